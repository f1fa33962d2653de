//! Wire protocol: message structs, constants, and the frame codec.

mod addr;
mod constants;
mod frame;
mod proto;

pub use addr::{check_vid, DriveAddr, VID_MAX_LEN};
pub use constants::{
    ecodes, BODY_HASH_TYPE_SHA1, BODY_SIGNATURE_PIPO, MSG_MAGIC,
    PROTOCOL_TYPE_TAPE, PROTOCOL_VERSION_1,
};
pub use frame::{frames, pre_fill_header, Frame};
pub use proto::{
    AcsDismountTape, AcsForceDismountTape, AcsMountTapeReadOnly,
    AcsMountTapeReadWrite, Exception, Header, Heartbeat, MsgType, ReturnValue,
};

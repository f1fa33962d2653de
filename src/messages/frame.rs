//! Frame codec: the two-part (header, body) message envelope with body
//! hash stamping and explicit integrity/header checks.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use prost::Message;
use sha1::{Digest, Sha1};

use crate::messages::constants::{
    BODY_HASH_TYPE_SHA1, BODY_SIGNATURE_PIPO, MSG_MAGIC, PROTOCOL_TYPE_TAPE,
    PROTOCOL_VERSION_1,
};
use crate::messages::proto::{Header, MsgType};
use crate::utils::AcsError;

/// Application-level message envelope: a protobuf header plus the raw
/// (already protobuf-encoded) body bytes. Stateless value type.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Frame {
    pub header: Header,
    pub body: Bytes,
}

/// Returns a header pre-filled with the tape-domain protocol constants and
/// the placeholder body signature. The message type is left unset and the
/// body hash is stamped by `Frame::serialize_body()`.
pub fn pre_fill_header() -> Header {
    Header {
        magic: MSG_MAGIC,
        protocoltype: PROTOCOL_TYPE_TAPE,
        protocolversion: PROTOCOL_VERSION_1,
        msgtype: MsgType::None as u32,
        bodyhashtype: BODY_HASH_TYPE_SHA1.into(),
        bodyhashvalue: String::new(),
        bodysignaturetype: BODY_HASH_TYPE_SHA1.into(),
        bodysignature: BODY_SIGNATURE_PIPO.into(),
    }
}

/// Base64 SHA1 digest of the given body bytes.
fn body_hash(body: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(body);
    BASE64.encode(hasher.finalize())
}

impl Frame {
    /// Creates an empty-bodied frame with a pre-filled header carrying the
    /// given message type.
    pub fn new(msgtype: MsgType) -> Frame {
        let mut header = pre_fill_header();
        header.msgtype = msgtype as u32;
        Frame {
            header,
            body: Bytes::new(),
        }
    }

    /// Serializes `msg` into the frame body and stamps the body hash into
    /// the header.
    pub fn serialize_body(
        &mut self,
        msg: &impl Message,
    ) -> Result<(), AcsError> {
        let mut body = Vec::with_capacity(msg.encoded_len());
        msg.encode(&mut body)?;
        self.header.bodyhashvalue = body_hash(&body);
        self.body = body.into();
        Ok(())
    }

    /// Deserializes the frame body into a message of type `M`. Does not
    /// verify the body hash; callers decide when trust is established by
    /// calling `check_hash()` explicitly.
    pub fn parse_body<M: Message + Default>(&self) -> Result<M, AcsError> {
        Ok(M::decode(&self.body[..])?)
    }

    /// Recomputes the body digest and compares it against the one stored in
    /// the header.
    pub fn check_hash(&self) -> Result<(), AcsError> {
        let computed = body_hash(&self.body);
        if computed != self.header.bodyhashvalue {
            return Err(AcsError::HashMismatch {
                stored: self.header.bodyhashvalue.clone(),
                computed,
            });
        }
        Ok(())
    }

    /// Rejects the frame if its magic or protocol type/version differ from
    /// the constants this implementation speaks.
    pub fn check_header(&self) -> Result<(), AcsError> {
        if self.header.magic != MSG_MAGIC {
            return Err(AcsError::HeaderMismatch {
                field: "magic",
                expected: MSG_MAGIC,
                actual: self.header.magic,
            });
        }
        if self.header.protocoltype != PROTOCOL_TYPE_TAPE {
            return Err(AcsError::HeaderMismatch {
                field: "protocol type",
                expected: PROTOCOL_TYPE_TAPE,
                actual: self.header.protocoltype,
            });
        }
        if self.header.protocolversion != PROTOCOL_VERSION_1 {
            return Err(AcsError::HeaderMismatch {
                field: "protocol version",
                expected: PROTOCOL_VERSION_1,
                actual: self.header.protocolversion,
            });
        }
        Ok(())
    }

    /// The header's message type if it is a known one.
    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::try_from(self.header.msgtype as i32).ok()
    }
}

/// Convenience constructors for the frames this subsystem exchanges.
pub mod frames {
    use super::{Frame, MsgType};
    use crate::messages::addr::DriveAddr;
    use crate::messages::constants::ecodes;
    use crate::messages::proto::{
        AcsDismountTape, AcsForceDismountTape, AcsMountTapeReadOnly,
        AcsMountTapeReadWrite, Exception, Heartbeat, ReturnValue,
    };
    use crate::utils::AcsError;

    pub fn return_value_frame(value: i32) -> Result<Frame, AcsError> {
        let mut frame = Frame::new(MsgType::ReturnValue);
        frame.serialize_body(&ReturnValue { value })?;
        Ok(frame)
    }

    pub fn exception_frame(
        code: i32,
        message: &str,
    ) -> Result<Frame, AcsError> {
        let mut frame = Frame::new(MsgType::Exception);
        frame.serialize_body(&Exception {
            code,
            message: message.into(),
        })?;
        Ok(frame)
    }

    pub fn heartbeat_frame(bytes_moved: u64) -> Result<Frame, AcsError> {
        let mut frame = Frame::new(MsgType::Heartbeat);
        frame.serialize_body(&Heartbeat { bytes_moved })?;
        Ok(frame)
    }

    pub fn mount_tape_read_only_frame(
        vid: &str,
        addr: DriveAddr,
    ) -> Result<Frame, AcsError> {
        let mut frame = Frame::new(MsgType::AcsMountTapeReadOnly);
        frame.serialize_body(&AcsMountTapeReadOnly {
            vid: vid.into(),
            acs: addr.acs,
            lsm: addr.lsm,
            panel: addr.panel,
            drive: addr.drive,
        })?;
        Ok(frame)
    }

    pub fn mount_tape_read_write_frame(
        vid: &str,
        addr: DriveAddr,
    ) -> Result<Frame, AcsError> {
        let mut frame = Frame::new(MsgType::AcsMountTapeReadWrite);
        frame.serialize_body(&AcsMountTapeReadWrite {
            vid: vid.into(),
            acs: addr.acs,
            lsm: addr.lsm,
            panel: addr.panel,
            drive: addr.drive,
        })?;
        Ok(frame)
    }

    pub fn dismount_tape_frame(
        vid: &str,
        addr: DriveAddr,
    ) -> Result<Frame, AcsError> {
        let mut frame = Frame::new(MsgType::AcsDismountTape);
        frame.serialize_body(&AcsDismountTape {
            vid: vid.into(),
            acs: addr.acs,
            lsm: addr.lsm,
            panel: addr.panel,
            drive: addr.drive,
        })?;
        Ok(frame)
    }

    pub fn force_dismount_tape_frame(
        vid: &str,
        addr: DriveAddr,
    ) -> Result<Frame, AcsError> {
        let mut frame = Frame::new(MsgType::AcsForceDismountTape);
        frame.serialize_body(&AcsForceDismountTape {
            vid: vid.into(),
            acs: addr.acs,
            lsm: addr.lsm,
            panel: addr.panel,
            drive: addr.drive,
        })?;
        Ok(frame)
    }

    /// Numeric code to put on the wire for a given error.
    pub fn wire_code(err: &AcsError) -> i32 {
        match err {
            AcsError::HeaderMismatch { .. } => ecodes::SEBADVERSION,
            AcsError::Transport(_) => ecodes::SECONNDROP,
            AcsError::Serialize(_)
            | AcsError::Deserialize(_)
            | AcsError::HashMismatch { .. } => ecodes::SECOMERR,
            AcsError::Remote { code, .. } => *code,
            AcsError::DuplicateRequest(_)
            | AcsError::SequenceExhausted
            | AcsError::InvalidTransition { .. }
            | AcsError::ReplyAlreadySent { .. }
            | AcsError::Library(_)
            | AcsError::Msg(_) => ecodes::SEINTERNAL,
        }
    }

    /// Builds the exception reply frame reporting the given error to a
    /// remote client.
    pub fn exception_frame_for(err: &AcsError) -> Result<Frame, AcsError> {
        exception_frame(wire_code(err), &err.to_string())
    }
}

#[cfg(test)]
mod frame_tests {
    use super::frames::*;
    use super::*;
    use crate::messages::addr::DriveAddr;
    use crate::messages::constants::ecodes;
    use crate::messages::proto::{AcsDismountTape, Exception};

    #[test]
    fn body_round_trip() -> Result<(), AcsError> {
        let addr = DriveAddr::new(0, 1, 2, 3);
        let frame = dismount_tape_frame("T00001", addr)?;
        assert_eq!(frame.msg_type(), Some(MsgType::AcsDismountTape));
        frame.check_header()?;
        frame.check_hash()?;

        let body = frame.parse_body::<AcsDismountTape>()?;
        assert_eq!(
            body,
            AcsDismountTape {
                vid: "T00001".into(),
                acs: 0,
                lsm: 1,
                panel: 2,
                drive: 3,
            }
        );
        Ok(())
    }

    #[test]
    fn hash_detects_mutation() -> Result<(), AcsError> {
        let frame = heartbeat_frame(7777)?;
        frame.check_hash()?;

        for byte in 0..frame.body.len() {
            let mut corrupted = frame.clone();
            let mut body = corrupted.body.to_vec();
            body[byte] ^= 0xff;
            corrupted.body = body.into();
            assert!(matches!(
                corrupted.check_hash(),
                Err(AcsError::HashMismatch { .. })
            ));
        }
        Ok(())
    }

    #[test]
    fn header_field_mismatches() -> Result<(), AcsError> {
        let frame = return_value_frame(0)?;
        frame.check_header()?;

        let mut bad = frame.clone();
        bad.header.magic += 1;
        assert!(matches!(
            bad.check_header(),
            Err(AcsError::HeaderMismatch { field: "magic", .. })
        ));

        let mut bad = frame.clone();
        bad.header.protocoltype += 1;
        assert!(bad.check_header().is_err());

        let mut bad = frame;
        bad.header.protocolversion += 1;
        assert!(bad.check_header().is_err());
        Ok(())
    }

    #[test]
    fn pre_filled_fields() {
        let header = pre_fill_header();
        assert_eq!(header.magic, MSG_MAGIC);
        assert_eq!(header.bodyhashtype, "SHA1");
        assert_eq!(header.bodysignaturetype, "SHA1");
        assert_eq!(header.bodysignature, "PIPO");
        assert_eq!(header.bodyhashvalue, "");
    }

    #[test]
    fn unknown_msg_type() -> Result<(), AcsError> {
        let mut frame = return_value_frame(0)?;
        frame.header.msgtype = 9999;
        assert_eq!(frame.msg_type(), None);
        Ok(())
    }

    #[test]
    fn exception_for_error() -> Result<(), AcsError> {
        let err = AcsError::DuplicateRequest("drive 0:1:2:3 busy".into());
        let frame = exception_frame_for(&err)?;
        assert_eq!(frame.msg_type(), Some(MsgType::Exception));
        let body = frame.parse_body::<Exception>()?;
        assert_eq!(body.code, ecodes::SEINTERNAL);
        assert!(body.message.contains("drive 0:1:2:3 busy"));
        Ok(())
    }
}

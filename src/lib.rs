//! Tapeacs is an asynchronous controller daemon for ACS tape libraries. It
//! accepts mount and dismount requests from local client tools over loopback
//! TCP, drives them against the vendor control software on a dedicated worker
//! thread, and tracks every request through a small state machine until its
//! reply frame is delivered exactly once.

#[macro_use]
mod utils;

mod messages;

mod daemon;

mod client;

pub use crate::utils::{logger_init, AcsError, LOG_NAME};

pub use crate::messages::{check_vid, ecodes, DriveAddr, VID_MAX_LEN};

pub use crate::daemon::{
    AcsDaemon, AcsLibrary, AcsdConfig, LibraryResponse, ResponseStatus, SeqNo,
    SimulatedLibrary,
};

pub use crate::client::AcsProxy;

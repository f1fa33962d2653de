//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Customized error type for tapeacs. Expected rejections (duplicate
/// requests, remote exceptions) and invariant violations (double reply,
/// backward state transition) are separate variants so callers can tell
/// them apart instead of parsing strings.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum AcsError {
    /// Socket-level failure (bind, connect, read, write, peer gone).
    Transport(String),
    /// Protobuf encoding failure.
    Serialize(String),
    /// Protobuf decoding failure.
    Deserialize(String),
    /// Stored and recomputed body digests differ.
    HashMismatch { stored: String, computed: String },
    /// A fixed header field does not match the expected constant.
    HeaderMismatch {
        field: &'static str,
        expected: u32,
        actual: u32,
    },
    /// New request collides with a tracked one by drive slot or VID.
    DuplicateRequest(String),
    /// Sequence number space saturated from both ends.
    SequenceExhausted,
    /// Request state machine asked to move backward.
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
    /// Second reply attempted for the same request.
    ReplyAlreadySent { seq_no: u16 },
    /// Remote endpoint answered with an exception frame.
    Remote { code: i32, message: String },
    /// Vendor library call failure.
    Library(String),
    /// Anything else.
    Msg(String),
}

impl AcsError {
    pub fn msg(msg: impl ToString) -> Self {
        AcsError::Msg(msg.to_string())
    }
}

impl fmt::Display for AcsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AcsError::Transport(s) => write!(f, "transport error: {}", s),
            AcsError::Serialize(s) => write!(f, "serialization error: {}", s),
            AcsError::Deserialize(s) => {
                write!(f, "deserialization error: {}", s)
            }
            AcsError::HashMismatch { stored, computed } => write!(
                f,
                "body hash mismatch: stored '{}' computed '{}'",
                stored, computed
            ),
            AcsError::HeaderMismatch {
                field,
                expected,
                actual,
            } => write!(
                f,
                "unexpected header {}: expected {} actual {}",
                field, expected, actual
            ),
            AcsError::DuplicateRequest(s) => {
                write!(f, "duplicate request: {}", s)
            }
            AcsError::SequenceExhausted => {
                write!(f, "no free sequence number available")
            }
            AcsError::InvalidTransition { from, to } => {
                write!(f, "invalid state transition from {} to {}", from, to)
            }
            AcsError::ReplyAlreadySent { seq_no } => {
                write!(f, "reply already sent for sequence number {}", seq_no)
            }
            AcsError::Remote { code, message } => {
                write!(f, "remote exception (code {}): {}", code, message)
            }
            AcsError::Library(s) => write!(f, "library error: {}", s),
            AcsError::Msg(s) => write!(f, "{}", s),
        }
    }
}

impl error::Error for AcsError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to an `AcsError` variant.
macro_rules! impl_from_error {
    ($variant:ident, $error:ty) => {
        impl From<$error> for AcsError {
            fn from(e: $error) -> Self {
                AcsError::$variant(e.to_string())
            }
        }
    };
}

// Same for common generic error types.
macro_rules! impl_from_error_generic {
    ($variant:ident, $error:ty) => {
        impl<T> From<$error> for AcsError {
            fn from(e: $error) -> AcsError {
                AcsError::$variant(e.to_string())
            }
        }
    };
}

impl_from_error!(Transport, io::Error);
impl_from_error!(Msg, string::FromUtf8Error);
impl_from_error!(Msg, num::ParseIntError);
impl_from_error!(Msg, net::AddrParseError);
impl_from_error!(Serialize, prost::EncodeError);
impl_from_error!(Deserialize, prost::DecodeError);
impl_from_error!(Msg, toml::ser::Error);
impl_from_error!(Msg, toml::de::Error);
impl_from_error!(Msg, ctrlc::Error);
impl_from_error!(Msg, tokio::sync::mpsc::error::TryRecvError);

impl_from_error_generic!(Msg, tokio::sync::SetError<T>);
impl_from_error_generic!(Msg, tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(Transport, tokio::sync::mpsc::error::SendError<T>);
impl_from_error_generic!(Library, tokio::sync::mpsc::error::TrySendError<T>);

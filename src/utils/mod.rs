//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod safetcp;

pub use error::AcsError;
pub use print::{logger_init, LOG_NAME};

pub(crate) use safetcp::{
    safe_tcp_read_frame, safe_tcp_write_frame, tcp_bind_with_retry,
    tcp_connect_with_retry,
};

//! Tape daemon client-side modules.

mod proxy;

pub use proxy::AcsProxy;

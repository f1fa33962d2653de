//! Tape daemon internal modules.

mod acsd;
mod handler;
mod library;
mod reactor;
mod registry;
mod request;
mod router;

pub use acsd::{AcsDaemon, AcsdConfig};
pub use library::{AcsLibrary, LibraryResponse, ResponseStatus, SimulatedLibrary};
pub use request::SeqNo;

pub(crate) use router::RouterSocket;

//! Transport layer for the refbus process mesh.
//!
//! Every channel between two processes is an ordered byte stream. This crate
//! provides the single stream type the rest of the workspace builds on:
//! [`IpcStream`], backed by a Unix domain socket, plus [`UnixDomainSocket`]
//! for bind/accept/connect and [`IpcStream::pair`] for channels that stay
//! inside one process (extension hosts, tests).

pub mod error;
pub mod stream;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use stream::IpcStream;

#[cfg(unix)]
pub use uds::UnixDomainSocket;

//! Byte-stream transports for cmdmux.
//!
//! The protocol core only needs a pair of blocking `Read`/`Write` halves; this
//! crate provides the two adapters the rest of the workspace uses:
//!
//! - [`UnixDomainSocket`] — filesystem-path UDS listener/connector
//! - [`memory::duplex_pair`] — connected in-memory streams for tests and demos

pub mod error;
pub mod memory;
#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use memory::{duplex_pair, MemoryStream};
#[cfg(unix)]
pub use uds::{SocketStream, UnixDomainSocket};

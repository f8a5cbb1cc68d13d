//! Bidirectional command RPC multiplexed over a single ordered byte stream.
//!
//! Either side of a connection registers named commands and invokes the
//! other side's. Commands are `async` (one reply, optional trailing payload
//! stream) or `streaming` (the duplex stream is the payload). A [`Router`]
//! composes many connections into a mesh, forwarding commands to remote
//! peers by splicing channels together.
//!
//! Layering, bottom up: wire frames (`cmdmux-wire`) carry
//! `(channel, type, payload)` messages; the multiplexer owns the per
//! connection channel tables; a [`Channel`](channel::ChannelIo) is one
//! invocation's state machine; an [`Endpoint`] binds a transport pair to a
//! [`CommandRegistry`]; a [`Router`] shares one registry across endpoints.

pub mod channel;
pub mod encoding;
pub mod endpoint;
pub mod error;
pub mod manifest;
mod mux;
pub mod pipe;
pub mod registry;
pub mod router;

pub use channel::ChannelIo;
pub use encoding::{Encoding, Payload};
pub use endpoint::{Endpoint, EndpointConfig};
pub use error::{ProtoError, Result};
pub use manifest::{CommandInfo, Manifest, Mode};
pub use pipe::pipe;
pub use registry::{CommandDescriptor, CommandRegistry};
pub use router::{ConnectionOptions, Router};

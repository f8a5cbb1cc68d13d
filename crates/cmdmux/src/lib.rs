//! Bidirectional command RPC multiplexed over one ordered byte stream.
//!
//! Both sides of a connection expose named commands and invoke the other
//! side's; a router composes connections into a mesh with transparent
//! forwarding.
//!
//! # Crate Structure
//!
//! - [`transport`] — byte-stream adapters (Unix sockets, in-memory pairs)
//! - [`wire`] — varint frame codec with channel multiplexing
//! - [`proto`] — channels, registry, endpoints, and routing

/// Re-export transport types.
pub mod transport {
    pub use cmdmux_transport::*;
}

/// Re-export wire framing types.
pub mod wire {
    pub use cmdmux_wire::*;
}

/// Re-export the protocol core.
pub mod proto {
    pub use cmdmux_proto::*;
}

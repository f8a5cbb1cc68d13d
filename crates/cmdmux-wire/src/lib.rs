//! Wire framing for cmdmux.
//!
//! Every message on the stream is `varint(body_len) ++ body`, where the body
//! is `varint(channel << 4 | type) ++ payload`. The low four header bits carry
//! the message type, everything above them the channel number. Channel 0 is
//! reserved for connection-wide control traffic.
//!
//! The decoder is restartable: it consumes complete messages from a
//! caller-owned buffer and leaves partial bytes in place for the next call.

pub mod codec;
pub mod error;
pub mod reader;
pub mod varint;
pub mod writer;

pub use codec::{
    decode_frame, encode_frame, FrameConfig, MessageType, WireFrame, CONTROL_CHANNEL,
    DEFAULT_MAX_PAYLOAD,
};
pub use error::{Result, WireError};
pub use reader::FrameReader;
pub use writer::FrameWriter;

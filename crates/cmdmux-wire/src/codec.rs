use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Result, WireError};
use crate::varint;

/// Reserved channel number for connection-wide control traffic.
pub const CONTROL_CHANNEL: u64 = 0;

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

// Channel numbers share a u64 header with the 4-bit type tag.
const MAX_CHANNEL: u64 = u64::MAX >> 4;

/// Message types carried in the low four bits of the frame header.
///
/// Values 8 through 14 are reserved; frames carrying them decode but have no
/// [`MessageType`] and are expected to be dropped by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Manifest exchange on the control channel.
    Announce = 0,
    /// Opens a logical channel, carrying its invocation id and environment.
    Open = 1,
    /// The one command invocation a channel exists for.
    Command = 2,
    /// Single response to a received command.
    Reply = 3,
    /// Payload stream message.
    Data = 4,
    /// Diagnostic side-channel message.
    Log = 5,
    /// No more data from the sending side.
    Fin = 6,
    /// Invocation finished, possibly with an error.
    Close = 7,
    /// Application-defined control-channel extension.
    Extension = 15,
}

impl MessageType {
    /// Map a wire tag to a known message type, `None` for reserved tags.
    pub fn from_wire(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Announce),
            1 => Some(Self::Open),
            2 => Some(Self::Command),
            3 => Some(Self::Reply),
            4 => Some(Self::Data),
            5 => Some(Self::Log),
            6 => Some(Self::Fin),
            7 => Some(Self::Close),
            15 => Some(Self::Extension),
            _ => None,
        }
    }

    /// The 4-bit wire tag.
    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// A decoded wire message.
#[derive(Debug, Clone)]
pub struct WireFrame {
    /// Channel number as sent by the peer.
    pub channel: u64,
    /// Raw 4-bit type tag (may be a reserved value).
    pub tag: u8,
    /// The message payload.
    pub payload: Bytes,
}

impl WireFrame {
    /// The known message type, if the tag is not reserved.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_wire(self.tag)
    }
}

/// Configuration for frame encoding/decoding.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// Encode one frame into `dst`.
///
/// Wire layout:
/// ```text
/// varint(body_len) ++ varint(channel << 4 | type) ++ payload
/// ```
pub fn encode_frame(
    channel: u64,
    kind: MessageType,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<()> {
    if channel > MAX_CHANNEL {
        return Err(WireError::ChannelOutOfRange(channel));
    }

    let header = channel << 4 | u64::from(kind.tag());
    let body_len = varint::encoded_len(header) + payload.len();

    dst.reserve(varint::encoded_len(body_len as u64) + body_len);
    varint::encode(body_len as u64, dst);
    varint::encode(header, dst);
    dst.extend_from_slice(payload);
    Ok(())
}

/// Decode one frame from the front of `src`.
///
/// Returns `Ok(None)` while `src` holds less than a complete frame; on
/// success the frame's bytes are consumed and partial bytes of any following
/// frame are left in place.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<WireFrame>> {
    let Some((body_len, len_len)) = varint::decode(src)? else {
        return Ok(None);
    };
    let body_len = usize::try_from(body_len).map_err(|_| WireError::PayloadTooLarge {
        size: usize::MAX,
        max: max_payload,
    })?;

    // The header varint is at most 10 bytes of the body.
    if body_len > max_payload + varint::MAX_VARINT_LEN {
        return Err(WireError::PayloadTooLarge {
            size: body_len,
            max: max_payload,
        });
    }
    if src.len() < len_len + body_len {
        return Ok(None);
    }

    src.advance(len_len);
    let mut body = src.split_to(body_len);

    let Some((header, header_len)) = varint::decode(&body)? else {
        return Err(WireError::TruncatedHeader);
    };
    body.advance(header_len);

    let payload = body.freeze();
    if payload.len() > max_payload {
        return Err(WireError::PayloadTooLarge {
            size: payload.len(),
            max: max_payload,
        });
    }

    Ok(Some(WireFrame {
        channel: header >> 4,
        tag: (header & 0x0f) as u8,
        payload,
    }))
}

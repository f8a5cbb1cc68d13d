/// Errors raised while encoding or decoding wire frames.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// A varint ran past its 10-byte maximum.
    #[error("varint exceeds 10 bytes")]
    VarintOverflow,

    /// The channel number does not fit next to the 4-bit type tag.
    #[error("channel number {0} out of range")]
    ChannelOutOfRange(u64),

    /// A frame body ended before its header varint was complete.
    #[error("frame body truncates the channel/type header")]
    TruncatedHeader,

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended (possibly mid-frame).
    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, WireError>;

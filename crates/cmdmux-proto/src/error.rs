use std::time::Duration;

use crate::manifest::Mode;

/// Errors raised by the protocol core.
///
/// A `Protocol` error destroys the one channel it occurred on; `Remote` marks
/// a failure reported by the peer, as opposed to one produced locally, so
/// forwarding layers can tell which side to blame. Connection-level failures
/// surface as `ConnectionClosed` on every channel of that connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// Invalid command registration; fatal to that registration only.
    #[error("invalid command registration: {0}")]
    Config(String),

    /// Ordering violation on a channel; destroys that channel.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The named command is not registered / not in the remote manifest.
    #[error("command not found: {0}")]
    CommandNotFound(String),

    /// The command was invoked with the wrong invocation style.
    #[error("command '{command}' is {registered} mode, invoked as {requested}")]
    ModeMismatch {
        command: String,
        registered: Mode,
        requested: Mode,
    },

    /// The peer closed the channel with an error payload.
    #[error("remote error: {0}")]
    Remote(String),

    /// No connected peer is known under this name.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// The channel reached a terminal state without delivering a reply.
    #[error("channel closed without reply")]
    ChannelClosed,

    /// The connection this channel lived on is gone.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// No remote manifest arrived within the deadline.
    #[error("no remote manifest received within {0:?}")]
    ManifestTimeout(Duration),

    /// A blocking wait ran out of time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A payload does not fit the channel's negotiated encoding.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// JSON (de)serialization failure on a structural message.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame-level wire failure.
    #[error("wire error: {0}")]
    Wire(#[from] cmdmux_wire::WireError),

    /// I/O failure while standing up or driving a connection.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtoError {
    /// Shallow copy for storage in a shared call outcome.
    ///
    /// Variants wrapping non-clonable sources degrade to `Protocol` with the
    /// rendered message; every variant a call outcome actually carries clones
    /// losslessly.
    pub(crate) fn clone_shallow(&self) -> Self {
        match self {
            Self::Config(s) => Self::Config(s.clone()),
            Self::Protocol(s) => Self::Protocol(s.clone()),
            Self::CommandNotFound(s) => Self::CommandNotFound(s.clone()),
            Self::ModeMismatch {
                command,
                registered,
                requested,
            } => Self::ModeMismatch {
                command: command.clone(),
                registered: *registered,
                requested: *requested,
            },
            Self::Remote(s) => Self::Remote(s.clone()),
            Self::UnknownPeer(s) => Self::UnknownPeer(s.clone()),
            Self::ChannelClosed => Self::ChannelClosed,
            Self::ConnectionClosed(s) => Self::ConnectionClosed(s.clone()),
            Self::ManifestTimeout(d) => Self::ManifestTimeout(*d),
            Self::Timeout(d) => Self::Timeout(*d),
            Self::Encoding(s) => Self::Encoding(s.clone()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtoError>;

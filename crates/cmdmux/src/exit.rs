use std::fmt;
use std::io;

use cmdmux_proto::ProtoError;
use cmdmux_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const REMOTE_ERROR: i32 = 40;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn proto_error(context: &str, err: ProtoError) -> CliError {
    let code = match &err {
        ProtoError::Remote(_) => REMOTE_ERROR,
        ProtoError::CommandNotFound(_) | ProtoError::UnknownPeer(_) => USAGE,
        ProtoError::ModeMismatch { .. } | ProtoError::Config(_) => USAGE,
        ProtoError::ManifestTimeout(_) | ProtoError::Timeout(_) => TIMEOUT,
        ProtoError::Json(_) | ProtoError::Encoding(_) => DATA_INVALID,
        ProtoError::ConnectionClosed(_) | ProtoError::ChannelClosed => FAILURE,
        ProtoError::Wire(_) | ProtoError::Io(_) => TRANSPORT_ERROR,
        ProtoError::Protocol(_) => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

use std::fmt;
use std::io;

use vmlink_core::LinkError;
use vmlink_transport::TransportError;
use vmlink_wire::WireError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
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
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => TRANSPORT_ERROR,
        io::ErrorKind::PermissionDenied => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn wire_error(context: &str, err: WireError) -> CliError {
    match err {
        WireError::Io(source) | WireError::PartialPayload { source, .. } => {
            io_error(context, source)
        }
        WireError::ConnectionClosed => CliError::new(FAILURE, format!("{context}: {err}")),
        WireError::InvalidSignature { .. }
        | WireError::PayloadTooLarge { .. }
        | WireError::TruncatedRecord { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        WireError::ChannelIdOutOfRange(_) => CliError::new(USAGE, format!("{context}: {err}")),
    }
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::Wire(err) => wire_error(context, err),
        TransportError::PathTooLong { .. } => CliError::new(USAGE, format!("{context}: {err}")),
    }
}

pub fn link_error(context: &str, err: LinkError) -> CliError {
    match err {
        LinkError::Transport(err) => transport_error(context, err),
        LinkError::Wire(err) => wire_error(context, err),
        LinkError::TimedOut(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        LinkError::Config(_) | LinkError::Open(_) | LinkError::OversizedPayload { .. } => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        LinkError::MalformedHeader { .. }
        | LinkError::MalformedOpen { .. }
        | LinkError::ExportValidation(_)
        | LinkError::SizeMismatch { .. }
        | LinkError::ShortRead { .. } => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        LinkError::RemoteClosed { .. } | LinkError::Closed { .. } => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

use std::path::PathBuf;

use vmlink_wire::WireError;

/// Errors that can occur on a physical channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified socket path.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to connect to the specified socket path.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the underlying stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// Header encoding/decoding failed.
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl TransportError {
    /// True when the peer closed the stream between headers.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Wire(WireError::ConnectionClosed))
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

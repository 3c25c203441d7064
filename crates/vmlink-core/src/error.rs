use std::time::Duration;

use vmlink_transport::TransportError;
use vmlink_wire::{PayloadType, WireError};

use crate::export::ExportError;

/// Errors reported by dispatch, allocation and virtual channel operations.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Header fields are out of range for a connection-scoped payload.
    #[error("malformed header: type {payload_type} vcid {vchan_id:#x} session {session_id}")]
    MalformedHeader {
        payload_type: PayloadType,
        vchan_id: u32,
        session_id: u32,
    },

    /// An open-handshake header does not carry exactly one open request record.
    #[error("malformed open request: type {payload_type} size {size} (expected {expected})")]
    MalformedOpen {
        payload_type: PayloadType,
        size: usize,
        expected: usize,
    },

    /// No open virtual channel matches the header.
    #[error("virtual channel {vchan_id:#x} session {session_id} not found")]
    ChannelNotFound { vchan_id: u32, session_id: u32 },

    /// The remote side closed the virtual channel.
    #[error("virtual channel {vchan_id:#x} closed by remote")]
    RemoteClosed { vchan_id: u32 },

    /// The local side closed the virtual channel.
    #[error("virtual channel {vchan_id:#x} closed locally")]
    Closed { vchan_id: u32 },

    /// No buffer could be acquired for an incoming message. Only that message is lost.
    #[error("failed to allocate {size} byte message")]
    AllocationFailure { size: usize },

    /// The receive buffer cannot hold the next message; it stays queued.
    #[error("receive buffer too small ({capacity} bytes, message needs {required})")]
    BufferTooSmall { required: usize, capacity: usize },

    /// A payload exceeds the protocol ceiling.
    #[error("payload of {size} bytes exceeds protocol maximum {max}")]
    OversizedPayload { size: usize, max: usize },

    /// An incoming export failed validation and was dropped.
    #[error("export rejected: {0}")]
    ExportValidation(#[from] ExportError),

    /// A fixed-size record arrived with a different declared size.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// The stream delivered fewer bytes than the header declared.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// An interruptible wait was interrupted; retry.
    #[error("wait interrupted")]
    Interrupted,

    /// A bounded wait expired.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// The open-handshake collaborator rejected a request.
    #[error("open handshake failed: {0}")]
    Open(String),

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// Wire encoding/decoding error.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Physical channel error.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl LinkError {
    /// True for statuses a caller is expected to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BufferTooSmall { .. } | Self::Interrupted)
    }

    /// True when the stream position is no longer known, so the next header cannot be trusted.
    pub fn breaks_framing(&self) -> bool {
        matches!(
            self,
            Self::OversizedPayload { .. }
                | Self::ShortRead { .. }
                | Self::Wire(_)
                | Self::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;

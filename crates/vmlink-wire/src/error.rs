/// Errors that can occur while encoding or decoding wire data.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The header does not start with the stream signature.
    #[error("invalid header signature {found:#010x} (expected 0xbee1bee1)")]
    InvalidSignature { found: u32 },

    /// The declared payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A virtual channel id does not fit in the header id field.
    #[error("virtual channel id {0:#x} out of range")]
    ChannelIdOutOfRange(u32),

    /// A payload record is shorter than its fixed layout.
    #[error("truncated {record} record ({len} bytes, need {need})")]
    TruncatedRecord {
        record: &'static str,
        len: usize,
        need: usize,
    },

    /// The stream failed after part of a payload had already been consumed.
    #[error("payload read failed after {filled} bytes: {source}")]
    PartialPayload {
        filled: usize,
        #[source]
        source: std::io::Error,
    },

    /// An I/O error occurred while reading or writing the stream.
    #[error("wire I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended before a complete header was received.
    #[error("connection closed (incomplete header)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, WireError>;

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, WireError};

/// Header: signature (4) + size (4) + id/type (4) + session (4) + sequence (4) = 20 bytes.
pub const HEADER_SIZE: usize = 20;

/// Stream synchronization signature.
pub const SIGNATURE: u32 = 0xBEE1_BEE1;

/// Protocol ceiling for a single payload: 4 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 4 * 1024 * 1024;

const ID_SHIFT: u32 = 20;
const ID_MASK: u32 = 0xFFF0_0000;
const TYPE_SHIFT: u32 = 16;
const TYPE_MASK: u32 = 0x000F_0000;

/// Largest virtual channel id representable in a header.
pub const MAX_VCHAN_ID: u32 = ID_MASK >> ID_SHIFT;

/// Payload type carried in every header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadType {
    Msg,
    Init,
    InitAck,
    InitDone,
    Export,
    ExportAck,
    Profile,
    Close,
    InitCancel,
    ScheMsg,
    ScheMsgAck,
    ScheResultReq,
    ScheResultRsp,
    /// A type value this implementation does not know.
    Unknown(u8),
}

impl PayloadType {
    /// Decode the 4-bit wire value.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Msg,
            1 => Self::Init,
            2 => Self::InitAck,
            3 => Self::InitDone,
            4 => Self::Export,
            5 => Self::ExportAck,
            6 => Self::Profile,
            7 => Self::Close,
            8 => Self::InitCancel,
            9 => Self::ScheMsg,
            10 => Self::ScheMsgAck,
            11 => Self::ScheResultReq,
            12 => Self::ScheResultRsp,
            other => Self::Unknown(other),
        }
    }

    /// The 4-bit wire value.
    pub fn as_raw(self) -> u8 {
        match self {
            Self::Msg => 0,
            Self::Init => 1,
            Self::InitAck => 2,
            Self::InitDone => 3,
            Self::Export => 4,
            Self::ExportAck => 5,
            Self::Profile => 6,
            Self::Close => 7,
            Self::InitCancel => 8,
            Self::ScheMsg => 9,
            Self::ScheMsgAck => 10,
            Self::ScheResultReq => 11,
            Self::ScheResultRsp => 12,
            Self::Unknown(raw) => raw,
        }
    }

    /// Open-handshake types are routed before any channel exists.
    pub fn is_open_handshake(self) -> bool {
        matches!(
            self,
            Self::Init | Self::InitAck | Self::InitDone | Self::InitCancel
        )
    }

    /// Human-readable name for logs and CLI output.
    pub fn name(self) -> &'static str {
        match self {
            Self::Msg => "MSG",
            Self::Init => "INIT",
            Self::InitAck => "INIT_ACK",
            Self::InitDone => "INIT_DONE",
            Self::Export => "EXPORT",
            Self::ExportAck => "EXPORT_ACK",
            Self::Profile => "PROFILE",
            Self::Close => "CLOSE",
            Self::InitCancel => "INIT_CANCEL",
            Self::ScheMsg => "SCHE_MSG",
            Self::ScheMsgAck => "SCHE_MSG_ACK",
            Self::ScheResultReq => "SCHE_RESULT_REQ",
            Self::ScheResultRsp => "SCHE_RESULT_RSP",
            Self::Unknown(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(raw) => write!(f, "UNKNOWN({raw})"),
            known => f.write_str(known.name()),
        }
    }
}

/// Fixed-width header preceding every payload on a physical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Payload size in bytes.
    pub size: u32,
    /// Payload type.
    pub payload_type: PayloadType,
    /// Virtual channel id on the receiving side.
    pub vchan_id: u32,
    /// Connection epoch of the virtual channel.
    pub session_id: u32,
    /// Sender-assigned sequence number.
    pub sequence: u32,
}

impl Header {
    /// Create a header with sequence 0; senders stamp the sequence on transmit.
    pub fn new(payload_type: PayloadType, size: u32, vchan_id: u32, session_id: u32) -> Self {
        Self {
            size,
            payload_type,
            vchan_id,
            session_id,
            sequence: 0,
        }
    }

    /// Payload size as a `usize`.
    pub fn payload_len(&self) -> usize {
        self.size as usize
    }

    /// Copy of this header with a different sequence number.
    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }
}

/// Encode a header into the wire format.
///
/// Wire format (little-endian):
/// ```text
/// ┌────────────┬──────────┬─────────────────────────┬────────────┬────────────┐
/// │ Signature  │ Size     │ Id/Type                 │ Session    │ Sequence   │
/// │ 0xBEE1BEE1 │ (4B)     │ id<<20 | type<<16 (4B)  │ (4B)       │ (4B)       │
/// └────────────┴──────────┴─────────────────────────┴────────────┴────────────┘
/// ```
pub fn encode_header(header: &Header, dst: &mut BytesMut) -> Result<()> {
    if header.vchan_id > MAX_VCHAN_ID {
        return Err(WireError::ChannelIdOutOfRange(header.vchan_id));
    }
    let id_type = (header.vchan_id << ID_SHIFT)
        | ((u32::from(header.payload_type.as_raw()) << TYPE_SHIFT) & TYPE_MASK);

    dst.reserve(HEADER_SIZE);
    dst.put_u32_le(SIGNATURE);
    dst.put_u32_le(header.size);
    dst.put_u32_le(id_type);
    dst.put_u32_le(header.session_id);
    dst.put_u32_le(header.sequence);
    Ok(())
}

/// Convert a payload length to the header's 32-bit size field.
pub fn payload_size(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| WireError::PayloadTooLarge {
        size: len,
        max: u32::MAX as usize,
    })
}

/// Decode a header from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't hold a complete header yet. On success, consumes
/// only the header bytes; the payload is left for the caller to drain.
pub fn decode_header(src: &mut BytesMut, max_payload: usize) -> Result<Option<Header>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut raw = &src[..HEADER_SIZE];
    let signature = raw.get_u32_le();
    if signature != SIGNATURE {
        return Err(WireError::InvalidSignature { found: signature });
    }
    let size = raw.get_u32_le();
    let id_type = raw.get_u32_le();
    let session_id = raw.get_u32_le();
    let sequence = raw.get_u32_le();

    if size as usize > max_payload {
        return Err(WireError::PayloadTooLarge {
            size: size as usize,
            max: max_payload,
        });
    }

    src.advance(HEADER_SIZE);

    Ok(Some(Header {
        size,
        payload_type: PayloadType::from_raw(((id_type & TYPE_MASK) >> TYPE_SHIFT) as u8),
        vchan_id: (id_type & ID_MASK) >> ID_SHIFT,
        session_id,
        sequence,
    }))
}

/// Configuration for header readers and frame writers.
#[derive(Debug, Clone)]
pub struct WireConfig {
    /// Maximum payload size in bytes. Default: 4 MiB.
    pub max_payload_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

//! Wire codec for vmlink physical channels.
//!
//! Every payload on a physical channel is preceded by a fixed 20-byte header:
//! - A 4-byte signature (`0xBEE1BEE1`) for stream synchronization
//! - A 4-byte little-endian payload size
//! - A packed virtual channel id and payload type
//! - A 4-byte session id and a 4-byte sender sequence number
//!
//! Payloads are never decoded here beyond the fixed records in [`records`]; routing and
//! validation live in `vmlink-core`.

pub mod codec;
pub mod error;
pub mod reader;
pub mod records;
pub mod writer;

pub use codec::{
    decode_header, encode_header, payload_size, Header, PayloadType, WireConfig,
    DEFAULT_MAX_PAYLOAD, HEADER_SIZE, MAX_VCHAN_ID, SIGNATURE,
};
pub use error::{Result, WireError};
pub use reader::HeaderReader;
pub use records::{
    ExportAck, ExportHeader, OpenRequest, PfnTableHeader, ProfileStat, Region, EXPORT_PREFIX_SIZE,
    SCHE_TICK_SIZE,
};
pub use writer::FrameWriter;

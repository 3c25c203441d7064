//! Fixed-layout payload records.
//!
//! All integers are little-endian. Every record has a fixed `SIZE`; decoders reject shorter input
//! and ignore nothing silently.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, WireError};

fn ensure_len(record: &'static str, src: &[u8], need: usize) -> Result<()> {
    if src.len() < need {
        return Err(WireError::TruncatedRecord {
            record,
            len: src.len(),
            need,
        });
    }
    Ok(())
}

/// Open request carried by INIT / INIT_ACK / INIT_DONE / INIT_CANCEL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenRequest {
    pub vchan_id: u32,
    pub sub_id: u32,
    pub open_id: u32,
    pub ver_fe: u32,
    pub ver_be: u32,
}

impl OpenRequest {
    pub const SIZE: usize = 24;

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(Self::SIZE);
        dst.put_u32_le(self.vchan_id);
        dst.put_u32_le(self.sub_id);
        dst.put_u32_le(self.open_id);
        dst.put_u32_le(self.ver_fe);
        dst.put_u32_le(self.ver_be);
        dst.put_u32_le(0);
    }

    pub fn decode(mut src: &[u8]) -> Result<Self> {
        ensure_len("open request", src, Self::SIZE)?;
        Ok(Self {
            vchan_id: src.get_u32_le(),
            sub_id: src.get_u32_le(),
            open_id: src.get_u32_le(),
            ver_fe: src.get_u32_le(),
            ver_be: src.get_u32_le(),
        })
    }
}

/// Acknowledgement that an export was registered by the importing side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportAck {
    pub export_id: u32,
    pub vcid_local: u32,
    pub vcid_remote: u32,
}

impl ExportAck {
    pub const SIZE: usize = 16;

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(Self::SIZE);
        dst.put_u32_le(self.export_id);
        dst.put_u32_le(self.vcid_local);
        dst.put_u32_le(self.vcid_remote);
        dst.put_u32_le(0);
    }

    pub fn decode(mut src: &[u8]) -> Result<Self> {
        ensure_len("export ack", src, Self::SIZE)?;
        Ok(Self {
            export_id: src.get_u32_le(),
            vcid_local: src.get_u32_le(),
            vcid_remote: src.get_u32_le(),
        })
    }
}

/// Cross-domain latency probe carried by PROFILE.
///
/// The sender fills the tx fields; the receiver stamps the rx fields on arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProfileStat {
    pub tx_sec: u64,
    pub tx_usec: u64,
    pub rx_sec: u64,
    pub rx_usec: u64,
}

impl ProfileStat {
    pub const SIZE: usize = 32;
    /// Offset of `rx_sec`; `rx_usec` follows immediately.
    pub const RX_OFFSET: usize = 16;

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(Self::SIZE);
        dst.put_u64_le(self.tx_sec);
        dst.put_u64_le(self.tx_usec);
        dst.put_u64_le(self.rx_sec);
        dst.put_u64_le(self.rx_usec);
    }

    pub fn decode(mut src: &[u8]) -> Result<Self> {
        ensure_len("profile stat", src, Self::SIZE)?;
        Ok(Self {
            tx_sec: src.get_u64_le(),
            tx_usec: src.get_u64_le(),
            rx_sec: src.get_u64_le(),
            rx_usec: src.get_u64_le(),
        })
    }

    /// The rx stamp as written in place by the receiver.
    pub fn rx_stamp(sec: u64, usec: u64) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&sec.to_le_bytes());
        out[8..].copy_from_slice(&usec.to_le_bytes());
        out
    }
}

/// Leading bytes of SCHE_MSG / SCHE_MSG_ACK overwritten with the receive tick.
pub const SCHE_TICK_SIZE: usize = 8;

/// Export descriptor header that opens every EXPORT payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExportHeader {
    pub export_id: u32,
    pub readonly: u32,
    pub domid_local: u32,
    pub domid_remote: u32,
    pub vcid_local: u32,
    pub vcid_remote: u32,
    pub payload_count: u32,
    pub flags: u32,
    pub import_index: u64,
}

impl ExportHeader {
    pub const SIZE: usize = 40;

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(Self::SIZE);
        dst.put_u32_le(self.export_id);
        dst.put_u32_le(self.readonly);
        dst.put_u32_le(self.domid_local);
        dst.put_u32_le(self.domid_remote);
        dst.put_u32_le(self.vcid_local);
        dst.put_u32_le(self.vcid_remote);
        dst.put_u32_le(self.payload_count);
        dst.put_u32_le(self.flags);
        dst.put_u64_le(self.import_index);
    }

    pub fn decode(mut src: &[u8]) -> Result<Self> {
        ensure_len("export header", src, Self::SIZE)?;
        Ok(Self {
            export_id: src.get_u32_le(),
            readonly: src.get_u32_le(),
            domid_local: src.get_u32_le(),
            domid_remote: src.get_u32_le(),
            vcid_local: src.get_u32_le(),
            vcid_remote: src.get_u32_le(),
            payload_count: src.get_u32_le(),
            flags: src.get_u32_le(),
            import_index: src.get_u64_le(),
        })
    }
}

/// Header of the compressed page-frame-number table following [`ExportHeader`].
///
/// `nregions` is signed on the wire and must be validated before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PfnTableHeader {
    pub first_pfn: u64,
    pub nregions: i32,
}

impl PfnTableHeader {
    pub const SIZE: usize = 16;

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(Self::SIZE);
        dst.put_u64_le(self.first_pfn);
        dst.put_i32_le(self.nregions);
        dst.put_u32_le(0);
    }

    pub fn decode(mut src: &[u8]) -> Result<Self> {
        ensure_len("pfn table header", src, Self::SIZE)?;
        Ok(Self {
            first_pfn: src.get_u64_le(),
            nregions: src.get_i32_le(),
        })
    }
}

/// One run of contiguous pages, followed by `gap` skipped pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    pub page_count: u32,
    pub gap: u32,
}

impl Region {
    pub const SIZE: usize = 8;

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.page_count);
        dst.put_u32_le(self.gap);
    }

    pub fn decode(mut src: &[u8]) -> Result<Self> {
        ensure_len("region", src, Self::SIZE)?;
        Ok(Self {
            page_count: src.get_u32_le(),
            gap: src.get_u32_le(),
        })
    }
}

/// Fixed prefix of every EXPORT payload: descriptor header plus table header.
pub const EXPORT_PREFIX_SIZE: usize = ExportHeader::SIZE + PfnTableHeader::SIZE;

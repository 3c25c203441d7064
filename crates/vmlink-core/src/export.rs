use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;
use tracing::warn;
use vmlink_transport::PhysicalChannel;
use vmlink_wire::{ExportHeader, PfnTableHeader, Region, EXPORT_PREFIX_SIZE};

/// Reasons an incoming EXPORT payload is rejected.
///
/// Checks run in declaration order; the first failing check is reported.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExportError {
    /// Payload cannot hold the descriptor and table headers.
    #[error("export payload of {size} bytes is outside {min}..={max}")]
    SizeOutOfRange { size: usize, min: usize, max: usize },

    /// Region count is zero or negative.
    #[error("export declares {0} regions")]
    NoRegions(i32),

    /// Region table size overflows.
    #[error("export region table of {0} regions overflows")]
    RegionOverflow(i32),

    /// Region count exceeds the export ceiling.
    #[error("export declares {nregions} regions, ceiling is {max}")]
    TooManyRegions { nregions: u32, max: u32 },

    /// More regions than pages.
    #[error("export declares {nregions} regions but only {payload_count} pages")]
    RegionsExceedPayload { nregions: u32, payload_count: u32 },

    /// Page count exceeds the export ceiling.
    #[error("export payload_count {payload_count} exceeds ceiling {max}")]
    PayloadCountOutOfRange { payload_count: u32, max: u32 },

    /// Declared payload size disagrees with the region table.
    #[error("export payload is {declared} bytes, region table implies {expected}")]
    SizeMismatch { declared: usize, expected: usize },
}

/// A validated incoming memory grant, pending until the importer claims it.
#[derive(Clone)]
pub struct ExportDescriptor {
    header: ExportHeader,
    first_pfn: u64,
    regions: Vec<Region>,
    pchan: Option<Arc<dyn PhysicalChannel>>,
}

impl ExportDescriptor {
    /// Validate and parse a complete EXPORT payload.
    ///
    /// No wire-declared count is trusted until every check before it has passed.
    pub fn parse(
        payload: &[u8],
        max_payload: usize,
        max_payload_count: u32,
    ) -> Result<Self, ExportError> {
        let declared = payload.len();
        if declared < EXPORT_PREFIX_SIZE || declared > max_payload {
            return Err(ExportError::SizeOutOfRange {
                size: declared,
                min: EXPORT_PREFIX_SIZE,
                max: max_payload,
            });
        }

        let (head, rest) = payload.split_at(ExportHeader::SIZE);
        let (table, region_bytes) = rest.split_at(PfnTableHeader::SIZE);
        let header = ExportHeader::decode(head).map_err(|_| size_error(declared, max_payload))?;
        let table = PfnTableHeader::decode(table).map_err(|_| size_error(declared, max_payload))?;

        if table.nregions <= 0 {
            return Err(ExportError::NoRegions(table.nregions));
        }
        let nregions = table.nregions.unsigned_abs();
        let expected = (nregions as usize)
            .checked_mul(Region::SIZE)
            .and_then(|len| len.checked_add(EXPORT_PREFIX_SIZE))
            .ok_or(ExportError::RegionOverflow(table.nregions))?;
        if nregions > max_payload_count {
            return Err(ExportError::TooManyRegions {
                nregions,
                max: max_payload_count,
            });
        }
        if nregions > header.payload_count {
            return Err(ExportError::RegionsExceedPayload {
                nregions,
                payload_count: header.payload_count,
            });
        }
        if header.payload_count > max_payload_count {
            return Err(ExportError::PayloadCountOutOfRange {
                payload_count: header.payload_count,
                max: max_payload_count,
            });
        }
        if declared != expected {
            return Err(ExportError::SizeMismatch { declared, expected });
        }

        let regions = region_bytes
            .chunks_exact(Region::SIZE)
            .filter_map(|raw| Region::decode(raw).ok())
            .collect();

        Ok(Self {
            header,
            first_pfn: table.first_pfn,
            regions,
            pchan: None,
        })
    }

    /// Attach the receiving physical channel and replace the wire domain ids with its identity.
    pub fn bind(mut self, pchan: Arc<dyn PhysicalChannel>) -> Self {
        let (local, remote) = (pchan.vmid_local(), pchan.vmid_remote());
        if self.header.domid_remote != local || self.header.domid_local != remote {
            warn!(
                pchan = pchan.name(),
                export_id = self.header.export_id,
                wire_local = self.header.domid_local,
                wire_remote = self.header.domid_remote,
                local,
                remote,
                "export domain ids disagree with channel identity"
            );
        }
        self.header.domid_local = local;
        self.header.domid_remote = remote;
        self.pchan = Some(pchan);
        self
    }

    pub fn export_id(&self) -> u32 {
        self.header.export_id
    }

    pub fn readonly(&self) -> bool {
        self.header.readonly != 0
    }

    pub fn domid_local(&self) -> u32 {
        self.header.domid_local
    }

    pub fn domid_remote(&self) -> u32 {
        self.header.domid_remote
    }

    /// Exporter's virtual channel id.
    pub fn vcid_local(&self) -> u32 {
        self.header.vcid_local
    }

    /// Importer's virtual channel id, as the exporter saw it.
    pub fn vcid_remote(&self) -> u32 {
        self.header.vcid_remote
    }

    pub fn payload_count(&self) -> u32 {
        self.header.payload_count
    }

    pub fn flags(&self) -> u32 {
        self.header.flags
    }

    pub fn import_index(&self) -> u64 {
        self.header.import_index
    }

    pub fn first_pfn(&self) -> u64 {
        self.first_pfn
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// The physical channel the export arrived on, once bound.
    pub fn pchan(&self) -> Option<&Arc<dyn PhysicalChannel>> {
        self.pchan.as_ref()
    }

    /// Expand the compressed table into `(first pfn, page count)` runs.
    pub fn page_runs(&self) -> Vec<(u64, u32)> {
        let mut pfn = self.first_pfn;
        self.regions
            .iter()
            .map(|region| {
                let run = (pfn, region.page_count);
                pfn = pfn
                    .saturating_add(u64::from(region.page_count))
                    .saturating_add(u64::from(region.gap));
                run
            })
            .collect()
    }

    /// Total pages described by the region table.
    pub fn total_pages(&self) -> u64 {
        self.regions.iter().map(|r| u64::from(r.page_count)).sum()
    }
}

fn size_error(size: usize, max: usize) -> ExportError {
    ExportError::SizeOutOfRange {
        size,
        min: EXPORT_PREFIX_SIZE,
        max,
    }
}

impl fmt::Debug for ExportDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportDescriptor")
            .field("header", &self.header)
            .field("first_pfn", &self.first_pfn)
            .field("regions", &self.regions.len())
            .field("pchan", &self.pchan.as_ref().map(|p| p.name()))
            .finish()
    }
}

/// Outgoing memory grant built by the exporting side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    pub export_id: u32,
    pub readonly: bool,
    pub flags: u32,
    pub import_index: u64,
    pub first_pfn: u64,
    pub regions: Vec<Region>,
}

impl ExportRequest {
    pub fn new(export_id: u32, first_pfn: u64, regions: Vec<Region>) -> Self {
        Self {
            export_id,
            readonly: false,
            flags: 0,
            import_index: 0,
            first_pfn,
            regions,
        }
    }

    /// Pages described by the region table; sent as `payload_count`.
    pub fn payload_count(&self) -> u32 {
        self.regions
            .iter()
            .fold(0u32, |acc, r| acc.saturating_add(r.page_count))
    }

    /// Encoded payload size.
    pub fn encoded_len(&self) -> usize {
        EXPORT_PREFIX_SIZE + self.regions.len() * Region::SIZE
    }

    /// Encode as an EXPORT payload from the exporter's point of view.
    ///
    /// `domids` and `vcids` are `(local, remote)` pairs.
    pub fn encode(&self, domids: (u32, u32), vcids: (u32, u32), dst: &mut BytesMut) {
        let header = ExportHeader {
            export_id: self.export_id,
            readonly: u32::from(self.readonly),
            domid_local: domids.0,
            domid_remote: domids.1,
            vcid_local: vcids.0,
            vcid_remote: vcids.1,
            payload_count: self.payload_count(),
            flags: self.flags,
            import_index: self.import_index,
        };
        dst.reserve(self.encoded_len());
        header.encode(dst);
        PfnTableHeader {
            first_pfn: self.first_pfn,
            nregions: i32::try_from(self.regions.len()).unwrap_or(i32::MAX),
        }
        .encode(dst);
        for region in &self.regions {
            region.encode(dst);
        }
    }
}

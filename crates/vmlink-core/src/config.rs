use serde::{Deserialize, Serialize};
use vmlink_wire::{WireConfig, DEFAULT_MAX_PAYLOAD};

use crate::error::Result;

/// Page granularity used for scatter chunks.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Ceiling on the number of pages a single export may describe.
pub const MAX_EXPORT_PAYLOAD_COUNT: u32 = 0x8_0000;

/// Limits applied by a [`Transport`](crate::Transport).
///
/// Every field has a default, so a JSON document only needs the values it overrides:
///
/// ```
/// let cfg = vmlink_core::TransportConfig::from_json(r#"{ "page_size": 8192 }"#).unwrap();
/// assert_eq!(cfg.page_size, 8192);
/// assert_eq!(cfg.max_payload_size, vmlink_wire::DEFAULT_MAX_PAYLOAD);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Largest payload accepted from the wire. Default: 4 MiB.
    pub max_payload_size: usize,
    /// Chunk size for scattered messages. Default: 4096.
    pub page_size: usize,
    /// Largest `payload_count` an export may declare.
    pub max_export_payload_count: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            page_size: DEFAULT_PAGE_SIZE,
            max_export_payload_count: MAX_EXPORT_PAYLOAD_COUNT,
        }
    }
}

impl TransportConfig {
    /// Parse a JSON configuration document.
    pub fn from_json(input: &str) -> Result<Self> {
        Ok(serde_json::from_str(input)?)
    }

    /// Wire configuration matching these limits.
    pub fn wire_config(&self) -> WireConfig {
        WireConfig {
            max_payload_size: self.max_payload_size,
            ..WireConfig::default()
        }
    }
}

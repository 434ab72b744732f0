//! Channel configuration
//!
//! Each `[[channels]]` entry describes one receiver and its worker pool.
//!
//! ```toml
//! [[channels]]
//! name = "udp_ingest"
//! decode = "extension"
//! receiver = { protocol = "udp", address = "0.0.0.0", port = 58625 }
//! workers = 6
//! exporters = ["file_all"]
//! transfer_exporter = "relay"
//! route_key_mode = "channel_id"
//! ops_services = [{ service_id = 42, channel_id = 1001 }]
//! ```

use std::collections::HashMap;
use std::str::FromStr;

use conduit_protocol::DecodeType;
use conduit_routing::RouteKeyMode;
use conduit_sources::ReceiverConfig;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

/// One ops service id mapped onto a channel id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct OpsServiceMapping {
    pub service_id: u32,
    pub channel_id: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub name: String,

    /// Whether this channel is started
    /// Default: true
    pub enabled: bool,

    /// Wire framing: extension, tlv, legacy or tglog
    /// Default: extension
    pub decode: String,

    pub receiver: ReceiverConfig,

    /// Worker tasks; 0 selects the default, above 64 is clamped
    pub workers: usize,

    /// Per-worker queue ceiling
    /// Default: 100000
    pub queue_ceiling: usize,

    /// Decode and export without queueing
    pub direct: bool,

    /// Static exporters every record is written through
    pub exporters: Vec<String>,

    /// Exporter receiving legacy transfer messages
    pub transfer_exporter: Option<String>,

    /// Which router serves this channel's routing keys
    pub route_key_mode: RouteKeyMode,

    pub ops_services: Vec<OpsServiceMapping>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            decode: DecodeType::Extension.as_str().into(),
            receiver: ReceiverConfig::default(),
            workers: 0,
            queue_ceiling: 100_000,
            direct: false,
            exporters: Vec::new(),
            transfer_exporter: None,
            route_key_mode: RouteKeyMode::ChannelId,
            ops_services: Vec::new(),
        }
    }
}

impl ChannelConfig {
    pub fn decode_type(&self) -> Result<DecodeType> {
        DecodeType::from_str(&self.decode).map_err(|_| {
            ConfigError::invalid_value(
                "channel",
                &self.name,
                "decode",
                format!(
                    "unknown '{}' (expected extension, tlv, legacy or tglog)",
                    self.decode
                ),
            )
        })
    }

    pub fn ops_service_map(&self) -> HashMap<u32, u32> {
        self.ops_services
            .iter()
            .map(|m| (m.service_id, m.channel_id))
            .collect()
    }

    /// Every exporter name this channel refers to
    pub fn exporter_refs(&self) -> impl Iterator<Item = &str> {
        self.exporters
            .iter()
            .map(String::as_str)
            .chain(self.transfer_exporter.as_deref())
    }
}

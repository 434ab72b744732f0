//! Exporter settings
//!
//! One [`ExporterSettings`] describes one exporter instance. The same shape
//! is read from the daemon's TOML file and from exporter feed events (JSON):
//!
//! ```json
//! { "id": 7, "name": "kafka_main", "type": "kafka", "brokers": "k1:9092,k2:9092" }
//! ```

use std::path::PathBuf;

use conduit_routing::Filter;
use serde::{Deserialize, Serialize};

use crate::common::{Result, SinkError};
use crate::exporter::{ChannelFilter, ExporterConfig, ExporterKind};

fn default_pool() -> usize {
    1
}

/// Settings for one exporter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExporterSettings {
    /// Registry id (`stream_to_id` in route payloads); 0 for static exporters
    #[serde(default)]
    pub id: u32,

    pub name: String,

    /// Legacy per-stream binding: only records with this data id are taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_id: Option<u32>,

    /// Output table used with `data_id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,

    #[serde(flatten)]
    pub sink: SinkSettings,
}

impl ExporterSettings {
    pub fn parse(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    pub fn parse_list(payload: &str) -> Result<Vec<Self>> {
        Ok(serde_json::from_str(payload)?)
    }

    pub fn kind(&self) -> ExporterKind {
        self.sink.kind()
    }

    /// Filter configuration the exporter starts with
    pub fn initial_conf(&self) -> ExporterConfig {
        if let Some(data_id) = self.data_id {
            return ExporterConfig::DataId {
                data_id,
                table: self.table.clone().unwrap_or_default(),
            };
        }
        let platform_ids = match &self.sink {
            SinkSettings::Proxy(proxy) => proxy.platform_ids.clone(),
            _ => Vec::new(),
        };
        ExporterConfig::DataFlow { platform_ids }
    }

    /// Filter a legacy data-id entry contributes when it shares a sink
    pub fn channel_filter(&self) -> Option<ChannelFilter> {
        let data_id = self.data_id?;
        let table = self.table.clone().unwrap_or_default();
        Some(ChannelFilter::new(Filter::accept_all(), table).for_channel(data_id))
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(SinkError::config("exporter name must not be empty"));
        }
        self.sink.validate(&self.name)
    }
}

/// Kind-specific settings, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkSettings {
    Kafka(KafkaSettings),
    Pulsar(PulsarSettings),
    Redis(RedisSettings),
    Proxy(ProxySettings),
    File(FileSettings),
}

impl SinkSettings {
    pub fn kind(&self) -> ExporterKind {
        match self {
            Self::Kafka(_) => ExporterKind::Kafka,
            Self::Pulsar(_) => ExporterKind::Pulsar,
            Self::Redis(_) => ExporterKind::Redis,
            Self::Proxy(_) => ExporterKind::Proxy,
            Self::File(_) => ExporterKind::File,
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        let invalid = |what: &str| Err(SinkError::config(format!("exporter '{name}': {what}")));
        match self {
            Self::Kafka(k) if k.brokers.trim().is_empty() => invalid("brokers must not be empty"),
            Self::Kafka(k) if k.producers == 0 => invalid("producers must be at least 1"),
            Self::Pulsar(p) if p.service_url.is_empty() => invalid("service_url must not be empty"),
            Self::Pulsar(p) if p.producers == 0 => invalid("producers must be at least 1"),
            Self::Redis(r) if r.addresses.is_empty() => invalid("addresses must not be empty"),
            Self::Redis(r) if r.mode == RedisMode::Sentinel && r.master_name.is_empty() => {
                invalid("sentinel mode needs master_name")
            }
            Self::Proxy(p) if p.addresses.is_empty() => invalid("addresses must not be empty"),
            Self::Proxy(p) if p.connections == 0 => invalid("connections must be at least 1"),
            Self::Proxy(p) if p.protocol == ProxyProtocol::Http && p.http_workers == 0 => {
                invalid("http_workers must be at least 1")
            }
            Self::File(f) if f.path.as_os_str().is_empty() => invalid("path must not be empty"),
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Kafka
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaSettings {
    /// Comma-separated `host:port` list
    pub brokers: String,
    pub producers: usize,
    /// Fixed topic; when empty the output table names are used
    pub topic: String,
    pub data_set: String,
    pub biz_id: u32,
    pub acks: String,
    pub linger_ms: u32,
    pub queue_buffering_max_messages: u32,
    pub message_max_bytes: u32,
    pub security_protocol: Option<String>,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            brokers: String::new(),
            producers: default_pool(),
            topic: String::new(),
            data_set: String::new(),
            biz_id: 0,
            acks: "1".into(),
            linger_ms: 5,
            queue_buffering_max_messages: 100_000,
            message_max_bytes: 4 * 1024 * 1024,
            security_protocol: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
        }
    }
}

// =============================================================================
// Pulsar
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulsarSettings {
    pub service_url: String,
    pub producers: usize,
    pub tenant: String,
    pub namespace: String,
    /// `persistent` or `non-persistent`
    pub persistent: String,
    pub topic: String,
    pub data_set: String,
    pub biz_id: u32,
    pub token: Option<String>,
}

impl Default for PulsarSettings {
    fn default() -> Self {
        Self {
            service_url: String::new(),
            producers: default_pool(),
            tenant: "public".into(),
            namespace: "default".into(),
            persistent: "persistent".into(),
            topic: String::new(),
            data_set: String::new(),
            biz_id: 0,
            token: None,
        }
    }
}

// =============================================================================
// Redis
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedisMode {
    #[default]
    Single,
    Sentinel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub mode: RedisMode,
    /// Server address (single) or sentinel addresses
    pub addresses: Vec<String>,
    pub master_name: String,
    pub password: Option<String>,
    /// Fixed channel; when empty `data_set + biz_id` is used
    pub channel: String,
    pub data_set: String,
    pub biz_id: u32,
    pub poll_interval_secs: u64,
    pub connect_timeout_ms: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            mode: RedisMode::Single,
            addresses: Vec::new(),
            master_name: String::new(),
            password: None,
            channel: String::new(),
            data_set: String::new(),
            biz_id: 0,
            poll_interval_secs: 5,
            connect_timeout_ms: 1_000,
        }
    }
}

// =============================================================================
// Proxy
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyProtocol {
    #[default]
    Tcp,
    Udp,
    Http,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Http => "http",
        }
    }
}

/// Relay framing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyVersion {
    /// Legacy dynamic-meta report
    V1,
    /// Dynamic-extension frame
    #[default]
    V2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub protocol: ProxyProtocol,
    pub version: ProxyVersion,
    /// `host:port` (tcp/udp) or URLs (http)
    pub addresses: Vec<String>,
    /// Connections per address (tcp)
    pub connections: usize,
    /// Extra extension values appended to every relayed frame
    pub extensions: Vec<String>,
    /// Dataflow platform filter; empty accepts all platforms
    pub platform_ids: Vec<u32>,
    /// Keep the record's channel id in the relayed frame
    pub fill_channel_id: bool,
    pub connect_timeout_ms: u64,
    pub keepalive_secs: u64,
    pub http_queue: usize,
    pub http_workers: usize,
    pub http_timeout_ms: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            protocol: ProxyProtocol::Tcp,
            version: ProxyVersion::V2,
            addresses: Vec::new(),
            connections: default_pool(),
            extensions: Vec::new(),
            platform_ids: Vec::new(),
            fill_channel_id: true,
            connect_timeout_ms: 1_000,
            keepalive_secs: 60,
            http_queue: 10_000,
            http_workers: 2,
            http_timeout_ms: 5_000,
        }
    }
}

// =============================================================================
// File
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRotation {
    #[default]
    Hourly,
    Daily,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSettings {
    pub path: PathBuf,
    pub prefix: String,
    pub rotation: FileRotation,
    /// One file per source id instead of one shared file
    pub per_source: bool,
    pub queue_size: usize,
    pub flush_interval_ms: u64,
    /// Close a file once nothing was written to it for this long
    pub idle_close_secs: u64,
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data"),
            prefix: "records".into(),
            rotation: FileRotation::Hourly,
            per_source: false,
            queue_size: 10_000,
            flush_interval_ms: 100,
            idle_close_secs: 300,
        }
    }
}

#[cfg(test)]
#[path = "settings_test.rs"]
mod settings_test;

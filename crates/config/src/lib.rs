//! Conduit Configuration
//!
//! TOML-based configuration loading with sensible defaults.
//! Only what differs from the defaults needs to be written down.
//!
//! # Parsing
//!
//! Use the `FromStr` trait to parse configuration:
//!
//! ```
//! use conduit_config::Config;
//! use std::str::FromStr;
//!
//! let config = Config::from_str("[[channels]]\nname = \"udp_ingest\"").unwrap();
//! assert_eq!(config.channels.len(), 1);
//! ```
//!
//! # Example Config
//!
//! ```toml
//! [log]
//! level = "info"
//!
//! [[channels]]
//! name = "udp_ingest"
//! decode = "extension"
//! receiver = { protocol = "udp", port = 58625 }
//! exporters = ["file_all"]
//!
//! [exporters.file_all]
//! type = "file"
//! path = "data/"
//! ```

mod channels;
mod error;
mod exporters;
mod global;
mod logging;
mod routes;
mod validation;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

pub use channels::{ChannelConfig, OpsServiceMapping};
pub use error::{ConfigError, Result};
pub use exporters::{ExporterEntry, ExportersConfig};
pub use global::GlobalConfig;
pub use logging::{LogConfig, LogFormat, LogLevel, LogOutput};
pub use routes::{RouteBindingConfig, RouteEntryConfig, RouteFilterConfig};

use conduit_sinks::{ExporterKind, ExporterSettings};
use serde::Deserialize;

/// Main configuration structure
///
/// All sections are optional with sensible defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,

    /// Global settings (shutdown timeout, host address, queue sizes)
    pub global: GlobalConfig,

    /// Ingestion channels
    pub channels: Vec<ChannelConfig>,

    /// Named exporters
    pub exporters: ExportersConfig,

    /// Routes installed at startup
    pub routes: Vec<RouteEntryConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, contains invalid TOML or fails validation.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&contents)
    }

    fn parse(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        validation::validate_config(self)
    }

    /// Channels that should be started
    pub fn enabled_channels(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels.iter().filter(|c| c.enabled)
    }

    /// Check every exporter kind against what the daemon can start
    ///
    /// # Errors
    ///
    /// Returns an `InvalidValue` error naming the first unsupported exporter.
    pub fn validate_sink_support(&self, supported: impl Fn(ExporterKind) -> bool) -> Result<()> {
        validation::validate_sink_support(self, supported)
    }

    /// Exporter settings keyed by name, with registry ids assigned
    pub fn exporter_settings(&self) -> Result<BTreeMap<String, ExporterSettings>> {
        self.exporters.resolve()
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_protocol::DecodeType;
    use conduit_routing::RouteKeyMode;
    use std::io::Write;
    use std::str::FromStr;

    const FULL: &str = r#"
[log]
level = "debug"
format = "json"

[global]
shutdown_timeout_secs = 5

[[channels]]
name = "udp_ingest"
decode = "extension"
receiver = { protocol = "udp", address = "0.0.0.0", port = 58625 }
workers = 6
queue_ceiling = 100000
exporters = ["file_all"]
transfer_exporter = "relay"

[[channels]]
name = "tcp_ingest"
decode = "tlv"
receiver = { protocol = "tcp", port = 58625 }
route_key_mode = "platform"

[exporters.file_all]
type = "file"
path = "data/"

[exporters.relay]
type = "proxy"
protocol = "tcp"
version = "v2"
addresses = ["10.0.0.1:58625"]

[exporters.kafka_main]
id = 7
type = "kafka"
brokers = "k1:9092"

[[routes]]
channel_id = 1001
[[routes.bindings]]
name = "to_kafka"
exporter = "kafka_main"
table = "topic_a"
"#;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_str("").unwrap();
        assert!(config.channels.is_empty());
        assert!(config.exporters.is_empty());
        assert_eq!(config.global.shutdown_timeout_secs, 10);
    }

    #[test]
    fn test_full_config_parse() {
        let config = Config::from_str(FULL).unwrap();

        assert_eq!(config.log.level, LogLevel::Debug);
        assert_eq!(config.global.shutdown_timeout_secs, 5);
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channels[1].decode_type().unwrap(), DecodeType::Tlv);
        assert_eq!(config.channels[1].route_key_mode, RouteKeyMode::Platform);
        assert_eq!(config.exporters.len(), 3);
        assert_eq!(config.routes.len(), 1);

        let exporters = config.exporter_settings().unwrap();
        assert_eq!(exporters["kafka_main"].id, 7);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.enabled_channels().count(), 2);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/conduit.toml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError { .. }));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(Config::from_str("invalid { toml").is_err());
    }

    #[test]
    fn test_unknown_channel_exporter() {
        let toml = r#"
[[channels]]
name = "c"
exporters = ["ghost"]
"#;
        let err = Config::from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownExporter { ref exporter, .. } if exporter == "ghost"));
    }

    #[test]
    fn test_duplicate_port_same_protocol() {
        let toml = r#"
[[channels]]
name = "a"
receiver = { protocol = "udp", port = 9000 }

[[channels]]
name = "b"
receiver = { protocol = "udp", port = 9000 }
"#;
        let err = Config::from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicatePort { port: 9000, .. }));
    }

    #[test]
    fn test_disabled_channel_port_not_checked() {
        let toml = r#"
[[channels]]
name = "a"
receiver = { protocol = "udp", port = 9000 }

[[channels]]
name = "b"
enabled = false
receiver = { protocol = "udp", port = 9000 }
"#;
        let config = Config::from_str(toml).unwrap();
        assert_eq!(config.enabled_channels().count(), 1);
    }

    #[test]
    fn test_duplicate_channel_name() {
        let toml = r#"
[[channels]]
name = "a"
receiver = { port = 1 }

[[channels]]
name = "a"
receiver = { port = 2 }
"#;
        assert!(matches!(
            Config::from_str(toml),
            Err(ConfigError::Duplicate { .. })
        ));
    }

    #[test]
    fn test_bad_receiver_address() {
        let toml = r#"
[[channels]]
name = "a"
receiver = { address = "localhost" }
"#;
        let err = Config::from_str(toml).unwrap_err();
        assert!(err.to_string().contains("receiver.address"));
    }

    #[test]
    fn test_invalid_redis_mode() {
        let toml = r#"
[exporters.cache]
type = "redis"
mode = "cluster"
addresses = ["r:6379"]
"#;
        assert!(matches!(
            Config::from_str(toml),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_sentinel_without_master() {
        let toml = r#"
[exporters.cache]
type = "redis"
mode = "sentinel"
addresses = ["s:26379"]
"#;
        let err = Config::from_str(toml).unwrap_err();
        assert!(err.to_string().contains("master_name"));
    }

    #[test]
    fn test_unsupported_sink_kind_rejected() {
        let toml = r#"
[exporters.file_all]
type = "file"
path = "data/"

[exporters.events]
type = "pulsar"
service_url = "pulsar://p:6650"
"#;
        let config = Config::from_str(toml).unwrap();
        config.validate_sink_support(|_| true).unwrap();

        let err = config
            .validate_sink_support(|kind| kind != ExporterKind::Pulsar)
            .unwrap_err();
        assert!(matches!(
            &err,
            ConfigError::InvalidValue { name, field: "type", .. } if name == "events"
        ));
        assert!(err.to_string().contains("no pulsar client"));
    }

    #[test]
    fn test_zero_pool_size() {
        let toml = r#"
[exporters.kafka]
type = "kafka"
brokers = "k:9092"
producers = 0
"#;
        assert!(Config::from_str(toml).is_err());
    }

    #[test]
    fn test_route_with_undeclared_filter() {
        let toml = r#"
[exporters.kafka_main]
type = "kafka"
brokers = "k:9092"

[[routes]]
channel_id = 1001
[[routes.bindings]]
name = "b"
exporter = "kafka_main"
table = "t"
filter_and = ["eu"]
"#;
        let err = Config::from_str(toml).unwrap_err();
        assert!(err.to_string().contains("undeclared filter"));
    }

    #[test]
    fn test_route_without_key() {
        let toml = r#"
[[routes]]
channel_id = 0
"#;
        assert!(matches!(
            Config::from_str(toml),
            Err(ConfigError::MissingField { .. })
        ));
    }
}

//! Configuration error types

use std::io;
use thiserror::Error;

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur when loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        /// Path to the file
        path: String,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },

    /// Failed to parse TOML
    #[error("failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// A channel or route names an exporter that is not declared
    #[error("{referenced_by} references unknown exporter '{exporter}'")]
    UnknownExporter {
        /// Name of the missing exporter
        exporter: String,
        /// Channel or route holding the reference
        referenced_by: String,
    },

    /// Two receivers of the same protocol bind one port
    #[error("{protocol} port {port} is used by multiple channels: {channels}")]
    DuplicatePort {
        protocol: &'static str,
        port: u16,
        channels: String,
    },

    /// Two components share a name or id
    #[error("duplicate {component} '{name}'")]
    Duplicate {
        component: &'static str,
        name: String,
    },

    /// Validation error - required field missing
    #[error("{component} '{name}' is missing required field '{field}'")]
    MissingField {
        /// Component type (e.g., "channel", "exporter")
        component: &'static str,
        /// Name of the component
        name: String,
        /// Missing field name
        field: &'static str,
    },

    /// Validation error - invalid value
    #[error("{component} '{name}' has invalid {field}: {message}")]
    InvalidValue {
        /// Component type
        component: &'static str,
        /// Name of the component
        name: String,
        /// Field name
        field: &'static str,
        /// Error message
        message: String,
    },

    /// No channel is enabled
    #[error("no channels are enabled - at least one channel must be enabled")]
    NoChannelsEnabled,
}

impl ConfigError {
    pub fn unknown_exporter(exporter: impl Into<String>, referenced_by: impl Into<String>) -> Self {
        Self::UnknownExporter {
            exporter: exporter.into(),
            referenced_by: referenced_by.into(),
        }
    }

    pub fn duplicate_port(protocol: &'static str, port: u16, channels: impl Into<String>) -> Self {
        Self::DuplicatePort {
            protocol,
            port,
            channels: channels.into(),
        }
    }

    pub fn duplicate(component: &'static str, name: impl Into<String>) -> Self {
        Self::Duplicate {
            component,
            name: name.into(),
        }
    }

    /// Create a MissingField error
    pub fn missing_field(
        component: &'static str,
        name: impl Into<String>,
        field: &'static str,
    ) -> Self {
        Self::MissingField {
            component,
            name: name.into(),
            field,
        }
    }

    /// Create an InvalidValue error
    pub fn invalid_value(
        component: &'static str,
        name: impl Into<String>,
        field: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            component,
            name: name.into(),
            field,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_exporter_error() {
        let err = ConfigError::unknown_exporter("kafka_main", "channel 'udp_ingest'");
        assert!(err.to_string().contains("kafka_main"));
        assert!(err.to_string().contains("udp_ingest"));
    }

    #[test]
    fn test_duplicate_port_error() {
        let err = ConfigError::duplicate_port("udp", 58625, "a, b");
        assert!(err.to_string().contains("58625"));
        assert!(err.to_string().contains("a, b"));
        assert!(err.to_string().starts_with("udp"));
    }

    #[test]
    fn test_missing_field_error() {
        let err = ConfigError::missing_field("channel", "udp_ingest", "name");
        assert!(err.to_string().contains("channel"));
        assert!(err.to_string().contains("udp_ingest"));
    }

    #[test]
    fn test_invalid_value_error() {
        let err = ConfigError::invalid_value("channel", "tcp_ingest", "decode", "unknown 'xml'");
        assert!(err.to_string().contains("tcp_ingest"));
        assert!(err.to_string().contains("decode"));
    }

    #[test]
    fn test_no_channels_enabled() {
        assert!(ConfigError::NoChannelsEnabled.to_string().contains("no channels"));
    }
}

//! Logging configuration
//!
//! Controls the daemon's own `tracing` output. Besides the global level,
//! individual crates can be turned up or down:
//!
//! ```toml
//! [log]
//! level = "info"
//! format = "json"
//! output = "stderr"
//!
//! [log.targets]
//! conduit_sinks = "debug"
//! ```

use std::collections::BTreeMap;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Console,
    /// One JSON object per event
    Json,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Per-target overrides, e.g. `conduit_sinks = "debug"`
    pub targets: BTreeMap<String, LogLevel>,
}

impl LogConfig {
    /// Filter directive for `base` plus the per-target overrides
    ///
    /// `base` is the global level, usually [`LogLevel::as_str`] or a
    /// command-line override.
    pub fn directive(&self, base: &str) -> String {
        let mut out = base.to_string();
        for (target, level) in &self.targets {
            out.push(',');
            out.push_str(target);
            out.push('=');
            out.push_str(level.as_str());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: LogConfig = toml::from_str("").unwrap();
        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(config.format, LogFormat::Console);
        assert_eq!(config.output, LogOutput::Stdout);
        assert!(config.targets.is_empty());
        assert_eq!(config.directive("info"), "info");
    }

    #[test]
    fn test_json_to_stderr_with_targets() {
        let config: LogConfig = toml::from_str(
            r#"
level = "warn"
format = "json"
output = "stderr"

[targets]
conduit_sinks = "debug"
conduit_pipeline = "trace"
"#,
        )
        .unwrap();

        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.output, LogOutput::Stderr);
        assert_eq!(
            config.directive(config.level.as_str()),
            "warn,conduit_pipeline=trace,conduit_sinks=debug"
        );
    }

    #[test]
    fn test_unknown_level_rejected() {
        assert!(toml::from_str::<LogConfig>("level = \"loud\"").is_err());
        assert!(toml::from_str::<LogConfig>("[targets]\nconduit_sinks = \"loud\"").is_err());
    }

    #[test]
    fn test_unknown_output_rejected() {
        assert!(toml::from_str::<LogConfig>("output = \"file\"").is_err());
    }
}

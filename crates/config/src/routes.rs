//! Bootstrap routes
//!
//! Routes installed at startup, before any feed event arrives. Each entry is
//! turned into the same JSON payload the config feed carries, so bootstrap
//! and live updates go through one parser.
//!
//! ```toml
//! [[routes]]
//! channel_id = 1001
//!
//! [[routes.filters]]
//! name = "eu"
//! field_in = "protocol"
//! value = "region=eu"
//!
//! [[routes.bindings]]
//! name = "to_kafka"
//! exporter = "kafka_main"
//! table = "topic_a"
//! filter_and = ["eu"]
//! ```

use std::collections::BTreeMap;

use conduit_routing::RouteKeyMode;
use conduit_sinks::{ExporterSettings, SinkSettings};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RouteFilterConfig {
    pub name: String,
    /// `protocol` (extension tags) or `data` (first payload field)
    pub field_in: String,
    pub value: String,
    /// Field separator for `data` filters
    pub separator: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RouteBindingConfig {
    pub name: String,
    pub exporter: String,
    /// Topic, channel or table the exporter writes under
    pub table: String,
    pub filter_and: Vec<String>,
    pub filter_or: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RouteEntryConfig {
    /// Routing key: a channel id, or a platform number in platform mode
    pub channel_id: u32,
    pub route_key_mode: RouteKeyMode,
    pub bindings: Vec<RouteBindingConfig>,
    pub filters: Vec<RouteFilterConfig>,
}

impl RouteEntryConfig {
    /// Label used in error messages
    pub fn label(&self) -> String {
        format!("route {}", self.channel_id)
    }

    /// Build the feed payload for this route
    ///
    /// Exporter names are resolved to registry ids; the target shape follows
    /// the exporter's kind.
    pub fn to_payload(&self, exporters: &BTreeMap<String, ExporterSettings>) -> Result<String> {
        let routes = self
            .bindings
            .iter()
            .map(|binding| -> Result<Value> {
                let settings = exporters
                    .get(&binding.exporter)
                    .ok_or_else(|| ConfigError::unknown_exporter(&binding.exporter, self.label()))?;
                Ok(json!({
                    "name": binding.name,
                    "stream_to": stream_to(settings, &binding.table, &self.label())?,
                    "filter_name_and": binding.filter_and,
                    "filter_name_or": binding.filter_or,
                }))
            })
            .collect::<Result<Vec<Value>>>()?;

        let filters: Vec<Value> = self
            .filters
            .iter()
            .map(|f| {
                json!({
                    "name": f.name,
                    "field_in": f.field_in,
                    "field_data_value": f.value,
                    "field_separator": f.separator,
                })
            })
            .collect();

        Ok(json!({
            "metadata": {"channel_id": self.channel_id},
            "route": routes,
            "stream_filters": filters,
        })
        .to_string())
    }
}

fn stream_to(settings: &ExporterSettings, table: &str, label: &str) -> Result<Value> {
    let target = match &settings.sink {
        SinkSettings::Kafka(_) => json!({"stream_to_id": settings.id, "kafka": {"topic_name": table}}),
        SinkSettings::Pulsar(_) => {
            json!({"stream_to_id": settings.id, "pulsar": {"topic_name": table}})
        }
        SinkSettings::Redis(_) => {
            json!({"stream_to_id": settings.id, "redis": {"channel_name": table}})
        }
        SinkSettings::Proxy(_) => json!({"stream_to_id": settings.id, "dsproxy": {}}),
        SinkSettings::File(_) => {
            return Err(ConfigError::invalid_value(
                "route",
                label,
                "bindings",
                format!(
                    "exporter '{}' is a file exporter; routes target kafka, pulsar, redis or proxy",
                    settings.name
                ),
            ));
        }
    };
    Ok(target)
}

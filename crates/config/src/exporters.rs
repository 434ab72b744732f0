//! Exporter configuration
//!
//! Exporters are declared once under `[exporters.<name>]` and referenced by
//! name from channels and routes. The table body is the sink settings shape,
//! tagged by `type`:
//!
//! ```toml
//! [exporters.kafka_main]
//! type = "kafka"
//! brokers = "k1:9092,k2:9092"
//! producers = 4
//!
//! [exporters.file_all]
//! type = "file"
//! path = "data/"
//! ```
//!
//! Each exporter gets a registry id: the explicit `id` when given, otherwise
//! the lowest free id in name order.

use std::collections::{BTreeMap, BTreeSet};

use conduit_sinks::{ExporterSettings, SinkSettings};
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct ExporterEntry {
    /// Registry id referenced by route payloads
    #[serde(default)]
    pub id: Option<u32>,

    /// Legacy per-stream binding
    #[serde(default)]
    pub data_id: Option<u32>,

    #[serde(default)]
    pub table: Option<String>,

    #[serde(flatten)]
    pub sink: SinkSettings,
}

/// Named exporter declarations
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExportersConfig {
    #[serde(flatten)]
    exporters: BTreeMap<String, ExporterEntry>,
}

impl ExportersConfig {
    pub fn get(&self, name: &str) -> Option<&ExporterEntry> {
        self.exporters.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.exporters.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ExporterEntry)> {
        self.exporters.iter()
    }

    pub fn len(&self) -> usize {
        self.exporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exporters.is_empty()
    }

    /// Settings for every exporter, keyed by name, with ids assigned
    pub fn resolve(&self) -> Result<BTreeMap<String, ExporterSettings>> {
        let mut taken = BTreeSet::new();
        for (name, entry) in &self.exporters {
            if let Some(id) = entry.id {
                if id == 0 {
                    return Err(ConfigError::invalid_value(
                        "exporter",
                        name,
                        "id",
                        "must be greater than 0",
                    ));
                }
                if !taken.insert(id) {
                    return Err(ConfigError::duplicate("exporter id", id.to_string()));
                }
            }
        }

        let mut next = 1u32;
        let mut resolved = BTreeMap::new();
        for (name, entry) in &self.exporters {
            let id = match entry.id {
                Some(id) => id,
                None => {
                    while taken.contains(&next) {
                        next += 1;
                    }
                    taken.insert(next);
                    next
                }
            };
            let settings = ExporterSettings {
                id,
                name: name.clone(),
                data_id: entry.data_id,
                table: entry.table.clone(),
                sink: entry.sink.clone(),
            };
            settings
                .validate()
                .map_err(|e| ConfigError::invalid_value("exporter", name, "settings", e.to_string()))?;
            resolved.insert(name.clone(), settings);
        }
        Ok(resolved)
    }
}

//! Configuration feed for the channel-id router
//!
//! Route and exporter configuration arrives as [`ConfigEvent`]s carrying
//! JSON payloads. This module parses route payloads and compiles them into
//! [`RouteChain`]s ready for [`RoutingTable::update`](crate::RoutingTable::update).
//!
//! A route payload looks like:
//!
//! ```json
//! {
//!   "metadata": { "channel_id": 1001, "plat_name": "tglog" },
//!   "route": [
//!     {
//!       "name": "to_kafka",
//!       "stream_to": { "stream_to_id": 7, "kafka": { "topic_name": "topic_a" } },
//!       "filter_name_and": ["eu"],
//!       "filter_name_or": []
//!     }
//!   ],
//!   "stream_filters": [
//!     { "name": "eu", "field_in": "protocol", "field_data_value": "region=eu" }
//!   ]
//! }
//! ```

use std::collections::HashMap;

use serde::Deserialize;

use crate::filter::{FieldIn, FieldPredicate, Filter};
use crate::{Result, RoutingError};

/// What happened to a configuration key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Full snapshot; the payload is a JSON array
    List,
    Change,
    Create,
    Delete,
}

/// Which registry an event targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTarget {
    Route,
    Exporter,
}

/// One configuration change notification
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConfigEvent {
    pub kind: EventKind,
    pub target: EventTarget,
    /// Route key or exporter id; unused for `List`
    #[serde(default)]
    pub key: u32,
    /// JSON document; empty for `Delete`
    #[serde(default)]
    pub payload: String,
}

impl ConfigEvent {
    pub fn route(kind: EventKind, key: u32, payload: impl Into<String>) -> Self {
        Self {
            kind,
            target: EventTarget::Route,
            key,
            payload: payload.into(),
        }
    }

    pub fn exporter(kind: EventKind, key: u32, payload: impl Into<String>) -> Self {
        Self {
            kind,
            target: EventTarget::Exporter,
            key,
            payload: payload.into(),
        }
    }

    pub fn delete_route(key: u32) -> Self {
        Self::route(EventKind::Delete, key, String::new())
    }

    pub fn delete_exporter(key: u32) -> Self {
        Self::exporter(EventKind::Delete, key, String::new())
    }
}

// =============================================================================
// Route payload
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteMetadata {
    #[serde(default)]
    pub channel_id: u32,
    #[serde(default)]
    pub plat_name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KafkaTarget {
    #[serde(default)]
    pub topic_name: String,
    #[serde(default)]
    pub data_set: String,
    #[serde(default)]
    pub biz_id: u32,
    #[serde(default)]
    pub partition: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PulsarTarget {
    #[serde(default)]
    pub topic_name: String,
    #[serde(default)]
    pub tenant: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub persistent: String,
    #[serde(default)]
    pub data_set: String,
    #[serde(default)]
    pub biz_id: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedisTarget {
    #[serde(default)]
    pub channel_name: String,
    #[serde(default)]
    pub data_set: String,
    #[serde(default)]
    pub biz_id: u32,
}

/// Destination of one route: an exporter id plus the sink-specific output name
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamTo {
    #[serde(default)]
    pub stream_to_id: u32,
    pub kafka: Option<KafkaTarget>,
    pub pulsar: Option<PulsarTarget>,
    pub redis: Option<RedisTarget>,
    pub dsproxy: Option<serde_json::Value>,
}

impl StreamTo {
    /// Output table/topic/channel name for this target
    ///
    /// `None` when no supported target is present. Proxy relays carry no
    /// table name.
    pub fn table_name(&self) -> Option<String> {
        if let Some(kafka) = &self.kafka {
            return Some(name_or_default(
                &kafka.topic_name,
                &kafka.data_set,
                kafka.biz_id,
            ));
        }
        if let Some(pulsar) = &self.pulsar {
            return Some(name_or_default(
                &pulsar.topic_name,
                &pulsar.data_set,
                pulsar.biz_id,
            ));
        }
        if let Some(redis) = &self.redis {
            return Some(name_or_default(
                &redis.channel_name,
                &redis.data_set,
                redis.biz_id,
            ));
        }
        self.dsproxy.as_ref().map(|_| String::new())
    }
}

/// `name`, or `data_set` followed by `biz_id` when the name is empty
pub fn name_or_default(name: &str, data_set: &str, biz_id: u32) -> String {
    if name.is_empty() {
        format!("{data_set}{biz_id}")
    } else {
        name.to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteEntry {
    #[serde(default)]
    pub name: String,
    pub stream_to: StreamTo,
    #[serde(default)]
    pub filter_name_and: Vec<String>,
    #[serde(default)]
    pub filter_name_or: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamFilterSpec {
    pub name: String,
    #[serde(default)]
    pub field_index: u32,
    #[serde(default)]
    pub field_data_type: String,
    #[serde(default)]
    pub field_data_value: String,
    #[serde(default)]
    pub field_separator: String,
    #[serde(default)]
    pub field_in: String,
}

impl StreamFilterSpec {
    fn compile(&self) -> Result<FieldPredicate> {
        let field_in: FieldIn = self.field_in.parse().map_err(|_| {
            RoutingError::invalid_filter(&self.name, "field_in must be 'protocol' or 'data'")
        })?;
        Ok(FieldPredicate {
            name: self.name.clone(),
            field_in,
            value: self.field_data_value.clone(),
            separator: self.field_separator.clone(),
        })
    }
}

/// Route configuration for one channel id
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteConfig {
    #[serde(default)]
    pub metadata: RouteMetadata,
    #[serde(default)]
    pub route: Vec<RouteEntry>,
    #[serde(default)]
    pub stream_filters: Vec<StreamFilterSpec>,
}

/// One compiled (filter, table, exporter) binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteBinding {
    pub name: String,
    pub exporter_id: u32,
    pub table: String,
    pub filter: Filter,
}

/// Ordered bindings for one routing key
pub type RouteChain = Vec<RouteBinding>;

impl RouteConfig {
    pub fn parse(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Parse a `List` payload: a JSON array of route configs
    pub fn parse_list(payload: &str) -> Result<Vec<Self>> {
        Ok(serde_json::from_str(payload)?)
    }

    #[inline]
    pub fn channel_id(&self) -> u32 {
        self.metadata.channel_id
    }

    /// Resolve filter names and targets into a chain
    pub fn compile(&self) -> Result<RouteChain> {
        let channel_id = self.channel_id();
        if channel_id == 0 {
            return Err(RoutingError::missing_field(0, "metadata.channel_id"));
        }

        let mut predicates = HashMap::with_capacity(self.stream_filters.len());
        for spec in &self.stream_filters {
            if spec.name.is_empty() {
                return Err(RoutingError::missing_field(channel_id, "stream_filters.name"));
            }
            predicates.insert(spec.name.as_str(), spec.compile()?);
        }

        let resolve = |route: &str, names: &[String]| -> Result<Vec<FieldPredicate>> {
            names
                .iter()
                .map(|name| {
                    predicates
                        .get(name.as_str())
                        .cloned()
                        .ok_or_else(|| RoutingError::unknown_filter(route, name))
                })
                .collect()
        };

        self.route
            .iter()
            .map(|entry| {
                if entry.name.is_empty() {
                    return Err(RoutingError::missing_field(channel_id, "route.name"));
                }
                let table = entry
                    .stream_to
                    .table_name()
                    .ok_or_else(|| RoutingError::unsupported_target(&entry.name))?;
                let and = resolve(&entry.name, &entry.filter_name_and)?;
                let or = resolve(&entry.name, &entry.filter_name_or)?;
                Ok(RouteBinding {
                    name: entry.name.clone(),
                    exporter_id: entry.stream_to.stream_to_id,
                    table,
                    filter: Filter::new(and, or),
                })
            })
            .collect()
    }
}

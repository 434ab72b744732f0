//! Kafka exporter
//!
//! Records go to a round-robin pool of producers. Each record is produced
//! once per output table name (or to the fixed topic), keyed by
//! `channel_id|minute|host_ip` so one stream's minute lands on one partition.
//!
//! The client sits behind [`KafkaConnector`]; the `kafka` feature provides
//! one backed by rdkafka.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use conduit_protocol::{ChannelId, Record};
use conduit_routing::name_or_default;
use parking_lot::RwLock;

use crate::common::{Result, SinkError};
use crate::exporter::{Exporter, ExporterBase};
use crate::settings::KafkaSettings;

#[cfg(feature = "kafka")]
mod client;

#[cfg(feature = "kafka")]
pub use client::RdKafkaConnector;

/// One producer handle
#[async_trait]
pub trait KafkaProducer: Send + Sync {
    /// Enqueue one message; delivery is observed asynchronously
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()>;

    /// Flush outstanding messages before shutdown
    async fn flush(&self) {}
}

/// Creates producers from settings
pub trait KafkaConnector: Send + Sync {
    fn connect(&self, settings: &KafkaSettings) -> Result<Arc<dyn KafkaProducer>>;
}

/// Message key for a record
pub fn message_key(channel_id: ChannelId, arrived_at_ms: u64, host_ip: &str) -> String {
    format!("{}|{}|{}", channel_id.get(), arrived_at_ms / 60_000, host_ip)
}

pub struct KafkaExporter {
    base: ExporterBase,
    settings: KafkaSettings,
    connector: Option<Arc<dyn KafkaConnector>>,
    producers: RwLock<Vec<Arc<dyn KafkaProducer>>>,
    next: AtomicUsize,
}

impl KafkaExporter {
    pub fn new(
        base: ExporterBase,
        settings: KafkaSettings,
        connector: Option<Arc<dyn KafkaConnector>>,
    ) -> Self {
        Self {
            base,
            settings,
            connector,
            producers: RwLock::new(Vec::new()),
            next: AtomicUsize::new(0),
        }
    }

    fn next_producer(&self) -> Option<Arc<dyn KafkaProducer>> {
        let producers = self.producers.read();
        if producers.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % producers.len();
        Some(Arc::clone(&producers[idx]))
    }

    /// Topics a record is produced to
    fn topics(&self, record: &Record) -> Vec<String> {
        if !self.settings.topic.is_empty() {
            return vec![self.settings.topic.clone()];
        }
        let named: Vec<String> = record
            .table_names
            .iter()
            .filter(|t| !t.is_empty())
            .cloned()
            .collect();
        if named.is_empty() {
            vec![name_or_default("", &self.settings.data_set, self.settings.biz_id)]
        } else {
            named
        }
    }
}

#[async_trait]
impl Exporter for KafkaExporter {
    fn base(&self) -> &ExporterBase {
        &self.base
    }

    async fn start(&self) -> Result<()> {
        let connector = self
            .connector
            .as_ref()
            .ok_or(SinkError::Unavailable("kafka"))?;
        let mut pool = Vec::with_capacity(self.settings.producers);
        for _ in 0..self.settings.producers.max(1) {
            pool.push(connector.connect(&self.settings)?);
        }
        *self.producers.write() = pool;
        tracing::info!(
            exporter = %self.base.name(),
            brokers = %self.settings.brokers,
            producers = self.settings.producers,
            "kafka exporter started"
        );
        Ok(())
    }

    async fn stop(&self) {
        let pool = std::mem::take(&mut *self.producers.write());
        for producer in &pool {
            producer.flush().await;
        }
        tracing::info!(exporter = %self.base.name(), "kafka exporter stopped");
    }

    async fn write(&self, record: &mut Record) -> Result<()> {
        let producer = self
            .next_producer()
            .ok_or_else(|| SinkError::NotRunning(self.base.name().to_string()))?;
        let key = message_key(record.channel_id, record.arrived_at_ms, &self.base.context().host_ip);
        let topics = self.topics(record);

        let mut last_error = None;
        for topic in &topics {
            if let Err(e) = producer.send(topic, &key, record.payload()).await {
                last_error = Some(e);
            }
        }
        record.set_output("kafka", self.settings.brokers.clone(), format!("kafka|{}", topics.join(",")));
        last_error.map_or(Ok(()), Err)
    }
}

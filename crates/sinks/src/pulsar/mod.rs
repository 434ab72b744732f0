//! Pulsar exporter
//!
//! Round-robin over a producer pool. Topics are normalized to
//! `{persistent}://{tenant}/{namespace}/{topic}`. No Pulsar client is linked
//! in; the daemon injects a [`PulsarConnector`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use conduit_protocol::Record;
use conduit_routing::name_or_default;
use parking_lot::RwLock;

use crate::common::{Result, SinkError};
use crate::exporter::{Exporter, ExporterBase};
use crate::settings::PulsarSettings;

#[async_trait]
pub trait PulsarProducer: Send + Sync {
    async fn send(&self, topic: &str, payload: &[u8]) -> Result<()>;

    async fn close(&self) {}
}

pub trait PulsarConnector: Send + Sync {
    fn connect(&self, settings: &PulsarSettings) -> Result<Arc<dyn PulsarProducer>>;
}

/// Fully qualified topic name
///
/// Names that already carry a scheme are kept as they are.
pub fn normalize_topic(settings: &PulsarSettings, topic: &str) -> String {
    if topic.contains("://") {
        return topic.to_string();
    }
    let persistence = if settings.persistent.is_empty() {
        "persistent"
    } else {
        settings.persistent.as_str()
    };
    format!(
        "{persistence}://{}/{}/{topic}",
        settings.tenant, settings.namespace
    )
}

pub struct PulsarExporter {
    base: ExporterBase,
    settings: PulsarSettings,
    connector: Option<Arc<dyn PulsarConnector>>,
    producers: RwLock<Vec<Arc<dyn PulsarProducer>>>,
    next: AtomicUsize,
}

impl PulsarExporter {
    pub fn new(
        base: ExporterBase,
        settings: PulsarSettings,
        connector: Option<Arc<dyn PulsarConnector>>,
    ) -> Self {
        Self {
            base,
            settings,
            connector,
            producers: RwLock::new(Vec::new()),
            next: AtomicUsize::new(0),
        }
    }

    fn next_producer(&self) -> Option<Arc<dyn PulsarProducer>> {
        let producers = self.producers.read();
        if producers.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % producers.len();
        Some(Arc::clone(&producers[idx]))
    }

    fn topics(&self, record: &Record) -> Vec<String> {
        let s = &self.settings;
        if !s.topic.is_empty() {
            return vec![normalize_topic(s, &s.topic)];
        }
        let mut topics: Vec<String> = record
            .table_names
            .iter()
            .filter(|t| !t.is_empty())
            .map(|t| normalize_topic(s, t))
            .collect();
        if topics.is_empty() {
            topics.push(normalize_topic(s, &name_or_default("", &s.data_set, s.biz_id)));
        }
        topics
    }
}

#[async_trait]
impl Exporter for PulsarExporter {
    fn base(&self) -> &ExporterBase {
        &self.base
    }

    async fn start(&self) -> Result<()> {
        let connector = self
            .connector
            .as_ref()
            .ok_or(SinkError::Unavailable("pulsar"))?;
        let pool = (0..self.settings.producers.max(1))
            .map(|_| connector.connect(&self.settings))
            .collect::<Result<Vec<_>>>()?;
        *self.producers.write() = pool;
        tracing::info!(
            exporter = %self.base.name(),
            service_url = %self.settings.service_url,
            "pulsar exporter started"
        );
        Ok(())
    }

    async fn stop(&self) {
        let pool = std::mem::take(&mut *self.producers.write());
        for producer in &pool {
            producer.close().await;
        }
    }

    async fn write(&self, record: &mut Record) -> Result<()> {
        let producer = self
            .next_producer()
            .ok_or_else(|| SinkError::NotRunning(self.base.name().to_string()))?;
        let topics = self.topics(record);
        let mut last_error = None;
        for topic in &topics {
            if let Err(e) = producer.send(topic, record.payload()).await {
                last_error = Some(e);
            }
        }
        record.set_output(
            "pulsar",
            self.settings.service_url.clone(),
            format!("pulsar|{}", topics.join(",")),
        );
        last_error.map_or(Ok(()), Err)
    }
}

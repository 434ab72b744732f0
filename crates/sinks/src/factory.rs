//! Builds exporters of every kind from settings

use std::sync::Arc;

use crate::common::Result;
use crate::exporter::{Exporter, ExporterBase, ExporterContext, ExporterKind};
use crate::file::FileExporter;
use crate::kafka::{KafkaConnector, KafkaExporter};
use crate::proxy::ProxyExporter;
use crate::pulsar::{PulsarConnector, PulsarExporter};
use crate::redis::RedisExporter;
use crate::registry::ExporterFactory;
use crate::settings::{ExporterSettings, SinkSettings};

/// Default factory: one exporter type per settings kind
#[derive(Clone, Default)]
pub struct SinkFactory {
    ctx: ExporterContext,
    kafka: Option<Arc<dyn KafkaConnector>>,
    pulsar: Option<Arc<dyn PulsarConnector>>,
}

impl SinkFactory {
    pub fn new(ctx: ExporterContext) -> Self {
        Self {
            ctx,
            kafka: default_kafka_connector(),
            pulsar: None,
        }
    }

    #[must_use]
    pub fn with_kafka(mut self, connector: Arc<dyn KafkaConnector>) -> Self {
        self.kafka = Some(connector);
        self
    }

    #[must_use]
    pub fn with_pulsar(mut self, connector: Arc<dyn PulsarConnector>) -> Self {
        self.pulsar = Some(connector);
        self
    }

    pub fn context(&self) -> &ExporterContext {
        &self.ctx
    }

    /// Whether exporters of `kind` can be started with this factory
    ///
    /// Kafka and Pulsar need a client connector; the other kinds are built in.
    pub fn supports(&self, kind: ExporterKind) -> bool {
        match kind {
            ExporterKind::Kafka => self.kafka.is_some(),
            ExporterKind::Pulsar => self.pulsar.is_some(),
            ExporterKind::Redis | ExporterKind::Proxy | ExporterKind::File => true,
        }
    }
}

#[cfg(feature = "kafka")]
fn default_kafka_connector() -> Option<Arc<dyn KafkaConnector>> {
    Some(Arc::new(crate::kafka::RdKafkaConnector))
}

#[cfg(not(feature = "kafka"))]
fn default_kafka_connector() -> Option<Arc<dyn KafkaConnector>> {
    None
}

impl ExporterFactory for SinkFactory {
    fn create(&self, settings: &ExporterSettings) -> Result<Arc<dyn Exporter>> {
        settings.validate()?;
        let base = ExporterBase::new(
            settings.id,
            settings.name.clone(),
            settings.kind(),
            self.ctx.clone(),
        )
        .with_conf(settings.initial_conf());

        let exporter: Arc<dyn Exporter> = match &settings.sink {
            SinkSettings::Kafka(k) => {
                Arc::new(KafkaExporter::new(base, k.clone(), self.kafka.clone()))
            }
            SinkSettings::Pulsar(p) => {
                Arc::new(PulsarExporter::new(base, p.clone(), self.pulsar.clone()))
            }
            SinkSettings::Redis(r) => Arc::new(RedisExporter::new(base, r.clone())),
            SinkSettings::Proxy(p) => Arc::new(ProxyExporter::new(base, p.clone())),
            SinkSettings::File(f) => Arc::new(FileExporter::new(base, f.clone())),
        };
        tracing::debug!(exporter = %settings.name, kind = %settings.kind(), "exporter created");
        Ok(exporter)
    }
}

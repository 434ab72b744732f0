//! rdkafka-backed producer

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};

use super::{KafkaConnector, KafkaProducer};
use crate::common::{Result, SinkError};
use crate::settings::KafkaSettings;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds `FutureProducer`s
#[derive(Debug, Default, Clone, Copy)]
pub struct RdKafkaConnector;

impl RdKafkaConnector {
    fn client_config(settings: &KafkaSettings) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &settings.brokers)
            .set("acks", &settings.acks)
            .set("linger.ms", settings.linger_ms.to_string())
            .set(
                "queue.buffering.max.messages",
                settings.queue_buffering_max_messages.to_string(),
            )
            .set("message.max.bytes", settings.message_max_bytes.to_string());

        if let Some(protocol) = &settings.security_protocol {
            config.set("security.protocol", protocol);
        }
        if let Some(mechanism) = &settings.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }
        if let Some(username) = &settings.sasl_username {
            config.set("sasl.username", username);
        }
        if let Some(password) = &settings.sasl_password {
            config.set("sasl.password", password);
        }
        config
    }
}

impl KafkaConnector for RdKafkaConnector {
    fn connect(&self, settings: &KafkaSettings) -> Result<Arc<dyn KafkaProducer>> {
        let producer: FutureProducer = Self::client_config(settings)
            .create()
            .map_err(|e| SinkError::connection(settings.brokers.clone(), e))?;
        Ok(Arc::new(RdKafkaProducer {
            producer,
            delivery_failures: Arc::new(AtomicU64::new(0)),
        }))
    }
}

struct RdKafkaProducer {
    producer: FutureProducer,
    delivery_failures: Arc<AtomicU64>,
}

#[async_trait]
impl KafkaProducer for RdKafkaProducer {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        let record = FutureRecord::to(topic).key(key).payload(payload);
        let delivery = self
            .producer
            .send_result(record)
            .map_err(|(e, _)| SinkError::write(format!("kafka enqueue to {topic}: {e}")))?;

        // Delivery is observed off the hot path
        let failures = Arc::clone(&self.delivery_failures);
        let topic = topic.to_string();
        tokio::spawn(async move {
            match delivery.await {
                Ok(Ok(_)) => {}
                Ok(Err((e, _))) => {
                    let n = failures.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::debug!(topic = %topic, error = %e, failures = n, "kafka delivery failed");
                }
                Err(_) => {
                    failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
        Ok(())
    }

    async fn flush(&self) {
        if let Err(e) = self.producer.flush(FLUSH_TIMEOUT) {
            tracing::warn!(error = %e, "kafka flush failed");
        }
    }
}

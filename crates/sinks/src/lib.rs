//! Conduit Sinks - exporters and fan-out chains
//!
//! An exporter is a started, connected sink that takes one [`Record`] at a
//! time. Workers call [`Exporter::deliver`] concurrently; it wraps the
//! kind-specific write with delivery accounting.
//!
//! ```text
//! [Worker] --&mut Record--> [ExporterChain] --filter--> [Exporter::deliver] --> [Sink]
//!                               |
//!           [Router] --id--> [ExporterRegistry]
//! ```
//!
//! # Exporter kinds
//!
//! | Kind | Destination | Client |
//! |------|-------------|--------|
//! | `kafka` | Kafka topics | rdkafka (`kafka` feature) or injected |
//! | `pulsar` | Pulsar topics | injected |
//! | `redis` | Redis pub/sub, single or sentinel | built-in RESP |
//! | `proxy` | Another collector tier over TCP/UDP/HTTP | tokio, reqwest |
//! | `file` | Rotating local log files | std |
//!
//! [`Record`]: conduit_protocol::Record

mod chain;
mod common;
mod exporter;
mod factory;
mod registry;
mod settings;

pub mod file;
pub mod kafka;
pub mod proxy;
pub mod pulsar;
pub mod redis;
pub mod util;

pub use chain::ExporterChain;
pub use common::{
    ExporterMetrics, ExporterMetricsHandle, ExporterMetricsSnapshot, Result, SinkError,
};
pub use exporter::{
    ChannelFilter, DEFAULT_STOP_GRACE, Exporter, ExporterBase, ExporterConfig, ExporterContext,
    ExporterKind,
};
pub use factory::SinkFactory;
pub use registry::{ExporterFactory, ExporterRegistry, REGISTRY_SWEEP_INTERVAL};
pub use settings::{
    ExporterSettings, FileRotation, FileSettings, KafkaSettings, ProxyProtocol, ProxySettings,
    ProxyVersion, PulsarSettings, RedisMode, RedisSettings, SinkSettings,
};

#[cfg(test)]
mod testutil;

//! Conduit Pipeline - channels, workers and the channel-id router
//!
//! Wires a receiver to a codec, a worker pool and the exporters.
//!
//! # Architecture
//!
//! ```text
//! [Receiver]           [Worker pool]                   [Exporters]
//!    UDP ──┐                                         ┌──> static (dataflow) chain
//!          ├──> Channel ──> crossfire queues ──> decode ┤
//!    TCP ──┘                                         └──> ChannelIdRouter ──> registry
//! ```
//!
//! # Key Design
//!
//! - **Bounded queues**: `notify` never blocks; a queue at its ceiling sheds
//! - **One owner per record**: records move through the pipeline and are
//!   released by whichever stage ends their journey
//! - **Off-path updates**: route and exporter changes arrive on a bounded
//!   event queue and are applied by a background task
//! - **Deferred release**: replaced chains and exporters stay alive for a
//!   grace window before they are released

mod channel;
mod error;
mod metrics;
mod router;
mod worker;

pub use channel::{Channel, ChannelConf, ChannelDeps, ChannelMetricsHandle, PENDING_SWEEP_INTERVAL};
pub use error::{PipelineError, Result};
pub use metrics::{RouterMetrics, RouterMetricsSnapshot, WorkerMetrics, WorkerMetricsSnapshot};
pub use router::{ChannelIdRouter, ConfigFeed, DEFAULT_EVENT_QUEUE, RouterMetricsHandle};
pub use worker::{
    DEFAULT_QUEUE_CEILING, DEFAULT_WORKERS, MAX_WORKERS, RecordHandler, WorkerPool,
    effective_workers,
};

#[cfg(test)]
mod testutil;

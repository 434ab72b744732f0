//! Pipeline error types
//!
//! Errors raised while starting or driving a channel. Routing misses and
//! queue-full drops are not errors; they are counted and logged.

use conduit_protocol::ProtocolError;
use conduit_routing::RoutingError;
use conduit_sinks::SinkError;
use conduit_sources::SourceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// `start` was called before `update_conf`
    #[error("channel '{0}' has no configuration")]
    NotConfigured(String),

    /// The channel is not running
    #[error("channel '{0}' is not running")]
    NotRunning(String),

    /// The worker pool could not be started
    #[error("channel '{channel}' failed to start workers: {reason}")]
    Workers { channel: String, reason: String },

    /// The config event feed is closed or full
    #[error("config event feed: {0}")]
    Feed(String),

    /// A record could not be decoded
    #[error("decode error: {0}")]
    Decode(#[from] ProtocolError),

    #[error("receiver error: {0}")]
    Receiver(#[from] SourceError),

    #[error("exporter error: {0}")]
    Sink(#[from] SinkError),

    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),
}

impl PipelineError {
    pub fn workers(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Workers {
            channel: channel.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

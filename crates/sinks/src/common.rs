//! Common types shared by all exporters
//!
//! Error type, result alias and the per-exporter metrics block.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

/// Result type for exporter operations
pub type Result<T> = std::result::Result<T, SinkError>;

/// Metrics kept by every exporter
#[derive(Debug, Default)]
pub struct ExporterMetrics {
    /// Records handed to `write`
    pub writes: AtomicU64,

    /// Writes that reached the sink
    pub writes_ok: AtomicU64,

    /// Writes that failed
    pub writes_failed: AtomicU64,

    /// Payload bytes written
    pub bytes_written: AtomicU64,

    /// Records skipped by the link filter
    pub filtered: AtomicU64,

    /// Connection (re)establishments
    pub reconnects: AtomicU64,
}

impl ExporterMetrics {
    pub const fn new() -> Self {
        Self {
            writes: AtomicU64::new(0),
            writes_ok: AtomicU64::new(0),
            writes_failed: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_ok(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.writes_ok.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_failed(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.writes_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ExporterMetricsSnapshot {
        ExporterMetricsSnapshot {
            writes: self.writes.load(Ordering::Relaxed),
            writes_ok: self.writes_ok.load(Ordering::Relaxed),
            writes_failed: self.writes_failed.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of exporter metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExporterMetricsSnapshot {
    pub writes: u64,
    pub writes_ok: u64,
    pub writes_failed: u64,
    pub bytes_written: u64,
    pub filtered: u64,
    pub reconnects: u64,
}

impl ExporterMetricsSnapshot {
    /// Change since an earlier snapshot
    pub fn diff(&self, previous: &ExporterMetricsSnapshot) -> ExporterMetricsSnapshot {
        ExporterMetricsSnapshot {
            writes: self.writes.saturating_sub(previous.writes),
            writes_ok: self.writes_ok.saturating_sub(previous.writes_ok),
            writes_failed: self.writes_failed.saturating_sub(previous.writes_failed),
            bytes_written: self.bytes_written.saturating_sub(previous.bytes_written),
            filtered: self.filtered.saturating_sub(previous.filtered),
            reconnects: self.reconnects.saturating_sub(previous.reconnects),
        }
    }
}

/// Cloneable read handle on an exporter's metrics
///
/// Stays valid after the exporter is stopped and released.
#[derive(Clone)]
pub struct ExporterMetricsHandle {
    name: String,
    kind: &'static str,
    metrics: Arc<ExporterMetrics>,
}

impl ExporterMetricsHandle {
    pub(crate) fn new(name: String, kind: &'static str, metrics: Arc<ExporterMetrics>) -> Self {
        Self {
            name,
            kind,
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn snapshot(&self) -> ExporterMetricsSnapshot {
        self.metrics.snapshot()
    }
}

/// Exporter errors
#[derive(Debug, Error)]
pub enum SinkError {
    /// Exporter could not be started
    #[error("failed to start exporter '{name}': {reason}")]
    Start { name: String, reason: String },

    /// A write did not reach the sink
    #[error("write failed: {0}")]
    Write(String),

    /// Connection error (network sinks)
    #[error("connection to {target} failed: {reason}")]
    Connection { target: String, reason: String },

    /// Exporter was used before `start` or after `stop`
    #[error("exporter '{0}' is not running")]
    NotRunning(String),

    /// Invalid exporter settings
    #[error("configuration error: {0}")]
    Config(String),

    /// Client library not compiled in or not provided
    #[error("{0} client is not available")]
    Unavailable(&'static str),

    /// Bounded queue is full
    #[error("queue full for exporter '{0}'")]
    QueueFull(String),

    /// Frame could not be built
    #[error("encode failed: {0}")]
    Encode(#[from] conduit_protocol::ProtocolError),

    /// Settings payload is not valid JSON
    #[error("invalid exporter payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SinkError {
    #[inline]
    pub fn start(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Start {
            name: name.into(),
            reason: reason.into(),
        }
    }

    #[inline]
    pub fn write(msg: impl Into<String>) -> Self {
        Self::Write(msg.into())
    }

    #[inline]
    pub fn connection(target: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Connection {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    #[inline]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
#[path = "common_test.rs"]
mod common_test;

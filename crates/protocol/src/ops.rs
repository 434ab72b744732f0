//! Delivery accounting
//!
//! Every terminal state a record reaches is reported once through an
//! [`OpsReporter`]. Reporters are fire-and-forget and must not block.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::ChannelId;
use crate::record::{RecordError, Transport};

/// Accounting state of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpsState {
    /// Decoded and entering the export stage
    Dealing,
    /// Accepted by an exporter
    Output,
    /// Decode or delivery failure
    Lost,
    /// Shed before processing (queue full)
    Dropped,
}

impl OpsState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dealing => "dealing",
            Self::Output => "output",
            Self::Lost => "lost",
            Self::Dropped => "dropped",
        }
    }
}

impl fmt::Display for OpsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time accounting view of one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpsSnapshot {
    pub state: OpsState,
    pub channel_id: ChannelId,
    pub bytes: u64,
    pub source_ip: IpAddr,
    pub transport: Transport,
    pub arrived_at_ms: u64,
    pub output_at_ms: u64,
    pub output_tag: String,
    pub error: Option<RecordError>,
}

/// Sink for accounting events
pub trait OpsReporter: Send + Sync {
    fn put_ops(&self, snapshot: OpsSnapshot);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopOpsReporter;

impl OpsReporter for NoopOpsReporter {
    #[inline]
    fn put_ops(&self, _snapshot: OpsSnapshot) {}
}

/// Counts events per state and traces lost records
#[derive(Debug, Default)]
pub struct CountingOpsReporter {
    dealing: AtomicU64,
    output: AtomicU64,
    lost: AtomicU64,
    dropped: AtomicU64,
    bytes_output: AtomicU64,
}

impl CountingOpsReporter {
    pub const fn new() -> Self {
        Self {
            dealing: AtomicU64::new(0),
            output: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            bytes_output: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> OpsCounts {
        OpsCounts {
            dealing: self.dealing.load(Ordering::Relaxed),
            output: self.output.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            bytes_output: self.bytes_output.load(Ordering::Relaxed),
        }
    }
}

impl OpsReporter for CountingOpsReporter {
    fn put_ops(&self, snapshot: OpsSnapshot) {
        match snapshot.state {
            OpsState::Dealing => {
                self.dealing.fetch_add(1, Ordering::Relaxed);
            }
            OpsState::Output => {
                self.output.fetch_add(1, Ordering::Relaxed);
                self.bytes_output
                    .fetch_add(snapshot.bytes, Ordering::Relaxed);
            }
            OpsState::Lost => {
                self.lost.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    channel_id = %snapshot.channel_id,
                    source_ip = %snapshot.source_ip,
                    error = ?snapshot.error,
                    "record lost"
                );
            }
            OpsState::Dropped => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Copy of [`CountingOpsReporter`] counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpsCounts {
    pub dealing: u64,
    pub output: u64,
    pub lost: u64,
    pub dropped: u64,
    pub bytes_output: u64,
}

impl OpsCounts {
    /// Difference from an earlier snapshot
    pub fn diff(&self, previous: &OpsCounts) -> OpsCounts {
        OpsCounts {
            dealing: self.dealing.saturating_sub(previous.dealing),
            output: self.output.saturating_sub(previous.output),
            lost: self.lost.saturating_sub(previous.lost),
            dropped: self.dropped.saturating_sub(previous.dropped),
            bytes_output: self.bytes_output.saturating_sub(previous.bytes_output),
        }
    }
}

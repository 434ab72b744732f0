//! Pipeline metrics
//!
//! Atomic counters for worker pools and the channel-id router.
//! All operations use relaxed ordering; values are eventually consistent.

use std::sync::atomic::{AtomicU64, Ordering};

use conduit_protocol::now_ms;

/// Counters shared by every worker of one channel
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    /// Records accepted into a worker queue
    enqueued: AtomicU64,

    /// Records shed at the queue ceiling
    dropped: AtomicU64,

    /// Records taken off a queue (or handled inline in direct mode)
    processed: AtomicU64,

    /// Records whose journey ended on a worker
    released: AtomicU64,

    /// Decode failures
    lost: AtomicU64,

    /// Heartbeats and other silently skipped messages
    skipped: AtomicU64,

    /// Legacy transfer messages relayed raw
    transferred: AtomicU64,
}

impl WorkerMetrics {
    pub const fn new() -> Self {
        Self {
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            released: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            transferred: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_lost(&self) {
        self.lost.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transferred(&self) {
        self.transferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerMetricsSnapshot {
        WorkerMetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            transferred: self.transferred.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`WorkerMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerMetricsSnapshot {
    pub enqueued: u64,
    pub dropped: u64,
    pub processed: u64,
    pub released: u64,
    pub lost: u64,
    pub skipped: u64,
    pub transferred: u64,
}

impl WorkerMetricsSnapshot {
    /// Records dequeued but not yet released
    #[inline]
    pub fn in_flight(&self) -> u64 {
        self.processed.saturating_sub(self.released)
    }

    pub fn diff(&self, previous: &Self) -> Self {
        Self {
            enqueued: self.enqueued.saturating_sub(previous.enqueued),
            dropped: self.dropped.saturating_sub(previous.dropped),
            processed: self.processed.saturating_sub(previous.processed),
            released: self.released.saturating_sub(previous.released),
            lost: self.lost.saturating_sub(previous.lost),
            skipped: self.skipped.saturating_sub(previous.skipped),
            transferred: self.transferred.saturating_sub(previous.transferred),
        }
    }
}

/// Counters for the channel-id router
#[derive(Debug, Default)]
pub struct RouterMetrics {
    /// Routing table lookups
    lookups: AtomicU64,

    /// Lookups with no chain installed
    misses: AtomicU64,

    /// Bindings whose filter matched
    matched: AtomicU64,

    /// Bindings whose filter rejected the record
    filtered: AtomicU64,

    /// Bindings naming an exporter id the registry does not hold
    missing_exporter: AtomicU64,

    /// Successful deliveries
    delivered: AtomicU64,

    /// Config events applied
    events_applied: AtomicU64,

    /// Config events rejected (malformed payload, unknown target)
    events_rejected: AtomicU64,
}

impl RouterMetrics {
    pub const fn new() -> Self {
        Self {
            lookups: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            matched: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            missing_exporter: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            events_applied: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_lookup(&self) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_matched(&self) {
        self.matched.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_missing_exporter(&self) {
        self.missing_exporter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event(&self, ok: bool) {
        if ok {
            self.events_applied.fetch_add(1, Ordering::Relaxed);
        } else {
            self.events_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> RouterMetricsSnapshot {
        RouterMetricsSnapshot {
            lookups: self.lookups.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            missing_exporter: self.missing_exporter.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RouterMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterMetricsSnapshot {
    pub lookups: u64,
    pub misses: u64,
    pub matched: u64,
    pub filtered: u64,
    pub missing_exporter: u64,
    pub delivered: u64,
    pub events_applied: u64,
    pub events_rejected: u64,
}

impl RouterMetricsSnapshot {
    /// Share of lookups that found a chain (0.0 - 1.0)
    ///
    /// Returns None if nothing was looked up yet.
    #[inline]
    pub fn hit_rate(&self) -> Option<f64> {
        if self.lookups == 0 {
            None
        } else {
            Some(self.lookups.saturating_sub(self.misses) as f64 / self.lookups as f64)
        }
    }

    pub fn diff(&self, previous: &Self) -> Self {
        Self {
            lookups: self.lookups.saturating_sub(previous.lookups),
            misses: self.misses.saturating_sub(previous.misses),
            matched: self.matched.saturating_sub(previous.matched),
            filtered: self.filtered.saturating_sub(previous.filtered),
            missing_exporter: self.missing_exporter.saturating_sub(previous.missing_exporter),
            delivered: self.delivered.saturating_sub(previous.delivered),
            events_applied: self.events_applied.saturating_sub(previous.events_applied),
            events_rejected: self.events_rejected.saturating_sub(previous.events_rejected),
        }
    }
}

// ============================================================================
// Backpressure Tracker - Rate-limited logging for load shedding
// ============================================================================

/// Aggregates queue-full drops and logs a summary at most once per second
///
/// - >0 drops/sec: WARN
/// - >100 drops/sec: ERROR (workers cannot keep up)
pub struct BackpressureTracker {
    /// Drops in current interval
    interval_drops: AtomicU64,
    /// Last log time (epoch milliseconds)
    last_log_ms: AtomicU64,
}

/// Log interval in milliseconds
const LOG_INTERVAL_MS: u64 = 1000;
/// Drops per interval that escalate to ERROR
const CRITICAL_DROP_THRESHOLD: u64 = 100;

impl BackpressureTracker {
    pub fn new() -> Self {
        Self {
            interval_drops: AtomicU64::new(0),
            last_log_ms: AtomicU64::new(now_ms()),
        }
    }

    /// Count one shed record; returns true if a summary was logged
    pub fn record_drop(&self, channel: &str) -> bool {
        self.interval_drops.fetch_add(1, Ordering::Relaxed);
        self.maybe_log(channel, now_ms())
    }

    fn maybe_log(&self, channel: &str, now: u64) -> bool {
        let last = self.last_log_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < LOG_INTERVAL_MS {
            return false;
        }

        // Claim the log slot so concurrent callers don't double-log
        if self
            .last_log_ms
            .compare_exchange(last, now, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }

        let drops = self.interval_drops.swap(0, Ordering::Relaxed);
        if drops == 0 {
            return false;
        }

        if drops > CRITICAL_DROP_THRESHOLD {
            tracing::error!(
                channel,
                dropped = drops,
                threshold = CRITICAL_DROP_THRESHOLD,
                "CRITICAL: worker queues at ceiling, shedding load"
            );
        } else {
            tracing::warn!(channel, dropped = drops, "worker queue full, records dropped");
        }
        true
    }

    #[cfg(test)]
    pub fn current_drops(&self) -> u64 {
        self.interval_drops.load(Ordering::Relaxed)
    }
}

impl Default for BackpressureTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BackpressureTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackpressureTracker")
            .field(
                "interval_drops",
                &self.interval_drops.load(Ordering::Relaxed),
            )
            .finish()
    }
}

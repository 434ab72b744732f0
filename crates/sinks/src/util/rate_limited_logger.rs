//! Rate-limited logging for hot-path failures
//!
//! Exporters and worker queues can fail thousands of times a second when a
//! downstream is down. The logger emits at most one event per interval and
//! reports how many were folded into it.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Default interval between emitted events
pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Warn,
    Error,
}

/// Logs at most once per interval, counting what it suppressed
#[derive(Debug)]
pub struct RateLimitedLogger {
    min_interval: Duration,
    last_log_time: Mutex<Option<Instant>>,
    /// Events since the last emitted one
    pending: AtomicU64,
    total: AtomicU64,
}

impl RateLimitedLogger {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_log_time: Mutex::new(None),
            pending: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    /// Record a failure; returns true if it was logged
    pub fn error(&self, target: &str, error: &dyn Display) -> bool {
        self.log(Level::Error, target, error, Instant::now())
    }

    /// Record a warning (load shedding, retries); returns true if it was logged
    pub fn warn(&self, target: &str, reason: &dyn Display) -> bool {
        self.log(Level::Warn, target, reason, Instant::now())
    }

    fn log(&self, level: Level, target: &str, error: &dyn Display, now: Instant) -> bool {
        self.pending.fetch_add(1, Ordering::Relaxed);
        let total = self.total.fetch_add(1, Ordering::Relaxed) + 1;

        if !self.should_log(now) {
            return false;
        }

        let suppressed = self.pending.swap(0, Ordering::Relaxed).saturating_sub(1);
        match level {
            Level::Error => tracing::error!(
                target_name = %target,
                error = %error,
                suppressed,
                total,
                "delivery failure"
            ),
            Level::Warn => tracing::warn!(
                target_name = %target,
                reason = %error,
                suppressed,
                total,
                "degraded"
            ),
        }
        true
    }

    fn should_log(&self, now: Instant) -> bool {
        let mut last = self.last_log_time.lock();
        match *last {
            Some(at) if now.saturating_duration_since(at) < self.min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Events recorded since the last emitted one
    pub fn pending_count(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn total_count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

impl Default for RateLimitedLogger {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_event_logs() {
        let logger = RateLimitedLogger::default();
        assert!(logger.error("kafka_main", &"broker down"));
        assert_eq!(logger.total_count(), 1);
        assert_eq!(logger.pending_count(), 0);
    }

    #[test]
    fn test_burst_is_folded() {
        let logger = RateLimitedLogger::new(Duration::from_secs(10));
        assert!(logger.warn("worker-0", &"queue full"));

        for _ in 0..10 {
            assert!(!logger.warn("worker-0", &"queue full"));
        }

        assert_eq!(logger.total_count(), 11);
        assert_eq!(logger.pending_count(), 10);
    }

    #[test]
    fn test_logs_again_after_interval() {
        let logger = RateLimitedLogger::new(Duration::from_secs(10));
        let start = Instant::now();

        assert!(logger.log(Level::Error, "relay", &"refused", start));
        assert!(!logger.log(Level::Error, "relay", &"refused", start + Duration::from_secs(9)));
        assert!(logger.log(Level::Error, "relay", &"refused", start + Duration::from_secs(10)));
        assert_eq!(logger.pending_count(), 0);
    }
}

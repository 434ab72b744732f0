//! Per-codec counters

use std::sync::atomic::{AtomicU64, Ordering};

use crate::FailureKind;

/// Receive and failure counters for one codec instance
///
/// Relaxed ordering throughout; values are eventually consistent.
#[derive(Debug, Default)]
pub struct CodecMetrics {
    received: AtomicU64,
    bytes: AtomicU64,
    magic_errors: AtomicU64,
    length_errors: AtomicU64,
    missing_tag_errors: AtomicU64,
    malformed_errors: AtomicU64,
    type_errors: AtomicU64,
    skipped: AtomicU64,
    transferred: AtomicU64,
}

impl CodecMetrics {
    pub const fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            magic_errors: AtomicU64::new(0),
            length_errors: AtomicU64::new(0),
            missing_tag_errors: AtomicU64::new(0),
            malformed_errors: AtomicU64::new(0),
            type_errors: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            transferred: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_received(&self, bytes: u64) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_failure(&self, kind: FailureKind) {
        let counter = match kind {
            FailureKind::Magic => &self.magic_errors,
            FailureKind::BodyLength => &self.length_errors,
            FailureKind::MissingTag => &self.missing_tag_errors,
            FailureKind::Malformed => &self.malformed_errors,
            FailureKind::MessageType => &self.type_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transferred(&self) {
        self.transferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CodecMetricsSnapshot {
        CodecMetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            magic_errors: self.magic_errors.load(Ordering::Relaxed),
            length_errors: self.length_errors.load(Ordering::Relaxed),
            missing_tag_errors: self.missing_tag_errors.load(Ordering::Relaxed),
            malformed_errors: self.malformed_errors.load(Ordering::Relaxed),
            type_errors: self.type_errors.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            transferred: self.transferred.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CodecMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodecMetricsSnapshot {
    pub received: u64,
    pub bytes: u64,
    pub magic_errors: u64,
    pub length_errors: u64,
    pub missing_tag_errors: u64,
    pub malformed_errors: u64,
    pub type_errors: u64,
    pub skipped: u64,
    pub transferred: u64,
}

impl CodecMetricsSnapshot {
    /// Sum of all failure categories
    pub fn failures(&self) -> u64 {
        self.magic_errors
            + self.length_errors
            + self.missing_tag_errors
            + self.malformed_errors
            + self.type_errors
    }

    pub fn diff(&self, previous: &CodecMetricsSnapshot) -> CodecMetricsSnapshot {
        CodecMetricsSnapshot {
            received: self.received.saturating_sub(previous.received),
            bytes: self.bytes.saturating_sub(previous.bytes),
            magic_errors: self.magic_errors.saturating_sub(previous.magic_errors),
            length_errors: self.length_errors.saturating_sub(previous.length_errors),
            missing_tag_errors: self
                .missing_tag_errors
                .saturating_sub(previous.missing_tag_errors),
            malformed_errors: self
                .malformed_errors
                .saturating_sub(previous.malformed_errors),
            type_errors: self.type_errors.saturating_sub(previous.type_errors),
            skipped: self.skipped.saturating_sub(previous.skipped),
            transferred: self.transferred.saturating_sub(previous.transferred),
        }
    }
}

//! Worker pool
//!
//! N independent tasks, each draining its own bounded crossfire queue.
//! Records are spread round-robin; there is no affinity and no ordering
//! across workers.
//!
//! ```text
//! on_record ──notify──┬──> [queue 0] ──> worker 0 ──┐
//!                     ├──> [queue 1] ──> worker 1 ──┼──> RecordHandler::deal_data
//!                     └──> [queue N] ──> worker N ──┘
//! ```
//!
//! `notify` never blocks: a queue at its ceiling sheds the record.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use conduit_protocol::{ErrorCode, OpsReporter, OpsState, Record};
use crossfire::{AsyncRx, MAsyncTx, TrySendError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{PipelineError, Result};
use crate::metrics::{BackpressureTracker, WorkerMetrics};

/// Hard upper bound on workers per channel
pub const MAX_WORKERS: usize = 64;

/// Workers used when the configured count is zero
pub const DEFAULT_WORKERS: usize = 6;

/// Default per-worker queue ceiling
pub const DEFAULT_QUEUE_CEILING: usize = 100_000;

/// Tick that drains anything a missed wake-up left behind
pub const DRAIN_INTERVAL: Duration = Duration::from_millis(100);

/// Period of the queue depth report
pub const DEPTH_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Enqueue attempts before a record is shed
const ENQUEUE_RETRIES: usize = 3;

/// Effective worker count: 0 means default, above the ceiling is clamped
pub fn effective_workers(configured: usize) -> usize {
    match configured {
        0 => DEFAULT_WORKERS,
        n => n.min(MAX_WORKERS),
    }
}

/// Consumer of dequeued records
///
/// Takes ownership: whatever path `deal_data` follows, the record is
/// released when it returns.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn deal_data(&self, record: Record);
}

struct WorkerQueue {
    tx: MAsyncTx<Record>,
    depth: Arc<AtomicUsize>,
}

/// Running pool of workers
pub struct WorkerPool {
    name: String,
    queues: Vec<WorkerQueue>,
    next: AtomicUsize,
    ceiling: usize,
    metrics: Arc<WorkerMetrics>,
    backpressure: BackpressureTracker,
    ops: Arc<dyn OpsReporter>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl WorkerPool {
    /// Spawn `workers` tasks feeding `handler`
    ///
    /// Fails when `workers` is zero or the ceiling is zero.
    pub fn start(
        name: impl Into<String>,
        workers: usize,
        ceiling: usize,
        handler: Arc<dyn RecordHandler>,
        metrics: Arc<WorkerMetrics>,
        ops: Arc<dyn OpsReporter>,
    ) -> Result<Self> {
        let name = name.into();
        if workers == 0 {
            return Err(PipelineError::workers(&name, "zero workers"));
        }
        if ceiling == 0 {
            return Err(PipelineError::workers(&name, "zero queue ceiling"));
        }

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let mut queues = Vec::with_capacity(workers);

        for worker_id in 0..workers {
            let (tx, rx) = crossfire::mpsc::bounded_async::<Record>(ceiling);
            let depth = Arc::new(AtomicUsize::new(0));
            let worker = Worker {
                id: worker_id,
                channel: name.clone(),
                depth: Arc::clone(&depth),
                handler: Arc::clone(&handler),
                metrics: Arc::clone(&metrics),
            };
            tracker.spawn(worker.run(rx, cancel.clone()));
            queues.push(WorkerQueue { tx, depth });
        }

        tracing::info!(channel = %name, workers, ceiling, "worker pool started");

        Ok(Self {
            name,
            queues,
            next: AtomicUsize::new(0),
            ceiling,
            metrics,
            backpressure: BackpressureTracker::new(),
            ops,
            cancel,
            tracker,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    #[inline]
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    /// Records currently queued per worker
    pub fn depths(&self) -> Vec<usize> {
        self.queues
            .iter()
            .map(|q| q.depth.load(Ordering::Relaxed))
            .collect()
    }

    /// Hand `record` to the next worker round-robin
    ///
    /// Returns false when the record was shed.
    pub fn dispatch(&self, record: Record) -> bool {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        self.notify(index, record)
    }

    /// Enqueue on a specific worker, shedding at the ceiling
    pub fn notify(&self, index: usize, mut record: Record) -> bool {
        let queue = &self.queues[index % self.queues.len()];
        if queue.depth.load(Ordering::Relaxed) >= self.ceiling {
            self.shed(record, "queue at ceiling");
            return false;
        }

        // Counted before the send so the worker's decrement never runs first
        queue.depth.fetch_add(1, Ordering::Relaxed);
        for attempt in 0..ENQUEUE_RETRIES {
            match queue.tx.try_send(record) {
                Ok(()) => {
                    self.metrics.record_enqueued();
                    return true;
                }
                Err(TrySendError::Full(r)) => {
                    record = r;
                    if attempt + 1 < ENQUEUE_RETRIES {
                        std::hint::spin_loop();
                    }
                }
                Err(TrySendError::Disconnected(r)) => {
                    record = r;
                    break;
                }
            }
        }
        queue.depth.fetch_sub(1, Ordering::Relaxed);
        self.shed(record, "queue full");
        false
    }

    /// Drop `record` as queue-full and account it
    pub(crate) fn shed(&self, mut record: Record, reason: &str) {
        self.metrics.record_dropped();
        record.set_error(ErrorCode::QueueFull, reason);
        self.ops.put_ops(record.ops_snapshot(OpsState::Dropped));
        self.backpressure.record_drop(&self.name);
    }

    /// Stop every worker; queued records are drained before the tasks exit
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        let snap = self.metrics.snapshot();
        tracing::info!(
            channel = %self.name,
            processed = snap.processed,
            released = snap.released,
            dropped = snap.dropped,
            "worker pool stopped"
        );
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("workers", &self.queues.len())
            .field("ceiling", &self.ceiling)
            .finish()
    }
}

/// Per-worker state; the receiver stays a local of `run`
struct Worker {
    id: usize,
    channel: String,
    depth: Arc<AtomicUsize>,
    handler: Arc<dyn RecordHandler>,
    metrics: Arc<WorkerMetrics>,
}

impl Worker {
    async fn run(self, rx: AsyncRx<Record>, cancel: CancellationToken) {
        let mut drain = tokio::time::interval(DRAIN_INTERVAL);
        drain.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut report = tokio::time::interval(DEPTH_REPORT_INTERVAL);
        report.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::debug!(channel = %self.channel, worker_id = self.id, "worker started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(record) => self.process(record).await,
                    Err(_) => break,
                },
                _ = drain.tick() => {
                    self.drain(&rx).await;
                }
                _ = report.tick() => {
                    let depth = self.depth.load(Ordering::Relaxed);
                    if depth > 0 {
                        tracing::debug!(channel = %self.channel, worker_id = self.id, depth, "queue depth");
                    }
                }
            }
        }

        // Best effort: whatever is still queued gets processed
        let remaining = self.drain(&rx).await;
        tracing::debug!(
            channel = %self.channel,
            worker_id = self.id,
            drained = remaining,
            "worker stopped"
        );
    }

    /// Process whatever is queued without waiting
    ///
    /// Returns a future that holds no borrow of `rx`, so the worker
    /// future stays `Send`.
    fn drain<'a>(&'a self, rx: &AsyncRx<Record>) -> impl Future<Output = usize> + Send + 'a {
        let mut queued = Vec::new();
        while let Ok(record) = rx.try_recv() {
            queued.push(record);
        }
        async move {
            let count = queued.len();
            for record in queued {
                self.process(record).await;
            }
            count
        }
    }

    async fn process(&self, record: Record) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
        self.metrics.record_processed();
        self.handler.deal_data(record).await;
        self.metrics.record_released();
    }
}

#[cfg(test)]
#[path = "worker_test.rs"]
mod worker_test;

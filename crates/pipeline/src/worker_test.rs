//! Tests for the worker pool

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use conduit_protocol::{CountingOpsReporter, NoopOpsReporter, Record};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use super::{RecordHandler, Worker, WorkerPool, effective_workers};
use crate::PipelineError;
use crate::metrics::WorkerMetrics;

/// Handler that blocks on a gate and reports every record it saw
struct GatedHandler {
    gate: Semaphore,
    seen: AtomicUsize,
    entered: mpsc::UnboundedSender<u8>,
}

impl GatedHandler {
    fn new(open: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<u8>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let permits = if open { Semaphore::MAX_PERMITS } else { 0 };
        let handler = Arc::new(Self {
            gate: Semaphore::new(permits),
            seen: AtomicUsize::new(0),
            entered: tx,
        });
        (handler, rx)
    }
}

#[async_trait]
impl RecordHandler for GatedHandler {
    async fn deal_data(&self, record: Record) {
        let _ = self.entered.send(record.payload()[0]);
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        self.seen.fetch_add(1, Ordering::SeqCst);
    }
}

fn record(tag: u8) -> Record {
    Record::from_slice(&[tag])
}

async fn entered(rx: &mut mpsc::UnboundedReceiver<u8>) -> u8 {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("handler not entered")
        .expect("handler dropped")
}

// =============================================================================
// Sizing
// =============================================================================

#[test]
fn test_effective_workers() {
    assert_eq!(effective_workers(0), 6);
    assert_eq!(effective_workers(3), 3);
    assert_eq!(effective_workers(64), 64);
    assert_eq!(effective_workers(1000), 64);
}

#[test]
fn test_worker_future_is_send() {
    fn assert_send<T: Send>(_: &T) {}

    let (handler, _rx) = GatedHandler::new(true);
    let (_tx, rx) = crossfire::mpsc::bounded_async::<Record>(4);
    let worker = Worker {
        id: 0,
        channel: "send".into(),
        depth: Arc::new(AtomicUsize::new(0)),
        handler,
        metrics: Arc::new(WorkerMetrics::new()),
    };
    let run = worker.run(rx, CancellationToken::new());
    assert_send(&run);
}

#[tokio::test]
async fn test_zero_workers_is_an_error() {
    let (handler, _rx) = GatedHandler::new(true);
    let err = WorkerPool::start(
        "c",
        0,
        10,
        handler,
        Arc::new(WorkerMetrics::new()),
        Arc::new(NoopOpsReporter),
    )
    .unwrap_err();
    assert!(matches!(err, PipelineError::Workers { .. }));
}

// =============================================================================
// Dispatch
// =============================================================================

#[tokio::test]
async fn test_round_robin_reaches_every_record() {
    let (handler, mut rx) = GatedHandler::new(true);
    let metrics = Arc::new(WorkerMetrics::new());
    let pool = WorkerPool::start(
        "rr",
        4,
        100,
        Arc::clone(&handler) as Arc<dyn RecordHandler>,
        Arc::clone(&metrics),
        Arc::new(NoopOpsReporter),
    )
    .unwrap();
    assert_eq!(pool.len(), 4);

    for i in 0..20u8 {
        assert!(pool.dispatch(record(i)));
    }
    let mut tags = Vec::new();
    for _ in 0..20 {
        tags.push(entered(&mut rx).await);
    }
    tags.sort_unstable();
    assert_eq!(tags, (0..20u8).collect::<Vec<_>>());

    pool.stop().await;
    let snap = metrics.snapshot();
    assert_eq!(snap.enqueued, 20);
    assert_eq!(snap.processed, 20);
    assert_eq!(snap.released, 20);
    assert_eq!(handler.seen.load(Ordering::SeqCst), 20);
}

#[tokio::test]
async fn test_ceiling_sheds_without_blocking() {
    let (handler, mut rx) = GatedHandler::new(false);
    let metrics = Arc::new(WorkerMetrics::new());
    let ops = Arc::new(CountingOpsReporter::new());
    let pool = WorkerPool::start(
        "shed",
        1,
        2,
        Arc::clone(&handler) as Arc<dyn RecordHandler>,
        Arc::clone(&metrics),
        Arc::clone(&ops) as Arc<dyn conduit_protocol::OpsReporter>,
    )
    .unwrap();

    // First record is taken off the queue and parked in the handler
    assert!(pool.dispatch(record(0)));
    assert_eq!(entered(&mut rx).await, 0);

    assert!(pool.dispatch(record(1)));
    assert!(pool.dispatch(record(2)));
    assert_eq!(pool.depths(), vec![2]);
    assert!(!pool.dispatch(record(3)));
    assert!(pool.depths()[0] <= pool.ceiling());

    assert_eq!(metrics.snapshot().dropped, 1);
    assert_eq!(ops.snapshot().dropped, 1);

    handler.gate.add_permits(10);
    pool.stop().await;
    let snap = metrics.snapshot();
    assert_eq!(snap.processed, 3);
    assert_eq!(snap.released, 3);
}

#[tokio::test]
async fn test_stop_drains_queued_records() {
    let (handler, mut rx) = GatedHandler::new(false);
    let metrics = Arc::new(WorkerMetrics::new());
    let pool = Arc::new(
        WorkerPool::start(
            "drain",
            1,
            10,
            Arc::clone(&handler) as Arc<dyn RecordHandler>,
            Arc::clone(&metrics),
            Arc::new(NoopOpsReporter),
        )
        .unwrap(),
    );

    pool.dispatch(record(0));
    entered(&mut rx).await;
    for i in 1..5u8 {
        pool.dispatch(record(i));
    }

    let stopping = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    handler.gate.add_permits(10);
    stopping.await.unwrap();

    assert_eq!(handler.seen.load(Ordering::SeqCst), 5);
    let snap = metrics.snapshot();
    assert_eq!(snap.released, 5);
    assert_eq!(snap.in_flight(), 0);
}

#[tokio::test]
async fn test_dispatch_after_stop_is_shed() {
    let (handler, _rx) = GatedHandler::new(true);
    let metrics = Arc::new(WorkerMetrics::new());
    let pool = WorkerPool::start(
        "late",
        2,
        4,
        handler,
        Arc::clone(&metrics),
        Arc::new(NoopOpsReporter),
    )
    .unwrap();
    pool.stop().await;

    assert!(!pool.dispatch(record(9)));
    assert_eq!(metrics.snapshot().dropped, 1);
}

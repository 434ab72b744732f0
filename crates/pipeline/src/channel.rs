//! Channel: one ingestion pipeline end to end
//!
//! ```text
//! Receiver ──on_record──> Dispatch ──notify──> WorkerPool ──deal_data──> ChannelCore
//!                            │ direct                                      │
//!                            └──────────── spawn(deal_data) ───────────────┤
//!                                                                          ├──> static exporters
//!                                                                          └──> ChannelIdRouter
//! ```
//!
//! The configuration lives behind a lock and is only read by `start`; a
//! running channel keeps the snapshot it was started with until restarted.
//! Static exporters sit in an `ArcSwap` so one can be replaced while workers
//! write through the previous list.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use conduit_protocol::{
    ChannelId, Clock, Codec, DecodeType, ErrorCode, NoopOpsReporter, OpsReporter, OpsState, Record,
    SystemClock,
};
use conduit_sinks::util::RateLimitedLogger;
use conduit_sinks::{Exporter, ExporterChain, ExporterFactory, ExporterSettings};
use conduit_sources::{Receiver, ReceiverConfig, ReceiverMetricsHandle, RecordSink, build_receiver};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{PipelineError, Result};
use crate::metrics::{WorkerMetrics, WorkerMetricsSnapshot};
use crate::router::ChannelIdRouter;
use crate::worker::{DEFAULT_QUEUE_CEILING, RecordHandler, WorkerPool, effective_workers};

/// Period of the sweep that stops replaced static exporters
pub const PENDING_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Static configuration of one channel
#[derive(Debug, Clone)]
pub struct ChannelConf {
    pub name: String,
    pub decode: DecodeType,
    pub receiver: ReceiverConfig,
    /// 0 selects the default; anything above the hard limit is clamped
    pub workers: usize,
    /// Per-worker queue ceiling
    pub queue_ceiling: usize,
    /// Skip the worker queues; at most `queue_ceiling` records in flight
    pub direct: bool,
    /// Dataflow exporters every record is written through
    pub exporters: Vec<ExporterSettings>,
    /// Destination for legacy transfer messages
    pub transfer_exporter: Option<ExporterSettings>,
    /// Ops service id to channel id, for self-telemetry records
    pub ops_services: HashMap<u32, u32>,
}

impl ChannelConf {
    pub fn new(name: impl Into<String>, decode: DecodeType, receiver: ReceiverConfig) -> Self {
        Self {
            name: name.into(),
            decode,
            receiver,
            workers: 0,
            queue_ceiling: DEFAULT_QUEUE_CEILING,
            direct: false,
            exporters: Vec::new(),
            transfer_exporter: None,
            ops_services: HashMap::new(),
        }
    }
}

/// Collaborators injected into a channel
#[derive(Clone)]
pub struct ChannelDeps {
    pub factory: Arc<dyn ExporterFactory>,
    pub router: Option<Arc<ChannelIdRouter>>,
    pub ops: Arc<dyn OpsReporter>,
    pub clock: Arc<dyn Clock>,
}

impl ChannelDeps {
    pub fn new(factory: Arc<dyn ExporterFactory>) -> Self {
        Self {
            factory,
            router: None,
            ops: Arc::new(NoopOpsReporter),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_router(mut self, router: Arc<ChannelIdRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_ops(mut self, ops: Arc<dyn OpsReporter>) -> Self {
        self.ops = ops;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Live exporter set; swapped as a whole
#[derive(Default)]
struct StaticExporters {
    chain: ExporterChain,
    transfer: Option<Arc<dyn Exporter>>,
}

/// Per-run state shared by workers and direct-mode tasks
struct ChannelCore {
    name: String,
    codec: Arc<dyn Codec>,
    exporters: ArcSwap<StaticExporters>,
    retired: Mutex<Vec<Arc<dyn Exporter>>>,
    router: Option<Arc<ChannelIdRouter>>,
    ops: Arc<dyn OpsReporter>,
    clock: Arc<dyn Clock>,
    ops_services: HashMap<u32, u32>,
    metrics: Arc<WorkerMetrics>,
    decode_errors: RateLimitedLogger,
}

impl ChannelCore {
    fn decode_msg(&self, record: &mut Record) -> Result<()> {
        if let Err(e) = self.codec.decode(record) {
            self.decode_errors.warn(&self.name, &e);
            return Err(e.into());
        }
        Ok(())
    }

    async fn export_data(&self, record: &mut Record) -> usize {
        record.output_at_ms = self.clock.now_ms();
        let exporters = self.exporters.load_full();
        let mut delivered = exporters.chain.write_to(record).await;

        if !record.channel_id.is_none()
            && let Some(router) = &self.router
        {
            delivered += router.route(record).await;
        }
        delivered
    }

    /// Map an ops record's service id onto a channel id
    fn resolve_ops(&self, record: &mut Record) {
        if record.is_ops
            && record.channel_id.is_none()
            && let Some(&channel_id) = self.ops_services.get(&record.service_id)
        {
            record.channel_id = ChannelId::new(channel_id);
        }
    }

    async fn transfer(&self, record: &mut Record) {
        self.metrics.record_transferred();
        let exporters = self.exporters.load_full();
        match &exporters.transfer {
            Some(exporter) => {
                exporter.deliver(record).await;
            }
            None => tracing::trace!(channel = %self.name, "transfer message without transfer exporter"),
        }
    }

    /// Swap in `exporter`, retiring a static link with the same id
    fn install(&self, exporter: Arc<dyn Exporter>) {
        let current = self.exporters.load_full();
        let id = exporter.base().id();
        let mut replaced = None;
        let mut chain = ExporterChain::new();
        for link in current.chain.iter() {
            if replaced.is_none() && link.base().id() == id {
                replaced = Some(Arc::clone(link));
                chain.push(Arc::clone(&exporter));
            } else {
                chain.push(Arc::clone(link));
            }
        }
        if replaced.is_none() {
            chain.push(exporter);
        }
        self.exporters.store(Arc::new(StaticExporters {
            chain,
            transfer: current.transfer.clone(),
        }));

        if let Some(old) = replaced {
            tracing::info!(channel = %self.name, exporter = %old.name(), "static exporter replaced");
            old.base().set_need_stop();
            self.retired.lock().push(old);
        }
    }

    /// Stop replaced exporters whose grace window has passed
    async fn sweep_retired_at(&self, now: Instant) -> usize {
        let due: Vec<Arc<dyn Exporter>> = {
            let mut retired = self.retired.lock();
            let (due, keep): (Vec<_>, Vec<_>) = retired
                .drain(..)
                .partition(|exporter| exporter.base().is_need_stop_at(now));
            *retired = keep;
            due
        };
        for exporter in &due {
            exporter.stop().await;
        }
        due.len()
    }

    async fn stop_exporters(&self) {
        let exporters = self.exporters.swap(Arc::new(StaticExporters::default()));
        exporters.chain.stop_all().await;
        if let Some(transfer) = &exporters.transfer {
            transfer.stop().await;
        }
        let retired = std::mem::take(&mut *self.retired.lock());
        for exporter in retired {
            exporter.stop().await;
        }
    }
}

#[async_trait]
impl RecordHandler for ChannelCore {
    async fn deal_data(&self, mut record: Record) {
        if self.decode_msg(&mut record).is_err() {
            self.metrics.record_lost();
            self.ops.put_ops(record.ops_snapshot(OpsState::Lost));
            return;
        }

        match record.error_code() {
            Some(ErrorCode::Transfer) => self.transfer(&mut record).await,
            Some(ErrorCode::Skip) => self.metrics.record_skipped(),
            _ => {
                self.resolve_ops(&mut record);
                self.ops.put_ops(record.ops_snapshot(OpsState::Dealing));
                self.export_data(&mut record).await;
            }
        }
    }
}

/// Receiver-facing entry point of a running channel
struct Dispatch {
    core: Arc<ChannelCore>,
    pool: WorkerPool,
    direct: bool,
    /// Direct-mode records in flight, capped at the queue ceiling
    inline_permits: Arc<Semaphore>,
    inline: TaskTracker,
}

impl Dispatch {
    fn handle_record(&self, record: Record) -> bool {
        if !self.direct {
            return self.pool.dispatch(record);
        }
        let Ok(permit) = Arc::clone(&self.inline_permits).try_acquire_owned() else {
            self.pool.shed(record, "direct mode at ceiling");
            return false;
        };
        let core = Arc::clone(&self.core);
        self.inline.spawn(async move {
            core.metrics.record_processed();
            core.deal_data(record).await;
            core.metrics.record_released();
            drop(permit);
        });
        true
    }
}

impl RecordSink for Dispatch {
    fn on_record(&self, record: Record) {
        self.handle_record(record);
    }
}

struct Running {
    dispatch: Arc<Dispatch>,
    receiver: Arc<dyn Receiver>,
    sweep_cancel: CancellationToken,
    sweep: TaskTracker,
}

/// Cloneable view of a channel's worker metrics
#[derive(Debug, Clone)]
pub struct ChannelMetricsHandle {
    name: String,
    metrics: Arc<WorkerMetrics>,
}

impl ChannelMetricsHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> WorkerMetricsSnapshot {
        self.metrics.snapshot()
    }
}

pub struct Channel {
    name: String,
    conf: RwLock<Option<ChannelConf>>,
    deps: ChannelDeps,
    metrics: Arc<WorkerMetrics>,
    running: RwLock<Option<Arc<Running>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Channel {
    pub fn new(name: impl Into<String>, deps: ChannelDeps) -> Self {
        Self {
            name: name.into(),
            conf: RwLock::new(None),
            deps,
            metrics: Arc::new(WorkerMetrics::new()),
            running: RwLock::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_conf(self, conf: ChannelConf) -> Self {
        self.update_conf(conf);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the configuration; takes effect on the next `start`
    pub fn update_conf(&self, conf: ChannelConf) {
        *self.conf.write() = Some(conf);
    }

    pub fn conf(&self) -> Option<ChannelConf> {
        self.conf.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.read().is_some()
    }

    pub fn metrics_handle(&self) -> ChannelMetricsHandle {
        ChannelMetricsHandle {
            name: self.name.clone(),
            metrics: Arc::clone(&self.metrics),
        }
    }

    pub fn receiver_metrics(&self) -> Option<ReceiverMetricsHandle> {
        self.running
            .read()
            .as_ref()
            .map(|running| running.receiver.metrics_handle())
    }

    /// Bound address of the running receiver
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .read()
            .as_ref()
            .and_then(|running| running.receiver.local_addr())
    }

    /// Per-worker queue depths of the running pool
    pub fn queue_depths(&self) -> Vec<usize> {
        self.running
            .read()
            .as_ref()
            .map(|running| running.dispatch.pool.depths())
            .unwrap_or_default()
    }

    /// Names of the live static exporters
    pub fn exporter_names(&self) -> Vec<String> {
        self.running
            .read()
            .as_ref()
            .map(|running| running.dispatch.core.exporters.load().chain.names())
            .unwrap_or_default()
    }

    fn current(&self) -> Result<Arc<Running>> {
        self.running
            .read()
            .clone()
            .ok_or_else(|| PipelineError::NotRunning(self.name.clone()))
    }

    /// Start the pipeline
    ///
    /// A previous run is stopped first. Any failure leaves the channel stopped.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let conf = self
            .conf
            .read()
            .clone()
            .ok_or_else(|| PipelineError::NotConfigured(self.name.clone()))?;

        self.shutdown().await;

        let codec = conf.decode.codec();
        let core = Arc::new(ChannelCore {
            name: self.name.clone(),
            codec: Arc::clone(&codec),
            exporters: ArcSwap::from_pointee(StaticExporters::default()),
            retired: Mutex::new(Vec::new()),
            router: self.deps.router.clone(),
            ops: Arc::clone(&self.deps.ops),
            clock: Arc::clone(&self.deps.clock),
            ops_services: conf.ops_services.clone(),
            metrics: Arc::clone(&self.metrics),
            decode_errors: RateLimitedLogger::default(),
        });

        let pool = WorkerPool::start(
            self.name.clone(),
            effective_workers(conf.workers),
            conf.queue_ceiling,
            Arc::clone(&core) as Arc<dyn RecordHandler>,
            Arc::clone(&self.metrics),
            Arc::clone(&self.deps.ops),
        )?;
        let dispatch = Arc::new(Dispatch {
            core: Arc::clone(&core),
            pool,
            direct: conf.direct,
            inline_permits: Arc::new(Semaphore::new(
                conf.queue_ceiling.min(Semaphore::MAX_PERMITS),
            )),
            inline: TaskTracker::new(),
        });

        let receiver = build_receiver(conf.receiver.clone(), &self.name);
        if let Err(e) = receiver
            .start(Arc::clone(&dispatch) as Arc<dyn RecordSink>, codec)
            .await
        {
            dispatch.pool.stop().await;
            tracing::error!(channel = %self.name, error = %e, "receiver failed to start");
            return Err(e.into());
        }

        let exporters = self.start_exporters(&conf).await;
        core.exporters.store(Arc::new(exporters));

        let sweep_cancel = CancellationToken::new();
        let sweep = TaskTracker::new();
        sweep.spawn(run_sweep(Arc::clone(&core), sweep_cancel.clone()));

        tracing::info!(
            channel = %self.name,
            decode = conf.decode.as_str(),
            protocol = %conf.receiver.protocol,
            address = ?receiver.local_addr(),
            direct = conf.direct,
            exporters = core.exporters.load().chain.len(),
            "channel started"
        );

        *self.running.write() = Some(Arc::new(Running {
            dispatch,
            receiver,
            sweep_cancel,
            sweep,
        }));
        Ok(())
    }

    async fn start_exporters(&self, conf: &ChannelConf) -> StaticExporters {
        let mut chain = ExporterChain::new();
        for settings in &conf.exporters {
            if let Some(filter) = settings.channel_filter()
                && chain.is_exists_and_update_filter(&settings.name, filter)
            {
                tracing::debug!(channel = %self.name, exporter = %settings.name, "data id bound to existing sink");
                continue;
            }
            match self.deps.factory.create(settings) {
                Ok(exporter) => chain.push(exporter),
                Err(e) => {
                    tracing::warn!(channel = %self.name, exporter = %settings.name, error = %e, "exporter skipped");
                }
            }
        }
        chain.start_all().await;

        let mut transfer = None;
        if let Some(settings) = &conf.transfer_exporter {
            match self.deps.factory.create(settings) {
                Ok(exporter) => match exporter.start().await {
                    Ok(()) => transfer = Some(exporter),
                    Err(e) => {
                        tracing::warn!(channel = %self.name, exporter = %settings.name, error = %e, "transfer exporter failed to start");
                    }
                },
                Err(e) => {
                    tracing::warn!(channel = %self.name, exporter = %settings.name, error = %e, "transfer exporter skipped");
                }
            }
        }
        StaticExporters { chain, transfer }
    }

    /// Stop the pipeline: sweep, receiver, workers, then exporters
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        self.shutdown().await;
    }

    async fn shutdown(&self) {
        let running = self.running.write().take();
        let Some(running) = running else {
            return;
        };

        running.sweep_cancel.cancel();
        running.sweep.close();
        running.sweep.wait().await;

        running.receiver.stop().await;

        let dispatch = &running.dispatch;
        dispatch.pool.stop().await;
        dispatch.inline.close();
        dispatch.inline.wait().await;

        dispatch.core.stop_exporters().await;
        tracing::info!(channel = %self.name, "channel stopped");
    }

    /// Hand one framed record to the pipeline
    ///
    /// Returns false when the record was shed or the channel is stopped.
    pub fn handle_record(&self, record: Record) -> bool {
        let running = self.running.read().clone();
        match running {
            Some(running) => running.dispatch.handle_record(record),
            None => {
                tracing::trace!(channel = %self.name, "record for stopped channel dropped");
                false
            }
        }
    }

    /// Decode `record` with the running codec
    pub fn decode_msg(&self, record: &mut Record) -> Result<()> {
        self.current()?.dispatch.core.decode_msg(record)
    }

    /// Write `record` through the static exporters and the router
    ///
    /// Returns the number of deliveries; a routing miss is not an error.
    pub async fn export_data(&self, record: &mut Record) -> Result<usize> {
        let running = self.current()?;
        Ok(running.dispatch.core.export_data(record).await)
    }

    /// Create and start an exporter, replacing the static link with its id
    ///
    /// The previous instance keeps serving in-flight writes and is stopped
    /// by the pending sweep once its grace window has passed.
    pub async fn replace_exporter(&self, settings: &ExporterSettings) -> Result<()> {
        let running = self.current()?;
        settings.validate()?;
        let exporter = self.deps.factory.create(settings)?;
        exporter.start().await?;
        running.dispatch.core.install(exporter);
        Ok(())
    }

    /// Stop retired static exporters that are due at `now`
    pub async fn sweep_pending_at(&self, now: Instant) -> usize {
        match self.current() {
            Ok(running) => running.dispatch.core.sweep_retired_at(now).await,
            Err(_) => 0,
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn run_sweep(core: Arc<ChannelCore>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(PENDING_SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let stopped = core.sweep_retired_at(Instant::now()).await;
                if stopped > 0 {
                    tracing::debug!(channel = %core.name, stopped, "replaced exporters stopped");
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "channel_test.rs"]
mod channel_test;

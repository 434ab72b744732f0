//! Channel-id router
//!
//! Looks up a record's routing key in the [`RoutingTable`], evaluates each
//! binding's filter and delivers through the exporter the binding names.
//! Exporters live in a shared [`ExporterRegistry`] keyed by id, so any
//! number of bindings targeting one sink share one connection.
//!
//! Configuration changes arrive as [`ConfigEvent`]s on a bounded queue and
//! are applied by a background task, off the hot path. A malformed event is
//! logged and skipped; whatever was live before stays live.

use std::sync::Arc;
use std::time::{Duration, Instant};

use conduit_protocol::{ErrorCode, Record};
use conduit_routing::{
    ConfigEvent, EventKind, EventTarget, RouteChain, RouteConfig, RouteKeyMode, RoutingTable,
    SWEEP_INTERVAL,
};
use conduit_sinks::util::RateLimitedLogger;
use conduit_sinks::{ExporterRegistry, REGISTRY_SWEEP_INTERVAL};
use crossfire::{AsyncRx, MAsyncTx, TrySendError};
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{PipelineError, Result};
use crate::metrics::{RouterMetrics, RouterMetricsSnapshot};

/// Default capacity of the config event queue
pub const DEFAULT_EVENT_QUEUE: usize = 1024;

pub struct ChannelIdRouter {
    table: RoutingTable<RouteChain>,
    registry: Arc<ExporterRegistry>,
    metrics: Arc<RouterMetrics>,
    missing: RateLimitedLogger,
    tasks: Mutex<Option<(CancellationToken, TaskTracker)>>,
}

/// Cloneable view of router metrics for the reporter
#[derive(Debug, Clone)]
pub struct RouterMetricsHandle {
    mode: RouteKeyMode,
    metrics: Arc<RouterMetrics>,
}

impl RouterMetricsHandle {
    pub fn mode(&self) -> RouteKeyMode {
        self.mode
    }

    pub fn snapshot(&self) -> RouterMetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl ChannelIdRouter {
    pub fn new(mode: RouteKeyMode, registry: Arc<ExporterRegistry>) -> Self {
        Self::with_table(RoutingTable::new(mode), registry)
    }

    /// Router whose retired chains are released after `grace`
    pub fn with_grace(mode: RouteKeyMode, grace: Duration, registry: Arc<ExporterRegistry>) -> Self {
        Self::with_table(RoutingTable::with_grace(mode, grace), registry)
    }

    fn with_table(table: RoutingTable<RouteChain>, registry: Arc<ExporterRegistry>) -> Self {
        Self {
            table,
            registry,
            metrics: Arc::new(RouterMetrics::new()),
            missing: RateLimitedLogger::default(),
            tasks: Mutex::new(None),
        }
    }

    #[inline]
    pub fn mode(&self) -> RouteKeyMode {
        self.table.mode()
    }

    pub fn table(&self) -> &RoutingTable<RouteChain> {
        &self.table
    }

    pub fn registry(&self) -> &Arc<ExporterRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &RouterMetrics {
        &self.metrics
    }

    pub fn metrics_handle(&self) -> RouterMetricsHandle {
        RouterMetricsHandle {
            mode: self.mode(),
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Deliver `record` to every binding of its chain whose filter matches
    ///
    /// Each delivery sees only the binding's table name. Returns the number
    /// of successful deliveries; a miss returns 0 and is not an error.
    pub async fn route(&self, record: &mut Record) -> usize {
        self.metrics.record_lookup();
        let Some(chain) = self.table.lookup(record.channel_id) else {
            self.metrics.record_miss();
            tracing::trace!(channel_id = %record.channel_id, "no route");
            return 0;
        };

        let mut delivered = 0;
        for binding in chain.iter() {
            if !binding.filter.matches(record) {
                self.metrics.record_filtered();
                continue;
            }
            self.metrics.record_matched();

            let Some(exporter) = self.registry.get(binding.exporter_id) else {
                self.metrics.record_missing_exporter();
                self.missing.warn(
                    &binding.name,
                    &format_args!("route targets unknown exporter {}", binding.exporter_id),
                );
                continue;
            };

            if record.error_code() == Some(ErrorCode::Export) {
                record.clear_error();
            }
            record.table_names.clear();
            if !binding.table.is_empty() {
                record.add_table_name(binding.table.as_str());
            }
            if exporter.deliver(record).await {
                self.metrics.record_delivered();
                delivered += 1;
            }
        }
        delivered
    }

    /// Apply one configuration event
    pub async fn apply(&self, event: &ConfigEvent) -> Result<()> {
        match event.target {
            EventTarget::Route => self.apply_route(event),
            EventTarget::Exporter => Ok(self.registry.apply(event).await?),
        }
    }

    fn apply_route(&self, event: &ConfigEvent) -> Result<()> {
        match event.kind {
            EventKind::Delete => {
                if !self.table.delete(event.key) {
                    tracing::debug!(key = event.key, "delete for unknown route");
                }
                Ok(())
            }
            EventKind::Create | EventKind::Change => {
                let config = RouteConfig::parse(&event.payload)?;
                let chain = config.compile()?;
                let key = if event.key != 0 {
                    event.key
                } else {
                    config.channel_id()
                };
                tracing::info!(key, bindings = chain.len(), "route installed");
                self.table.update(key, chain);
                Ok(())
            }
            EventKind::List => {
                let configs = RouteConfig::parse_list(&event.payload)?;
                let mut entries = Vec::with_capacity(configs.len());
                for config in &configs {
                    match config.compile() {
                        Ok(chain) => entries.push((config.channel_id(), chain)),
                        Err(e) => tracing::warn!(
                            channel_id = config.channel_id(),
                            error = %e,
                            "route skipped"
                        ),
                    }
                }
                tracing::info!(routes = entries.len(), "route table replaced");
                self.table.replace_all(entries);
                Ok(())
            }
        }
    }

    /// Release retired chains and stop retired exporters that are due
    pub async fn sweep_at(&self, now: Instant) -> (usize, usize) {
        let chains = self.table.sweep_expired(now);
        let exporters = self.registry.sweep_at(now).await;
        (chains, exporters)
    }

    /// Spawn the event task and the two release sweeps
    ///
    /// Returns the feed producers push events into. Calling `start` on a
    /// running router restarts its tasks with a fresh feed.
    pub async fn start(self: &Arc<Self>, queue: usize) -> ConfigFeed {
        self.stop_tasks().await;

        let (tx, rx) = crossfire::mpsc::bounded_async::<ConfigEvent>(queue.max(1));
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(Arc::clone(self).run_events(rx, cancel.clone()));
        tracker.spawn(Arc::clone(self).run_sweeps(cancel.clone()));
        *self.tasks.lock() = Some((cancel, tracker));

        tracing::info!(mode = self.mode().as_str(), queue, "channel-id router started");
        ConfigFeed { tx }
    }

    async fn stop_tasks(&self) {
        let tasks = self.tasks.lock().take();
        if let Some((cancel, tracker)) = tasks {
            cancel.cancel();
            tracker.close();
            tracker.wait().await;
        }
    }

    /// Stop background tasks and every registered exporter
    pub async fn stop(&self) {
        self.stop_tasks().await;
        self.registry.stop_all().await;
        tracing::info!(mode = self.mode().as_str(), "channel-id router stopped");
    }

    async fn handle_event(&self, event: ConfigEvent) {
        let result = self.apply(&event).await;
        self.metrics.record_event(result.is_ok());
        if let Err(e) = result {
            tracing::warn!(
                target_kind = ?event.target,
                kind = ?event.kind,
                key = event.key,
                error = %e,
                "config event skipped"
            );
        }
    }

    async fn run_events(self: Arc<Self>, rx: AsyncRx<ConfigEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(_) => break,
                },
            }
        }
        tracing::debug!("config event task stopped");
    }

    async fn run_sweeps(self: Arc<Self>, cancel: CancellationToken) {
        let mut routes = tokio::time::interval(SWEEP_INTERVAL);
        routes.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut exporters = tokio::time::interval(REGISTRY_SWEEP_INTERVAL);
        exporters.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = routes.tick() => {
                    let released = self.table.sweep_expired(Instant::now());
                    if released > 0 {
                        tracing::debug!(released, "retired route chains released");
                    }
                }
                _ = exporters.tick() => {
                    let stopped = self.registry.sweep().await;
                    if stopped > 0 {
                        tracing::debug!(stopped, "retired exporters stopped");
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for ChannelIdRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelIdRouter")
            .field("table", &self.table)
            .field("registry", &self.registry)
            .finish()
    }
}

/// Producer side of the router's config event queue
#[derive(Clone)]
pub struct ConfigFeed {
    tx: MAsyncTx<ConfigEvent>,
}

impl ConfigFeed {
    /// Queue an event without waiting; fails when the queue is full
    pub fn try_publish(&self, event: ConfigEvent) -> Result<()> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(PipelineError::Feed("queue full".into())),
            Err(TrySendError::Disconnected(_)) => Err(PipelineError::Feed("router stopped".into())),
        }
    }

    /// Queue an event, waiting for room
    pub async fn publish(&self, event: ConfigEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| PipelineError::Feed("router stopped".into()))
    }
}

impl std::fmt::Debug for ConfigFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigFeed").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "router_test.rs"]
mod router_test;

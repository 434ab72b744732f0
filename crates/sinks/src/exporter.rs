//! Exporter trait and the state every exporter shares
//!
//! An exporter is a started, connected sink. Workers call [`Exporter::deliver`]
//! concurrently; it wraps the kind-specific [`Exporter::write`] with the
//! accounting every delivery needs (output stamp, ops event, metrics and
//! rate-limited failure logging).

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use conduit_protocol::{
    Clock, ErrorCode, NoopOpsReporter, OpsReporter, OpsState, Record, SystemClock,
};
use conduit_routing::Filter;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::common::{ExporterMetrics, ExporterMetricsHandle, Result};
use crate::util::RateLimitedLogger;

/// Time between `set_need_stop` and the exporter becoming eligible for release
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(60);

/// Sink family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExporterKind {
    Kafka,
    Pulsar,
    Redis,
    Proxy,
    File,
}

impl ExporterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kafka => "kafka",
            Self::Pulsar => "pulsar",
            Self::Redis => "redis",
            Self::Proxy => "proxy",
            Self::File => "file",
        }
    }
}

impl fmt::Display for ExporterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which records an exporter accepts when it sits in an [`ExporterChain`]
///
/// [`ExporterChain`]: crate::ExporterChain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExporterConfig {
    /// Dataflow exporter: every record, optionally limited to some platforms
    DataFlow { platform_ids: Vec<u32> },

    /// Legacy per-stream exporter: one data id, one output table
    DataId { data_id: u32, table: String },

    /// Channel-id exporter: filters attached to a shared sink, each with its table
    ChannelId { filters: Vec<ChannelFilter> },
}

/// One filter attached to a channel-id exporter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFilter {
    /// Only records of this channel; `None` takes every channel
    pub channel_id: Option<u32>,
    pub filter: Filter,
    /// Output table for records that match
    pub table: String,
}

impl ChannelFilter {
    pub fn new(filter: Filter, table: impl Into<String>) -> Self {
        Self {
            channel_id: None,
            filter,
            table: table.into(),
        }
    }

    pub fn for_channel(mut self, channel_id: u32) -> Self {
        self.channel_id = Some(channel_id);
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.channel_id
            .is_none_or(|id| record.channel_id.get() == id)
            && self.filter.matches(record)
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self::DataFlow {
            platform_ids: Vec::new(),
        }
    }
}

impl ExporterConfig {
    /// Decide whether `record` goes to this exporter
    ///
    /// `None` filters the record out. `Some(tables)` accepts it; a non-empty
    /// list replaces the record's output table names.
    pub fn select(&self, record: &Record) -> Option<Vec<String>> {
        match self {
            Self::DataFlow { platform_ids } => {
                let platform = record.channel_id.platform();
                (platform_ids.is_empty() || platform_ids.contains(&platform)).then(Vec::new)
            }
            Self::DataId { data_id, table } => {
                (record.channel_id.get() == *data_id).then(|| vec![table.clone()])
            }
            Self::ChannelId { filters } => {
                let tables: Vec<String> = filters
                    .iter()
                    .filter(|f| f.matches(record))
                    .map(|f| f.table.clone())
                    .collect();
                (!tables.is_empty()).then_some(tables)
            }
        }
    }

    /// Short name for logs
    pub fn shape(&self) -> &'static str {
        match self {
            Self::DataFlow { .. } => "dataflow",
            Self::DataId { .. } => "data_id",
            Self::ChannelId { .. } => "channel_id",
        }
    }
}

/// Collaborators injected into every exporter
#[derive(Clone)]
pub struct ExporterContext {
    pub ops: Arc<dyn OpsReporter>,
    pub clock: Arc<dyn Clock>,
    /// This host's address, used in Kafka message keys
    pub host_ip: String,
}

impl ExporterContext {
    pub fn new(ops: Arc<dyn OpsReporter>) -> Self {
        Self {
            ops,
            clock: Arc::new(SystemClock),
            host_ip: String::new(),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_host_ip(mut self, host_ip: impl Into<String>) -> Self {
        self.host_ip = host_ip.into();
        self
    }
}

impl Default for ExporterContext {
    fn default() -> Self {
        Self::new(Arc::new(NoopOpsReporter))
    }
}

impl fmt::Debug for ExporterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExporterContext")
            .field("host_ip", &self.host_ip)
            .finish_non_exhaustive()
    }
}

/// Identity, configuration and accounting shared by all exporter kinds
pub struct ExporterBase {
    id: u32,
    name: String,
    kind: ExporterKind,
    conf: RwLock<ExporterConfig>,
    need_stop_since: Mutex<Option<Instant>>,
    grace: Duration,
    metrics: Arc<ExporterMetrics>,
    ctx: ExporterContext,
    errors: RateLimitedLogger,
}

impl ExporterBase {
    pub fn new(id: u32, name: impl Into<String>, kind: ExporterKind, ctx: ExporterContext) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            conf: RwLock::new(ExporterConfig::default()),
            need_stop_since: Mutex::new(None),
            grace: DEFAULT_STOP_GRACE,
            metrics: Arc::new(ExporterMetrics::new()),
            ctx,
            errors: RateLimitedLogger::default(),
        }
    }

    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    #[must_use]
    pub fn with_conf(self, conf: ExporterConfig) -> Self {
        *self.conf.write() = conf;
        self
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> ExporterKind {
        self.kind
    }

    #[inline]
    pub fn metrics(&self) -> &ExporterMetrics {
        &self.metrics
    }

    pub fn metrics_handle(&self) -> ExporterMetricsHandle {
        ExporterMetricsHandle::new(self.name.clone(), self.kind.as_str(), Arc::clone(&self.metrics))
    }

    #[inline]
    pub fn context(&self) -> &ExporterContext {
        &self.ctx
    }

    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.ctx.clock.now_ms()
    }

    /// Replace the filter configuration
    pub fn update_conf(&self, conf: ExporterConfig) {
        tracing::debug!(exporter = %self.name, shape = conf.shape(), "exporter config updated");
        *self.conf.write() = conf;
    }

    pub fn conf(&self) -> ExporterConfig {
        self.conf.read().clone()
    }

    pub fn select(&self, record: &Record) -> Option<Vec<String>> {
        self.conf.read().select(record)
    }

    /// Attach a filter, switching the exporter to the channel-id shape
    ///
    /// A legacy data-id binding is kept as the first filter; a dataflow
    /// config is replaced. Duplicate filters are ignored.
    pub fn add_filter(&self, filter: ChannelFilter) {
        let mut conf = self.conf.write();
        match &mut *conf {
            ExporterConfig::ChannelId { filters } => {
                if !filters.contains(&filter) {
                    filters.push(filter);
                }
            }
            ExporterConfig::DataId { data_id, table } => {
                let existing = ChannelFilter::new(Filter::accept_all(), std::mem::take(table))
                    .for_channel(*data_id);
                let mut filters = vec![existing];
                if !filters.contains(&filter) {
                    filters.push(filter);
                }
                *conf = ExporterConfig::ChannelId { filters };
            }
            ExporterConfig::DataFlow { .. } => {
                *conf = ExporterConfig::ChannelId {
                    filters: vec![filter],
                };
            }
        }
    }

    /// Mark the exporter for release once the grace window has passed
    pub fn set_need_stop(&self) {
        self.set_need_stop_at(Instant::now());
    }

    pub fn set_need_stop_at(&self, now: Instant) {
        let mut since = self.need_stop_since.lock();
        if since.is_none() {
            *since = Some(now);
        }
    }

    pub fn is_need_stop(&self) -> bool {
        self.is_need_stop_at(Instant::now())
    }

    pub fn is_need_stop_at(&self, now: Instant) -> bool {
        match *self.need_stop_since.lock() {
            Some(since) => now.saturating_duration_since(since) >= self.grace,
            None => false,
        }
    }

    /// Whether `set_need_stop` has been called
    pub fn is_retiring(&self) -> bool {
        self.need_stop_since.lock().is_some()
    }
}

impl fmt::Debug for ExporterBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExporterBase")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("conf", &*self.conf.read())
            .finish_non_exhaustive()
    }
}

/// A running sink
#[async_trait]
pub trait Exporter: Send + Sync {
    fn base(&self) -> &ExporterBase;

    /// Connect and spawn background tasks
    async fn start(&self) -> Result<()>;

    /// Release connections and stop background tasks
    async fn stop(&self);

    /// Hand one record to the sink
    async fn write(&self, record: &mut Record) -> Result<()>;

    fn name(&self) -> &str {
        self.base().name()
    }

    fn kind(&self) -> ExporterKind {
        self.base().kind()
    }

    /// Write and account the outcome
    ///
    /// Returns true when the sink accepted the record. A failure marks the
    /// record with [`ErrorCode::Export`] and reports it lost.
    async fn deliver(&self, record: &mut Record) -> bool {
        let base = self.base();
        record.output_at_ms = base.now_ms();
        match self.write(record).await {
            Ok(()) => {
                base.metrics.record_ok(record.len() as u64);
                base.ctx.ops.put_ops(record.ops_snapshot(OpsState::Output));
                true
            }
            Err(e) => {
                base.metrics.record_failed();
                record.set_error(ErrorCode::Export, e.to_string());
                base.ctx.ops.put_ops(record.ops_snapshot(OpsState::Lost));
                base.errors.error(base.name(), &e);
                false
            }
        }
    }
}

impl fmt::Debug for dyn Exporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.base().fmt(f)
    }
}

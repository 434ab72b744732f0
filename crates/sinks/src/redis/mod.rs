//! Redis pub/sub exporter
//!
//! `single` mode publishes to one server. `sentinel` mode asks the sentinels
//! for the current master, caches the answer and refreshes it from a
//! background poll; publishing targets whatever master is cached.
//!
//! Writes check a connection out of a small idle pool and dial outside any
//! lock. A failed dial blocks new dials for [`RECONNECT_BACKOFF`].

pub mod resp;

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use conduit_protocol::Record;
use conduit_routing::name_or_default;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::common::{Result, SinkError};
use crate::exporter::{Exporter, ExporterBase};
use crate::proxy::RECONNECT_BACKOFF;
use crate::settings::{RedisMode, RedisSettings};

use self::resp::{Reply, RespConnection};

/// Ask each sentinel in turn for the master address of `master_name`
pub async fn resolve_master(
    sentinels: &[String],
    master_name: &str,
    timeout: Duration,
) -> Result<String> {
    let mut last_error = SinkError::config("no sentinel addresses");
    for sentinel in sentinels {
        let reply = async {
            let mut conn = RespConnection::connect(sentinel, timeout).await?;
            conn.command(&[
                b"SENTINEL",
                b"get-master-addr-by-name",
                master_name.as_bytes(),
            ])
            .await
        }
        .await;
        match reply {
            Ok(Reply::Array(Some(items))) if items.len() == 2 => {
                if let (Some(host), Some(port)) = (items[0].as_text(), items[1].as_text()) {
                    return Ok(format!("{host}:{port}"));
                }
                last_error = SinkError::write("sentinel returned a non-text address");
            }
            Ok(other) => {
                last_error = SinkError::write(format!("unexpected sentinel reply {other:?}"));
            }
            Err(e) => last_error = e,
        }
    }
    Err(last_error)
}

/// Idle connections kept for reuse; extra ones are closed on check-in
const MAX_IDLE: usize = 4;

struct Shared {
    settings: RedisSettings,
    master: ArcSwapOption<String>,
    idle: Mutex<Vec<RespConnection>>,
    last_failure: Mutex<Option<Instant>>,
}

impl Shared {
    fn new(settings: RedisSettings) -> Self {
        Self {
            settings,
            master: ArcSwapOption::empty(),
            idle: Mutex::new(Vec::new()),
            last_failure: Mutex::new(None),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.settings.connect_timeout_ms.max(1))
    }

    /// Address publishes should go to right now
    fn target(&self) -> Option<String> {
        match self.settings.mode {
            RedisMode::Single => self.settings.addresses.first().cloned(),
            RedisMode::Sentinel => self.master.load_full().map(|m| m.as_ref().clone()),
        }
    }

    async fn open(&self, addr: &str) -> Result<RespConnection> {
        let mut conn = RespConnection::connect(addr, self.timeout()).await?;
        if let Some(password) = &self.settings.password {
            conn.command(&[b"AUTH", password.as_bytes()]).await?;
        }
        Ok(conn)
    }

    /// Open a connection unless the last attempt failed within the backoff
    async fn dial(&self, addr: &str) -> Result<RespConnection> {
        let last_failure = *self.last_failure.lock();
        if last_failure.is_some_and(|at| at.elapsed() < RECONNECT_BACKOFF) {
            return Err(SinkError::write(format!("redis {addr} in reconnect backoff")));
        }
        match self.open(addr).await {
            Ok(conn) => {
                *self.last_failure.lock() = None;
                Ok(conn)
            }
            Err(e) => {
                *self.last_failure.lock() = Some(Instant::now());
                Err(e)
            }
        }
    }

    /// Idle connection to `addr`; connections to a stale master are dropped
    fn checkout(&self, addr: &str) -> Option<RespConnection> {
        let mut idle = self.idle.lock();
        idle.retain(|c| c.addr() == addr);
        idle.pop()
    }

    fn checkin(&self, conn: RespConnection) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE {
            idle.push(conn);
        }
    }

    async fn refresh_master(&self) -> Result<bool> {
        let addr = resolve_master(
            &self.settings.addresses,
            &self.settings.master_name,
            self.timeout(),
        )
        .await?;
        let changed = self.master.load().as_deref() != Some(&addr);
        if changed {
            tracing::info!(master = %addr, "redis master changed");
            self.master.store(Some(Arc::new(addr)));
        }
        Ok(changed)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<String> {
        let target = self
            .target()
            .ok_or_else(|| SinkError::write("no redis master available"))?;
        let mut conn = match self.checkout(&target) {
            Some(conn) => conn,
            None => self.dial(&target).await?,
        };
        conn.command(&[b"PUBLISH", channel.as_bytes(), payload]).await?;
        self.checkin(conn);
        Ok(target)
    }
}

pub struct RedisExporter {
    base: ExporterBase,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl RedisExporter {
    pub fn new(base: ExporterBase, settings: RedisSettings) -> Self {
        Self {
            base,
            shared: Arc::new(Shared::new(settings)),
            cancel: CancellationToken::new(),
        }
    }

    /// Currently cached sentinel master
    pub fn master(&self) -> Option<String> {
        self.shared.master.load_full().map(|m| m.as_ref().clone())
    }

    fn channels(&self, record: &Record) -> Vec<String> {
        let s = &self.shared.settings;
        if !s.channel.is_empty() {
            return vec![s.channel.clone()];
        }
        let named: Vec<String> = record
            .table_names
            .iter()
            .filter(|t| !t.is_empty())
            .cloned()
            .collect();
        if named.is_empty() {
            vec![name_or_default("", &s.data_set, s.biz_id)]
        } else {
            named
        }
    }

    fn spawn_master_poll(&self) {
        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        let name = self.base.name().to_string();
        let period = Duration::from_secs(shared.settings.poll_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = shared.refresh_master().await {
                            tracing::warn!(exporter = %name, error = %e, "sentinel poll failed");
                        }
                    }
                }
            }
            tracing::debug!(exporter = %name, "sentinel poll stopped");
        });
    }
}

#[async_trait]
impl Exporter for RedisExporter {
    fn base(&self) -> &ExporterBase {
        &self.base
    }

    async fn start(&self) -> Result<()> {
        let shared = &self.shared;
        match shared.settings.mode {
            RedisMode::Single => {
                let addr = shared
                    .settings
                    .addresses
                    .first()
                    .ok_or_else(|| SinkError::config("redis address missing"))?;
                match shared.dial(addr).await {
                    Ok(conn) => shared.checkin(conn),
                    Err(e) => {
                        tracing::warn!(exporter = %self.base.name(), error = %e, "redis not reachable, will retry on write");
                    }
                }
            }
            RedisMode::Sentinel => {
                if let Err(e) = shared.refresh_master().await {
                    tracing::warn!(exporter = %self.base.name(), error = %e, "no redis master yet");
                }
                self.spawn_master_poll();
            }
        }
        tracing::info!(exporter = %self.base.name(), mode = ?shared.settings.mode, "redis exporter started");
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        self.shared.idle.lock().clear();
    }

    async fn write(&self, record: &mut Record) -> Result<()> {
        let channels = self.channels(record);
        let mut target = String::new();
        for channel in &channels {
            target = self.shared.publish(channel, record.payload()).await?;
        }
        record.set_output("redis", target, format!("redis|{}", channels.join(",")));
        Ok(())
    }
}

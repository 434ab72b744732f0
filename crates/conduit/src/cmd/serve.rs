//! Serve command - run the Conduit daemon
//!
//! Startup order: exporters, routers (plus bootstrap routes), channels.
//! Shutdown runs the same list backwards.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use conduit_config::{ChannelConfig, Config};
use conduit_pipeline::{
    Channel, ChannelConf, ChannelDeps, ChannelIdRouter, ChannelMetricsHandle, ConfigFeed,
    RouterMetricsHandle,
};
use conduit_protocol::{CountingOpsReporter, OpsCounts};
use conduit_routing::{ConfigEvent, EventKind, RouteKeyMode};
use conduit_sinks::{ExporterContext, ExporterRegistry, ExporterSettings, SinkFactory};

/// Period of the metrics log line
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Serve command arguments
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Path to configuration file (defaults to configs/config.toml if not specified)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// Run the daemon until SIGINT or SIGTERM
pub async fn run(config: Config) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        platform = std::env::consts::OS,
        arch = std::env::consts::ARCH,
        "Conduit starting"
    );

    if let Err(e) = run_server(config).await {
        error!(error = %e, "server error");
        return Err(e);
    }

    info!("Conduit shutdown complete");
    Ok(())
}

struct RouterEntry {
    router: Arc<ChannelIdRouter>,
    // Held so the event task outlives startup
    _feed: ConfigFeed,
}

async fn run_server(config: Config) -> Result<()> {
    if config.enabled_channels().next().is_none() {
        return Err(conduit_config::ConfigError::NoChannelsEnabled.into());
    }

    let exporters = config
        .exporter_settings()
        .context("failed to resolve exporters")?;

    let ops = Arc::new(CountingOpsReporter::new());
    let ctx = ExporterContext::new(ops.clone()).with_host_ip(config.global.host_ip.clone());
    let factory = Arc::new(SinkFactory::new(ctx));
    config.validate_sink_support(|kind| factory.supports(kind))?;

    let registry = Arc::new(ExporterRegistry::new(factory.clone()));
    for (name, settings) in &exporters {
        if let Err(e) = registry.upsert(settings).await {
            warn!(exporter = %name, error = %e, "exporter unavailable at startup");
        }
    }

    let routers = start_routers(&config, &exporters, &registry).await;

    let mut channels = Vec::new();
    for channel_config in config.enabled_channels() {
        let conf = channel_conf(channel_config, &exporters)?;
        let mut deps = ChannelDeps::new(factory.clone()).with_ops(ops.clone());
        if let Some(entry) = routers.get(&channel_config.route_key_mode) {
            deps = deps.with_router(Arc::clone(&entry.router));
        }
        channels.push(Channel::new(channel_config.name.clone(), deps).with_conf(conf));
    }

    let mut healthy = 0;
    for channel in &channels {
        match channel
            .start()
            .await
            .with_context(|| format!("channel '{}' failed to start", channel.name()))
        {
            Ok(()) => healthy += 1,
            Err(e) => {
                let reason = format!("{e:#}");
                error!(error = %reason, "channel unhealthy");
            }
        }
    }
    if healthy == 0 {
        shutdown(&channels, &routers, config.global.shutdown_timeout()).await;
        anyhow::bail!("no channel could be started");
    }

    info!(
        channels = healthy,
        exporters = registry.len(),
        routers = routers.len(),
        "Conduit running"
    );

    let cancel = CancellationToken::new();
    let reporter = tokio::spawn(report_metrics(
        channels.iter().map(Channel::metrics_handle).collect(),
        routers.values().map(|e| e.router.metrics_handle()).collect(),
        ops,
        cancel.clone(),
    ));

    wait_for_shutdown().await;
    info!("shutdown signal received, stopping...");

    cancel.cancel();
    let _ = reporter.await;
    shutdown(&channels, &routers, config.global.shutdown_timeout()).await;

    Ok(())
}

/// One router per key mode in use; every router shares `registry`
async fn start_routers(
    config: &Config,
    exporters: &BTreeMap<String, ExporterSettings>,
    registry: &Arc<ExporterRegistry>,
) -> HashMap<RouteKeyMode, RouterEntry> {
    let mut routers = HashMap::new();
    let modes = config
        .enabled_channels()
        .map(|c| c.route_key_mode)
        .chain(config.routes.iter().map(|r| r.route_key_mode));

    for mode in modes {
        if routers.contains_key(&mode) {
            continue;
        }
        let router = Arc::new(ChannelIdRouter::with_grace(
            mode,
            config.global.release_grace(),
            Arc::clone(registry),
        ));
        let feed = router.start(config.global.event_queue_size).await;
        routers.insert(mode, RouterEntry { router, _feed: feed });
    }

    for route in &config.routes {
        let Some(entry) = routers.get(&route.route_key_mode) else {
            continue;
        };
        let applied = match route.to_payload(exporters) {
            Ok(payload) => {
                let event = ConfigEvent::route(EventKind::Create, route.channel_id, payload);
                entry.router.apply(&event).await.map_err(anyhow::Error::from)
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = applied {
            warn!(route = %route.label(), error = %e, "bootstrap route skipped");
        }
    }

    routers
}

fn channel_conf(
    config: &ChannelConfig,
    exporters: &BTreeMap<String, ExporterSettings>,
) -> Result<ChannelConf> {
    let lookup = |name: &str| {
        exporters
            .get(name)
            .cloned()
            .with_context(|| format!("channel '{}' refers to unknown exporter '{name}'", config.name))
    };

    let mut conf = ChannelConf::new(&config.name, config.decode_type()?, config.receiver.clone());
    conf.workers = config.workers;
    conf.queue_ceiling = config.queue_ceiling;
    conf.direct = config.direct;
    conf.exporters = config
        .exporters
        .iter()
        .map(|name| lookup(name))
        .collect::<Result<_>>()?;
    conf.transfer_exporter = config.transfer_exporter.as_deref().map(lookup).transpose()?;
    conf.ops_services = config.ops_service_map();
    Ok(conf)
}

/// Stop channels, then routers, within `timeout`
async fn shutdown(
    channels: &[Channel],
    routers: &HashMap<RouteKeyMode, RouterEntry>,
    timeout: Duration,
) {
    let sequence = async {
        for channel in channels.iter().rev() {
            channel.stop().await;
        }
        for entry in routers.values() {
            entry.router.stop().await;
        }
    };

    if tokio::time::timeout(timeout, sequence).await.is_err() {
        warn!(
            timeout_secs = timeout.as_secs(),
            "shutdown did not finish within timeout"
        );
    }
}

async fn report_metrics(
    channels: Vec<ChannelMetricsHandle>,
    routers: Vec<RouterMetricsHandle>,
    ops: Arc<CountingOpsReporter>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    let mut last_ops = OpsCounts::default();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for channel in &channels {
            let m = channel.snapshot();
            info!(
                channel = channel.name(),
                enqueued = m.enqueued,
                dropped = m.dropped,
                processed = m.processed,
                lost = m.lost,
                in_flight = m.in_flight(),
                "channel metrics"
            );
        }
        for router in &routers {
            let m = router.snapshot();
            info!(
                mode = router.mode().as_str(),
                lookups = m.lookups,
                misses = m.misses,
                delivered = m.delivered,
                events_rejected = m.events_rejected,
                "router metrics"
            );
        }

        let now = ops.snapshot();
        let delta = now.diff(&last_ops);
        info!(
            dealing = delta.dealing,
            output = delta.output,
            lost = delta.lost,
            dropped = delta.dropped,
            bytes_output = delta.bytes_output,
            "ops"
        );
        last_ops = now;
    }
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

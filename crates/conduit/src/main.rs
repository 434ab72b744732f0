//! Conduit - multi-protocol ingestion and channel-id routing daemon
//!
//! # Usage
//!
//! ```bash
//! # Run the daemon (default)
//! conduit
//! conduit --config configs/config.toml --log-level debug
//! ```

mod cmd;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use conduit_config::{Config, LogConfig, LogFormat, LogOutput};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

/// Conduit - multi-protocol ingestion and channel-id routing daemon
#[derive(Parser, Debug)]
#[command(name = "conduit")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (error if specified but not found)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). Overrides config file.
    #[arg(short, long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon
    Serve(cmd::serve::ServeArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = match cli.command {
        Some(Command::Serve(mut args)) => {
            // CLI global --config overrides subcommand config if both specified
            if args.config.is_none() && cli.config.is_some() {
                args.config = cli.config;
            }
            args
        }
        None => cmd::serve::ServeArgs { config: cli.config },
    };

    let (config, source) = load_config(args.config.as_deref())?;
    let log_level = resolve_log_level(cli.log_level.as_deref(), &config.log);
    init_logging(&log_level, &config.log)?;
    tracing::info!(config = %source, "configuration loaded");

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all().thread_name("conduit-worker");
    if config.global.num_processors > 0 {
        builder.worker_threads(config.global.num_processors);
    }
    let runtime = builder.build().context("failed to build async runtime")?;

    runtime.block_on(cmd::serve::run(config))
}

/// Load the configuration, falling back to the default locations
fn load_config(path: Option<&Path>) -> Result<(Config, String)> {
    if let Some(path) = path {
        if !path.exists() {
            anyhow::bail!("config file not found: {}", path.display());
        }
        let config = Config::from_file(path).context("failed to load configuration")?;
        return Ok((config, path.display().to_string()));
    }

    for candidate in ["configs/config.toml", "config.toml"] {
        let path = Path::new(candidate);
        if path.exists() {
            let config = Config::from_file(path).context("failed to load configuration")?;
            return Ok((config, candidate.to_string()));
        }
    }

    Ok((Config::default(), "(default)".to_string()))
}

/// Resolve log level: CLI flag > config file
///
/// Per-target overrides from `[log.targets]` apply on top of either.
fn resolve_log_level(cli_level: Option<&str>, log: &LogConfig) -> String {
    match cli_level {
        Some(level) => level.to_string(),
        None => log.level.as_str().to_string(),
    }
}

/// Initialize the tracing subscriber for logging
fn init_logging(level: &str, log: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_new(log.directive(level))
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("invalid log level: {}", e))?;

    let writer = match log.output {
        LogOutput::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogOutput::Stderr => BoxMakeWriter::new(std::io::stderr),
    };

    let layer = match log.format {
        LogFormat::Console => fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_writer(writer)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(false)
            .with_writer(writer)
            .boxed(),
    };

    tracing_subscriber::registry().with(layer).with(filter).init();

    Ok(())
}

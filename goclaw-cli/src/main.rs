//! Goclaw CLI - boots the orchestration engine and runs it until a signal.
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults (in-memory storage, one default lane)
//! goclaw
//!
//! # Run against a config file with debug logging
//! goclaw --config goclaw.toml --debug
//! ```
//!
//! `SIGINT`/`SIGTERM` initiate a graceful stop; on Unix, `SIGHUP` re-reads
//! the config file and applies its log level without a restart.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use goclaw_core::config::GoclawConfig;
use goclaw_engine::Engine;
use std::path::PathBuf;
use std::process;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

#[derive(Parser)]
#[command(name = "goclaw")]
#[command(about = "Goclaw - multi-agent workflow orchestration engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port handed to the transport collaborators
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level
    #[arg(long, value_enum)]
    log_level: Option<LogLevelArg>,

    /// Shorthand for --log-level debug
    #[arg(long)]
    debug: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevelArg {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevelArg {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

type LogReloadHandle = reload::Handle<EnvFilter, Registry>;

fn init_tracing(level: &str) -> Result<LogReloadHandle> {
    let filter = EnvFilter::try_new(level).context("invalid log level")?;
    let (filter_layer, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();
    Ok(handle)
}

fn apply_log_level(handle: &LogReloadHandle, level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).context("invalid log level")?;
    handle.reload(filter).context("failed to reload log filter")?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("goclaw: {err:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config =
        GoclawConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    let level = if cli.debug {
        "debug".to_string()
    } else {
        cli.log_level
            .map(|l| l.as_str().to_string())
            .unwrap_or_else(|| config.log_level.clone())
    };
    let log_handle = init_tracing(&level)?;

    if let Some(port) = cli.port {
        info!(port, "transport port recorded for API collaborators");
    }

    let engine = Engine::new(config).context("failed to initialize engine")?;
    engine.start().await.context("failed to start engine")?;
    info!("goclaw engine started, waiting for signals");

    wait_for_shutdown(&log_handle, cli.config.as_deref()).await;

    engine.stop().await.context("engine stop failed")?;
    Ok(())
}

/// Block until SIGINT or SIGTERM. On Unix, SIGHUP hot-reloads the log level
/// from the config file instead of stopping.
async fn wait_for_shutdown(log_handle: &LogReloadHandle, config_path: Option<&std::path::Path>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut hangup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT, shutting down");
                    return;
                }
                _ = terminate.recv() => {
                    info!("received SIGTERM, shutting down");
                    return;
                }
                _ = hangup.recv() => {
                    match GoclawConfig::load(config_path) {
                        Ok(config) => {
                            if let Err(err) = apply_log_level(log_handle, &config.log_level) {
                                tracing::warn!(%err, "log level reload failed");
                            } else {
                                info!(level = %config.log_level, "log level reloaded");
                            }
                        }
                        Err(err) => tracing::warn!(%err, "config reload failed"),
                    }
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (log_handle, config_path);
        let _ = tokio::signal::ctrl_c().await;
        info!("received interrupt, shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["goclaw", "--debug", "--port", "8080"]).unwrap();
        assert!(cli.debug);
        assert_eq!(cli.port, Some(8080));
        assert!(cli.config.is_none());

        let cli = Cli::try_parse_from(["goclaw", "--log-level", "warn"]).unwrap();
        assert!(matches!(cli.log_level, Some(LogLevelArg::Warn)));

        assert!(Cli::try_parse_from(["goclaw", "--log-level", "loud"]).is_err());
    }
}

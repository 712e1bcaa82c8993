#![forbid(unsafe_code)]

//! `nanoclaw` server binary.
//!
//! Bootstraps configuration, the store, the channel adapters, and the
//! router's background loops, then waits for a shutdown signal.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use nanoclaw::channel::cli::CliChannel;
use nanoclaw::channel::{Channel, ChannelSet};
use nanoclaw::config::GlobalConfig;
use nanoclaw::router::Router;
use nanoclaw::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "nanoclaw", about = "Assistant router with sandboxed agent execution", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Enable the terminal channel regardless of configuration.
    #[arg(long)]
    cli: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("nanoclaw server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = GlobalConfig::load(&args.config)?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if args.cli {
        config.cli_channel = true;
    }
    let config = Arc::new(config);
    info!(data_dir = %config.data_dir.display(), "configuration loaded");

    let mut adapters: Vec<Arc<dyn Channel>> = Vec::new();
    if config.cli_channel {
        adapters.push(Arc::new(CliChannel::new("Operator".to_owned())));
    }
    if adapters.is_empty() {
        info!("no channel adapters configured; running store/scheduler/ipc only");
    }
    let channels = ChannelSet::new(adapters);

    let cancel = CancellationToken::new();
    let router = Router::start(Arc::clone(&config), channels, cancel.clone()).await?;
    info!("nanoclaw ready");

    shutdown_signal().await;
    info!("shutdown signal received — starting graceful shutdown");
    cancel.cancel();

    // A second signal force-exits.
    tokio::spawn(async {
        shutdown_signal().await;
        error!("second shutdown signal received — forcing exit");
        std::process::exit(1);
    });

    router.shutdown().await;
    info!("nanoclaw shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}

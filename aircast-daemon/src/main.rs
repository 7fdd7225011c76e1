mod config;
mod dbus;
mod service;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use dbus::DbusServer;
use service::MiracastService;

/// Grace period for teardown after a shutdown signal
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "aircast-daemon", version, about = "Miracast source daemon")]
struct Args {
    /// Enable debugging output
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!("starting aircast daemon v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load().context("Failed to load configuration")?;

    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let service = MiracastService::create(config.clone(), signal_tx).await;

    if config.service.enable_on_start {
        if let Err(e) = service.write().await.set_enabled(true).await {
            warn!("could not enable the service at startup: {e}");
        }
    }

    let dbus = DbusServer::start(service.clone())
        .await
        .context("Failed to register on D-Bus")?;
    tokio::spawn(dbus.emit_signals(signal_rx));

    wait_for_shutdown().await;

    info!("shutting down");
    let _ = service.write().await.set_enabled(false).await;
    tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;

    Ok(())
}

async fn wait_for_shutdown() {
    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler installed");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

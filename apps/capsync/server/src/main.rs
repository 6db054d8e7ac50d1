use std::sync::Arc;

use anyhow::{Context, Result};
use capsync_server::{
    app, spawn_reconciler, telemetry::Telemetry, AppState, Cli, ServerConfig, SyncHub,
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        reconcile_interval = ?config.sync.reconcile_interval,
        observer_interval = ?config.sync.observer_interval,
        send_buffer = config.sync.send_buffer,
        "starting capsync server"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let hub = SyncHub::new(config.sync.clone());
    let state = Arc::new(AppState::new(Arc::clone(&hub), metrics));

    let reconciler_handle = spawn_reconciler(hub);

    let listener = app::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    app::serve(listener, state, shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    reconciler_handle.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

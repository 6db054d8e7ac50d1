use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use anyhow::{ensure, Context};
use clap::Parser;

use crate::hub::{SyncConfig, MIN_SEND_BUFFER};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub sync: SyncConfig,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Parser)]
#[command(
    name = "capsync-server",
    author,
    version,
    about = "Shares one boolean flag across every connected WebSocket client"
)]
pub struct Cli {
    /// Interface to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "CAPSYNC_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// How often the reconciler re-checks the flag, in milliseconds.
    #[arg(long, env = "CAPSYNC_RECONCILE_INTERVAL_MS", default_value_t = 50)]
    pub reconcile_interval_ms: u64,

    /// How often observers receive the participant count, in milliseconds.
    #[arg(long, env = "CAPSYNC_OBSERVER_INTERVAL_MS", default_value_t = 5000)]
    pub observer_interval_ms: u64,

    /// Outbound frames queued per connection before it is evicted.
    #[arg(long, env = "CAPSYNC_SEND_BUFFER", default_value_t = 64)]
    pub send_buffer: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "CAPSYNC_SHUTDOWN_GRACE_SECS", default_value_t = 1)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let host: IpAddr = cli
            .host
            .parse()
            .with_context(|| format!("invalid listen host: {}", cli.host))?;
        ensure!(
            cli.reconcile_interval_ms > 0,
            "reconcile interval must be greater than zero"
        );
        ensure!(
            cli.observer_interval_ms > 0,
            "observer interval must be greater than zero"
        );
        ensure!(
            cli.send_buffer >= MIN_SEND_BUFFER,
            "send buffer must hold at least {MIN_SEND_BUFFER} frames"
        );

        Ok(ServerConfig {
            listen_addr: SocketAddr::new(host, cli.port),
            sync: SyncConfig {
                reconcile_interval: Duration::from_millis(cli.reconcile_interval_ms),
                observer_interval: Duration::from_millis(cli.observer_interval_ms),
                send_buffer: cli.send_buffer,
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

//! spns-daemon: the push notification server daemon.
//!
//! Wires the transport, database, and engine together: binds the RPC
//! endpoints, runs the engine's startup sequence, installs its timers, and
//! then idles until shutdown.

mod config;
mod rlimit;

use std::sync::Arc;

use spns_hive::HiveMind;
use spns_transport::link::Router;
use spns_transport::quic::QuicTransport;
use tracing::{error, info};

use crate::config::DaemonConfig;

/// Minimum open-file soft limit; every storage node costs a descriptor.
const MIN_NOFILE: u64 = 10_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DaemonConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log.level.clone())),
        )
        .init();

    info!("push notification server starting");

    rlimit::raise_nofile_limit(MIN_NOFILE);

    let pool = spns_db::Pool::open(&config.core.database)?;

    let router = Router::new();
    let listen = config.core.listen.parse()?;
    let main_transport = QuicTransport::bind(listen, Arc::clone(&router))
        .map_err(|e| anyhow::anyhow!("failed to bind {}: {e}", config.core.listen))?;
    info!(addr = %main_transport.local_addr(), "listening for frontend/notifier connections");

    // Optional dedicated endpoints for storage-node traffic, assigned to
    // nodes round-robin.
    let mut push_transports: Vec<Arc<dyn spns_transport::link::Transport>> = Vec::new();
    for _ in 0..config.core.push_instances {
        let transport = QuicTransport::bind("0.0.0.0:0".parse()?, Arc::clone(&router))
            .map_err(|e| anyhow::anyhow!("failed to bind push instance: {e}"))?;
        push_transports.push(transport);
    }

    let notify_queue = if config.core.push_instances <= 1 {
        4000
    } else {
        6000 / config.core.push_instances as usize
    };

    let hive = HiveMind::new(
        config.hive_config()?,
        pool,
        main_transport,
        push_transports,
    );
    hive.register_endpoints(&router, notify_queue);

    if let Err(e) = hive.startup().await {
        error!("startup failed: {e}");
        anyhow::bail!("startup failed: {e}");
    }
    hive.install_timers();

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping");
    Ok(())
}

//! # Keystone Node
//!
//! Coordination daemon: loads the engine config, starts every background
//! loop and reports status until a shutdown signal arrives.
//!
//! ```text
//! keystone-node [CONFIG_PATH]
//!
//! CONFIG_PATH defaults to the platform config dir (keystone.toml);
//! KEYSTONE_* environment variables override file values.
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use keystone_sync::{EngineBuilder, EngineConfig};

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = EngineConfig::load(config_path).context("Failed to load engine config")?;
    info!(
        node_id = %config.node_id(),
        backend = %config.store.backend,
        strategy = ?config.sync.conflict_resolution_strategy,
        "Configuration loaded"
    );

    let mut engine = EngineBuilder::new(config)
        .build()
        .await
        .context("Failed to build coordination engine")?;
    engine.start().await?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut status_tick = tokio::time::interval(STATUS_INTERVAL);

    loop {
        tokio::select! {
            _ = status_tick.tick() => {
                match engine.status().await {
                    Ok(status) => info!(
                        status = %serde_json::to_string(&status).unwrap_or_default(),
                        "Engine status"
                    ),
                    Err(e) => warn!(error_kind = %e.kind(), ?e, "Failed to read engine status"),
                }
            }

            _ = &mut shutdown => break,
        }
    }

    engine.shutdown().await?;
    info!("Node shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(?e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(?e, "Failed to install SIGTERM handler");
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

    info!("Shutdown signal received, starting graceful shutdown...");
}

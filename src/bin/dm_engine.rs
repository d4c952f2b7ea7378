//! # DM Engine
//!
//! Standalone worker process: loads configuration, connects the graph store and
//! delivers journaled mutations until shut down.
//!
//! ## Usage
//!
//! ```bash
//! # In-memory store (nothing survives a restart)
//! cargo run --bin dm-engine
//!
//! # PostgreSQL store with production logging
//! DM_ENV=production DM__DATABASE__URL=postgres://localhost/dm cargo run --bin dm-engine
//! ```
//!
//! Distributor backends are linked in by embedding crates, which register their
//! factories on the registry before the workers start.

use anyhow::Context;
use dm_core::config::ConfigManager;
use dm_core::logging;
use dm_core::{
    DistributorRegistry, DmService, GraphStore, MemoryGraphStore, SystemClock,
};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_structured_logging();

    info!("Starting DM engine");
    info!("   Version: {}", env!("CARGO_PKG_VERSION"));

    let manager = ConfigManager::load().context("failed to load DM configuration")?;
    let config = Arc::new(manager.config().clone());
    info!("   Environment: {}", manager.environment());

    let store = build_store(&config).await?;
    let registry = Arc::new(DistributorRegistry::new(config.distributors.clone()));
    if registry.config_names().is_empty() {
        warn!("no distributors configured; scheduled executions will be rejected");
    }

    let service = DmService::from_config(config.clone(), store, registry, Arc::new(SystemClock));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = service.engine().spawn_workers(shutdown_rx);
    info!("   Workers: {}", workers.len());
    info!("   Press Ctrl+C to shutdown gracefully");

    shutdown_signal().await;
    info!("Shutdown signal received, stopping workers...");

    if shutdown_tx.send(true).is_err() {
        warn!("all workers already exited");
    }
    for worker in workers {
        if let Err(e) = worker.await {
            error!("worker terminated abnormally: {e}");
        }
    }

    info!("DM engine shutdown complete");
    Ok(())
}

async fn build_store(config: &dm_core::DmConfig) -> anyhow::Result<Arc<dyn GraphStore>> {
    match &config.database.url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            let store = dm_core::store::PgGraphStore::connect(url, config.database.max_connections)
                .await
                .context("failed to connect to PostgreSQL")?;
            store.migrate().await.context("failed to create DM tables")?;
            info!("   Store: PostgreSQL");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            anyhow::bail!("database.url is set but dm-engine was built without the postgres feature")
        }
        None => {
            warn!("   Store: in-memory (database.url not set)");
            Ok(Arc::new(MemoryGraphStore::new()))
        }
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}

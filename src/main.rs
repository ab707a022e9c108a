// src/main.rs
//! docpool engine
//!
//! Starts a pool of office workers from the settings file given as first
//! argument (and `DOCPOOL_*` environment variables), checks every worker is
//! reachable, then keeps the pool up until Ctrl-C.

use anyhow::{Context, Result};
use docpool_engine::observability::init_tracing;
use docpool_engine::runtime::installed;
use docpool_engine::{BuildInfo, Connection, Pool, PoolSettings};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    info!("Starting {}", BuildInfo::current());

    // Load configuration
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let settings = PoolSettings::load(path.as_deref()).context("cannot load settings")?;
    info!("Configuration loaded: {:?}", settings);

    let pool = Arc::new(Pool::from_settings(settings)?);
    installed::install(Arc::clone(&pool));

    // Worker startup blocks for up to process_timeout_ms per worker
    let starting = Arc::clone(&pool);
    tokio::task::spawn_blocking(move || starting.start())
        .await
        .context("pool start panicked")??;

    let checking = Arc::clone(&pool);
    let reachability = tokio::task::spawn_blocking(move || {
        (0..checking.entries().len())
            .map(|_| {
                checking.execute(|connection: &dyn Connection| -> anyhow::Result<()> {
                    anyhow::ensure!(
                        connection.is_connected(),
                        "worker at {} is not connected",
                        connection.endpoint()
                    );
                    Ok(())
                })
            })
            .collect::<docpool_engine::Result<Vec<_>>>()
    })
    .await
    .context("reachability check panicked")?;

    match reachability {
        Ok(_) => info!("All {} workers are reachable: {:?}", pool.entries().len(), pool.stats()),
        Err(e) => error!("Worker reachability check failed: {}", e),
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to install CTRL+C signal handler")?;
    info!("Received shutdown signal, cleaning up...");

    installed::uninstall();
    let stopping = Arc::clone(&pool);
    tokio::task::spawn_blocking(move || stopping.stop())
        .await
        .context("pool stop panicked")??;

    info!("Pool stopped gracefully");
    Ok(())
}

//! Logvault worker
//!
//! Usage:
//!     logvault-worker --config etc/logvault.toml

use anyhow::Context;
use clap::Parser;
use logvault_db::{JobStore, ResultStore};
use logvault_logging::{init_logging, LogConfig};
use logvault_protocol::LogvaultConfig;
use logvault_worker::{QueueWorker, SubprocessExecutor, WorkerArgs};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = WorkerArgs::parse();

    let config = LogvaultConfig::load(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;

    init_logging(LogConfig {
        component: "worker",
        logs_directory: Some(config.logs_directory.as_path()),
        verbose: args.verbose,
    })?;

    let worker_id = args.worker_id.unwrap_or_else(|| {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        format!("worker-{}", &uuid[..8])
    });

    info!("Starting logvault worker");
    info!("  Worker ID: {}", worker_id);
    info!("  Database: {}", config.database.url);
    info!("  Concurrency: {}", config.worker.concurrency);

    let store = JobStore::open(&config.database.url, config.database.max_connections).await?;
    let results = ResultStore::open(&config.results_cache.url, config.database.max_connections).await?;
    let executor = SubprocessExecutor::new(&config).with_results(results);

    let (worker, shutdown_tx) = QueueWorker::new(store, Arc::new(executor), worker_id, &config.worker);

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            return;
        }
        let _ = shutdown_tx.send(()).await;
    });

    worker.run().await?;
    Ok(())
}

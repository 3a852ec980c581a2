//! Logvault garbage collector
//!
//! Usage:
//!     logvault-gc --config etc/logvault.toml

use anyhow::Context;
use clap::Parser;
use logvault_db::{JobStore, ResultStore};
use logvault_gc::{
    recovery_file, storage, ArchiveClass, GcArgs, ResourceClass, RetentionSweeper,
    SearchResultClass, StreamClass, TargetsBuffer, METRICS,
};
use logvault_logging::{init_logging, LogConfig};
use logvault_protocol::LogvaultConfig;
use std::path::Path;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

fn spawn_sweeper<C: ResourceClass + 'static>(
    class: C,
    recovery_directory: &Path,
    retention_minutes: u64,
    interval_minutes: u64,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<JoinHandle<()>> {
    let buffer = TargetsBuffer::open(recovery_file(recovery_directory, class.name()))?;
    let sweeper = RetentionSweeper::new(class, buffer, retention_minutes, interval_minutes);
    Ok(tokio::spawn(sweeper.run(shutdown)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = GcArgs::parse();

    let config = LogvaultConfig::load(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;
    config.validate_retention()?;

    init_logging(LogConfig {
        component: "garbage_collector",
        logs_directory: Some(config.logs_directory.as_path()),
        verbose: args.verbose,
    })?;

    let gc = &config.garbage_collector;
    let archive_retention = config.archive_output.retention_period;
    let search_retention = config.results_cache.retention_period;
    let stream_retention = config.stream_output.retention_period;
    if archive_retention.is_none() && search_retention.is_none() && stream_retention.is_none() {
        info!("No retention period configured, nothing to collect");
        return Ok(());
    }

    info!("Starting logvault garbage collector");
    info!("  Database: {}", config.database.url);
    info!("  Recovery directory: {}", gc.recovery_directory.display());

    let jobs = JobStore::open(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to open job store")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    if let Some(retention) = archive_retention {
        let storage = storage::from_config(&config.archive_output.storage)?;
        info!("  Archives: {} min on {}", retention, storage.describe());
        tasks.push(spawn_sweeper(
            ArchiveClass::new(jobs.clone(), storage),
            &gc.recovery_directory,
            retention,
            gc.sweep_interval.archive,
            shutdown_rx.clone(),
        )?);
    }

    if search_retention.is_some() || stream_retention.is_some() {
        let results =
            ResultStore::open(&config.results_cache.url, config.database.max_connections)
                .await
                .context("Failed to open results cache")?;

        if let Some(retention) = search_retention {
            info!("  Search results: {} min", retention);
            tasks.push(spawn_sweeper(
                SearchResultClass::new(results.clone(), jobs.clone()),
                &gc.recovery_directory,
                retention,
                gc.sweep_interval.search_result,
                shutdown_rx.clone(),
            )?);
        }

        if let Some(retention) = stream_retention {
            let storage = storage::from_config(&config.stream_output.storage)?;
            info!("  Streams: {} min on {}", retention, storage.describe());
            tasks.push(spawn_sweeper(
                StreamClass::new(results, jobs.clone(), storage),
                &gc.recovery_directory,
                retention,
                gc.sweep_interval.stream,
                shutdown_rx.clone(),
            )?);
        }
    }

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            return;
        }
        info!("Shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            warn!("Sweeper task ended abnormally: {}", e);
        }
    }

    info!("{}", METRICS.snapshot().summary());
    jobs.close().await;
    Ok(())
}

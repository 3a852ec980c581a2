//! Logvault scheduler
//!
//! Usage:
//!     logvault-scheduler --config etc/logvault.toml

use anyhow::Context;
use clap::Parser;
use logvault_db::{JobStore, ResultStore};
use logvault_logging::{init_logging, LogConfig};
use logvault_protocol::{BackendKind, LogvaultConfig};
use logvault_scheduler::{
    bridge, reducer, LocalWorkflowDriver, QueueBackend, Reaper, Scheduler, SchedulerArgs,
    TaskBackend, WorkflowBackend, METRICS,
};
use logvault_worker::SubprocessExecutor;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = SchedulerArgs::parse();

    let config = LogvaultConfig::load(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;

    init_logging(LogConfig {
        component: "scheduler",
        logs_directory: Some(config.logs_directory.as_path()),
        verbose: args.verbose,
    })?;

    info!("Starting logvault scheduler");
    info!("  Scheduler ID: {}", config.scheduler.id);
    info!("  Database: {}", config.database.url);
    info!("  Backend: {:?}", config.scheduler.backend);

    let store = JobStore::open(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to open job store")?;

    let backend: Arc<dyn TaskBackend> = match config.scheduler.backend {
        BackendKind::Queue => Arc::new(QueueBackend::new(
            store.clone(),
            config.scheduler.task_priority,
        )),
        BackendKind::Workflow => {
            let results =
                ResultStore::open(&config.results_cache.url, config.database.max_connections)
                    .await
                    .context("Failed to open results cache")?;
            let executor = SubprocessExecutor::new(&config).with_results(results);
            let driver = LocalWorkflowDriver::new(
                Arc::new(executor),
                config.workflow.max_parallel_tasks,
            );
            Arc::new(WorkflowBackend::new(Arc::new(driver)))
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut scheduler = Scheduler::new(store.clone(), backend, config.scheduler.clone());

    if config.reducer.enabled {
        let addr = format!("{}:{}", config.reducer.host, config.reducer.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind reducer listener on {}", addr))?;
        let (offers, acquisition) = bridge();
        tokio::spawn(reducer::run_listener(listener, offers, shutdown_rx.clone()));
        scheduler = scheduler.with_reducer(acquisition);
    }

    let reaper = Reaper::new(store.clone(), &config.reaper);
    let reaper_task = tokio::spawn(reaper.run(shutdown_rx.clone()));

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            return;
        }
        info!("Shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    scheduler.run(shutdown_rx).await?;
    if let Err(e) = reaper_task.await {
        warn!("Reaper task ended abnormally: {}", e);
    }

    info!("{}", METRICS.snapshot().summary());
    store.close().await;
    Ok(())
}

//! Periodic cleanup of jobs whose scheduler stopped heartbeating.

use logvault_db::{HangingScope, JobStore};
use logvault_protocol::config::ReaperConfig;
use logvault_protocol::JobId;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::metrics::METRICS;

pub struct Reaper {
    store: JobStore,
    interval: Duration,
    heartbeat_timeout: Duration,
}

impl Reaper {
    pub fn new(store: JobStore, config: &ReaperConfig) -> Self {
        Self {
            store,
            interval: Duration::from_secs(config.interval_secs),
            heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_secs),
        }
    }

    /// Kill in-flight jobs whose owner has not heartbeated within the
    /// timeout. Returns the ids killed.
    pub async fn sweep_once(&self) -> Result<Vec<JobId>> {
        let cutoff = JobStore::now_millis() - self.heartbeat_timeout.as_millis() as i64;
        self.sweep_stale_since(cutoff).await
    }

    pub async fn sweep_stale_since(&self, cutoff_ms: i64) -> Result<Vec<JobId>> {
        let killed = self
            .store
            .kill_hanging_jobs(HangingScope::StaleSince(cutoff_ms))
            .await?;
        METRICS.add_jobs_killed(killed.len() as u64);
        Ok(killed)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            heartbeat_timeout_secs = self.heartbeat_timeout.as_secs(),
            "Reaper started"
        );
        let mut tick = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                _ = tick.tick() => {
                    match self.sweep_once().await {
                        Ok(killed) if killed.is_empty() => debug!("No hanging jobs"),
                        Ok(killed) => info!(count = killed.len(), "Reaped hanging jobs"),
                        Err(e) => {
                            warn!("Reaper sweep failed: {}", e);
                            METRICS.inc_db_errors();
                        }
                    }
                }
            }
        }
        info!("Reaper stopped");
    }
}

//! Job submission helpers for callers outside the scheduler process.
//!
//! Clients only ever talk to the [`JobStore`]; the scheduler picks submitted
//! jobs up on its next iteration.

use logvault_db::{DbError, JobStore};
use logvault_protocol::{JobConfig, JobId, JobStatus};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{Result, SchedulerError};

/// Insert a PENDING job for `config`.
pub async fn submit_job(store: &JobStore, config: &JobConfig) -> Result<JobId> {
    let blob = config.encode()?;
    let id = store.create_job(config.kind(), &blob).await?;
    info!(job_id = %id, kind = %config.kind(), "Job submitted");
    Ok(id)
}

/// Request cancellation. Returns the status the job moved to.
pub async fn cancel_job(store: &JobStore, id: JobId) -> Result<JobStatus> {
    match store.cancel_job(id).await {
        Ok(status) => Ok(status),
        Err(DbError::NotFound(_)) => Err(SchedulerError::JobNotFound(id)),
        Err(e) => Err(e.into()),
    }
}

/// Poll the job status every `interval` until it is terminal.
///
/// A status integer outside the known range is returned as an error rather
/// than polled forever.
pub async fn wait_for_job(
    store: &JobStore,
    id: JobId,
    interval: Duration,
    timeout: Duration,
) -> Result<JobStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        let status = store
            .get_job_status(id)
            .await?
            .ok_or(SchedulerError::JobNotFound(id))?;
        if status.is_terminal() {
            return Ok(status);
        }
        debug!(job_id = %id, %status, "Waiting for job");

        if Instant::now() >= deadline {
            return Err(SchedulerError::Timeout(id));
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logvault_protocol::{ExtractIrJobConfig, JobKind};

    fn extract_config() -> JobConfig {
        JobConfig::ExtractIr(ExtractIrJobConfig {
            archive_id: "archive-1".to_string(),
            orig_file_id: "file-1".to_string(),
            msg_ix: 0,
            target_uncompressed_size: None,
        })
    }

    #[tokio::test]
    async fn test_submit_creates_pending_job() {
        let store = JobStore::open_in_memory().await.unwrap();
        let id = submit_job(&store, &extract_config()).await.unwrap();

        let record = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.kind, JobKind::ExtractIr);
        assert_eq!(
            JobConfig::decode(JobKind::ExtractIr, &record.config).unwrap(),
            extract_config()
        );
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let store = JobStore::open_in_memory().await.unwrap();
        let err = cancel_job(&store, JobId::new(99)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_wait_returns_terminal_status() {
        let store = JobStore::open_in_memory().await.unwrap();
        let id = submit_job(&store, &extract_config()).await.unwrap();
        assert_eq!(
            cancel_job(&store, id).await.unwrap(),
            JobStatus::Cancelled
        );

        let status = wait_for_job(&store, id, Duration::from_millis(5), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_wait_times_out_on_pending_job() {
        let store = JobStore::open_in_memory().await.unwrap();
        let id = submit_job(&store, &extract_config()).await.unwrap();

        let err = wait_for_job(&store, id, Duration::from_millis(5), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_wait_rejects_unknown_status_value() {
        let store = JobStore::open_in_memory().await.unwrap();
        let id = submit_job(&store, &extract_config()).await.unwrap();
        sqlx::query("UPDATE jobs SET status = 42 WHERE id = ?")
            .bind(id.as_i64())
            .execute(store.pool())
            .await
            .unwrap();

        let err = wait_for_job(&store, id, Duration::from_millis(5), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Db(_)));
    }
}

//! Scheduler heartbeats and hanging-job cleanup.

use crate::error::Result;
use crate::jobs::{in_flight_list, open_task_list};
use crate::types::{HangingScope, QueueEntryState};
use crate::{now_millis, JobStore};
use logvault_protocol::defaults::KILLED_BY_REAPER_MESSAGE;
use logvault_protocol::{JobId, JobStatus, TaskStatus};
use tracing::{info, warn};

impl JobStore {
    /// Record that `scheduler_id` is alive.
    pub async fn heartbeat(&self, scheduler_id: &str) -> Result<()> {
        self.heartbeat_at(scheduler_id, now_millis()).await
    }

    pub async fn heartbeat_at(&self, scheduler_id: &str, at_ms: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduler_heartbeats (scheduler_id, last_seen) VALUES (?, ?)
            ON CONFLICT(scheduler_id) DO UPDATE SET last_seen = excluded.last_seen
            "#,
        )
        .bind(scheduler_id)
        .bind(at_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn last_heartbeat(&self, scheduler_id: &str) -> Result<Option<i64>> {
        Ok(sqlx::query_scalar(
            "SELECT last_seen FROM scheduler_heartbeats WHERE scheduler_id = ?",
        )
        .bind(scheduler_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Kill every in-flight job matched by `scope`, together with its open
    /// tasks and any queue entries not yet claimed.
    ///
    /// Runs in one transaction touching only the matched job ids. Returns the
    /// ids killed; an empty list means nothing was written.
    pub async fn kill_hanging_jobs(&self, scope: HangingScope<'_>) -> Result<Vec<JobId>> {
        let in_flight = in_flight_list();
        let mut tx = self.pool.begin().await?;

        let ids: Vec<i64> = match scope {
            HangingScope::OwnedBy(scheduler_id) => {
                sqlx::query_scalar(&format!(
                    "SELECT id FROM jobs WHERE status IN ({in_flight}) AND scheduler_id = ? ORDER BY id"
                ))
                .bind(scheduler_id)
                .fetch_all(&mut *tx)
                .await?
            }
            HangingScope::StaleSince(cutoff_ms) => {
                sqlx::query_scalar(&format!(
                    r#"SELECT id FROM jobs
                    WHERE status IN ({in_flight})
                    AND (scheduler_id IS NULL OR scheduler_id NOT IN (
                        SELECT scheduler_id FROM scheduler_heartbeats WHERE last_seen >= ?
                    ))
                    ORDER BY id"#
                ))
                .bind(cutoff_ms)
                .fetch_all(&mut *tx)
                .await?
            }
        };

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let now = now_millis();
        let open_tasks = open_task_list();
        for id in &ids {
            sqlx::query(&format!(
                "UPDATE tasks SET status = ?, duration = 0 WHERE job_id = ? AND status IN ({open_tasks})"
            ))
            .bind(TaskStatus::Killed.as_i32())
            .bind(id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(&format!(
                "UPDATE jobs SET status = ?, duration = 0, update_time = ?, status_msg = ? \
                 WHERE id = ? AND status IN ({in_flight})"
            ))
            .bind(JobStatus::Killed.as_i32())
            .bind(now)
            .bind(KILLED_BY_REAPER_MESSAGE)
            .bind(id)
            .execute(&mut *tx)
            .await?;

            sqlx::query("UPDATE task_queue SET state = ? WHERE group_id = ? AND state = ?")
                .bind(QueueEntryState::Revoked.as_i32())
                .bind(id)
                .bind(QueueEntryState::Queued.as_i32())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        let killed: Vec<JobId> = ids.into_iter().map(JobId::new).collect();
        match scope {
            HangingScope::OwnedBy(scheduler_id) => {
                warn!(scheduler_id, count = killed.len(), "Killed jobs left over from a previous run")
            }
            HangingScope::StaleSince(_) => {
                info!(count = killed.len(), "Killed jobs of unresponsive schedulers")
            }
        }
        Ok(killed)
    }
}

//! Job and task lifecycle operations.
//!
//! Every status write is an optimistic `UPDATE ... WHERE id = ? AND status = ?`.
//! A write that matches no row is reported as [`DbError::LostRace`].

use crate::error::{DbError, Result};
use crate::types::{JobRecord, TaskRecord};
use crate::{now_millis, JobStore};
use logvault_protocol::{
    job_status_from_tasks, JobId, JobKind, JobStatus, TaskId, TaskResult, TaskStatus,
};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

/// Final report for a job whose tasks all returned.
#[derive(Debug, Clone)]
pub struct JobOutcome<'a> {
    /// Status the job is expected to be in right now.
    pub from: JobStatus,
    pub results: &'a [TaskResult],
    /// Replaces the status derived from the task results.
    pub status_override: Option<JobStatus>,
    pub status_msg: Option<String>,
}

pub(crate) fn int_list(values: impl IntoIterator<Item = i32>) -> String {
    values
        .into_iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn in_flight_list() -> String {
    int_list(JobStatus::IN_FLIGHT.iter().map(|s| s.as_i32()))
}

pub(crate) fn open_task_list() -> String {
    int_list([TaskStatus::Pending.as_i32(), TaskStatus::Running.as_i32()])
}

const JOB_COLUMNS: &str = "id, kind, status, status_msg, creation_time, start_time, update_time, \
     duration, config, num_tasks, num_tasks_completed, num_tasks_failed, uncompressed_size, \
     compressed_size, scheduler_id";

impl JobStore {
    // ========================================================================
    // Jobs
    // ========================================================================

    /// Insert a PENDING job and return its id.
    pub async fn create_job(&self, kind: JobKind, config: &[u8]) -> Result<JobId> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (kind, status, creation_time, update_time, config)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(kind.as_i32())
        .bind(JobStatus::Pending.as_i32())
        .bind(now)
        .bind(now)
        .bind(config)
        .execute(&self.pool)
        .await?;

        let id = JobId::new(result.last_insert_rowid());
        debug!(job_id = %id, kind = %kind, "Created job");
        Ok(id)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_job).transpose()
    }

    /// Current status; an unknown stored integer is an error.
    pub async fn get_job_status(&self, id: JobId) -> Result<Option<JobStatus>> {
        let status: Option<i32> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?;

        Ok(status.map(JobStatus::from_i32).transpose()?)
    }

    /// PENDING jobs of the given kinds, oldest first.
    pub async fn list_pending_jobs(&self, kinds: &[JobKind]) -> Result<Vec<JobRecord>> {
        if kinds.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ? AND kind IN ({}) \
             ORDER BY creation_time ASC, id ASC",
            int_list(kinds.iter().map(|k| k.as_i32()))
        );
        let rows = sqlx::query(&sql)
            .bind(JobStatus::Pending.as_i32())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_job).collect()
    }

    /// Jobs in `status`, optionally restricted to one owning scheduler.
    pub async fn list_jobs_in_status(
        &self,
        status: JobStatus,
        scheduler_id: Option<&str>,
    ) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ? \
             AND (? IS NULL OR scheduler_id = ?) ORDER BY id"
        ))
        .bind(status.as_i32())
        .bind(scheduler_id)
        .bind(scheduler_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_job).collect()
    }

    /// Move a job along one edge of the state machine.
    pub async fn transition_job(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
        status_msg: Option<&str>,
    ) -> Result<()> {
        if !from.can_transition_to(to) {
            return Err(DbError::IllegalTransition {
                job_id: id,
                from,
                to,
            });
        }

        let now = now_millis();
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = ?,
                status_msg = COALESCE(?, status_msg),
                update_time = ?,
                duration = CASE
                    WHEN ? = 1 THEN (? - COALESCE(start_time, ?)) / 1000.0
                    ELSE duration
                END
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_i32())
        .bind(status_msg)
        .bind(now)
        .bind(to.is_terminal())
        .bind(now)
        .bind(now)
        .bind(id.as_i64())
        .bind(from.as_i32())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::LostRace {
                job_id: id,
                expected: from,
            });
        }
        debug!(job_id = %id, %from, %to, "Job transitioned");
        Ok(())
    }

    /// Persist the job's tasks and move it PENDING -> RUNNING, in one
    /// transaction. Returns task ids in payload order.
    pub async fn start_job(
        &self,
        id: JobId,
        scheduler_id: &str,
        payloads: &[Vec<u8>],
    ) -> Result<Vec<TaskId>> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = ?, start_time = ?, update_time = ?, num_tasks = ?, scheduler_id = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(JobStatus::Running.as_i32())
        .bind(now)
        .bind(now)
        .bind(payloads.len() as i64)
        .bind(scheduler_id)
        .bind(id.as_i64())
        .bind(JobStatus::Pending.as_i32())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::LostRace {
                job_id: id,
                expected: JobStatus::Pending,
            });
        }

        let mut task_ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let inserted = sqlx::query("INSERT INTO tasks (job_id, status, params) VALUES (?, ?, ?)")
                .bind(id.as_i64())
                .bind(TaskStatus::Pending.as_i32())
                .bind(payload.as_slice())
                .execute(&mut *tx)
                .await?;
            task_ids.push(TaskId::new(inserted.last_insert_rowid()));
        }

        tx.commit().await?;
        Ok(task_ids)
    }

    /// PENDING -> RUNNING for every task of the job once it was handed to a
    /// backend.
    pub async fn mark_tasks_running(&self, job_id: JobId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET status = ?, start_time = ? WHERE job_id = ? AND status = ?",
        )
        .bind(TaskStatus::Running.as_i32())
        .bind(now_millis())
        .bind(job_id.as_i64())
        .bind(TaskStatus::Pending.as_i32())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Write every task result, the archives they produced, the job counters
    /// and the job's final status in one transaction. Returns the status
    /// written.
    pub async fn finish_job(&self, id: JobId, outcome: JobOutcome<'_>) -> Result<JobStatus> {
        let derived = job_status_from_tasks(outcome.results.iter().map(|r| r.status))
            .ok_or_else(|| {
                DbError::invalid_state(format!("job {} has a non-terminal task result", id))
            })?;
        let status = match (outcome.status_override, outcome.from, derived) {
            (Some(forced), _, _) => forced,
            (None, JobStatus::Cancelling, JobStatus::Succeeded) => JobStatus::Cancelled,
            (None, _, derived) => derived,
        };
        if !outcome.from.can_transition_to(status) {
            return Err(DbError::IllegalTransition {
                job_id: id,
                from: outcome.from,
                to: status,
            });
        }

        let succeeded = outcome
            .results
            .iter()
            .filter(|r| r.status == TaskStatus::Succeeded)
            .count() as i64;
        let failed = outcome
            .results
            .iter()
            .filter(|r| r.status == TaskStatus::Failed)
            .count() as i64;
        let uncompressed: u64 = outcome.results.iter().map(|r| r.uncompressed_size).sum();
        let compressed: u64 = outcome.results.iter().map(|r| r.compressed_size).sum();

        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let open_tasks = open_task_list();
        for result in outcome.results {
            sqlx::query(&format!(
                "UPDATE tasks SET status = ?, duration = ?, uncompressed_size = ?, \
                 compressed_size = ?, error_message = ? \
                 WHERE id = ? AND job_id = ? AND status IN ({open_tasks})"
            ))
            .bind(result.status.as_i32())
            .bind(result.duration_secs)
            .bind(i64::try_from(result.uncompressed_size).unwrap_or(i64::MAX))
            .bind(i64::try_from(result.compressed_size).unwrap_or(i64::MAX))
            .bind(result.error_message.as_deref())
            .bind(result.task_id.as_i64())
            .bind(id.as_i64())
            .execute(&mut *tx)
            .await?;

            for archive in &result.archives {
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO archives
                        (id, dataset, begin_timestamp, end_timestamp, size, creation_time)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&archive.id)
                .bind(archive.dataset.as_deref().unwrap_or(""))
                .bind(archive.begin_timestamp)
                .bind(archive.end_timestamp)
                .bind(i64::try_from(archive.size).unwrap_or(i64::MAX))
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        let updated = sqlx::query(
            r#"
            UPDATE jobs SET
                status = ?,
                status_msg = COALESCE(?, status_msg),
                update_time = ?,
                duration = (? - COALESCE(start_time, ?)) / 1000.0,
                num_tasks_completed = ?,
                num_tasks_failed = ?,
                uncompressed_size = ?,
                compressed_size = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(status.as_i32())
        .bind(outcome.status_msg.as_deref())
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(succeeded)
        .bind(failed)
        .bind(i64::try_from(uncompressed).unwrap_or(i64::MAX))
        .bind(i64::try_from(compressed).unwrap_or(i64::MAX))
        .bind(id.as_i64())
        .bind(outcome.from.as_i32())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(DbError::LostRace {
                job_id: id,
                expected: outcome.from,
            });
        }

        tx.commit().await?;
        debug!(job_id = %id, %status, succeeded, failed, "Job finished");
        Ok(status)
    }

    /// Ask for a job to stop. PENDING and PENDING_REDUCER jobs are cancelled
    /// outright, together with their open tasks; RUNNING jobs move to
    /// CANCELLING and are finalised when their tasks return.
    pub async fn cancel_job(&self, id: JobId) -> Result<JobStatus> {
        let current = self
            .get_job_status(id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("job {}", id)))?;

        let next = match current {
            JobStatus::Pending | JobStatus::PendingReducer => JobStatus::Cancelled,
            JobStatus::Running => JobStatus::Cancelling,
            other => {
                return Err(DbError::IllegalTransition {
                    job_id: id,
                    from: other,
                    to: JobStatus::Cancelled,
                })
            }
        };

        let now = now_millis();
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = ?,
                status_msg = ?,
                update_time = ?,
                duration = CASE
                    WHEN ? = 1 THEN (? - COALESCE(start_time, ?)) / 1000.0
                    ELSE duration
                END
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(next.as_i32())
        .bind(logvault_protocol::defaults::CANCELLED_BY_USER_MESSAGE)
        .bind(now)
        .bind(next.is_terminal())
        .bind(now)
        .bind(now)
        .bind(id.as_i64())
        .bind(current.as_i32())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(DbError::LostRace {
                job_id: id,
                expected: current,
            });
        }

        if next.is_terminal() {
            sqlx::query(&format!(
                "UPDATE tasks SET status = ?, duration = 0 WHERE job_id = ? AND status IN ({})",
                open_task_list()
            ))
            .bind(TaskStatus::Cancelled.as_i32())
            .bind(id.as_i64())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(job_id = %id, from = %current, to = %next, "Job cancel requested");
        Ok(next)
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    pub async fn list_tasks(&self, job_id: JobId) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, status, start_time, duration, params,
                   uncompressed_size, compressed_size, error_message
            FROM tasks WHERE job_id = ? ORDER BY id
            "#,
        )
        .bind(job_id.as_i64())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_task).collect()
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    /// Delete a job and its tasks (tasks first) in one transaction.
    pub async fn delete_job(&self, id: JobId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM tasks WHERE job_id = ?")
            .bind(id.as_i64())
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.as_i64())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete terminal jobs of `kinds` last updated before `cutoff_ms`.
    pub async fn delete_expired_jobs(&self, cutoff_ms: i64, kinds: &[JobKind]) -> Result<Vec<JobId>> {
        if kinds.is_empty() {
            return Ok(Vec::new());
        }
        let terminal = int_list(
            JobStatus::ALL
                .iter()
                .filter(|s| s.is_terminal())
                .map(|s| s.as_i32()),
        );
        let kinds = int_list(kinds.iter().map(|k| k.as_i32()));

        let mut tx = self.pool.begin().await?;
        let ids: Vec<i64> = sqlx::query_scalar(&format!(
            "SELECT id FROM jobs WHERE update_time < ? AND status IN ({terminal}) AND kind IN ({kinds})"
        ))
        .bind(cutoff_ms)
        .fetch_all(&mut *tx)
        .await?;

        for id in &ids {
            sqlx::query("DELETE FROM tasks WHERE job_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM jobs WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(ids.into_iter().map(JobId::new).collect())
    }
}

fn row_to_job(row: &SqliteRow) -> Result<JobRecord> {
    Ok(JobRecord {
        id: JobId::new(row.try_get("id")?),
        kind: JobKind::from_i32(row.try_get("kind")?)?,
        status: JobStatus::from_i32(row.try_get("status")?)?,
        status_msg: row.try_get("status_msg")?,
        creation_time: row.try_get("creation_time")?,
        start_time: row.try_get("start_time")?,
        update_time: row.try_get("update_time")?,
        duration: row.try_get("duration")?,
        config: row.try_get("config")?,
        num_tasks: row.try_get("num_tasks")?,
        num_tasks_completed: row.try_get("num_tasks_completed")?,
        num_tasks_failed: row.try_get("num_tasks_failed")?,
        uncompressed_size: row.try_get("uncompressed_size")?,
        compressed_size: row.try_get("compressed_size")?,
        scheduler_id: row.try_get("scheduler_id")?,
    })
}

fn row_to_task(row: &SqliteRow) -> Result<TaskRecord> {
    Ok(TaskRecord {
        id: TaskId::new(row.try_get("id")?),
        job_id: JobId::new(row.try_get("job_id")?),
        status: TaskStatus::from_i32(row.try_get("status")?)?,
        start_time: row.try_get("start_time")?,
        duration: row.try_get("duration")?,
        params: row.try_get("params")?,
        uncompressed_size: row.try_get("uncompressed_size")?,
        compressed_size: row.try_get("compressed_size")?,
        error_message: row.try_get("error_message")?,
    })
}

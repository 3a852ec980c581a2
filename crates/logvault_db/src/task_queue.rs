//! Durable work queue backing the queue task backend.
//!
//! Entries are grouped by job id. Workers claim the highest-priority oldest
//! queued entry atomically and write the encoded result back.

use crate::error::{DbError, Result};
use crate::types::{ClaimedEntry, GroupEntry, QueueEntryState};
use crate::{now_millis, JobStore};
use logvault_protocol::{JobId, TaskId};
use sqlx::Row;
use tracing::debug;

impl JobStore {
    /// Queue one group of tasks. `entries` order is the submission order
    /// [`JobStore::group_entries`] reports back.
    pub async fn enqueue_tasks(
        &self,
        group_id: JobId,
        entries: &[(TaskId, Vec<u8>)],
        priority: i32,
    ) -> Result<()> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;
        for (seq, (task_id, params)) in entries.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO task_queue (group_id, task_id, seq, priority, state, params, enqueued_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(group_id.as_i64())
            .bind(task_id.as_i64())
            .bind(seq as i64)
            .bind(priority)
            .bind(QueueEntryState::Queued.as_i32())
            .bind(params.as_slice())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(group_id = %group_id, count = entries.len(), "Enqueued tasks");
        Ok(())
    }

    /// Claim the next queued entry for `worker_id`.
    pub async fn claim_next_task(&self, worker_id: &str) -> Result<Option<ClaimedEntry>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT id, group_id, task_id, params FROM task_queue
            WHERE state = ?
            ORDER BY priority DESC, id ASC
            LIMIT 1
            "#,
        )
        .bind(QueueEntryState::Queued.as_i32())
        .fetch_optional(&mut *tx)
        .await?;

        let row = match row {
            Some(row) => row,
            None => {
                tx.rollback().await?;
                return Ok(None);
            }
        };
        let entry = ClaimedEntry {
            entry_id: row.try_get("id")?,
            group_id: JobId::new(row.try_get("group_id")?),
            task_id: TaskId::new(row.try_get("task_id")?),
            params: row.try_get("params")?,
        };

        let claimed = sqlx::query(
            "UPDATE task_queue SET state = ?, worker_id = ?, claimed_at = ? WHERE id = ? AND state = ?",
        )
        .bind(QueueEntryState::Claimed.as_i32())
        .bind(worker_id)
        .bind(now_millis())
        .bind(entry.entry_id)
        .bind(QueueEntryState::Queued.as_i32())
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        tx.commit().await?;
        Ok(Some(entry))
    }

    /// Store the encoded result of a claimed entry.
    pub async fn complete_task(&self, entry_id: i64, result: &[u8]) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE task_queue SET state = ?, result = ?, finished_at = ? WHERE id = ? AND state = ?",
        )
        .bind(QueueEntryState::Done.as_i32())
        .bind(result)
        .bind(now_millis())
        .bind(entry_id)
        .bind(QueueEntryState::Claimed.as_i32())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(DbError::invalid_state(format!(
                "queue entry {} is not claimed",
                entry_id
            )));
        }
        Ok(())
    }

    /// Every entry of a group in submission order.
    pub async fn group_entries(&self, group_id: JobId) -> Result<Vec<GroupEntry>> {
        let rows = sqlx::query(
            "SELECT task_id, state, result FROM task_queue WHERE group_id = ? ORDER BY seq",
        )
        .bind(group_id.as_i64())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let raw: i32 = row.try_get("state")?;
                let state = QueueEntryState::from_i32(raw).ok_or_else(|| {
                    DbError::invalid_state(format!("unknown queue entry state {}", raw))
                })?;
                Ok(GroupEntry {
                    task_id: TaskId::new(row.try_get("task_id")?),
                    state,
                    result: row.try_get("result")?,
                })
            })
            .collect()
    }

    /// Revoke entries of a group that no worker has claimed yet.
    pub async fn revoke_group(&self, group_id: JobId) -> Result<u64> {
        let result = sqlx::query("UPDATE task_queue SET state = ? WHERE group_id = ? AND state = ?")
            .bind(QueueEntryState::Revoked.as_i32())
            .bind(group_id.as_i64())
            .bind(QueueEntryState::Queued.as_i32())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Drop a group once its results were collected.
    pub async fn purge_group(&self, group_id: JobId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM task_queue WHERE group_id = ?")
            .bind(group_id.as_i64())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_order_priority_then_fifo() {
        let store = JobStore::open_in_memory().await.unwrap();
        store
            .enqueue_tasks(JobId::new(1), &[(TaskId::new(10), b"low".to_vec())], 0)
            .await
            .unwrap();
        store
            .enqueue_tasks(
                JobId::new(2),
                &[
                    (TaskId::new(20), b"high-a".to_vec()),
                    (TaskId::new(21), b"high-b".to_vec()),
                ],
                5,
            )
            .await
            .unwrap();

        let first = store.claim_next_task("w1").await.unwrap().unwrap();
        let second = store.claim_next_task("w2").await.unwrap().unwrap();
        let third = store.claim_next_task("w1").await.unwrap().unwrap();
        assert_eq!(first.task_id, TaskId::new(20));
        assert_eq!(second.task_id, TaskId::new(21));
        assert_eq!(third.task_id, TaskId::new(10));
        assert!(store.claim_next_task("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_group_entries_track_results_in_submission_order() {
        let store = JobStore::open_in_memory().await.unwrap();
        let group = JobId::new(7);
        store
            .enqueue_tasks(
                group,
                &[
                    (TaskId::new(1), b"a".to_vec()),
                    (TaskId::new(2), b"b".to_vec()),
                ],
                0,
            )
            .await
            .unwrap();

        let a = store.claim_next_task("w").await.unwrap().unwrap();
        let b = store.claim_next_task("w").await.unwrap().unwrap();
        store.complete_task(b.entry_id, b"rb").await.unwrap();

        let entries = store.group_entries(group).await.unwrap();
        assert_eq!(entries[0].state, QueueEntryState::Claimed);
        assert_eq!(entries[1].state, QueueEntryState::Done);
        assert_eq!(entries[1].result.as_deref(), Some(&b"rb"[..]));

        store.complete_task(a.entry_id, b"ra").await.unwrap();
        assert!(store.complete_task(a.entry_id, b"again").await.is_err());

        assert_eq!(store.purge_group(group).await.unwrap(), 2);
        assert!(store.group_entries(group).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_revoke_only_unclaimed() {
        let store = JobStore::open_in_memory().await.unwrap();
        let group = JobId::new(3);
        store
            .enqueue_tasks(
                group,
                &[
                    (TaskId::new(1), b"a".to_vec()),
                    (TaskId::new(2), b"b".to_vec()),
                ],
                0,
            )
            .await
            .unwrap();
        store.claim_next_task("w").await.unwrap().unwrap();

        assert_eq!(store.revoke_group(group).await.unwrap(), 1);
        let states: Vec<_> = store
            .group_entries(group)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.state)
            .collect();
        assert_eq!(states, vec![QueueEntryState::Claimed, QueueEntryState::Revoked]);
        assert!(store.claim_next_task("w").await.unwrap().is_none());
    }
}

//! Durable queue backend.
//!
//! Tasks are MessagePack-encoded into the JobStore's `task_queue` table under
//! one group per job. `logvault-worker` processes claim and complete the
//! entries; the handle decodes the group's results once all are in.

use async_trait::async_trait;
use logvault_db::{JobStore, QueueEntryState};
use logvault_protocol::{codec, JobId, TaskParams, TaskResult};
use std::time::Duration;
use tracing::{debug, info};

use super::{BackendError, ResultHandle, Result, TaskBackend};

pub struct QueueBackend {
    store: JobStore,
    priority: i32,
}

impl QueueBackend {
    pub fn new(store: JobStore, priority: i32) -> Self {
        Self { store, priority }
    }
}

#[async_trait]
impl TaskBackend for QueueBackend {
    fn name(&self) -> &'static str {
        "queue"
    }

    async fn submit(&self, job_id: JobId, tasks: Vec<TaskParams>) -> Result<Box<dyn ResultHandle>> {
        let entries = tasks
            .iter()
            .map(|task| Ok((task.task_id, codec::encode(task)?)))
            .collect::<Result<Vec<_>>>()?;
        self.store
            .enqueue_tasks(job_id, &entries, self.priority)
            .await?;
        debug!(job_id = %job_id, tasks = entries.len(), "Tasks queued");

        Ok(Box::new(QueueResultHandle {
            store: self.store.clone(),
            group_id: job_id,
            expected: entries.len(),
        }))
    }

    async fn cancel(&self, job_id: JobId) -> Result<()> {
        let revoked = self.store.revoke_group(job_id).await?;
        info!(job_id = %job_id, revoked, "Revoked queued tasks");
        Ok(())
    }
}

struct QueueResultHandle {
    store: JobStore,
    group_id: JobId,
    expected: usize,
}

impl QueueResultHandle {
    async fn try_collect(&self) -> Result<Option<Vec<TaskResult>>> {
        let entries = self.store.group_entries(self.group_id).await?;
        if entries.len() != self.expected {
            return Err(BackendError::Incomplete {
                job_id: self.group_id,
                expected: self.expected,
                found: entries.len(),
            });
        }

        let finished = entries.iter().all(|entry| {
            matches!(
                entry.state,
                QueueEntryState::Done | QueueEntryState::Revoked
            )
        });
        if !finished {
            return Ok(None);
        }

        let mut results = Vec::with_capacity(entries.len());
        for entry in &entries {
            let result = match (&entry.state, &entry.result) {
                (QueueEntryState::Done, Some(bytes)) => codec::decode::<TaskResult>(bytes)?,
                _ => TaskResult::cancelled(entry.task_id),
            };
            results.push(result);
        }
        self.store.purge_group(self.group_id).await?;
        Ok(Some(results))
    }
}

#[async_trait]
impl ResultHandle for QueueResultHandle {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Vec<TaskResult>>> {
        if let Some(results) = self.try_collect().await? {
            return Ok(Some(results));
        }
        if timeout.is_zero() {
            return Ok(None);
        }
        tokio::time::sleep(timeout).await;
        self.try_collect().await
    }
}

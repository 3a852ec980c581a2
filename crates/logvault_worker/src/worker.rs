//! Queue worker.
//!
//! Claims entries from the JobStore's task queue, runs them through a
//! [`TaskExecutor`] and stores the encoded [`TaskResult`] back on the entry,
//! where the scheduler's queue backend polls for it.
//!
//! - Bounded concurrency (`worker.concurrency`)
//! - Graceful shutdown via shutdown channel: running tasks finish and are
//!   reported before the loop exits

use logvault_db::{ClaimedEntry, JobStore};
use logvault_protocol::config::WorkerConfig;
use logvault_protocol::{codec, TaskParams, TaskResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::executor::TaskExecutor;

/// Result from a finished entry, waiting to be stored.
struct EntryResult {
    entry_id: i64,
    result: TaskResult,
}

pub struct QueueWorker {
    store: JobStore,
    executor: Arc<dyn TaskExecutor>,
    worker_id: String,
    poll_interval: Duration,
    concurrency: usize,
    result_tx: mpsc::Sender<EntryResult>,
    result_rx: mpsc::Receiver<EntryResult>,
    shutdown_rx: mpsc::Receiver<()>,
    active: HashMap<i64, (JoinHandle<()>, CancellationToken)>,
}

impl QueueWorker {
    /// Returns the worker and its shutdown sender; call [`run`](Self::run)
    /// on the worker.
    pub fn new(
        store: JobStore,
        executor: Arc<dyn TaskExecutor>,
        worker_id: impl Into<String>,
        config: &WorkerConfig,
    ) -> (Self, mpsc::Sender<()>) {
        let concurrency = config.concurrency.max(1);
        let (result_tx, result_rx) = mpsc::channel(concurrency * 2);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        (
            Self {
                store,
                executor,
                worker_id: worker_id.into(),
                poll_interval: Duration::from_millis(config.poll_interval_ms),
                concurrency,
                result_tx,
                result_rx,
                shutdown_rx,
                active: HashMap::new(),
            },
            shutdown_tx,
        )
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim and run a single entry inline. Returns `false` when the queue
    /// was empty.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(entry) = self.store.claim_next_task(&self.worker_id).await? else {
            return Ok(false);
        };
        let entry_id = entry.entry_id;
        let result = execute_entry(self.executor.as_ref(), entry, CancellationToken::new()).await;
        self.store_result(entry_id, &result).await?;
        Ok(true)
    }

    /// Main loop; consumes the worker.
    pub async fn run(mut self) -> Result<()> {
        info!(worker_id = %self.worker_id, concurrency = self.concurrency, "Worker started");
        let mut poll = tokio::time::interval(self.poll_interval);

        loop {
            self.reap_finished();

            tokio::select! {
                biased;

                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, waiting for {} active tasks...", self.active.len());
                    self.wait_for_active().await;
                    break;
                }

                Some(done) = self.result_rx.recv() => {
                    if let Err(e) = self.store_result(done.entry_id, &done.result).await {
                        error!(entry_id = done.entry_id, error = %e, "Failed to store task result");
                    }
                }

                _ = poll.tick() => {
                    self.claim_available().await;
                }
            }
        }

        info!(worker_id = %self.worker_id, "Worker stopped");
        Ok(())
    }

    async fn claim_available(&mut self) {
        while self.active.len() < self.concurrency {
            let entry = match self.store.claim_next_task(&self.worker_id).await {
                Ok(Some(entry)) => entry,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "Failed to claim task");
                    return;
                }
            };
            debug!(entry_id = entry.entry_id, task_id = %entry.task_id, "Claimed task");

            let entry_id = entry.entry_id;
            let cancel = CancellationToken::new();
            let executor = Arc::clone(&self.executor);
            let result_tx = self.result_tx.clone();
            let token = cancel.clone();
            let handle = tokio::spawn(async move {
                let result = execute_entry(executor.as_ref(), entry, token).await;
                if result_tx.send(EntryResult { entry_id, result }).await.is_err() {
                    warn!(entry_id, "Result channel closed before task finished");
                }
            });
            self.active.insert(entry_id, (handle, cancel));
        }
    }

    fn reap_finished(&mut self) {
        self.active.retain(|entry_id, (handle, _)| {
            if handle.is_finished() {
                debug!("Reaped finished entry {}", entry_id);
                false
            } else {
                true
            }
        });
    }

    async fn wait_for_active(&mut self) {
        for (entry_id, (handle, _)) in self.active.drain() {
            if let Err(e) = handle.await {
                warn!("Entry {} task panicked during shutdown: {:?}", entry_id, e);
            }
        }

        let mut stored = 0;
        while let Ok(done) = self.result_rx.try_recv() {
            if let Err(e) = self.store_result(done.entry_id, &done.result).await {
                error!(entry_id = done.entry_id, error = %e, "Failed to store task result during shutdown");
            }
            stored += 1;
        }
        info!("Graceful shutdown complete: stored {} results", stored);
    }

    async fn store_result(&self, entry_id: i64, result: &TaskResult) -> Result<()> {
        let bytes = codec::encode(result)?;
        self.store.complete_task(entry_id, &bytes).await?;
        info!(
            entry_id,
            task_id = %result.task_id,
            status = %result.status,
            "Task finished"
        );
        Ok(())
    }
}

async fn execute_entry(
    executor: &dyn TaskExecutor,
    entry: ClaimedEntry,
    cancel: CancellationToken,
) -> TaskResult {
    match codec::decode::<TaskParams>(&entry.params) {
        Ok(params) => executor.execute(params, cancel).await,
        Err(e) => {
            warn!(entry_id = entry.entry_id, error = %e, "Undecodable task parameters");
            TaskResult::failed(entry.task_id, 0.0, format!("undecodable task parameters: {}", e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use logvault_db::QueueEntryState;
    use logvault_protocol::{ExtractIrJobConfig, JobId, TaskId, TaskPayload, TaskStatus};

    struct Echo;

    #[async_trait]
    impl TaskExecutor for Echo {
        async fn execute(&self, params: TaskParams, _cancel: CancellationToken) -> TaskResult {
            TaskResult::succeeded(params.task_id, 0.5).with_sizes(10, 2)
        }
    }

    fn params(task: i64) -> Vec<u8> {
        codec::encode(&TaskParams {
            job_id: JobId::new(1),
            task_id: TaskId::new(task),
            payload: TaskPayload::ExtractIr(ExtractIrJobConfig {
                archive_id: "a1".to_string(),
                orig_file_id: "f1".to_string(),
                msg_ix: 0,
                target_uncompressed_size: None,
            }),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_run_once_stores_result() {
        let store = JobStore::open_in_memory().await.unwrap();
        store
            .enqueue_tasks(JobId::new(1), &[(TaskId::new(7), params(7))], 0)
            .await
            .unwrap();

        let (worker, _shutdown) =
            QueueWorker::new(store.clone(), Arc::new(Echo), "w-1", &WorkerConfig::default());
        assert!(worker.run_once().await.unwrap());
        assert!(!worker.run_once().await.unwrap());

        let entries = store.group_entries(JobId::new(1)).await.unwrap();
        assert_eq!(entries[0].state, QueueEntryState::Done);
        let result: TaskResult = codec::decode(entries[0].result.as_ref().unwrap()).unwrap();
        assert_eq!(result.task_id, TaskId::new(7));
        assert_eq!(result.status, TaskStatus::Succeeded);
        assert_eq!(result.uncompressed_size, 10);
    }

    #[tokio::test]
    async fn test_garbage_params_fail_the_task() {
        let store = JobStore::open_in_memory().await.unwrap();
        store
            .enqueue_tasks(JobId::new(1), &[(TaskId::new(3), vec![0xc1])], 0)
            .await
            .unwrap();

        let (worker, _shutdown) =
            QueueWorker::new(store.clone(), Arc::new(Echo), "w-1", &WorkerConfig::default());
        assert!(worker.run_once().await.unwrap());

        let entries = store.group_entries(JobId::new(1)).await.unwrap();
        let result: TaskResult = codec::decode(entries[0].result.as_ref().unwrap()).unwrap();
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.error_message.unwrap().contains("undecodable"));
    }
}

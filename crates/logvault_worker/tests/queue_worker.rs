//! Queue worker loop against a real JobStore.

use async_trait::async_trait;
use logvault_db::{JobStore, QueueEntryState};
use logvault_protocol::config::WorkerConfig;
use logvault_protocol::{
    codec, ExtractJsonJobConfig, JobId, TaskId, TaskParams, TaskPayload, TaskResult, TaskStatus,
};
use logvault_worker::{CancellationToken, QueueWorker, TaskExecutor};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Counting {
    calls: AtomicUsize,
}

#[async_trait]
impl TaskExecutor for Counting {
    async fn execute(&self, params: TaskParams, _cancel: CancellationToken) -> TaskResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        if params.task_id == TaskId::new(2) {
            TaskResult::failed(params.task_id, 0.01, "exit 1")
        } else {
            TaskResult::succeeded(params.task_id, 0.01)
        }
    }
}

fn encoded(group: JobId, task: i64) -> (TaskId, Vec<u8>) {
    let params = TaskParams {
        job_id: group,
        task_id: TaskId::new(task),
        payload: TaskPayload::ExtractJson(ExtractJsonJobConfig {
            archive_id: format!("archive-{}", task),
            dataset: None,
            target_chunk_size: None,
        }),
    };
    (TaskId::new(task), codec::encode(&params).unwrap())
}

#[tokio::test]
async fn test_worker_drains_queue_and_shuts_down() {
    let tmp = tempfile::TempDir::new().unwrap();
    let url = format!("sqlite:{}", tmp.path().join("jobs.sqlite").display());
    let store = JobStore::open(&url, 4).await.unwrap();

    let group = JobId::new(11);
    let entries: Vec<_> = (1..=3).map(|task| encoded(group, task)).collect();
    store.enqueue_tasks(group, &entries, 0).await.unwrap();

    let executor = Arc::new(Counting {
        calls: AtomicUsize::new(0),
    });
    let config = WorkerConfig {
        poll_interval_ms: 10,
        concurrency: 2,
        ..WorkerConfig::default()
    };
    let (worker, shutdown) = QueueWorker::new(store.clone(), executor.clone(), "w-it", &config);
    let handle = tokio::spawn(worker.run());

    let done = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let entries = store.group_entries(group).await.unwrap();
            if entries.iter().all(|e| e.state == QueueEntryState::Done) {
                return entries;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("queue was not drained");

    shutdown.send(()).await.unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    let statuses: Vec<TaskStatus> = done
        .iter()
        .map(|e| codec::decode::<TaskResult>(e.result.as_ref().unwrap()).unwrap().status)
        .collect();
    assert_eq!(
        statuses,
        vec![TaskStatus::Succeeded, TaskStatus::Failed, TaskStatus::Succeeded]
    );
}

//! Scheduler end-to-end: JobStore, backends, workers and reducers together.

use async_trait::async_trait;
use logvault_db::{ArchiveRecord, JobRecord, JobStore};
use logvault_protocol::config::{SchedulerConfig, WorkerConfig};
use logvault_protocol::wire::{
    AggregationConfigBody, DoneBody, Header, Message, OpCode, RegisterBody, HEADER_SIZE,
};
use logvault_protocol::{
    AggregationConfig, ArchiveStats, CompressionJobConfig, ExtractJsonJobConfig, InputPath,
    JobConfig, JobId, JobStatus, ReducerAddress, SearchJobConfig, TaskParams, TaskPayload,
    TaskResult, TaskStatus,
};
use logvault_scheduler::{
    bridge, cancel_job, reducer, submit_job, LocalWorkflowDriver, QueueBackend, Scheduler,
    TaskBackend, WorkflowBackend,
};
use logvault_worker::{CancellationToken, QueueWorker, TaskExecutor};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

// ============================================================================
// Helpers
// ============================================================================

fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        id: "sched-it".to_string(),
        jobs_poll_delay_ms: 10,
        result_poll_timeout_ms: 5,
        target_task_size: 100,
        ..SchedulerConfig::default()
    }
}

fn workflow(executor: Arc<dyn TaskExecutor>) -> Arc<dyn TaskBackend> {
    let driver = LocalWorkflowDriver::new(executor, 4);
    Arc::new(WorkflowBackend::new(Arc::new(driver)))
}

async fn drive_to_completion(scheduler: &mut Scheduler, store: &JobStore, id: JobId) -> JobRecord {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            scheduler.run_iteration().await;
            let record = store.get_job(id).await.unwrap().unwrap();
            if record.status.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not finish")
}

fn compression_job(paths: &[&str]) -> JobConfig {
    JobConfig::Compression(CompressionJobConfig {
        dataset: None,
        paths: paths
            .iter()
            .map(|p| InputPath {
                path: p.to_string(),
                size: 100,
            })
            .collect(),
        timestamp_key: None,
        target_archive_size: 1 << 20,
    })
}

/// Compresses every batch except ones containing `/logs/1.log`.
struct FakeCompressor;

#[async_trait]
impl TaskExecutor for FakeCompressor {
    async fn execute(&self, params: TaskParams, _cancel: CancellationToken) -> TaskResult {
        let TaskPayload::Compression { paths, .. } = &params.payload else {
            return TaskResult::failed(params.task_id, 0.0, "not a compression task");
        };
        if paths.iter().any(|p| p.path == "/logs/1.log") {
            return TaskResult::failed(params.task_id, 0.01, "clp-s exited with status 1");
        }
        let size: u64 = paths.iter().map(|p| p.size).sum();
        let mut result = TaskResult::succeeded(params.task_id, 0.01).with_sizes(size, size / 10);
        result.archives.push(ArchiveStats {
            id: format!("archive-{}", params.task_id),
            dataset: None,
            begin_timestamp: 0,
            end_timestamp: 1_000,
            uncompressed_size: size,
            size: size / 10,
        });
        result
    }
}

// ============================================================================
// Compression
// ============================================================================

#[tokio::test]
async fn test_partial_failure_through_queue_backend() {
    let tmp = tempfile::TempDir::new().unwrap();
    let url = format!("sqlite:{}", tmp.path().join("jobs.sqlite").display());
    let store = JobStore::open(&url, 4).await.unwrap();

    let worker_config = WorkerConfig {
        poll_interval_ms: 10,
        concurrency: 2,
        ..WorkerConfig::default()
    };
    let (worker, worker_shutdown) =
        QueueWorker::new(store.clone(), Arc::new(FakeCompressor), "w-it", &worker_config);
    let worker_task = tokio::spawn(worker.run());

    let backend = Arc::new(QueueBackend::new(store.clone(), 0));
    let mut scheduler = Scheduler::new(store.clone(), backend, scheduler_config());

    let id = submit_job(
        &store,
        &compression_job(&["/logs/0.log", "/logs/1.log", "/logs/2.log"]),
    )
    .await
    .unwrap();
    let record = drive_to_completion(&mut scheduler, &store, id).await;

    worker_shutdown.send(()).await.unwrap();
    worker_task.await.unwrap().unwrap();

    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.num_tasks, 3);
    assert_eq!(record.num_tasks_completed, 2);
    assert_eq!(record.num_tasks_failed, 1);
    assert_eq!(record.uncompressed_size, 200);
    assert_eq!(record.scheduler_id.as_deref(), Some("sched-it"));

    let statuses: Vec<TaskStatus> = store
        .list_tasks(id)
        .await
        .unwrap()
        .iter()
        .map(|t| t.status)
        .collect();
    assert_eq!(
        statuses,
        vec![TaskStatus::Succeeded, TaskStatus::Failed, TaskStatus::Succeeded]
    );

    let archives = store.list_archives_overlapping(None, None, None).await.unwrap();
    assert_eq!(archives.len(), 2);
    assert!(store.group_entries(id).await.unwrap().is_empty());
    assert_eq!(scheduler.active_jobs(), 0);
}

#[tokio::test]
async fn test_successful_job_through_workflow_backend() {
    let store = JobStore::open_in_memory().await.unwrap();
    let mut scheduler = Scheduler::new(
        store.clone(),
        workflow(Arc::new(FakeCompressor)),
        scheduler_config(),
    );

    let id = submit_job(&store, &compression_job(&["/logs/a.log", "/logs/b.log"]))
        .await
        .unwrap();
    let record = drive_to_completion(&mut scheduler, &store, id).await;

    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(record.num_tasks_completed, 2);
    assert_eq!(record.num_tasks_failed, 0);
    assert_eq!(record.compressed_size, 20);
}

#[tokio::test]
async fn test_job_without_input_is_rejected() {
    let store = JobStore::open_in_memory().await.unwrap();
    let mut scheduler = Scheduler::new(
        store.clone(),
        workflow(Arc::new(FakeCompressor)),
        scheduler_config(),
    );

    let id = submit_job(&store, &compression_job(&[])).await.unwrap();
    let record = drive_to_completion(&mut scheduler, &store, id).await;

    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.status_msg.contains("No input paths"));
    assert!(store.list_tasks(id).await.unwrap().is_empty());
}

// ============================================================================
// Cancellation and recovery
// ============================================================================

/// Blocks every task until it is cancelled.
struct Stuck;

#[async_trait]
impl TaskExecutor for Stuck {
    async fn execute(&self, params: TaskParams, cancel: CancellationToken) -> TaskResult {
        cancel.cancelled().await;
        TaskResult::cancelled(params.task_id)
    }
}

fn extract_job() -> JobConfig {
    JobConfig::ExtractJson(ExtractJsonJobConfig {
        archive_id: "archive-7".to_string(),
        dataset: None,
        target_chunk_size: None,
    })
}

#[tokio::test]
async fn test_cancel_running_job() {
    let store = JobStore::open_in_memory().await.unwrap();
    let mut scheduler = Scheduler::new(store.clone(), workflow(Arc::new(Stuck)), scheduler_config());

    let id = submit_job(&store, &extract_job()).await.unwrap();
    scheduler.run_iteration().await;
    assert_eq!(
        store.get_job_status(id).await.unwrap(),
        Some(JobStatus::Running)
    );

    assert_eq!(
        cancel_job(&store, id).await.unwrap(),
        JobStatus::Cancelling
    );
    let record = drive_to_completion(&mut scheduler, &store, id).await;

    assert_eq!(record.status, JobStatus::Cancelled);
    let tasks = store.list_tasks(id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_before_start() {
    let store = JobStore::open_in_memory().await.unwrap();
    let mut scheduler = Scheduler::new(store.clone(), workflow(Arc::new(Stuck)), scheduler_config());

    let id = submit_job(&store, &extract_job()).await.unwrap();
    assert_eq!(cancel_job(&store, id).await.unwrap(), JobStatus::Cancelled);

    scheduler.run_iteration().await;
    assert_eq!(scheduler.active_jobs(), 0);
    assert_eq!(
        store.get_job_status(id).await.unwrap(),
        Some(JobStatus::Cancelled)
    );
}

#[tokio::test]
async fn test_restart_kills_jobs_of_previous_run() {
    let store = JobStore::open_in_memory().await.unwrap();
    let mut first = Scheduler::new(store.clone(), workflow(Arc::new(Stuck)), scheduler_config());
    let id = submit_job(&store, &extract_job()).await.unwrap();
    first.run_iteration().await;
    assert_eq!(first.active_jobs(), 1);

    let second = Scheduler::new(store.clone(), workflow(Arc::new(Stuck)), scheduler_config());
    assert_eq!(second.recover().await.unwrap(), vec![id]);
    assert!(second.recover().await.unwrap().is_empty());

    assert_eq!(
        store.get_job_status(id).await.unwrap(),
        Some(JobStatus::Killed)
    );
    let tasks = store.list_tasks(id).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Killed);
}

#[tokio::test]
async fn test_run_exits_on_shutdown() {
    let store = JobStore::open_in_memory().await.unwrap();
    let scheduler = Scheduler::new(store, workflow(Arc::new(Stuck)), scheduler_config());
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(scheduler.run(rx));
    tokio::time::sleep(Duration::from_millis(30)).await;
    tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

// ============================================================================
// Aggregation through a reducer
// ============================================================================

/// Records the reducer each search task was pointed at.
#[derive(Default)]
struct RecordingSearcher {
    reducers: Mutex<Vec<Option<ReducerAddress>>>,
}

#[async_trait]
impl TaskExecutor for RecordingSearcher {
    async fn execute(&self, params: TaskParams, _cancel: CancellationToken) -> TaskResult {
        if let TaskPayload::Search { reducer, .. } = &params.payload {
            self.reducers.lock().unwrap().push(reducer.clone());
        }
        TaskResult::succeeded(params.task_id, 0.01)
    }
}

async fn read_message(stream: &mut TcpStream) -> Message {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).await.unwrap();
    let header = Header::unpack(&header).unwrap();
    let mut payload = vec![0u8; header.payload_len as usize];
    stream.read_exact(&mut payload).await.unwrap();
    Message::from_parts(header, payload).unwrap()
}

async fn write_message(stream: &mut TcpStream, message: &Message) {
    stream.write_all(&message.to_bytes().unwrap()).await.unwrap();
}

fn aggregation_search() -> JobConfig {
    JobConfig::Search(SearchJobConfig {
        dataset: None,
        query_string: "level: ERROR".to_string(),
        begin_timestamp: None,
        end_timestamp: None,
        ignore_case: false,
        max_num_results: 0,
        aggregation: Some(AggregationConfig {
            do_count_aggregation: true,
            count_by_time_bucket_size: None,
        }),
    })
}

async fn insert_archive(store: &JobStore, id: &str) {
    store
        .insert_archive(&ArchiveRecord {
            id: id.to_string(),
            dataset: String::new(),
            begin_timestamp: 0,
            end_timestamp: 1_000,
            size: 10,
            creation_time: 0,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_aggregation_job_runs_through_reducer() {
    let store = JobStore::open_in_memory().await.unwrap();
    insert_archive(&store, "a1").await;
    insert_archive(&store, "a2").await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (offers, acquisition) = bridge();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(reducer::run_listener(listener, offers, shutdown_rx));

    let reducer_address = ReducerAddress {
        host: "10.0.0.7".to_string(),
        port: 7100,
    };
    let advertised = reducer_address.clone();
    let fake_reducer = tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let register =
            Message::encode(OpCode::Register, JobId::new(0), &RegisterBody { address: advertised })
                .unwrap();
        write_message(&mut stream, &register).await;
        assert_eq!(read_message(&mut stream).await.opcode(), OpCode::Ack);

        let config = read_message(&mut stream).await;
        assert_eq!(config.opcode(), OpCode::AggregationConfig);
        let body: AggregationConfigBody = config.decode_body().unwrap();

        let verdict = read_message(&mut stream).await;
        assert_eq!(verdict.opcode(), OpCode::JobSucceeded);
        let done = Message::encode(
            OpCode::Done,
            verdict.job_id(),
            &DoneBody {
                succeeded: true,
                error_message: None,
            },
        )
        .unwrap();
        write_message(&mut stream, &done).await;
        (config.job_id(), body)
    });

    let searcher = Arc::new(RecordingSearcher::default());
    let mut scheduler = Scheduler::new(store.clone(), workflow(searcher.clone()), scheduler_config())
        .with_reducer(acquisition);

    let id = submit_job(&store, &aggregation_search()).await.unwrap();
    let record = drive_to_completion(&mut scheduler, &store, id).await;
    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(record.num_tasks_completed, 2);

    let (config_job, body) = fake_reducer.await.unwrap();
    assert_eq!(config_job, id);
    assert!(body.aggregation.do_count_aggregation);
    assert_eq!(
        *searcher.reducers.lock().unwrap(),
        vec![Some(reducer_address.clone()), Some(reducer_address)]
    );
    shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn test_aggregation_without_reducer_is_rejected() {
    let store = JobStore::open_in_memory().await.unwrap();
    insert_archive(&store, "a1").await;
    let mut scheduler = Scheduler::new(
        store.clone(),
        workflow(Arc::new(RecordingSearcher::default())),
        scheduler_config(),
    );

    let id = submit_job(&store, &aggregation_search()).await.unwrap();
    let record = drive_to_completion(&mut scheduler, &store, id).await;

    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.status_msg.contains("no reducer"));
}

#[tokio::test]
async fn test_search_outside_every_archive_succeeds_empty() {
    let store = JobStore::open_in_memory().await.unwrap();
    insert_archive(&store, "a1").await;
    let searcher = Arc::new(RecordingSearcher::default());
    let mut scheduler = Scheduler::new(store.clone(), workflow(searcher.clone()), scheduler_config());

    let query = JobConfig::Search(SearchJobConfig {
        dataset: None,
        query_string: "level: ERROR".to_string(),
        begin_timestamp: Some(5_000),
        end_timestamp: Some(6_000),
        ignore_case: false,
        max_num_results: 0,
        aggregation: None,
    });
    let id = submit_job(&store, &query).await.unwrap();
    let record = drive_to_completion(&mut scheduler, &store, id).await;

    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(record.num_tasks, 0);
    assert_eq!(record.num_tasks_failed, 0);
    assert!(store.list_tasks(id).await.unwrap().is_empty());
    assert!(searcher.reducers.lock().unwrap().is_empty());
}

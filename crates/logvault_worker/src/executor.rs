//! Task execution.
//!
//! [`TaskExecutor`] is the narrow seam between the control plane and the
//! compression/search binaries. [`SubprocessExecutor`] runs them as child
//! processes and reads their line-oriented JSON output.

use async_trait::async_trait;
use logvault_db::{DocumentId, ResultDocument, ResultStore, StreamRecord};
use logvault_protocol::config::WorkerConfig;
use logvault_protocol::{
    ArchiveStats, JobId, JobKind, LogvaultConfig, StorageConfig, TaskParams, TaskPayload,
    TaskResult,
};
use serde::Deserialize;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::error::{Result, WorkerError};

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run one task to completion. Failures are reported in the returned
    /// result, never as a panic or error.
    async fn execute(&self, params: TaskParams, cancel: CancellationToken) -> TaskResult;
}

/// A resolved command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    /// `command` may carry leading arguments, e.g. `"python3 -m clp"`.
    fn from_command(command: &str) -> Self {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_default();
        Self {
            program,
            args: parts.collect(),
        }
    }

    fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }
}

/// Run a command, returning its stdout. The child is killed when `cancel`
/// fires.
pub async fn run_command(invocation: &Invocation, cancel: &CancellationToken) -> Result<String> {
    debug!(program = %invocation.program, args = ?invocation.args, "Spawning task process");
    let child = Command::new(&invocation.program)
        .args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| WorkerError::Spawn {
            binary: invocation.program.clone(),
            source,
        })?;

    let output = tokio::select! {
        output = child.wait_with_output() => output?,
        _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
    };

    if !output.status.success() {
        return Err(WorkerError::from_exit(
            &invocation.program,
            output.status.code(),
            &String::from_utf8_lossy(&output.stderr),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(alias = "orig_file_path")]
    file: String,
    message: String,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    path: String,
    begin_msg_ix: i64,
    end_msg_ix: i64,
    #[serde(default)]
    is_last_chunk: bool,
}

fn json_lines<'a, T: serde::de::DeserializeOwned + 'a>(
    stdout: &'a str,
) -> impl Iterator<Item = T> + 'a {
    stdout.lines().filter_map(|line| {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        match serde_json::from_str(line) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(error = %e, "Skipping unparsable output line");
                None
            }
        }
    })
}

fn storage_location(storage: &StorageConfig, key: Option<&str>) -> String {
    match storage {
        StorageConfig::Fs { directory } => match key {
            Some(key) => directory.join(key).display().to_string(),
            None => directory.display().to_string(),
        },
        StorageConfig::S3 {
            bucket, key_prefix, ..
        } => {
            let mut url = format!("s3://{}/{}", bucket, key_prefix);
            if let Some(key) = key {
                if !url.ends_with('/') {
                    url.push('/');
                }
                url.push_str(key);
            }
            url
        }
    }
}

fn archive_key(dataset: Option<&str>, archive_id: &str) -> String {
    match dataset {
        Some(dataset) if !dataset.is_empty() => format!("{}/{}", dataset, archive_id),
        _ => archive_id.to_string(),
    }
}

/// Runs the configured compression, search and extraction binaries.
pub struct SubprocessExecutor {
    binaries: WorkerConfig,
    archive_output: StorageConfig,
    stream_output: StorageConfig,
    results: Option<ResultStore>,
}

/// What a finished process produced.
#[derive(Debug, Default)]
struct Produced {
    uncompressed_size: u64,
    compressed_size: u64,
    archives: Vec<ArchiveStats>,
}

impl SubprocessExecutor {
    pub fn new(config: &LogvaultConfig) -> Self {
        Self {
            binaries: config.worker.clone(),
            archive_output: config.archive_output.storage.clone(),
            stream_output: config.stream_output.storage.clone(),
            results: None,
        }
    }

    /// Search hits and extracted streams are recorded in `results`.
    pub fn with_results(mut self, results: ResultStore) -> Self {
        self.results = Some(results);
        self
    }

    pub fn invocation(&self, params: &TaskParams) -> Invocation {
        match &params.payload {
            TaskPayload::Compression {
                dataset,
                paths,
                timestamp_key,
                target_archive_size,
            } => {
                let mut inv = Invocation::from_command(&self.binaries.compress_binary);
                inv.arg("c")
                    .arg("--print-archive-stats")
                    .arg("--target-encoded-size")
                    .arg(target_archive_size.to_string());
                if let Some(key) = timestamp_key {
                    inv.arg("--timestamp-key").arg(key.as_str());
                }
                inv.arg(storage_location(&self.archive_output, dataset.as_deref()));
                for path in paths {
                    inv.arg(path.path.as_str());
                }
                inv
            }
            TaskPayload::Search {
                archive_id,
                query,
                reducer,
                aggregation,
            } => {
                let mut inv = Invocation::from_command(&self.binaries.search_binary);
                let key = archive_key(query.dataset.as_deref(), archive_id);
                inv.arg("s")
                    .arg(storage_location(&self.archive_output, Some(&key)))
                    .arg(query.query_string.as_str());
                if let Some(begin) = query.begin_timestamp {
                    inv.arg("--tge").arg(begin.to_string());
                }
                if let Some(end) = query.end_timestamp {
                    inv.arg("--tle").arg(end.to_string());
                }
                if query.ignore_case {
                    inv.arg("--ignore-case");
                }
                if query.max_num_results > 0 {
                    inv.arg("--max-num-results")
                        .arg(query.max_num_results.to_string());
                }
                if let Some(reducer) = reducer {
                    inv.arg("--reducer")
                        .arg(reducer.to_string())
                        .arg("--job-id")
                        .arg(params.job_id.to_string());
                }
                if let Some(aggregation) = aggregation {
                    if let Some(bucket) = aggregation.count_by_time_bucket_size {
                        inv.arg("--count-by-time").arg(bucket.to_string());
                    } else if aggregation.do_count_aggregation {
                        inv.arg("--count");
                    }
                }
                inv
            }
            TaskPayload::ExtractIr(cfg) => {
                let mut inv = Invocation::from_command(&self.binaries.extract_binary);
                inv.arg("i")
                    .arg(storage_location(&self.archive_output, Some(&cfg.archive_id)))
                    .arg(cfg.orig_file_id.as_str())
                    .arg(cfg.msg_ix.to_string())
                    .arg(storage_location(&self.stream_output, None));
                if let Some(size) = cfg.target_uncompressed_size {
                    inv.arg("--target-size").arg(size.to_string());
                }
                inv
            }
            TaskPayload::ExtractJson(cfg) => {
                let mut inv = Invocation::from_command(&self.binaries.extract_binary);
                let key = archive_key(cfg.dataset.as_deref(), &cfg.archive_id);
                inv.arg("x")
                    .arg(storage_location(&self.archive_output, Some(&key)))
                    .arg(storage_location(&self.stream_output, None))
                    .arg("--ordered");
                if let Some(size) = cfg.target_chunk_size {
                    inv.arg("--target-ordered-chunk-size").arg(size.to_string());
                }
                inv
            }
        }
    }

    async fn run(&self, params: &TaskParams, cancel: &CancellationToken) -> Result<Produced> {
        let invocation = self.invocation(params);
        let stdout = run_command(&invocation, cancel).await?;
        self.collect(params, &stdout).await
    }

    async fn collect(&self, params: &TaskParams, stdout: &str) -> Result<Produced> {
        let mut produced = Produced::default();
        match &params.payload {
            TaskPayload::Compression { dataset, .. } => {
                for mut archive in json_lines::<ArchiveStats>(stdout) {
                    if archive.dataset.is_none() {
                        archive.dataset = dataset.clone();
                    }
                    produced.uncompressed_size += archive.uncompressed_size;
                    produced.compressed_size += archive.size;
                    produced.archives.push(archive);
                }
                if produced.archives.is_empty() {
                    return Err(WorkerError::Output(
                        "compression produced no archive statistics".to_string(),
                    ));
                }
            }
            TaskPayload::Search { reducer, .. } => {
                // With a reducer attached the binary streams straight to it.
                if reducer.is_some() {
                    return Ok(produced);
                }
                let docs: Vec<ResultDocument> = json_lines::<SearchHit>(stdout)
                    .map(|hit| ResultDocument {
                        file: hit.file,
                        message: hit.message,
                        timestamp: hit.timestamp,
                    })
                    .collect();
                if let Some(results) = &self.results {
                    results
                        .insert_results_metadata(
                            DocumentId::new(),
                            params.job_id,
                            JobKind::SearchOrAggregation,
                        )
                        .await?;
                    results.append_results(params.job_id, &docs).await?;
                }
                debug!(job_id = %params.job_id, hits = docs.len(), "Search task finished");
            }
            TaskPayload::ExtractIr(cfg) => {
                self.record_streams(params.job_id, &cfg.orig_file_id, stdout)
                    .await?;
            }
            TaskPayload::ExtractJson(cfg) => {
                self.record_streams(params.job_id, &cfg.archive_id, stdout)
                    .await?;
            }
        }
        Ok(produced)
    }

    async fn record_streams(&self, job_id: JobId, stream_id: &str, stdout: &str) -> Result<()> {
        let Some(results) = &self.results else {
            return Ok(());
        };
        let mut count = 0usize;
        for chunk in json_lines::<StreamChunk>(stdout) {
            results
                .insert_stream(&StreamRecord {
                    id: DocumentId::new(),
                    stream_id: stream_id.to_string(),
                    path: chunk.path,
                    orig_file_id: Some(stream_id.to_string()),
                    begin_msg_ix: chunk.begin_msg_ix,
                    end_msg_ix: chunk.end_msg_ix,
                    file_split_id: None,
                    is_last_chunk: chunk.is_last_chunk,
                })
                .await?;
            count += 1;
        }
        info!(job_id = %job_id, stream_id, chunks = count, "Recorded extracted streams");
        Ok(())
    }
}

#[async_trait]
impl TaskExecutor for SubprocessExecutor {
    async fn execute(&self, params: TaskParams, cancel: CancellationToken) -> TaskResult {
        let started = Instant::now();
        let outcome = self.run(&params, &cancel).await;
        let elapsed = started.elapsed().as_secs_f64();

        match outcome {
            Ok(produced) => {
                let mut result = TaskResult::succeeded(params.task_id, elapsed)
                    .with_sizes(produced.uncompressed_size, produced.compressed_size);
                result.archives = produced.archives;
                result
            }
            Err(WorkerError::Cancelled) => {
                info!(task_id = %params.task_id, "Task cancelled");
                let mut result = TaskResult::cancelled(params.task_id);
                result.duration_secs = elapsed;
                result
            }
            Err(e) => {
                warn!(
                    job_id = %params.job_id,
                    task_id = %params.task_id,
                    task = params.payload.name(),
                    error = %e,
                    "Task failed"
                );
                TaskResult::failed(params.task_id, elapsed, e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logvault_protocol::{InputPath, SearchJobConfig, TaskId, TaskStatus};
    use std::path::PathBuf;
    use std::time::Duration;

    fn config(archive_dir: PathBuf) -> LogvaultConfig {
        let mut config = LogvaultConfig::default();
        config.archive_output.storage = StorageConfig::Fs {
            directory: archive_dir,
        };
        config
    }

    fn compression(job: i64, task: i64) -> TaskParams {
        TaskParams {
            job_id: JobId::new(job),
            task_id: TaskId::new(task),
            payload: TaskPayload::Compression {
                dataset: Some("default".to_string()),
                paths: vec![InputPath {
                    path: "/logs/a.log".to_string(),
                    size: 10,
                }],
                timestamp_key: Some("ts".to_string()),
                target_archive_size: 1024,
            },
        }
    }

    #[test]
    fn test_compression_invocation() {
        let executor = SubprocessExecutor::new(&config(PathBuf::from("/data/archives")));
        let inv = executor.invocation(&compression(1, 2));
        assert_eq!(inv.program, "clp-s");
        assert_eq!(
            inv.args,
            vec![
                "c",
                "--print-archive-stats",
                "--target-encoded-size",
                "1024",
                "--timestamp-key",
                "ts",
                "/data/archives/default",
                "/logs/a.log",
            ]
        );
    }

    #[test]
    fn test_search_invocation_on_object_storage() {
        let mut cfg = LogvaultConfig::default();
        cfg.archive_output.storage = StorageConfig::S3 {
            bucket: "logs".to_string(),
            region: "us-east-1".to_string(),
            key_prefix: "archives".to_string(),
            endpoint_url: None,
        };
        let executor = SubprocessExecutor::new(&cfg);
        let params = TaskParams {
            job_id: JobId::new(5),
            task_id: TaskId::new(6),
            payload: TaskPayload::Search {
                archive_id: "a1".to_string(),
                query: SearchJobConfig {
                    dataset: Some("default".to_string()),
                    query_string: "level: ERROR".to_string(),
                    begin_timestamp: Some(100),
                    end_timestamp: None,
                    ignore_case: true,
                    max_num_results: 0,
                    aggregation: None,
                },
                reducer: None,
                aggregation: None,
            },
        };
        let inv = executor.invocation(&params);
        assert_eq!(
            inv.args,
            vec![
                "s",
                "s3://logs/archives/default/a1",
                "level: ERROR",
                "--tge",
                "100",
                "--ignore-case",
            ]
        );
    }

    #[tokio::test]
    async fn test_run_command_reports_exit_code() {
        let inv = Invocation {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo boom >&2; exit 3".to_string()],
        };
        let err = run_command(&inv, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            WorkerError::ExitCode { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_command_cancel_kills_child() {
        let inv = Invocation {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "sleep 30".to_string()],
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), run_command(&inv, &cancel))
            .await
            .unwrap();
        assert!(matches!(result, Err(WorkerError::Cancelled)));
    }

    #[tokio::test]
    async fn test_compression_collects_archive_stats() {
        let tmp = tempfile::TempDir::new().unwrap();
        let script = tmp.path().join("fake-clp.sh");
        std::fs::write(
            &script,
            "echo 'compressing...'\n\
             echo '{\"id\":\"a1\",\"begin_timestamp\":1,\"end_timestamp\":2,\"uncompressed_size\":100,\"size\":10}'\n\
             echo '{\"id\":\"a2\",\"begin_timestamp\":3,\"end_timestamp\":4,\"uncompressed_size\":50,\"size\":5}'\n",
        )
        .unwrap();

        let mut cfg = config(tmp.path().join("archives"));
        cfg.worker.compress_binary = format!("sh {}", script.display());
        let executor = SubprocessExecutor::new(&cfg);

        let result = executor
            .execute(compression(1, 2), CancellationToken::new())
            .await;
        assert_eq!(result.status, TaskStatus::Succeeded);
        assert_eq!(result.uncompressed_size, 150);
        assert_eq!(result.compressed_size, 15);
        assert_eq!(result.archives.len(), 2);
        assert_eq!(result.archives[0].dataset.as_deref(), Some("default"));
    }

    #[tokio::test]
    async fn test_missing_binary_fails_task() {
        let mut cfg = config(PathBuf::from("/tmp"));
        cfg.worker.compress_binary = "/nonexistent/logvault-clp".to_string();
        let executor = SubprocessExecutor::new(&cfg);

        let result = executor
            .execute(compression(1, 9), CancellationToken::new())
            .await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.task_id, TaskId::new(9));
        assert!(result
            .error_message
            .unwrap()
            .contains("/nonexistent/logvault-clp"));
    }

    #[tokio::test]
    async fn test_search_hits_land_in_results_store() {
        let tmp = tempfile::TempDir::new().unwrap();
        let script = tmp.path().join("fake-search.sh");
        std::fs::write(
            &script,
            "echo '{\"file\":\"/logs/a.log\",\"message\":\"ERROR disk\",\"timestamp\":7}'\n",
        )
        .unwrap();

        let mut cfg = config(tmp.path().join("archives"));
        cfg.worker.search_binary = format!("sh {}", script.display());
        let results = ResultStore::open_in_memory().await.unwrap();
        let executor = SubprocessExecutor::new(&cfg).with_results(results.clone());

        let params = TaskParams {
            job_id: JobId::new(3),
            task_id: TaskId::new(4),
            payload: TaskPayload::Search {
                archive_id: "a1".to_string(),
                query: SearchJobConfig {
                    dataset: None,
                    query_string: "ERROR".to_string(),
                    begin_timestamp: None,
                    end_timestamp: None,
                    ignore_case: false,
                    max_num_results: 0,
                    aggregation: None,
                },
                reducer: None,
                aggregation: None,
            },
        };
        let result = executor.execute(params, CancellationToken::new()).await;
        assert_eq!(result.status, TaskStatus::Succeeded);

        let docs = results.fetch_results(JobId::new(3)).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].message, "ERROR disk");
    }
}

//! Process configuration shared by the scheduler, worker and garbage
//! collector daemons.
//!
//! Loaded from a TOML file passed with `--config`. Every section has
//! defaults so a minimal file only needs to override what differs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::defaults;
use crate::types::{JobKind, StorageEngine};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogvaultConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub results_cache: ResultsCacheConfig,
    #[serde(default)]
    pub package: PackageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub reducer: ReducerConfig,
    #[serde(default = "default_archive_output")]
    pub archive_output: OutputConfig,
    #[serde(default = "default_stream_output")]
    pub stream_output: OutputConfig,
    #[serde(default)]
    pub garbage_collector: GarbageCollectorConfig,
    #[serde(default = "default_logs_directory")]
    pub logs_directory: PathBuf,
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsCacheConfig {
    #[serde(default = "default_results_cache_url")]
    pub url: String,
    /// Minutes to keep cached search results. Absent: never swept.
    #[serde(default)]
    pub retention_period: Option<u64>,
}

impl Default for ResultsCacheConfig {
    fn default() -> Self {
        Self {
            url: default_results_cache_url(),
            retention_period: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PackageConfig {
    #[serde(default)]
    pub storage_engine: StorageEngine,
}

/// Which execution substrate the scheduler drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Queue,
    Workflow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Identifies this scheduler's jobs to the reaper.
    #[serde(default = "default_scheduler_id")]
    pub id: String,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_jobs_poll_delay_ms")]
    pub jobs_poll_delay_ms: u64,
    #[serde(default = "default_result_poll_timeout_ms")]
    pub result_poll_timeout_ms: u64,
    /// Upper bound on the summed input size of one compression task.
    #[serde(default = "default_target_task_size")]
    pub target_task_size: u64,
    /// Queue priority given to submitted tasks.
    #[serde(default)]
    pub task_priority: i32,
    #[serde(default = "default_job_kinds")]
    pub kinds: Vec<JobKind>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            id: default_scheduler_id(),
            backend: BackendKind::default(),
            jobs_poll_delay_ms: default_jobs_poll_delay_ms(),
            result_poll_timeout_ms: default_result_poll_timeout_ms(),
            target_task_size: default_target_task_size(),
            task_priority: 0,
            kinds: default_job_kinds(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.jobs_poll_delay_ms)
    }

    pub fn result_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.result_poll_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_max_parallel_tasks")]
    pub max_parallel_tasks: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: default_max_parallel_tasks(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_worker_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_compress_binary")]
    pub compress_binary: String,
    #[serde(default = "default_search_binary")]
    pub search_binary: String,
    #[serde(default = "default_extract_binary")]
    pub extract_binary: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_worker_poll_interval_ms(),
            concurrency: default_worker_concurrency(),
            compress_binary: default_compress_binary(),
            search_binary: default_search_binary(),
            extract_binary: default_extract_binary(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_reaper_interval_secs")]
    pub interval_secs: u64,
    /// A scheduler whose heartbeat is older than this is presumed dead.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reaper_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReducerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_reducer_host")]
    pub host: String,
    #[serde(default = "default_reducer_port")]
    pub port: u16,
}

impl Default for ReducerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_reducer_host(),
            port: default_reducer_port(),
        }
    }
}

/// Where a class of output objects lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Fs {
        directory: PathBuf,
    },
    S3 {
        bucket: String,
        region: String,
        #[serde(default)]
        key_prefix: String,
        #[serde(default)]
        endpoint_url: Option<String>,
    },
}

impl StorageConfig {
    pub fn is_object_storage(&self) -> bool {
        matches!(self, StorageConfig::S3 { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub storage: StorageConfig,
    /// Minutes to keep objects of this class. Absent: never swept.
    #[serde(default)]
    pub retention_period: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepIntervals {
    #[serde(default = "default_archive_sweep_interval")]
    pub archive: u64,
    #[serde(default = "default_search_result_sweep_interval")]
    pub search_result: u64,
    #[serde(default = "default_stream_sweep_interval")]
    pub stream: u64,
}

impl Default for SweepIntervals {
    fn default() -> Self {
        Self {
            archive: default_archive_sweep_interval(),
            search_result: default_search_result_sweep_interval(),
            stream: default_stream_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GarbageCollectorConfig {
    /// Holds one recovery file per sweeper.
    #[serde(default = "default_recovery_directory")]
    pub recovery_directory: PathBuf,
    /// Minutes between sweeps, per resource class.
    #[serde(default)]
    pub sweep_interval: SweepIntervals,
}

impl Default for GarbageCollectorConfig {
    fn default() -> Self {
        Self {
            recovery_directory: default_recovery_directory(),
            sweep_interval: SweepIntervals::default(),
        }
    }
}

// ============================================================================
// Loading and validation
// ============================================================================

impl LogvaultConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: LogvaultConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Field-level checks every daemon relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::invalid("database.url must not be empty"));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::invalid("database.max_connections must be > 0"));
        }
        if self.scheduler.id.trim().is_empty() {
            return Err(ConfigError::invalid("scheduler.id must not be empty"));
        }
        if self.scheduler.jobs_poll_delay_ms == 0 {
            return Err(ConfigError::invalid("scheduler.jobs_poll_delay_ms must be > 0"));
        }
        if self.scheduler.target_task_size == 0 {
            return Err(ConfigError::invalid("scheduler.target_task_size must be > 0"));
        }
        if self.scheduler.kinds.is_empty() {
            return Err(ConfigError::invalid("scheduler.kinds must name at least one job kind"));
        }
        if self.workflow.max_parallel_tasks == 0 {
            return Err(ConfigError::invalid("workflow.max_parallel_tasks must be > 0"));
        }
        if self.worker.concurrency == 0 {
            return Err(ConfigError::invalid("worker.concurrency must be > 0"));
        }
        if self.reaper.interval_secs == 0 || self.reaper.heartbeat_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "reaper.interval_secs and reaper.heartbeat_timeout_secs must be > 0",
            ));
        }

        for (name, period) in [
            ("archive_output.retention_period", self.archive_output.retention_period),
            ("stream_output.retention_period", self.stream_output.retention_period),
            ("results_cache.retention_period", self.results_cache.retention_period),
        ] {
            if period == Some(0) {
                return Err(ConfigError::invalid(format!("{} must be > 0 minutes", name)));
            }
        }

        let intervals = &self.garbage_collector.sweep_interval;
        if intervals.archive == 0 || intervals.search_result == 0 || intervals.stream == 0 {
            return Err(ConfigError::invalid(
                "garbage_collector.sweep_interval values must be > 0 minutes",
            ));
        }

        Ok(())
    }

    /// Checks that every retained resource class lives on storage the
    /// configured engine can write. Run before any sweeper starts.
    pub fn validate_retention(&self) -> Result<(), ConfigError> {
        let engine = self.package.storage_engine;
        for (name, output) in [
            ("archive_output", &self.archive_output),
            ("stream_output", &self.stream_output),
        ] {
            if output.retention_period.is_none() {
                continue;
            }
            if output.storage.is_object_storage() && !engine.supports_object_storage() {
                return Err(ConfigError::invalid(format!(
                    "{}: retention on object storage is not supported with storage engine '{}'",
                    name, engine
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Defaults
// ============================================================================

fn default_database_url() -> String {
    defaults::DEFAULT_DATABASE_URL.to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_results_cache_url() -> String {
    defaults::DEFAULT_RESULTS_CACHE_URL.to_string()
}

fn default_scheduler_id() -> String {
    defaults::DEFAULT_SCHEDULER_ID.to_string()
}

fn default_jobs_poll_delay_ms() -> u64 {
    100
}

fn default_result_poll_timeout_ms() -> u64 {
    10
}

fn default_target_task_size() -> u64 {
    256 * 1024 * 1024
}

fn default_job_kinds() -> Vec<JobKind> {
    JobKind::ALL.to_vec()
}

fn default_max_parallel_tasks() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

fn default_worker_poll_interval_ms() -> u64 {
    200
}

fn default_worker_concurrency() -> usize {
    1
}

fn default_compress_binary() -> String {
    "clp-s".to_string()
}

fn default_search_binary() -> String {
    "clp-s".to_string()
}

fn default_extract_binary() -> String {
    "clp-s".to_string()
}

fn default_reaper_interval_secs() -> u64 {
    30
}

fn default_heartbeat_timeout_secs() -> u64 {
    120
}

fn default_reducer_host() -> String {
    "127.0.0.1".to_string()
}

fn default_reducer_port() -> u16 {
    defaults::DEFAULT_REDUCER_PORT
}

fn default_archive_output() -> OutputConfig {
    OutputConfig {
        storage: StorageConfig::Fs {
            directory: PathBuf::from(defaults::DEFAULT_ARCHIVE_DIRECTORY),
        },
        retention_period: None,
    }
}

fn default_stream_output() -> OutputConfig {
    OutputConfig {
        storage: StorageConfig::Fs {
            directory: PathBuf::from(defaults::DEFAULT_STREAM_DIRECTORY),
        },
        retention_period: None,
    }
}

impl Default for LogvaultConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            results_cache: ResultsCacheConfig::default(),
            package: PackageConfig::default(),
            scheduler: SchedulerConfig::default(),
            workflow: WorkflowConfig::default(),
            worker: WorkerConfig::default(),
            reaper: ReaperConfig::default(),
            reducer: ReducerConfig::default(),
            archive_output: default_archive_output(),
            stream_output: default_stream_output(),
            garbage_collector: GarbageCollectorConfig::default(),
            logs_directory: default_logs_directory(),
        }
    }
}

fn default_archive_sweep_interval() -> u64 {
    60
}

fn default_search_result_sweep_interval() -> u64 {
    30
}

fn default_stream_sweep_interval() -> u64 {
    30
}

fn default_recovery_directory() -> PathBuf {
    PathBuf::from(defaults::DEFAULT_RECOVERY_DIRECTORY)
}

fn default_logs_directory() -> PathBuf {
    PathBuf::from(defaults::DEFAULT_LOGS_DIRECTORY)
}

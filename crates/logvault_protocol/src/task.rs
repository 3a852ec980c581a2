//! Task parameters and results exchanged with a task backend.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::job_config::{
    AggregationConfig, ExtractIrJobConfig, ExtractJsonJobConfig, InputPath, SearchJobConfig,
};
use crate::types::{JobId, TaskId, TaskStatus};

/// Listening address of a reducer process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReducerAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ReducerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Kind-specific work carried by a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskPayload {
    Compression {
        dataset: Option<String>,
        paths: Vec<InputPath>,
        timestamp_key: Option<String>,
        target_archive_size: u64,
    },
    Search {
        archive_id: String,
        query: SearchJobConfig,
        /// Where to stream results for aggregation; `None` writes to the
        /// results cache.
        reducer: Option<ReducerAddress>,
        aggregation: Option<AggregationConfig>,
    },
    ExtractIr(ExtractIrJobConfig),
    ExtractJson(ExtractJsonJobConfig),
}

impl TaskPayload {
    pub fn name(&self) -> &'static str {
        match self {
            TaskPayload::Compression { .. } => "compression",
            TaskPayload::Search { .. } => "search",
            TaskPayload::ExtractIr(_) => "extract_ir",
            TaskPayload::ExtractJson(_) => "extract_json",
        }
    }
}

/// One unit of work handed to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub payload: TaskPayload,
}

/// One archive written by a compression task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveStats {
    pub id: String,
    #[serde(default)]
    pub dataset: Option<String>,
    /// Epoch milliseconds of the earliest and latest event.
    pub begin_timestamp: i64,
    pub end_timestamp: i64,
    #[serde(default)]
    pub uncompressed_size: u64,
    pub size: u64,
}

/// What a worker reports for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default)]
    pub duration_secs: f64,
    #[serde(default)]
    pub uncompressed_size: u64,
    #[serde(default)]
    pub compressed_size: u64,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Archives produced, for compression tasks.
    #[serde(default)]
    pub archives: Vec<ArchiveStats>,
}

impl TaskResult {
    pub fn succeeded(task_id: TaskId, duration_secs: f64) -> Self {
        Self {
            task_id,
            status: TaskStatus::Succeeded,
            duration_secs,
            uncompressed_size: 0,
            compressed_size: 0,
            error_message: None,
            archives: Vec::new(),
        }
    }

    pub fn failed(task_id: TaskId, duration_secs: f64, error: impl Into<String>) -> Self {
        Self {
            task_id,
            status: TaskStatus::Failed,
            duration_secs,
            uncompressed_size: 0,
            compressed_size: 0,
            error_message: Some(error.into()),
            archives: Vec::new(),
        }
    }

    /// A task stopped before it finished, e.g. revoked from the queue.
    pub fn cancelled(task_id: TaskId) -> Self {
        Self {
            status: TaskStatus::Cancelled,
            ..Self::failed(task_id, 0.0, "cancelled")
        }
    }

    pub fn with_sizes(mut self, uncompressed_size: u64, compressed_size: u64) -> Self {
        self.uncompressed_size = uncompressed_size;
        self.compressed_size = compressed_size;
        self
    }
}

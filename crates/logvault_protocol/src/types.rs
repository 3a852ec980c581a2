//! Canonical enums and identifiers shared by every logvault crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ProtocolError, Result};

// ============================================================================
// Identifiers
// ============================================================================

/// Job identifier assigned by the JobStore on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i64);

impl JobId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }

    /// Wire representation used in reducer frame headers.
    pub fn to_u64(self) -> Result<u64> {
        u64::try_from(self.0).map_err(|_| ProtocolError::InvalidId(self.0.to_string()))
    }

    pub fn from_u64(value: u64) -> Result<Self> {
        i64::try_from(value)
            .map(Self)
            .map_err(|_| ProtocolError::InvalidId(value.to_string()))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task identifier assigned by the JobStore on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(i64);

impl TaskId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Job kind
// ============================================================================

/// What a job does. Stored as a small integer in `jobs.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    Compression,
    SearchOrAggregation,
    ExtractIr,
    ExtractJson,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::Compression,
        JobKind::SearchOrAggregation,
        JobKind::ExtractIr,
        JobKind::ExtractJson,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Compression => "COMPRESSION",
            JobKind::SearchOrAggregation => "SEARCH_OR_AGGREGATION",
            JobKind::ExtractIr => "EXTRACT_IR",
            JobKind::ExtractJson => "EXTRACT_JSON",
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            JobKind::Compression => 0,
            JobKind::SearchOrAggregation => 1,
            JobKind::ExtractIr => 2,
            JobKind::ExtractJson => 3,
        }
    }

    pub fn from_i32(value: i32) -> Result<Self> {
        match value {
            0 => Ok(JobKind::Compression),
            1 => Ok(JobKind::SearchOrAggregation),
            2 => Ok(JobKind::ExtractIr),
            3 => Ok(JobKind::ExtractJson),
            _ => Err(ProtocolError::UnknownJobKind(value)),
        }
    }

    /// Query-side kinds whose output lands in the results cache.
    pub fn is_query(&self) -> bool {
        !matches!(self, JobKind::Compression)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "COMPRESSION" => Ok(JobKind::Compression),
            "SEARCH_OR_AGGREGATION" | "SEARCH" => Ok(JobKind::SearchOrAggregation),
            "EXTRACT_IR" => Ok(JobKind::ExtractIr),
            "EXTRACT_JSON" => Ok(JobKind::ExtractJson),
            _ => Err(ProtocolError::InvalidName(s.to_string())),
        }
    }
}

// ============================================================================
// Job status
// ============================================================================

/// Lifecycle of a job.
///
/// ```text
/// PENDING -> RUNNING -> {SUCCEEDED, FAILED, CANCELLED, KILLED}
///            RUNNING -> CANCELLING -> CANCELLED
///            RUNNING -> PENDING_REDUCER -> REDUCER_READY -> PENDING_REDUCER_DONE -> terminal
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelling,
    Cancelled,
    Killed,
    PendingReducer,
    ReducerReady,
    PendingReducerDone,
}

impl JobStatus {
    pub const ALL: [JobStatus; 10] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Cancelling,
        JobStatus::Cancelled,
        JobStatus::Killed,
        JobStatus::PendingReducer,
        JobStatus::ReducerReady,
        JobStatus::PendingReducerDone,
    ];

    /// States a scheduler holds a job in while it owns live backend work.
    pub const IN_FLIGHT: [JobStatus; 5] = [
        JobStatus::Running,
        JobStatus::Cancelling,
        JobStatus::PendingReducer,
        JobStatus::ReducerReady,
        JobStatus::PendingReducerDone,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelling => "CANCELLING",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Killed => "KILLED",
            JobStatus::PendingReducer => "PENDING_REDUCER",
            JobStatus::ReducerReady => "REDUCER_READY",
            JobStatus::PendingReducerDone => "PENDING_REDUCER_DONE",
        }
    }

    /// Integer stored in `jobs.status`.
    pub fn as_i32(&self) -> i32 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Succeeded => 2,
            JobStatus::Failed => 3,
            JobStatus::Cancelling => 4,
            JobStatus::Cancelled => 5,
            JobStatus::Killed => 6,
            JobStatus::PendingReducer => 7,
            JobStatus::ReducerReady => 8,
            JobStatus::PendingReducerDone => 9,
        }
    }

    pub fn from_i32(value: i32) -> Result<Self> {
        match value {
            0 => Ok(JobStatus::Pending),
            1 => Ok(JobStatus::Running),
            2 => Ok(JobStatus::Succeeded),
            3 => Ok(JobStatus::Failed),
            4 => Ok(JobStatus::Cancelling),
            5 => Ok(JobStatus::Cancelled),
            6 => Ok(JobStatus::Killed),
            7 => Ok(JobStatus::PendingReducer),
            8 => Ok(JobStatus::ReducerReady),
            9 => Ok(JobStatus::PendingReducerDone),
            _ => Err(ProtocolError::UnknownJobStatus(value)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Killed
        )
    }

    pub fn is_in_flight(&self) -> bool {
        Self::IN_FLIGHT.contains(self)
    }

    /// Whether `self -> next` is an edge of the job state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Pending, Running | Cancelled | Failed) => true,
            (Running, Succeeded | Failed | Cancelled | Killed | Cancelling | PendingReducer) => {
                true
            }
            (Cancelling, Cancelled | Killed) => true,
            (PendingReducer, ReducerReady | Failed | Killed | Cancelled) => true,
            (ReducerReady, PendingReducerDone | Failed | Killed) => true,
            (PendingReducerDone, Succeeded | Failed | Killed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.to_uppercase();
        JobStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == upper)
            .ok_or_else(|| ProtocolError::InvalidName(s.to_string()))
    }
}

// ============================================================================
// Task status
// ============================================================================

/// Lifecycle of a single task. Same shape as [`JobStatus`] without the
/// reducer sub-states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Killed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Killed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Killed => "KILLED",
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Running => 1,
            TaskStatus::Succeeded => 2,
            TaskStatus::Failed => 3,
            TaskStatus::Cancelled => 4,
            TaskStatus::Killed => 5,
        }
    }

    pub fn from_i32(value: i32) -> Result<Self> {
        match value {
            0 => Ok(TaskStatus::Pending),
            1 => Ok(TaskStatus::Running),
            2 => Ok(TaskStatus::Succeeded),
            3 => Ok(TaskStatus::Failed),
            4 => Ok(TaskStatus::Cancelled),
            5 => Ok(TaskStatus::Killed),
            _ => Err(ProtocolError::UnknownTaskStatus(value)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Killed
        )
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        match (self, next) {
            (Pending, Running | Cancelled | Killed | Failed) => true,
            (Running, Succeeded | Failed | Cancelled | Killed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.to_uppercase();
        TaskStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == upper)
            .ok_or_else(|| ProtocolError::InvalidName(s.to_string()))
    }
}

/// Derive a job's status from its tasks.
///
/// Returns `None` while any task is still non-terminal. Otherwise any FAILED
/// task fails the job, then KILLED, then CANCELLED; all SUCCEEDED succeeds.
pub fn job_status_from_tasks<I>(statuses: I) -> Option<JobStatus>
where
    I: IntoIterator<Item = TaskStatus>,
{
    let mut failed = false;
    let mut killed = false;
    let mut cancelled = false;

    for status in statuses {
        match status {
            TaskStatus::Pending | TaskStatus::Running => return None,
            TaskStatus::Succeeded => {}
            TaskStatus::Failed => failed = true,
            TaskStatus::Killed => killed = true,
            TaskStatus::Cancelled => cancelled = true,
        }
    }

    Some(if failed {
        JobStatus::Failed
    } else if killed {
        JobStatus::Killed
    } else if cancelled {
        JobStatus::Cancelled
    } else {
        JobStatus::Succeeded
    })
}

// ============================================================================
// Storage engine
// ============================================================================

/// Archive format produced by the compression binaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StorageEngine {
    /// Unstructured text logs; local filesystem output only.
    #[serde(rename = "clp")]
    Clp,
    /// Structured JSON logs; filesystem or object storage.
    #[default]
    #[serde(rename = "clp-s")]
    ClpS,
}

impl StorageEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageEngine::Clp => "clp",
            StorageEngine::ClpS => "clp-s",
        }
    }

    pub fn supports_object_storage(&self) -> bool {
        matches!(self, StorageEngine::ClpS)
    }
}

impl fmt::Display for StorageEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

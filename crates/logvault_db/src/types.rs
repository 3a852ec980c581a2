//! Row types returned by the stores.

use logvault_protocol::{JobId, JobKind, JobStatus, TaskId, TaskStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub status_msg: String,
    /// Epoch milliseconds.
    pub creation_time: i64,
    pub start_time: Option<i64>,
    pub update_time: i64,
    /// Seconds from start to the terminal transition.
    pub duration: Option<f64>,
    pub config: Vec<u8>,
    pub num_tasks: i64,
    pub num_tasks_completed: i64,
    pub num_tasks_failed: i64,
    pub uncompressed_size: i64,
    pub compressed_size: i64,
    pub scheduler_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub id: TaskId,
    pub job_id: JobId,
    pub status: TaskStatus,
    pub start_time: Option<i64>,
    pub duration: Option<f64>,
    /// Encoded [`logvault_protocol::TaskPayload`].
    pub params: Vec<u8>,
    pub uncompressed_size: i64,
    pub compressed_size: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRecord {
    pub id: String,
    /// Empty when the archive belongs to no dataset.
    pub dataset: String,
    pub begin_timestamp: i64,
    pub end_timestamp: i64,
    pub size: i64,
    pub creation_time: i64,
}

impl ArchiveRecord {
    /// Storage key relative to the archive root: `<dataset>/<id>` or `<id>`.
    pub fn storage_key(&self) -> String {
        if self.dataset.is_empty() {
            self.id.clone()
        } else {
            format!("{}/{}", self.dataset, self.id)
        }
    }
}

/// Lifecycle of a `task_queue` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEntryState {
    Queued,
    Claimed,
    Done,
    Revoked,
}

impl QueueEntryState {
    pub fn as_i32(&self) -> i32 {
        match self {
            QueueEntryState::Queued => 0,
            QueueEntryState::Claimed => 1,
            QueueEntryState::Done => 2,
            QueueEntryState::Revoked => 3,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(QueueEntryState::Queued),
            1 => Some(QueueEntryState::Claimed),
            2 => Some(QueueEntryState::Done),
            3 => Some(QueueEntryState::Revoked),
            _ => None,
        }
    }
}

/// An entry claimed by a worker.
#[derive(Debug, Clone)]
pub struct ClaimedEntry {
    pub entry_id: i64,
    pub group_id: JobId,
    pub task_id: TaskId,
    /// Encoded [`logvault_protocol::TaskParams`].
    pub params: Vec<u8>,
}

/// One entry of a submitted group, in submission order.
#[derive(Debug, Clone)]
pub struct GroupEntry {
    pub task_id: TaskId,
    pub state: QueueEntryState,
    /// Encoded [`logvault_protocol::TaskResult`] once `Done`.
    pub result: Option<Vec<u8>>,
}

/// Which in-flight jobs count as hanging.
#[derive(Debug, Clone, Copy)]
pub enum HangingScope<'a> {
    /// Jobs owned by this scheduler id; used when the scheduler restarts.
    OwnedBy(&'a str),
    /// Jobs whose owner has not heartbeated since the given epoch millis.
    StaleSince(i64),
}

//! Task backends.
//!
//! A [`TaskBackend`] accepts a batch of tasks for one job and hands back a
//! [`ResultHandle`]. The scheduler polls the handle with a short timeout
//! until every task has reported; it never blocks on a backend.

mod queue;
mod workflow;

pub use queue::QueueBackend;
pub use workflow::{
    GraphNode, GraphState, JobGraph, LocalWorkflowDriver, WorkflowBackend, WorkflowDriver,
    WorkflowJobId,
};

use async_trait::async_trait;
use logvault_db::DbError;
use logvault_protocol::{JobId, ProtocolError, TaskParams, TaskResult};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackendError>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Workflow driver error: {0}")]
    Driver(String),

    /// The backend lost track of submitted work, e.g. entries were purged.
    #[error("Result of job {job_id} is incomplete: expected {expected} tasks, found {found}")]
    Incomplete {
        job_id: JobId,
        expected: usize,
        found: usize,
    },
}

impl BackendError {
    pub fn driver(msg: impl Into<String>) -> Self {
        Self::Driver(msg.into())
    }
}

#[async_trait]
pub trait TaskBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Hand `tasks` to the backend. Returns as soon as they are accepted.
    async fn submit(&self, job_id: JobId, tasks: Vec<TaskParams>) -> Result<Box<dyn ResultHandle>>;

    /// Stop tasks of `job_id` that have not started. Backends without the
    /// capability ignore the request.
    async fn cancel(&self, _job_id: JobId) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait ResultHandle: Send + Sync {
    /// `Ok(None)` until every task of the batch is done, then the results
    /// in submission order. Waits at most `timeout`.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Vec<TaskResult>>>;
}

use logvault_db::DbError;
use logvault_protocol::{JobId, ProtocolError};
use thiserror::Error;

use crate::backend::BackendError;

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Job {0} not found")]
    JobNotFound(JobId),

    #[error("Timed out waiting for job {0}")]
    Timeout(JobId),
}

//! Error types for the database layer.

use logvault_protocol::{JobId, JobStatus, ProtocolError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored integer or blob could not be decoded.
    #[error("Corrupt row: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Illegal job transition for {job_id}: {from} -> {to}")]
    IllegalTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// The optimistic `WHERE status = ?` check matched no row: another
    /// writer moved the job first.
    #[error("Lost race on job {job_id}: expected status {expected}")]
    LostRace { job_id: JobId, expected: JobStatus },

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl DbError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn is_lost_race(&self) -> bool {
        matches!(self, DbError::LostRace { .. })
    }
}

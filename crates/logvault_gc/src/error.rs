use logvault_db::DbError;
use logvault_protocol::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GcError>;

#[derive(Debug, Error)]
pub enum GcError {
    #[error("Recovery file {path}: {source}")]
    Buffer {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Failed to delete {key}: {source}")]
    Delete {
        key: String,
        source: std::io::Error,
    },

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// A key that would escape its storage root.
    #[error("Invalid retention target: {0}")]
    InvalidTarget(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl GcError {
    pub(crate) fn buffer(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Buffer {
            path: path.into(),
            source,
        }
    }
}

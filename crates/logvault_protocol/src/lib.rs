//! Shared vocabulary of the logvault control plane.
//!
//! Status enumerations and their integer encodings, job and task
//! configuration types, the MessagePack task codec, reducer wire framing,
//! and the process configuration file.

pub mod codec;
pub mod config;
pub mod defaults;
pub mod error;
pub mod job_config;
pub mod task;
pub mod types;
pub mod wire;

pub use config::{
    BackendKind, ConfigError, GarbageCollectorConfig, LogvaultConfig, OutputConfig,
    StorageConfig,
};
pub use error::{ProtocolError, Result};
pub use job_config::{
    AggregationConfig, CompressionJobConfig, ExtractIrJobConfig, ExtractJsonJobConfig,
    InputPath, JobConfig, SearchJobConfig,
};
pub use task::{ArchiveStats, ReducerAddress, TaskParams, TaskPayload, TaskResult};
pub use types::{
    job_status_from_tasks, JobId, JobKind, JobStatus, StorageEngine, TaskId, TaskStatus,
};

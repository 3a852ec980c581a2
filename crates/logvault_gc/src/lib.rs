//! Logvault garbage collector
//!
//! One retention sweeper per resource class: archives, cached search
//! results and extracted streams. Each deletes expired metadata first and
//! keeps a recovery file of the physical objects it still has to remove.

pub mod buffer;
pub mod error;
pub mod metrics;
pub mod storage;
pub mod sweeper;

pub use buffer::TargetsBuffer;
pub use error::{GcError, Result};
pub use metrics::METRICS;
pub use storage::{FsStorage, ObjectStorage, StorageBackend};
pub use sweeper::{
    ArchiveClass, ResourceClass, RetentionSweeper, SearchResultClass, StreamClass, SweepReport,
};

use std::path::{Path, PathBuf};

/// Recovery file of the sweeper named `class` under `recovery_directory`.
pub fn recovery_file(recovery_directory: &Path, class: &str) -> PathBuf {
    recovery_directory.join(format!("{}_targets.txt", class))
}

#[derive(clap::Parser, Debug)]
#[command(
    name = "logvault-gc",
    about = "Retention garbage collector for the logvault control plane"
)]
pub struct GcArgs {
    /// Configuration file
    #[arg(long, short, env = "LOGVAULT_CONFIG")]
    pub config: PathBuf,

    /// Mirror debug logs to stderr
    #[arg(long, short)]
    pub verbose: bool,
}

//! Logvault task worker.
//!
//! Pulls tasks from the durable queue and runs the compression, search and
//! extraction binaries for them. The same [`TaskExecutor`] seam is used by
//! the scheduler's in-process workflow backend.

pub mod cancel;
pub mod error;
pub mod executor;
pub mod worker;

pub use cancel::CancellationToken;
pub use error::{Result, WorkerError};
pub use executor::{run_command, Invocation, SubprocessExecutor, TaskExecutor};
pub use worker::QueueWorker;

#[derive(clap::Parser, Debug)]
#[command(name = "logvault-worker", about = "Task worker for the logvault control plane")]
pub struct WorkerArgs {
    /// Configuration file
    #[arg(long, short, env = "LOGVAULT_CONFIG")]
    pub config: std::path::PathBuf,

    /// Worker ID (auto-generated if not provided)
    #[arg(long)]
    pub worker_id: Option<String>,

    /// Mirror debug logs to stderr
    #[arg(long, short)]
    pub verbose: bool,
}

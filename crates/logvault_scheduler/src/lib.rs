//! Logvault scheduler library
//!
//! The job scheduler loop, the task backends it drives, the hanging-job
//! reaper, and the bridge to aggregation reducers.

pub mod backend;
pub mod client;
pub mod error;
pub mod metrics;
pub mod partition;
pub mod reaper;
pub mod reducer;
pub mod scheduler;

pub use backend::{
    BackendError, LocalWorkflowDriver, QueueBackend, ResultHandle, TaskBackend, WorkflowBackend,
    WorkflowDriver,
};
pub use client::{cancel_job, submit_job, wait_for_job};
pub use error::{Result, SchedulerError};
pub use metrics::METRICS;
pub use reaper::Reaper;
pub use reducer::{bridge, ReducerBridge, ReducerHandlerMessage, ReducerOffers};
pub use scheduler::Scheduler;

#[derive(clap::Parser, Debug)]
#[command(
    name = "logvault-scheduler",
    about = "Job scheduler for the logvault control plane"
)]
pub struct SchedulerArgs {
    /// Configuration file
    #[arg(long, short, env = "LOGVAULT_CONFIG")]
    pub config: std::path::PathBuf,

    /// Mirror debug logs to stderr
    #[arg(long, short)]
    pub verbose: bool,
}

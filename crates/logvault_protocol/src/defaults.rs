//! Canonical default values shared by the daemons.

pub const DEFAULT_DATABASE_URL: &str = "sqlite:var/data/logvault.sqlite";
pub const DEFAULT_RESULTS_CACHE_URL: &str = "sqlite:var/data/results_cache.sqlite";
pub const DEFAULT_SCHEDULER_ID: &str = "scheduler-0";
pub const DEFAULT_REDUCER_PORT: u16 = 14009;
pub const DEFAULT_ARCHIVE_DIRECTORY: &str = "var/data/archives";
pub const DEFAULT_STREAM_DIRECTORY: &str = "var/data/streams";
pub const DEFAULT_RECOVERY_DIRECTORY: &str = "var/log/garbage_collector";
pub const DEFAULT_LOGS_DIRECTORY: &str = "var/log";
pub const CANCELLED_BY_USER_MESSAGE: &str = "Cancelled by user";
pub const KILLED_BY_REAPER_MESSAGE: &str = "Killed: owning scheduler stopped";

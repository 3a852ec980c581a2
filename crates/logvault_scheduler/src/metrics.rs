//! Metrics for the scheduler process.
//!
//! Lock-free atomics, readable through [`Metrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    // Job counters
    pub jobs_submitted: AtomicU64,
    pub jobs_succeeded: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_cancelled: AtomicU64,
    pub jobs_killed: AtomicU64,
    pub jobs_rejected: AtomicU64,

    // Task counters
    pub tasks_dispatched: AtomicU64,
    pub tasks_failed: AtomicU64,

    // Error counters
    pub backend_errors: AtomicU64,
    pub db_errors: AtomicU64,

    // Reducer
    pub reducers_registered: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            jobs_submitted: AtomicU64::new(0),
            jobs_succeeded: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_cancelled: AtomicU64::new(0),
            jobs_killed: AtomicU64::new(0),
            jobs_rejected: AtomicU64::new(0),
            tasks_dispatched: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            backend_errors: AtomicU64::new(0),
            db_errors: AtomicU64::new(0),
            reducers_registered: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_jobs_submitted(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_rejected(&self) {
        self.jobs_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_jobs_killed(&self, n: u64) {
        self.jobs_killed.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_tasks_dispatched(&self, n: u64) {
        self.tasks_dispatched.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_tasks_failed(&self, n: u64) {
        self.tasks_failed.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_backend_errors(&self) {
        self.backend_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_db_errors(&self) {
        self.db_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_reducers_registered(&self) {
        self.reducers_registered.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a job that reached a terminal status.
    pub fn record_finished(&self, status: logvault_protocol::JobStatus) {
        use logvault_protocol::JobStatus;
        let counter = match status {
            JobStatus::Succeeded => &self.jobs_succeeded,
            JobStatus::Failed => &self.jobs_failed,
            JobStatus::Cancelled => &self.jobs_cancelled,
            JobStatus::Killed => &self.jobs_killed,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            jobs_killed: self.jobs_killed.load(Ordering::Relaxed),
            jobs_rejected: self.jobs_rejected.load(Ordering::Relaxed),
            tasks_dispatched: self.tasks_dispatched.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            db_errors: self.db_errors.load(Ordering::Relaxed),
            reducers_registered: self.reducers_registered.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of metrics for reading
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub jobs_killed: u64,
    pub jobs_rejected: u64,
    pub tasks_dispatched: u64,
    pub tasks_failed: u64,
    pub backend_errors: u64,
    pub db_errors: u64,
    pub reducers_registered: u64,
}

impl MetricsSnapshot {
    /// Format as human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "Jobs: {} submitted, {} succeeded, {} failed, {} cancelled, {} killed, {} rejected | \
             Tasks: {} dispatched, {} failed | Errors: {} backend, {} db",
            self.jobs_submitted,
            self.jobs_succeeded,
            self.jobs_failed,
            self.jobs_cancelled,
            self.jobs_killed,
            self.jobs_rejected,
            self.tasks_dispatched,
            self.tasks_failed,
            self.backend_errors,
            self.db_errors,
        )
    }
}

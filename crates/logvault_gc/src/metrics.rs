//! Metrics for the garbage collector.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    pub sweeps_completed: AtomicU64,
    pub sweeps_failed: AtomicU64,

    // Targets
    pub targets_buffered: AtomicU64,
    pub targets_deleted: AtomicU64,
    pub targets_missing: AtomicU64,
    pub delete_failures: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            sweeps_completed: AtomicU64::new(0),
            sweeps_failed: AtomicU64::new(0),
            targets_buffered: AtomicU64::new(0),
            targets_deleted: AtomicU64::new(0),
            targets_missing: AtomicU64::new(0),
            delete_failures: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_sweeps_completed(&self) {
        self.sweeps_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_sweeps_failed(&self) {
        self.sweeps_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_targets_buffered(&self, n: u64) {
        self.targets_buffered.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_targets_deleted(&self) {
        self.targets_deleted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_targets_missing(&self) {
        self.targets_missing.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_delete_failures(&self) {
        self.delete_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sweeps_completed: self.sweeps_completed.load(Ordering::Relaxed),
            sweeps_failed: self.sweeps_failed.load(Ordering::Relaxed),
            targets_buffered: self.targets_buffered.load(Ordering::Relaxed),
            targets_deleted: self.targets_deleted.load(Ordering::Relaxed),
            targets_missing: self.targets_missing.load(Ordering::Relaxed),
            delete_failures: self.delete_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sweeps_completed: u64,
    pub sweeps_failed: u64,
    pub targets_buffered: u64,
    pub targets_deleted: u64,
    pub targets_missing: u64,
    pub delete_failures: u64,
}

impl MetricsSnapshot {
    pub fn summary(&self) -> String {
        format!(
            "Sweeps: {} completed, {} failed | Targets: {} buffered, {} deleted, {} already gone, {} delete failures",
            self.sweeps_completed,
            self.sweeps_failed,
            self.targets_buffered,
            self.targets_deleted,
            self.targets_missing,
            self.delete_failures,
        )
    }
}

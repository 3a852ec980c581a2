//! Retention sweepers.
//!
//! Every sweep runs three phases:
//! 1. retry targets a previous sweep (or run) left in the buffer
//! 2. commit the delete of expired metadata, then buffer the physical
//!    targets it returned
//! 3. delete the physical targets and shrink the buffer
//!
//! A target is only buffered once nothing points at it any more, so a crash
//! at any point never removes an object whose metadata survived. A target
//! whose deletion fails stays buffered and is retried next sweep.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use logvault_db::{JobStore, ResultStore};
use logvault_protocol::{JobId, JobKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::buffer::TargetsBuffer;
use crate::error::{GcError, Result};
use crate::metrics::METRICS;
use crate::storage::StorageBackend;

/// One kind of expiring resource.
#[async_trait]
pub trait ResourceClass: Send + Sync {
    fn name(&self) -> &'static str;

    /// Delete metadata for everything that expired before `cutoff`. The
    /// physical targets are appended to `buffer` after the delete commits.
    /// Returns the number of targets buffered.
    async fn expire(&self, cutoff: DateTime<Utc>, buffer: &mut TargetsBuffer) -> Result<usize>;

    /// Remove one target. `Ok(false)` means it was already gone.
    async fn delete_target(&self, key: &str) -> Result<bool>;
}

/// Buffer targets whose metadata delete already committed. If this fails
/// the objects are orphaned in storage, never referenced.
fn buffer_committed(buffer: &mut TargetsBuffer, keys: &[String]) -> Result<()> {
    buffer.append(keys).map_err(|e| {
        error!(
            path = %buffer.path().display(),
            count = keys.len(),
            "Could not buffer targets of deleted metadata, they are left in storage: {}",
            e
        );
        e
    })
}

fn cutoff_secs(cutoff: DateTime<Utc>) -> u32 {
    cutoff.timestamp().clamp(0, u32::MAX as i64) as u32
}

/// Archive rows in the job store and the archive objects they describe.
pub struct ArchiveClass {
    store: JobStore,
    storage: Arc<dyn StorageBackend>,
}

impl ArchiveClass {
    pub fn new(store: JobStore, storage: Arc<dyn StorageBackend>) -> Self {
        Self { store, storage }
    }
}

#[async_trait]
impl ResourceClass for ArchiveClass {
    fn name(&self) -> &'static str {
        "archive"
    }

    async fn expire(&self, cutoff: DateTime<Utc>, buffer: &mut TargetsBuffer) -> Result<usize> {
        let expired = self.store.expire_archives(cutoff.timestamp_millis()).await?;
        if expired.is_empty() {
            return Ok(0);
        }
        let keys: Vec<String> = expired.items.iter().map(|a| a.storage_key()).collect();
        expired.commit().await?;
        buffer_committed(buffer, &keys)?;
        Ok(keys.len())
    }

    async fn delete_target(&self, key: &str) -> Result<bool> {
        self.storage.delete(key).await
    }
}

/// Cached search results: one metadata entry and one document collection
/// per job. The collection is the physical target.
pub struct SearchResultClass {
    results: ResultStore,
    jobs: JobStore,
}

impl SearchResultClass {
    pub fn new(results: ResultStore, jobs: JobStore) -> Self {
        Self { results, jobs }
    }
}

#[async_trait]
impl ResourceClass for SearchResultClass {
    fn name(&self) -> &'static str {
        "search_result"
    }

    async fn expire(&self, cutoff: DateTime<Utc>, buffer: &mut TargetsBuffer) -> Result<usize> {
        let expired = self.results.expire_results_metadata(cutoff_secs(cutoff)).await?;
        let keys: Vec<String> = expired.items.iter().map(|r| r.job_id.to_string()).collect();
        if !keys.is_empty() {
            expired.commit().await?;
            buffer_committed(buffer, &keys)?;
        }

        let pruned = self
            .jobs
            .delete_expired_jobs(cutoff.timestamp_millis(), &[JobKind::SearchOrAggregation])
            .await?;
        if !pruned.is_empty() {
            debug!(count = pruned.len(), "Pruned expired search jobs");
        }
        Ok(keys.len())
    }

    async fn delete_target(&self, key: &str) -> Result<bool> {
        let job_id: i64 = key
            .parse()
            .map_err(|_| GcError::InvalidTarget(key.to_string()))?;
        Ok(self.results.drop_results(JobId::new(job_id)).await? > 0)
    }
}

/// Extracted IR/JSON streams: ResultStore documents plus stream files.
/// Metadata is deleted first so no reader can be pointed at a removed file.
pub struct StreamClass {
    results: ResultStore,
    jobs: JobStore,
    storage: Arc<dyn StorageBackend>,
}

impl StreamClass {
    pub fn new(results: ResultStore, jobs: JobStore, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            results,
            jobs,
            storage,
        }
    }
}

#[async_trait]
impl ResourceClass for StreamClass {
    fn name(&self) -> &'static str {
        "stream"
    }

    async fn expire(&self, cutoff: DateTime<Utc>, buffer: &mut TargetsBuffer) -> Result<usize> {
        let expired = self.results.expire_streams(cutoff_secs(cutoff)).await?;
        let keys: Vec<String> = expired.items.iter().map(|s| s.path.clone()).collect();
        if !keys.is_empty() {
            expired.commit().await?;
            buffer_committed(buffer, &keys)?;
        }

        self.jobs
            .delete_expired_jobs(
                cutoff.timestamp_millis(),
                &[JobKind::ExtractIr, JobKind::ExtractJson],
            )
            .await?;
        Ok(keys.len())
    }

    async fn delete_target(&self, key: &str) -> Result<bool> {
        self.storage.delete(key).await
    }
}

// ============================================================================
// Sweeper
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Targets left over from earlier sweeps and removed now.
    pub recovered: usize,
    /// Targets newly expired this sweep.
    pub expired: usize,
    pub deleted: usize,
    pub missing: usize,
    /// Targets still buffered after the sweep.
    pub pending: usize,
}

#[derive(Debug, Default)]
struct FlushOutcome {
    deleted: usize,
    missing: usize,
    failed: usize,
}

/// About a century. Longer periods overflow timer and timestamp math.
const MAX_PERIOD_MINUTES: u64 = 100 * 365 * 24 * 60;

pub struct RetentionSweeper<C> {
    class: C,
    buffer: TargetsBuffer,
    retention: Duration,
    interval: Duration,
}

impl<C: ResourceClass> RetentionSweeper<C> {
    /// `retention_minutes` and `interval_minutes` come straight from config
    /// and are capped at about a century.
    pub fn new(class: C, buffer: TargetsBuffer, retention_minutes: u64, interval_minutes: u64) -> Self {
        let minutes = |m: u64| Duration::from_secs(m.min(MAX_PERIOD_MINUTES) * 60);
        Self {
            class,
            buffer,
            retention: minutes(retention_minutes),
            interval: minutes(interval_minutes),
        }
    }

    pub fn name(&self) -> &'static str {
        self.class.name()
    }

    pub fn pending_targets(&self) -> &[String] {
        self.buffer.targets()
    }

    pub async fn sweep_once(&mut self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep as if the current time were `now`.
    pub async fn sweep_at(&mut self, now: DateTime<Utc>) -> Result<SweepReport> {
        let leftover = self.buffer.targets().len();
        let recovered = self.flush().await?;

        let cutoff = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let expired = self.class.expire(cutoff, &mut self.buffer).await?;
        METRICS.add_targets_buffered(expired as u64);

        let flushed = self.flush().await?;
        let report = SweepReport {
            recovered: recovered.deleted + recovered.missing,
            expired,
            deleted: recovered.deleted + flushed.deleted,
            missing: recovered.missing + flushed.missing,
            pending: self.buffer.targets().len(),
        };
        if leftover > 0 {
            info!(
                class = self.class.name(),
                leftover,
                recovered = report.recovered,
                "Retried buffered targets"
            );
        }
        Ok(report)
    }

    /// Delete every buffered target, keeping the failures buffered.
    async fn flush(&mut self) -> Result<FlushOutcome> {
        let mut outcome = FlushOutcome::default();
        if self.buffer.is_empty() {
            return Ok(outcome);
        }

        let mut remaining = Vec::new();
        for key in self.buffer.targets() {
            match self.class.delete_target(key).await {
                Ok(true) => {
                    outcome.deleted += 1;
                    METRICS.inc_targets_deleted();
                }
                Ok(false) => {
                    debug!(class = self.class.name(), key = %key, "Target already gone");
                    outcome.missing += 1;
                    METRICS.inc_targets_missing();
                }
                Err(e) => {
                    warn!(class = self.class.name(), key = %key, "Failed to delete target: {}", e);
                    outcome.failed += 1;
                    METRICS.inc_delete_failures();
                    remaining.push(key.clone());
                }
            }
        }
        self.buffer.retain(remaining)?;
        Ok(outcome)
    }

    /// Sweep every `interval` until shutdown. The first sweep runs at once.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            class = self.class.name(),
            retention_minutes = self.retention.as_secs() / 60,
            interval_minutes = self.interval.as_secs() / 60,
            buffer = %self.buffer.path().display(),
            "Sweeper started"
        );
        let mut tick = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                _ = tick.tick() => {
                    match self.sweep_once().await {
                        Ok(report) => {
                            METRICS.inc_sweeps_completed();
                            if report.expired > 0 || report.recovered > 0 || report.pending > 0 {
                                info!(
                                    class = self.class.name(),
                                    expired = report.expired,
                                    deleted = report.deleted,
                                    missing = report.missing,
                                    pending = report.pending,
                                    "Sweep finished"
                                );
                            } else {
                                debug!(class = self.class.name(), "Nothing expired");
                            }
                        }
                        Err(e) => {
                            METRICS.inc_sweeps_failed();
                            warn!(class = self.class.name(), "Sweep failed: {}", e);
                        }
                    }
                }
            }
        }
        info!(class = self.class.name(), "Sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsStorage;
    use logvault_db::{ArchiveRecord, DocumentId, StreamRecord};
    use std::sync::Mutex;
    use tempfile::TempDir;

    const MINUTE_MS: i64 = 60_000;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn archive(id: &str, dataset: &str, end_ms: i64) -> ArchiveRecord {
        ArchiveRecord {
            id: id.to_string(),
            dataset: dataset.to_string(),
            begin_timestamp: end_ms - MINUTE_MS,
            end_timestamp: end_ms,
            size: 10,
            creation_time: end_ms,
        }
    }

    fn make_object(root: &std::path::Path, key: &str) {
        let dir = root.join(key);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("files"), b"x").unwrap();
    }

    #[tokio::test]
    async fn test_leftover_target_is_deleted_before_new_work() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("archives");
        make_object(&root, "42/archiveA");

        // A crash after the metadata commit left this line behind.
        let buffer_path = tmp.path().join("gc/archive_targets.txt");
        std::fs::create_dir_all(buffer_path.parent().unwrap()).unwrap();
        std::fs::write(&buffer_path, "42/archiveA\n").unwrap();

        let store = JobStore::open_in_memory().await.unwrap();
        let class = ArchiveClass::new(store, Arc::new(FsStorage::new(&root)));
        let buffer = TargetsBuffer::open(&buffer_path).unwrap();
        assert_eq!(buffer.targets(), &["42/archiveA".to_string()][..]);

        let mut sweeper = RetentionSweeper::new(class, buffer, 60, 5);
        let report = sweeper.sweep_at(now()).await.unwrap();

        assert_eq!(report.recovered, 1);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.pending, 0);
        assert!(!root.join("42/archiveA").exists());
        assert!(!buffer_path.exists());
    }

    #[tokio::test]
    async fn test_sixty_minute_archive_retention() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("archives");
        let store = JobStore::open_in_memory().await.unwrap();

        let now_ms = now().timestamp_millis();
        store
            .insert_archive(&archive("old", "", now_ms - 90 * MINUTE_MS))
            .await
            .unwrap();
        store
            .insert_archive(&archive("recent", "", now_ms - 30 * MINUTE_MS))
            .await
            .unwrap();
        make_object(&root, "old");
        make_object(&root, "recent");

        let class = ArchiveClass::new(store.clone(), Arc::new(FsStorage::new(&root)));
        let buffer = TargetsBuffer::open(tmp.path().join("archive_targets.txt")).unwrap();
        let mut sweeper = RetentionSweeper::new(class, buffer, 60, 5);

        let report = sweeper.sweep_at(now()).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.deleted, 1);

        let left: Vec<String> = store
            .list_archives_overlapping(None, None, None)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(left, vec!["recent".to_string()]);
        assert!(!root.join("old").exists());
        assert!(root.join("recent").exists());

        // Running again changes nothing.
        let again = sweeper.sweep_at(now()).await.unwrap();
        assert_eq!(again, SweepReport::default());
        assert!(root.join("recent").exists());
    }

    #[tokio::test]
    async fn test_dataset_archives_use_dataset_prefix() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("archives");
        let store = JobStore::open_in_memory().await.unwrap();
        let now_ms = now().timestamp_millis();
        store
            .insert_archive(&archive("archiveA", "42", now_ms - 120 * MINUTE_MS))
            .await
            .unwrap();
        make_object(&root, "42/archiveA");

        let class = ArchiveClass::new(store, Arc::new(FsStorage::new(&root)));
        let buffer = TargetsBuffer::open(tmp.path().join("archive_targets.txt")).unwrap();
        let mut sweeper = RetentionSweeper::new(class, buffer, 60, 5);

        sweeper.sweep_at(now()).await.unwrap();
        assert!(!root.join("42/archiveA").exists());
    }

    #[tokio::test]
    async fn test_huge_periods_are_capped() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("archives");
        let store = JobStore::open_in_memory().await.unwrap();
        let now_ms = now().timestamp_millis();
        store
            .insert_archive(&archive("a1", "", now_ms - 120 * MINUTE_MS))
            .await
            .unwrap();
        make_object(&root, "a1");

        let class = ArchiveClass::new(store.clone(), Arc::new(FsStorage::new(&root)));
        let buffer = TargetsBuffer::open(tmp.path().join("archive_targets.txt")).unwrap();
        let mut sweeper = RetentionSweeper::new(class, buffer, u64::MAX, u64::MAX);
        assert_eq!(sweeper.interval, Duration::from_secs(MAX_PERIOD_MINUTES * 60));

        let report = sweeper.sweep_at(now()).await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert!(root.join("a1").exists());
    }

    /// Fails deletes for keys in `broken` until they are cleared.
    struct Flaky {
        inner: FsStorage,
        broken: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StorageBackend for Flaky {
        fn describe(&self) -> String {
            "flaky".to_string()
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            if self.broken.lock().unwrap().iter().any(|k| k == key) {
                return Err(GcError::Delete {
                    key: key.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
                });
            }
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn test_failed_delete_stays_buffered() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("archives");
        let store = JobStore::open_in_memory().await.unwrap();
        let now_ms = now().timestamp_millis();
        for id in ["a1", "a2"] {
            store
                .insert_archive(&archive(id, "", now_ms - 120 * MINUTE_MS))
                .await
                .unwrap();
            make_object(&root, id);
        }

        let storage = Arc::new(Flaky {
            inner: FsStorage::new(&root),
            broken: Mutex::new(vec!["a2".to_string()]),
        });
        let class = ArchiveClass::new(store.clone(), storage.clone());
        let buffer_path = tmp.path().join("archive_targets.txt");
        let buffer = TargetsBuffer::open(&buffer_path).unwrap();
        let mut sweeper = RetentionSweeper::new(class, buffer, 60, 5);

        let report = sweeper.sweep_at(now()).await.unwrap();
        assert_eq!(report.expired, 2);
        assert_eq!(report.pending, 1);
        assert_eq!(sweeper.pending_targets(), &["a2".to_string()][..]);
        assert_eq!(std::fs::read_to_string(&buffer_path).unwrap(), "a2\n");
        assert!(root.join("a2").exists());

        storage.broken.lock().unwrap().clear();
        let report = sweeper.sweep_at(now()).await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.pending, 0);
        assert!(!root.join("a2").exists());
        assert!(!buffer_path.exists());
    }

    #[tokio::test]
    async fn test_rolled_back_delete_keeps_object() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("archives");
        let store = JobStore::open_in_memory().await.unwrap();
        let now_ms = now().timestamp_millis();
        store
            .insert_archive(&archive("a1", "", now_ms - 120 * MINUTE_MS))
            .await
            .unwrap();
        make_object(&root, "a1");

        // Crash before the metadata delete commits.
        let expired = store
            .expire_archives(now_ms - 60 * MINUTE_MS)
            .await
            .unwrap();
        assert_eq!(expired.items.len(), 1);
        drop(expired);

        // Restart with a longer retention: the archive is no longer expired.
        let buffer_path = tmp.path().join("archive_targets.txt");
        let class = ArchiveClass::new(store.clone(), Arc::new(FsStorage::new(&root)));
        let buffer = TargetsBuffer::open(&buffer_path).unwrap();
        let mut sweeper = RetentionSweeper::new(class, buffer, 24 * 60, 5);
        let report = sweeper.sweep_at(now()).await.unwrap();

        assert_eq!(report, SweepReport::default());
        assert_eq!(store.list_archives_overlapping(None, None, None).await.unwrap().len(), 1);
        assert!(root.join("a1").exists());
        assert!(!buffer_path.exists());
    }

    #[tokio::test]
    async fn test_metadata_commits_before_targets_are_buffered() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("archives");
        let store = JobStore::open_in_memory().await.unwrap();
        let now_ms = now().timestamp_millis();
        store
            .insert_archive(&archive("a1", "", now_ms - 120 * MINUTE_MS))
            .await
            .unwrap();
        make_object(&root, "a1");

        // A directory where the recovery file should be makes appends fail.
        let buffer_path = tmp.path().join("gc/archive_targets.txt");
        let mut buffer = TargetsBuffer::open(&buffer_path).unwrap();
        std::fs::create_dir_all(&buffer_path).unwrap();

        let class = ArchiveClass::new(store.clone(), Arc::new(FsStorage::new(&root)));
        let cutoff = now() - chrono::Duration::minutes(60);
        let err = class.expire(cutoff, &mut buffer).await.unwrap_err();

        assert!(matches!(err, GcError::Buffer { .. }));
        assert!(buffer.is_empty());
        assert!(store.list_archives_overlapping(None, None, None).await.unwrap().is_empty());
        assert!(root.join("a1").exists());
    }

    #[tokio::test]
    async fn test_search_results_drop_collections() {
        let tmp = TempDir::new().unwrap();
        let results = ResultStore::open_in_memory().await.unwrap();
        let jobs = JobStore::open_in_memory().await.unwrap();
        let now_secs = now().timestamp() as u32;

        let old_job = JobId::new(1);
        let new_job = JobId::new(2);
        results
            .insert_results_metadata(
                DocumentId::with_time(now_secs - 90 * 60),
                old_job,
                JobKind::SearchOrAggregation,
            )
            .await
            .unwrap();
        results
            .insert_results_metadata(
                DocumentId::with_time(now_secs - 10 * 60),
                new_job,
                JobKind::SearchOrAggregation,
            )
            .await
            .unwrap();
        let doc = logvault_db::ResultDocument {
            file: "/logs/app.log".to_string(),
            message: "boom".to_string(),
            timestamp: 1,
        };
        results.append_results(old_job, &[doc.clone()]).await.unwrap();
        results.append_results(new_job, &[doc.clone()]).await.unwrap();

        let class = SearchResultClass::new(results.clone(), jobs);
        let buffer = TargetsBuffer::open(tmp.path().join("search_result_targets.txt")).unwrap();
        let mut sweeper = RetentionSweeper::new(class, buffer, 60, 1);

        let report = sweeper.sweep_at(now()).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.deleted, 1);
        assert!(results.fetch_results(old_job).await.unwrap().is_empty());
        assert_eq!(results.fetch_results(new_job).await.unwrap(), vec![doc]);
    }

    #[tokio::test]
    async fn test_streams_removed_after_metadata() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("streams");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("old.jsonl"), b"{}").unwrap();
        std::fs::write(root.join("new.jsonl"), b"{}").unwrap();

        let results = ResultStore::open_in_memory().await.unwrap();
        let jobs = JobStore::open_in_memory().await.unwrap();
        let now_secs = now().timestamp() as u32;
        for (secs, path) in [(now_secs - 7200, "old.jsonl"), (now_secs - 60, "new.jsonl")] {
            results
                .insert_stream(&StreamRecord {
                    id: DocumentId::with_time(secs),
                    stream_id: path.to_string(),
                    path: path.to_string(),
                    orig_file_id: Some("file-1".to_string()),
                    begin_msg_ix: 0,
                    end_msg_ix: 10,
                    file_split_id: None,
                    is_last_chunk: true,
                })
                .await
                .unwrap();
        }

        let class = StreamClass::new(results.clone(), jobs, Arc::new(FsStorage::new(&root)));
        let buffer = TargetsBuffer::open(tmp.path().join("stream_targets.txt")).unwrap();
        let mut sweeper = RetentionSweeper::new(class, buffer, 60, 1);

        let report = sweeper.sweep_at(now()).await.unwrap();
        assert_eq!(report.expired, 1);
        assert!(!root.join("old.jsonl").exists());
        assert!(root.join("new.jsonl").exists());
        let remaining = results.find_stream_for_message("file-1", 5).await.unwrap();
        assert_eq!(remaining.map(|s| s.path), Some("new.jsonl".to_string()));
    }
}

//! Splitting a job into tasks.

use logvault_db::JobStore;
use logvault_protocol::{
    CompressionJobConfig, InputPath, JobConfig, JobKind, SearchJobConfig, TaskPayload,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PartitionError {
    /// The job can never run; it is failed with this message.
    #[error("{0}")]
    Rejected(String),

    /// Archive lookup failed; retried on the next iteration.
    #[error("Database error: {0}")]
    Db(#[from] logvault_db::DbError),
}

/// Greedily pack input paths, in order, into tasks whose summed size stays
/// within `target_task_size`. A path larger than the target gets a task of
/// its own.
pub fn compression_tasks(config: &CompressionJobConfig, target_task_size: u64) -> Vec<TaskPayload> {
    let mut batches: Vec<Vec<InputPath>> = Vec::new();
    let mut current: Vec<InputPath> = Vec::new();
    let mut current_size = 0u64;

    for path in &config.paths {
        if !current.is_empty() && current_size.saturating_add(path.size) > target_task_size {
            batches.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size = current_size.saturating_add(path.size);
        current.push(path.clone());
    }
    if !current.is_empty() {
        batches.push(current);
    }

    batches
        .into_iter()
        .map(|paths| TaskPayload::Compression {
            dataset: config.dataset.clone(),
            paths,
            timestamp_key: config.timestamp_key.clone(),
            target_archive_size: config.target_archive_size,
        })
        .collect()
}

/// One task per archive overlapping the query's time range.
pub async fn search_tasks(
    store: &JobStore,
    config: &SearchJobConfig,
) -> Result<Vec<TaskPayload>, PartitionError> {
    let archives = store
        .list_archives_overlapping(
            config.dataset.as_deref(),
            config.begin_timestamp,
            config.end_timestamp,
        )
        .await?;

    Ok(archives
        .into_iter()
        .map(|archive| TaskPayload::Search {
            archive_id: archive.id,
            query: config.clone(),
            reducer: None,
            aggregation: config.aggregation.clone(),
        })
        .collect())
}

/// Decode a stored job config and produce its task payloads. Only a search
/// may come back empty, when no archive overlaps its time range; any other
/// job with nothing to do is rejected.
pub async fn plan_job(
    store: &JobStore,
    kind: JobKind,
    blob: &[u8],
    target_task_size: u64,
) -> Result<(JobConfig, Vec<TaskPayload>), PartitionError> {
    let config = JobConfig::decode(kind, blob)
        .map_err(|e| PartitionError::Rejected(format!("Undecodable job config: {}", e)))?;

    let payloads = match &config {
        JobConfig::Compression(cfg) => compression_tasks(cfg, target_task_size),
        JobConfig::Search(cfg) => search_tasks(store, cfg).await?,
        JobConfig::ExtractIr(cfg) => vec![TaskPayload::ExtractIr(cfg.clone())],
        JobConfig::ExtractJson(cfg) => vec![TaskPayload::ExtractJson(cfg.clone())],
    };

    if payloads.is_empty() {
        let reason = match kind {
            JobKind::SearchOrAggregation => return Ok((config, payloads)),
            JobKind::Compression => "No input paths to compress",
            JobKind::ExtractIr | JobKind::ExtractJson => "Nothing to extract",
        };
        return Err(PartitionError::Rejected(reason.to_string()));
    }
    Ok((config, payloads))
}

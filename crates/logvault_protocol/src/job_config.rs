//! Typed job configurations.
//!
//! The JobStore keeps these as opaque MessagePack blobs; only the scheduler's
//! task decomposition decodes them.

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::Result;
use crate::types::JobKind;

/// One input file (or directory) of a compression job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputPath {
    pub path: String,
    /// Uncompressed size in bytes, used to balance tasks.
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionJobConfig {
    #[serde(default)]
    pub dataset: Option<String>,
    pub paths: Vec<InputPath>,
    #[serde(default)]
    pub timestamp_key: Option<String>,
    pub target_archive_size: u64,
}

/// Server-side aggregation requested by a search job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AggregationConfig {
    #[serde(default)]
    pub do_count_aggregation: bool,
    /// Bucket size in milliseconds for count-by-time aggregations.
    #[serde(default)]
    pub count_by_time_bucket_size: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchJobConfig {
    #[serde(default)]
    pub dataset: Option<String>,
    pub query_string: String,
    /// Inclusive lower bound in epoch milliseconds.
    #[serde(default)]
    pub begin_timestamp: Option<i64>,
    /// Inclusive upper bound in epoch milliseconds.
    #[serde(default)]
    pub end_timestamp: Option<i64>,
    #[serde(default)]
    pub ignore_case: bool,
    #[serde(default)]
    pub max_num_results: u32,
    #[serde(default)]
    pub aggregation: Option<AggregationConfig>,
}

impl SearchJobConfig {
    pub fn needs_reducer(&self) -> bool {
        self.aggregation.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractIrJobConfig {
    pub archive_id: String,
    pub orig_file_id: String,
    pub msg_ix: u64,
    #[serde(default)]
    pub target_uncompressed_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractJsonJobConfig {
    pub archive_id: String,
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub target_chunk_size: Option<u64>,
}

/// A decoded job configuration, one variant per [`JobKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobConfig {
    Compression(CompressionJobConfig),
    Search(SearchJobConfig),
    ExtractIr(ExtractIrJobConfig),
    ExtractJson(ExtractJsonJobConfig),
}

impl JobConfig {
    pub fn kind(&self) -> JobKind {
        match self {
            JobConfig::Compression(_) => JobKind::Compression,
            JobConfig::Search(_) => JobKind::SearchOrAggregation,
            JobConfig::ExtractIr(_) => JobKind::ExtractIr,
            JobConfig::ExtractJson(_) => JobKind::ExtractJson,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            JobConfig::Compression(cfg) => codec::encode(cfg),
            JobConfig::Search(cfg) => codec::encode(cfg),
            JobConfig::ExtractIr(cfg) => codec::encode(cfg),
            JobConfig::ExtractJson(cfg) => codec::encode(cfg),
        }
    }

    /// Decode a stored blob; the job's kind selects the schema.
    pub fn decode(kind: JobKind, blob: &[u8]) -> Result<Self> {
        Ok(match kind {
            JobKind::Compression => JobConfig::Compression(codec::decode(blob)?),
            JobKind::SearchOrAggregation => JobConfig::Search(codec::decode(blob)?),
            JobKind::ExtractIr => JobConfig::ExtractIr(codec::decode(blob)?),
            JobKind::ExtractJson => JobConfig::ExtractJson(codec::decode(blob)?),
        })
    }
}

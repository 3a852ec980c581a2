//! Time-ordered document identifiers.
//!
//! Twelve bytes: a 4-byte big-endian creation time in seconds, five random
//! bytes fixed per process, and a 3-byte big-endian counter. The lowercase
//! hex form sorts the same way as the bytes, so "created before T" is a plain
//! string comparison against [`DocumentId::lower_bound_for`].

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use crate::error::DbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId([u8; 12]);

static COUNTER: AtomicU32 = AtomicU32::new(0);
static PROCESS_UNIQUE: OnceLock<[u8; 5]> = OnceLock::new();

fn process_unique() -> [u8; 5] {
    *PROCESS_UNIQUE.get_or_init(|| {
        let random = uuid::Uuid::new_v4();
        let mut out = [0u8; 5];
        out.copy_from_slice(&random.as_bytes()[..5]);
        out
    })
}

impl DocumentId {
    pub fn new() -> Self {
        Self::with_time(chrono::Utc::now().timestamp() as u32)
    }

    /// An id stamped with `secs` since the epoch.
    pub fn with_time(secs: u32) -> Self {
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(&process_unique());
        let count = COUNTER.fetch_add(1, Ordering::Relaxed) & 0x00ff_ffff;
        bytes[9..].copy_from_slice(&count.to_be_bytes()[1..]);
        Self(bytes)
    }

    /// Smallest id that could have been created at `secs`. Every id created
    /// earlier compares strictly less.
    pub fn lower_bound_for(secs: u32) -> Self {
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        Self(bytes)
    }

    pub fn timestamp_secs(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for DocumentId {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s)
            .map_err(|e| DbError::invalid_state(format!("bad document id '{}': {}", s, e)))?;
        let bytes: [u8; 12] = raw
            .try_into()
            .map_err(|_| DbError::invalid_state(format!("document id '{}' is not 12 bytes", s)))?;
        Ok(Self(bytes))
    }
}

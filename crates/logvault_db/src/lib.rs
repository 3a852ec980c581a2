//! Persistence for the logvault control plane.
//!
//! [`JobStore`] holds jobs, tasks, archives, scheduler heartbeats and the
//! durable task queue. [`ResultStore`] is the document-style cache that query
//! tasks stream their output into. Both are SQLite databases accessed through
//! `sqlx`; every multi-row mutation runs inside one transaction.

mod error;
mod schema;
mod types;

pub mod archives;
pub mod hanging;
pub mod jobs;
pub mod results;
pub mod task_queue;

pub use error::{DbError, Result};
pub use jobs::JobOutcome;
pub use results::{DocumentId, ResultDocument, ResultStore, StreamRecord};
pub use types::*;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Open a SQLite pool for `url`, creating the file and its parent
/// directory when missing. `sqlite::memory:` pools are pinned to a single
/// connection so every query sees the same database.
pub(crate) async fn connect_sqlite(url: &str, max_connections: u32) -> Result<SqlitePool> {
    let in_memory = url.contains(":memory:");
    let mut options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        options = options.journal_mode(SqliteJournalMode::Wal);
        SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?
    };
    Ok(pool)
}

/// Rows deleted inside a still-open transaction.
///
/// The caller records `items` somewhere durable before calling
/// [`Expired::commit`]. Dropping the value rolls the delete back.
pub struct Expired<T> {
    tx: Transaction<'static, Sqlite>,
    pub items: Vec<T>,
}

impl<T> Expired<T> {
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (or create) the store and make sure its tables exist.
    pub async fn open(url: &str, max_connections: u32) -> Result<Self> {
        let pool = connect_sqlite(url, max_connections).await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        info!(url, "JobStore opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self> {
        Self::open("sqlite::memory:", 1).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    pub fn now_millis() -> i64 {
        now_millis()
    }
}

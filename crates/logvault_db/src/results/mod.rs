//! Results cache written by query and extraction tasks.
//!
//! Each search job owns one logical collection of `{file, message,
//! timestamp}` documents plus one `results_metadata` entry. Extraction jobs
//! register the stream files they produce in `streams`. Retention compares
//! document ids, which embed their creation time.

mod document_id;

pub use document_id::DocumentId;

use crate::error::Result;
use crate::{connect_sqlite, Expired};
use logvault_protocol::{JobId, JobKind};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultDocument {
    pub file: String,
    pub message: String,
    /// Epoch milliseconds of the log event.
    pub timestamp: i64,
}

/// One extracted IR or JSON stream file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub id: DocumentId,
    pub stream_id: String,
    /// Key relative to the stream storage root.
    pub path: String,
    pub orig_file_id: Option<String>,
    pub begin_msg_ix: i64,
    pub end_msg_ix: i64,
    pub file_split_id: Option<String>,
    pub is_last_chunk: bool,
}

/// A `results_metadata` entry removed by retention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredResults {
    pub id: DocumentId,
    pub job_id: JobId,
}

#[derive(Clone)]
pub struct ResultStore {
    pool: SqlitePool,
}

impl ResultStore {
    pub async fn open(url: &str, max_connections: u32) -> Result<Self> {
        let pool = connect_sqlite(url, max_connections).await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        info!(url, "ResultStore opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self> {
        Self::open("sqlite::memory:", 1).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS results_metadata (
                id TEXT PRIMARY KEY,
                job_id INTEGER NOT NULL UNIQUE,
                kind INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS result_documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL,
                file TEXT NOT NULL,
                message TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_result_documents_job ON result_documents(job_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS streams (
                id TEXT PRIMARY KEY,
                stream_id TEXT NOT NULL,
                path TEXT NOT NULL,
                orig_file_id TEXT,
                begin_msg_ix INTEGER NOT NULL,
                end_msg_ix INTEGER NOT NULL,
                file_split_id TEXT,
                is_last_chunk INTEGER NOT NULL DEFAULT 0
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_streams_file_split ON streams(file_split_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_streams_msg_range \
             ON streams(orig_file_id, begin_msg_ix, end_msg_ix)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========================================================================
    // Search results
    // ========================================================================

    /// Register the result collection of a job. Later calls for the same job
    /// keep the first registration.
    pub async fn insert_results_metadata(
        &self,
        id: DocumentId,
        job_id: JobId,
        kind: JobKind,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO results_metadata (id, job_id, kind) VALUES (?, ?, ?) \
             ON CONFLICT(job_id) DO NOTHING",
        )
        .bind(id.to_hex())
        .bind(job_id.as_i64())
        .bind(kind.as_i32())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn append_results(&self, job_id: JobId, docs: &[ResultDocument]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for doc in docs {
            sqlx::query(
                "INSERT INTO result_documents (job_id, file, message, timestamp) VALUES (?, ?, ?, ?)",
            )
            .bind(job_id.as_i64())
            .bind(&doc.file)
            .bind(&doc.message)
            .bind(doc.timestamp)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// A job's results, newest event first.
    pub async fn fetch_results(&self, job_id: JobId) -> Result<Vec<ResultDocument>> {
        let rows = sqlx::query(
            "SELECT file, message, timestamp FROM result_documents \
             WHERE job_id = ? ORDER BY timestamp DESC, id",
        )
        .bind(job_id.as_i64())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ResultDocument {
                    file: row.try_get("file")?,
                    message: row.try_get("message")?,
                    timestamp: row.try_get("timestamp")?,
                })
            })
            .collect()
    }

    /// Delete `results_metadata` entries created before `cutoff_secs`,
    /// leaving the transaction open.
    pub async fn expire_results_metadata(
        &self,
        cutoff_secs: u32,
    ) -> Result<Expired<ExpiredResults>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query("DELETE FROM results_metadata WHERE id < ? RETURNING id, job_id")
            .bind(DocumentId::lower_bound_for(cutoff_secs).to_hex())
            .fetch_all(&mut *tx)
            .await?;

        let items = rows
            .iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                Ok(ExpiredResults {
                    id: id.parse()?,
                    job_id: JobId::new(row.try_get("job_id")?),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Expired { tx, items })
    }

    /// Drop a job's result collection. Dropping a missing collection is a
    /// no-op.
    pub async fn drop_results(&self, job_id: JobId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM result_documents WHERE job_id = ?")
            .bind(job_id.as_i64())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Streams
    // ========================================================================

    pub async fn insert_stream(&self, stream: &StreamRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO streams
                (id, stream_id, path, orig_file_id, begin_msg_ix, end_msg_ix, file_split_id, is_last_chunk)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(stream.id.to_hex())
        .bind(&stream.stream_id)
        .bind(&stream.path)
        .bind(stream.orig_file_id.as_deref())
        .bind(stream.begin_msg_ix)
        .bind(stream.end_msg_ix)
        .bind(stream.file_split_id.as_deref())
        .bind(stream.is_last_chunk)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The stream chunk of `orig_file_id` containing message `msg_ix`.
    pub async fn find_stream_for_message(
        &self,
        orig_file_id: &str,
        msg_ix: i64,
    ) -> Result<Option<StreamRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, stream_id, path, orig_file_id, begin_msg_ix, end_msg_ix, file_split_id, is_last_chunk
            FROM streams
            WHERE orig_file_id = ? AND begin_msg_ix <= ? AND end_msg_ix > ?
            LIMIT 1
            "#,
        )
        .bind(orig_file_id)
        .bind(msg_ix)
        .bind(msg_ix)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_stream).transpose()
    }

    pub async fn list_streams_for_split(&self, file_split_id: &str) -> Result<Vec<StreamRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, stream_id, path, orig_file_id, begin_msg_ix, end_msg_ix, file_split_id, is_last_chunk
            FROM streams WHERE file_split_id = ? ORDER BY begin_msg_ix
            "#,
        )
        .bind(file_split_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_stream).collect()
    }

    /// Delete stream entries created before `cutoff_secs`, leaving the
    /// transaction open.
    pub async fn expire_streams(&self, cutoff_secs: u32) -> Result<Expired<StreamRecord>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            r#"
            DELETE FROM streams WHERE id < ?
            RETURNING id, stream_id, path, orig_file_id, begin_msg_ix, end_msg_ix, file_split_id, is_last_chunk
            "#,
        )
        .bind(DocumentId::lower_bound_for(cutoff_secs).to_hex())
        .fetch_all(&mut *tx)
        .await?;

        let items = rows.iter().map(row_to_stream).collect::<Result<Vec<_>>>()?;
        Ok(Expired { tx, items })
    }
}

fn row_to_stream(row: &SqliteRow) -> Result<StreamRecord> {
    let id: String = row.try_get("id")?;
    Ok(StreamRecord {
        id: id.parse()?,
        stream_id: row.try_get("stream_id")?,
        path: row.try_get("path")?,
        orig_file_id: row.try_get("orig_file_id")?,
        begin_msg_ix: row.try_get("begin_msg_ix")?,
        end_msg_ix: row.try_get("end_msg_ix")?,
        file_split_id: row.try_get("file_split_id")?,
        is_last_chunk: row.try_get("is_last_chunk")?,
    })
}

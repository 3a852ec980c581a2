//! Archive metadata rows.

use crate::error::Result;
use crate::types::ArchiveRecord;
use crate::{Expired, JobStore};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

impl JobStore {
    pub async fn insert_archive(&self, archive: &ArchiveRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO archives (id, dataset, begin_timestamp, end_timestamp, size, creation_time)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&archive.id)
        .bind(&archive.dataset)
        .bind(archive.begin_timestamp)
        .bind(archive.end_timestamp)
        .bind(archive.size)
        .bind(archive.creation_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Archives whose time range overlaps `[begin, end]`, newest first.
    /// `None` bounds are open.
    pub async fn list_archives_overlapping(
        &self,
        dataset: Option<&str>,
        begin: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<ArchiveRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, dataset, begin_timestamp, end_timestamp, size, creation_time
            FROM archives
            WHERE (? IS NULL OR dataset = ?)
              AND (? IS NULL OR end_timestamp >= ?)
              AND (? IS NULL OR begin_timestamp <= ?)
            ORDER BY end_timestamp DESC, id
            "#,
        )
        .bind(dataset)
        .bind(dataset)
        .bind(begin)
        .bind(begin)
        .bind(end)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_archive).collect()
    }

    /// Delete archive rows whose `end_timestamp` is before `cutoff_ms`,
    /// leaving the transaction open.
    pub async fn expire_archives(&self, cutoff_ms: i64) -> Result<Expired<ArchiveRecord>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            r#"
            DELETE FROM archives WHERE end_timestamp < ?
            RETURNING id, dataset, begin_timestamp, end_timestamp, size, creation_time
            "#,
        )
        .bind(cutoff_ms)
        .fetch_all(&mut *tx)
        .await?;

        let items = rows.iter().map(row_to_archive).collect::<Result<Vec<_>>>()?;
        Ok(Expired { tx, items })
    }
}

fn row_to_archive(row: &SqliteRow) -> Result<ArchiveRecord> {
    Ok(ArchiveRecord {
        id: row.try_get("id")?,
        dataset: row.try_get("dataset")?,
        begin_timestamp: row.try_get("begin_timestamp")?,
        end_timestamp: row.try_get("end_timestamp")?,
        size: row.try_get("size")?,
        creation_time: row.try_get("creation_time")?,
    })
}

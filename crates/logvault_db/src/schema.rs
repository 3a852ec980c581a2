//! Table definitions for the JobStore.

use crate::error::Result;
use crate::JobStore;
use tracing::debug;

impl JobStore {
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        sqlx::query("PRAGMA foreign_keys=ON")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind INTEGER NOT NULL,
                status INTEGER NOT NULL DEFAULT 0,
                status_msg TEXT NOT NULL DEFAULT '',
                creation_time INTEGER NOT NULL,
                start_time INTEGER,
                update_time INTEGER NOT NULL,
                duration REAL,
                config BLOB NOT NULL,
                num_tasks INTEGER NOT NULL DEFAULT 0,
                num_tasks_completed INTEGER NOT NULL DEFAULT 0,
                num_tasks_failed INTEGER NOT NULL DEFAULT 0,
                uncompressed_size INTEGER NOT NULL DEFAULT 0,
                compressed_size INTEGER NOT NULL DEFAULT 0,
                scheduler_id TEXT
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_status_kind ON jobs(status, kind, creation_time)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                status INTEGER NOT NULL DEFAULT 0,
                start_time INTEGER,
                duration REAL,
                params BLOB NOT NULL,
                uncompressed_size INTEGER NOT NULL DEFAULT 0,
                compressed_size INTEGER NOT NULL DEFAULT 0,
                error_message TEXT
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_job ON tasks(job_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS archives (
                id TEXT PRIMARY KEY,
                dataset TEXT NOT NULL DEFAULT '',
                begin_timestamp INTEGER NOT NULL,
                end_timestamp INTEGER NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                creation_time INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_archives_end ON archives(end_timestamp)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS scheduler_heartbeats (
                scheduler_id TEXT PRIMARY KEY,
                last_seen INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS task_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id INTEGER NOT NULL,
                task_id INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                state INTEGER NOT NULL DEFAULT 0,
                params BLOB NOT NULL,
                result BLOB,
                worker_id TEXT,
                enqueued_at INTEGER NOT NULL,
                claimed_at INTEGER,
                finished_at INTEGER
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_task_queue_claim ON task_queue(state, priority DESC, id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_task_queue_group ON task_queue(group_id, seq)")
            .execute(&self.pool)
            .await?;

        debug!("JobStore schema verified");
        Ok(())
    }
}

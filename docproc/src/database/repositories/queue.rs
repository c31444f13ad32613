//! SQLite-backed queue store.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::QueueEntryDbModel;
use crate::queue::{QueueDepths, QueueStore, TaskInfo, TaskPriority};

/// Keeps queue ordering in the `queue_entries` table so pending work
/// survives a restart.
pub struct SqlxQueueStore {
    pool: SqlitePool,
}

impl SqlxQueueStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueueStore for SqlxQueueStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn push(&self, task: &TaskInfo, execute_at_ms: Option<i64>) -> Result<()> {
        let body = serde_json::to_string(task)?;
        // REPLACE deletes the old row, so a re-pushed task gets a fresh seq.
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO queue_entries (
                task_id, job_id, priority, task, execute_at, ready_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.task_id)
        .bind(&task.job_id)
        .bind(task.priority.rank())
        .bind(body)
        .bind(execute_at_ms)
        .bind(execute_at_ms.unwrap_or_else(|| Utc::now().timestamp_millis()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn promote_due(&self, now_ms: i64) -> Result<usize> {
        let result = sqlx::query(
            r#"
            UPDATE queue_entries
            SET ready_at = execute_at, execute_at = NULL
            WHERE execute_at IS NOT NULL AND execute_at <= ?
            "#,
        )
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn pop(&self) -> Result<Option<TaskInfo>> {
        // A single statement, so two dequeuers can never claim the same row.
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            DELETE FROM queue_entries
            WHERE seq = (
                SELECT seq FROM queue_entries
                WHERE execute_at IS NULL
                ORDER BY priority DESC, ready_at ASC, seq ASC
                LIMIT 1
            )
            RETURNING task
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((body,)) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, task_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM queue_entries WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn depths(&self) -> Result<QueueDepths> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT priority, COUNT(*) FROM queue_entries
            WHERE execute_at IS NULL
            GROUP BY priority
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let (delayed,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM queue_entries WHERE execute_at IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;

        let mut depths = QueueDepths {
            delayed: delayed as usize,
            ..Default::default()
        };
        for (rank, count) in rows {
            let count = count as usize;
            match TaskPriority::from_rank(rank) {
                Some(TaskPriority::Critical) => depths.critical += count,
                Some(TaskPriority::High) => depths.high += count,
                Some(TaskPriority::Normal) => depths.normal += count,
                Some(TaskPriority::Low) => depths.low += count,
                None => tracing::warn!(rank, count, "Queue entries with unknown priority"),
            }
        }
        Ok(depths)
    }

    async fn load_all(&self) -> Result<Vec<TaskInfo>> {
        let rows = sqlx::query_as::<_, QueueEntryDbModel>(
            "SELECT * FROM queue_entries ORDER BY priority DESC, ready_at ASC, seq ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            match row.decode() {
                Ok(task) => tasks.push(task),
                Err(e) => tracing::warn!(task_id = %row.task_id, error = %e, "Skipping undecodable queue entry"),
            }
        }
        Ok(tasks)
    }
}

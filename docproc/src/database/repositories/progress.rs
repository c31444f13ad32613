//! SQLite-backed progress history store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::ProgressHistoryDbModel;
use crate::progress::{JobProgressHistory, ProgressStore};

pub struct SqlxProgressStore {
    pool: SqlitePool,
}

impl SqlxProgressStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Unexpired histories of one user, newest first.
    pub async fn list_for_user(&self, user_id: &str, limit: i64) -> Result<Vec<JobProgressHistory>> {
        let rows = sqlx::query_as::<_, ProgressHistoryDbModel>(
            r#"
            SELECT * FROM progress_history
            WHERE user_id = ? AND expires_at > ?
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(Utc::now().timestamp_millis())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(ProgressHistoryDbModel::decode).collect()
    }
}

#[async_trait]
impl ProgressStore for SqlxProgressStore {
    async fn save_history(&self, history: &JobProgressHistory, expires_at: DateTime<Utc>) -> Result<()> {
        let model = ProgressHistoryDbModel::from_history(history, expires_at.timestamp_millis())?;
        sqlx::query(
            r#"
            INSERT INTO progress_history (
                job_id, user_id, history, final_status, created_at, updated_at, expires_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                history = excluded.history,
                final_status = excluded.final_status,
                updated_at = excluded.updated_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(&model.job_id)
        .bind(&model.user_id)
        .bind(&model.history)
        .bind(&model.final_status)
        .bind(model.created_at)
        .bind(model.updated_at)
        .bind(model.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_history(&self, job_id: &str) -> Result<Option<JobProgressHistory>> {
        let row = sqlx::query_as::<_, ProgressHistoryDbModel>(
            "SELECT * FROM progress_history WHERE job_id = ? AND expires_at > ?",
        )
        .bind(job_id)
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(ProgressHistoryDbModel::decode).transpose()
    }

    async fn load_unfinished(&self) -> Result<Vec<JobProgressHistory>> {
        let rows = sqlx::query_as::<_, ProgressHistoryDbModel>(
            r#"
            SELECT * FROM progress_history
            WHERE final_status IS NULL AND expires_at > ?
            ORDER BY created_at
            "#,
        )
        .bind(Utc::now().timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(ProgressHistoryDbModel::decode).collect()
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM progress_history WHERE expires_at <= ?")
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

//! Row models.

use sqlx::FromRow;

use crate::progress::{JobProgressHistory, ProcessingStatus};
use crate::queue::TaskInfo;
use crate::{Error, Result};

/// A pending entry of the task queue.
#[derive(Debug, Clone, FromRow)]
pub struct QueueEntryDbModel {
    pub seq: i64,
    pub task_id: String,
    pub job_id: String,
    /// [`crate::queue::TaskPriority::rank`] of the task.
    pub priority: i64,
    /// JSON-encoded [`TaskInfo`].
    pub task: String,
    /// Epoch milliseconds; `None` once the entry is ready.
    pub execute_at: Option<i64>,
    pub ready_at: i64,
}

impl QueueEntryDbModel {
    pub fn decode(&self) -> Result<TaskInfo> {
        Ok(serde_json::from_str(&self.task)?)
    }
}

/// A persisted progress history.
#[derive(Debug, Clone, FromRow)]
pub struct ProgressHistoryDbModel {
    pub job_id: String,
    pub user_id: String,
    /// JSON-encoded [`JobProgressHistory`].
    pub history: String,
    pub final_status: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub expires_at: i64,
}

impl ProgressHistoryDbModel {
    pub fn from_history(history: &JobProgressHistory, expires_at: i64) -> Result<Self> {
        Ok(Self {
            job_id: history.job_id.clone(),
            user_id: history.user_id.clone(),
            history: serde_json::to_string(history)?,
            final_status: history
                .final_status
                .map(ProcessingStatus::as_str)
                .map(str::to_string),
            created_at: history.created_at.timestamp_millis(),
            updated_at: history.updated_at.timestamp_millis(),
            expires_at,
        })
    }

    pub fn decode(&self) -> Result<JobProgressHistory> {
        serde_json::from_str(&self.history).map_err(Error::from)
    }
}

//! Task model shared by the queue and its stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::Error;

/// Dispatch priority of a task. Higher variants are dequeued first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    /// Priorities in dequeue order.
    pub const DESCENDING: [TaskPriority; 4] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];

    /// Numeric rank used by persistent stores (higher is served first).
    pub fn rank(self) -> i64 {
        match self {
            TaskPriority::Low => 0,
            TaskPriority::Normal => 1,
            TaskPriority::High => 2,
            TaskPriority::Critical => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(TaskPriority::Low),
            1 => Some(TaskPriority::Normal),
            2 => Some(TaskPriority::High),
            3 => Some(TaskPriority::Critical),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "normal" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            other => Err(Error::validation(format!("unknown priority '{}'", other))),
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failure,
    Retry,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Cancelled
        )
    }

    /// Only tasks that have not started (or are waiting for a retry) can be cancelled.
    pub fn is_cancellable(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Retry)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
            TaskStatus::Retry => "retry",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of schedulable work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: String,
    pub job_id: String,
    /// Stage name. The queue treats it as an opaque label.
    pub stage: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Number of times the task was put back because a dependency was not done yet.
    #[serde(default)]
    pub dependency_waits: u32,
}

impl TaskInfo {
    pub fn new(
        job_id: impl Into<String>,
        stage: impl Into<String>,
        priority: TaskPriority,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            stage: stage.into(),
            priority,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: 3,
            payload,
            dependencies: Vec::new(),
            error: None,
            result: None,
            dependency_waits: 0,
        }
    }

    pub fn with_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Seconds between start and completion, when both are known.
    pub fn duration_secs(&self) -> Option<f64> {
        let started = self.started_at?;
        let finished = self.completed_at?;
        Some((finished - started).num_milliseconds().max(0) as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
        assert_eq!(TaskPriority::DESCENDING[0], TaskPriority::Critical);
    }

    #[test]
    fn test_priority_rank_roundtrip() {
        for priority in TaskPriority::DESCENDING {
            assert_eq!(TaskPriority::from_rank(priority.rank()), Some(priority));
        }
        assert_eq!(TaskPriority::from_rank(9), None);
        assert_eq!("HIGH".parse::<TaskPriority>().unwrap(), TaskPriority::High);
        assert!("urgent".parse::<TaskPriority>().is_err());
    }

    #[test]
    fn test_cancellable_statuses() {
        assert!(TaskStatus::Pending.is_cancellable());
        assert!(TaskStatus::Retry.is_cancellable());
        assert!(!TaskStatus::Running.is_cancellable());
        assert!(!TaskStatus::Success.is_cancellable());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Retry.is_terminal());
    }

    #[test]
    fn test_task_serializes_lowercase_enums() {
        let task = TaskInfo::new("job-1", "upload", TaskPriority::High, serde_json::json!({}));
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["priority"], "high");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["max_retries"], 3);
    }
}

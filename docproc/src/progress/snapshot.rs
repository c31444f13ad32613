//! Progress records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// User-visible status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    /// A stage failed and is waiting for its next attempt.
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl ProcessingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessingStatus::Completed | ProcessingStatus::Failed | ProcessingStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Retrying => "retrying",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable point-in-time progress record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub timestamp: DateTime<Utc>,
    pub job_id: String,
    pub status: ProcessingStatus,
    pub progress_percentage: f64,
    pub current_step: String,
    pub completed_steps: u32,
    pub total_steps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
    /// Steps per second since the previous snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ProgressSnapshot {
    /// The 0% snapshot written when a job is registered.
    pub fn initial(job_id: impl Into<String>, total_steps: u32) -> Self {
        Self {
            timestamp: Utc::now(),
            job_id: job_id.into(),
            status: ProcessingStatus::Pending,
            progress_percentage: 0.0,
            current_step: "queued".to_string(),
            completed_steps: 0,
            total_steps,
            eta_seconds: None,
            throughput: None,
            error_message: None,
            metadata: serde_json::Map::new(),
        }
    }
}

/// Caller-supplied fields of a progress update. `None` keeps the previous value.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub percentage: Option<f64>,
    pub step: Option<String>,
    pub completed_steps: Option<u32>,
    pub eta_seconds: Option<f64>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl ProgressUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn percentage(mut self, percentage: f64) -> Self {
        self.percentage = Some(percentage);
        self
    }

    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn completed_steps(mut self, completed: u32) -> Self {
        self.completed_steps = Some(completed);
        self
    }

    pub fn eta_seconds(mut self, eta: f64) -> Self {
        self.eta_seconds = Some(eta);
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Ordered snapshots of one job plus its final accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressHistory {
    pub job_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub snapshots: Vec<ProgressSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_status: Option<ProcessingStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_processing_time_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_step_time_seconds: Option<f64>,
}

impl JobProgressHistory {
    pub fn new(job_id: impl Into<String>, user_id: impl Into<String>, initial: ProgressSnapshot) -> Self {
        let created_at = initial.timestamp;
        Self {
            job_id: job_id.into(),
            user_id: user_id.into(),
            created_at,
            updated_at: created_at,
            snapshots: vec![initial],
            final_status: None,
            total_processing_time_seconds: None,
            average_step_time_seconds: None,
        }
    }

    pub fn latest(&self) -> Option<&ProgressSnapshot> {
        self.snapshots.last()
    }

    pub fn is_finished(&self) -> bool {
        self.final_status.is_some()
    }
}

/// Aggregate statistics across tracked jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressAnalytics {
    pub total_jobs_tracked: u64,
    pub active_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub cancelled_jobs: u64,
    /// Completed jobs over all finished jobs (0.0 - 1.0).
    pub success_rate: f64,
    /// Moving average of total processing time, in seconds.
    pub average_processing_time_seconds: f64,
    pub active_connections: usize,
    pub total_progress_updates_sent: u64,
    pub peak_concurrent_jobs: u64,
    /// Jobs registered per UTC hour, for the last 24 hours.
    pub jobs_by_hour: BTreeMap<DateTime<Utc>, u64>,
}

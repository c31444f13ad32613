//! Submission requests and job records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::queue::TaskPriority;
use crate::{Error, Result};

/// Supported document formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Pdf,
    Docx,
    Html,
    Txt,
    Latex,
}

impl DocumentType {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentType::Pdf => "pdf",
            DocumentType::Docx => "docx",
            DocumentType::Html => "html",
            DocumentType::Txt => "txt",
            DocumentType::Latex => "latex",
        }
    }

    /// Leading bytes every file of this type starts with, if the format has any.
    pub fn magic(self) -> Option<&'static [u8]> {
        match self {
            DocumentType::Pdf => Some(b"%PDF"),
            DocumentType::Docx => Some(b"PK"),
            DocumentType::Html | DocumentType::Txt | DocumentType::Latex => None,
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pdf" => Ok(DocumentType::Pdf),
            "docx" => Ok(DocumentType::Docx),
            "html" | "htm" => Ok(DocumentType::Html),
            "txt" => Ok(DocumentType::Txt),
            "latex" | "tex" => Ok(DocumentType::Latex),
            other => Err(Error::validation(format!("unsupported document type: {}", other))),
        }
    }
}

fn default_true() -> bool {
    true
}

/// A request to run a document through the processing pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRequest {
    pub document_id: String,
    /// Path of the source file on the local filesystem.
    pub file_path: String,
    pub document_type: DocumentType,
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "default_true")]
    pub extract_text: bool,
    #[serde(default = "default_true")]
    pub extract_metadata: bool,
    #[serde(default)]
    pub extract_entities: bool,
    #[serde(default)]
    pub generate_thumbnails: bool,
}

impl ProcessingRequest {
    pub fn new(
        document_id: impl Into<String>,
        file_path: impl Into<String>,
        document_type: DocumentType,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            file_path: file_path.into(),
            document_type,
            options: serde_json::Map::new(),
            extract_text: true,
            extract_metadata: true,
            extract_entities: false,
            generate_thumbnails: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.document_id.trim().is_empty() {
            return Err(Error::validation("document_id must not be empty"));
        }
        if self.document_id.contains(['/', '\\']) || self.document_id.contains("..") {
            return Err(Error::validation(format!(
                "document_id contains path separators: {}",
                self.document_id
            )));
        }
        if self.file_path.trim().is_empty() {
            return Err(Error::validation("file_path must not be empty"));
        }
        Ok(())
    }

    /// Storage key prefix for everything produced from this document.
    pub fn storage_prefix(&self) -> String {
        format!("documents/{}", self.document_id)
    }
}

/// Aggregate state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The coordinator's view of a submitted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: String,
    pub user_id: String,
    pub priority: TaskPriority,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Stage tasks in pipeline order.
    pub task_ids: Vec<String>,
    pub request: ProcessingRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobRecord {
    pub fn new(
        job_id: impl Into<String>,
        user_id: impl Into<String>,
        priority: TaskPriority,
        request: ProcessingRequest,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            user_id: user_id.into(),
            priority,
            state: JobState::Pending,
            created_at: Utc::now(),
            completed_at: None,
            task_ids: Vec::new(),
            request,
            error: None,
        }
    }

    /// Seconds from submission to completion, when the job is finished.
    pub fn processing_time_secs(&self) -> Option<f64> {
        self.completed_at
            .map(|done| (done - self.created_at).num_milliseconds().max(0) as f64 / 1000.0)
    }

    /// Move to a terminal state. Returns false if the job already finished.
    pub(crate) fn finish(&mut self, state: JobState, error: Option<String>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = state;
        self.error = error;
        self.completed_at = Some(Utc::now());
        true
    }
}

//! Pipeline stages and the handler registry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

use super::job::ProcessingRequest;
use crate::progress::{ProgressTracker, ProgressUpdate};
use crate::storage::ObjectStore;

/// Fixed stages every document goes through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStage {
    Upload,
    Validation,
    Extraction,
    Analysis,
    Indexing,
    Completion,
}

impl ProcessingStage {
    pub const ALL: [ProcessingStage; 6] = [
        ProcessingStage::Upload,
        ProcessingStage::Validation,
        ProcessingStage::Extraction,
        ProcessingStage::Analysis,
        ProcessingStage::Indexing,
        ProcessingStage::Completion,
    ];

    /// Job percentage reported when this stage starts.
    pub fn progress_percentage(self) -> f64 {
        match self {
            ProcessingStage::Upload => 10.0,
            ProcessingStage::Validation => 20.0,
            ProcessingStage::Extraction => 50.0,
            ProcessingStage::Analysis => 70.0,
            ProcessingStage::Indexing => 90.0,
            ProcessingStage::Completion => 100.0,
        }
    }

    /// 1-based position in the pipeline.
    pub fn step(self) -> u32 {
        match self {
            ProcessingStage::Upload => 1,
            ProcessingStage::Validation => 2,
            ProcessingStage::Extraction => 3,
            ProcessingStage::Analysis => 4,
            ProcessingStage::Indexing => 5,
            ProcessingStage::Completion => 6,
        }
    }

    pub fn previous(self) -> Option<ProcessingStage> {
        let idx = self.step() as usize - 1;
        idx.checked_sub(1).map(|i| Self::ALL[i])
    }

    pub fn is_last(self) -> bool {
        self == ProcessingStage::Completion
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStage::Upload => "upload",
            ProcessingStage::Validation => "validation",
            ProcessingStage::Extraction => "extraction",
            ProcessingStage::Analysis => "analysis",
            ProcessingStage::Indexing => "indexing",
            ProcessingStage::Completion => "completion",
        }
    }

    /// Human-readable step name shown in progress snapshots.
    pub fn label(self) -> &'static str {
        match self {
            ProcessingStage::Upload => "Uploading document",
            ProcessingStage::Validation => "Validating document",
            ProcessingStage::Extraction => "Extracting content",
            ProcessingStage::Analysis => "Analyzing content",
            ProcessingStage::Indexing => "Indexing document",
            ProcessingStage::Completion => "Finalizing",
        }
    }
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStage {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| crate::Error::validation(format!("unknown stage: {}", s)))
    }
}

/// Failure raised by a stage handler.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StageError {
    pub message: String,
    /// Whether another attempt could succeed.
    pub retryable: bool,
}

impl StageError {
    /// An infrastructure hiccup worth retrying.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that will repeat on every attempt, such as an invalid document.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<crate::Error> for StageError {
    fn from(err: crate::Error) -> Self {
        Self {
            retryable: err.is_transient(),
            message: err.to_string(),
        }
    }
}

/// Everything a handler gets to see about the task it runs.
#[derive(Clone)]
pub struct StageContext {
    pub job_id: String,
    pub task_id: String,
    pub stage: ProcessingStage,
    pub request: ProcessingRequest,
    pub storage: Arc<dyn ObjectStore>,
    /// Zero on the first attempt.
    pub attempt: u32,
    pub max_file_size_mb: u64,
    pub(crate) tracker: Arc<ProgressTracker>,
}

impl StageContext {
    /// Report progress within the stage, `fraction` in 0.0..=1.0.
    ///
    /// Mapped onto the span between the previous stage's percentage and this
    /// one's. Updates dropped by the rate limiter are ignored.
    pub async fn report_progress(&self, fraction: f64, step: Option<&str>) {
        let start = self
            .stage
            .previous()
            .map(|s| s.progress_percentage())
            .unwrap_or(0.0);
        let end = self.stage.progress_percentage();
        let percentage = start + (end - start) * fraction.clamp(0.0, 1.0);

        let mut update = ProgressUpdate::new().percentage(percentage);
        if let Some(step) = step {
            update = update.step(step);
        }
        if let Err(e) = self.tracker.update_progress(&self.job_id, update).await {
            trace!(job_id = %self.job_id, error = %e, "Dropped stage progress");
        }
    }
}

/// Work performed for one pipeline stage.
///
/// Return [`StageError::permanent`] for failures that retrying cannot fix so
/// the job fails without consuming its retry budget.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run the stage. The returned value is stored as the task result.
    async fn run(&self, ctx: &StageContext) -> Result<serde_json::Value, StageError>;
}

/// Lookup table from stage to handler.
#[derive(Clone, Default)]
pub struct StageRegistry {
    handlers: HashMap<ProcessingStage, Arc<dyn StageHandler>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry populated with the built-in handlers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for stage in ProcessingStage::ALL {
            registry.register(stage, super::handlers::default_handler(stage));
        }
        registry
    }

    /// Install a handler, replacing any previous one for the stage.
    pub fn register(&mut self, stage: ProcessingStage, handler: Arc<dyn StageHandler>) {
        self.handlers.insert(stage, handler);
    }

    pub fn get(&self, stage: ProcessingStage) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(&stage).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

//! Document processing pipeline.
//!
//! A submitted document becomes one task per [`ProcessingStage`], chained by
//! dependencies and executed by the [`JobCoordinator`]:
//! - `upload` copies the source into object storage
//! - `validation` rejects documents that cannot be processed
//! - `extraction`, `analysis`, `indexing` run the pluggable stage handlers
//! - `completion` finalizes the job

pub mod cleanup;
pub mod coordinator;
pub mod graph;
pub mod handlers;
pub mod job;
pub mod resources;
pub mod stage;

pub use cleanup::{CleanupConfig, CleanupReport, CleanupService};
pub use coordinator::{
    CoordinatorConfig, INTERRUPTED_MESSAGE, JobCoordinator, ProcessingMetrics, RecoveryReport,
};
pub use graph::TaskGraph;
pub use job::{DocumentType, JobRecord, JobState, ProcessingRequest};
pub use resources::{ResourceLimits, ResourceMonitor};
pub use stage::{ProcessingStage, StageContext, StageError, StageHandler, StageRegistry};

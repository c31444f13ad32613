//! Task queue: priority buckets, delayed execution, per-task status and
//! retry scheduling. The queue has no knowledge of pipeline stages.

pub mod backoff;
pub mod metrics;
pub mod store;
pub mod task;
mod task_queue;

pub use backoff::{RetryDecision, RetryPolicy, next_delay};
pub use metrics::QueueMetrics;
pub use store::{MemoryQueueStore, QueueDepths, QueueStore};
pub use task::{TaskInfo, TaskPriority, TaskStatus};
pub use task_queue::{QueueConfig, TaskOutcome, TaskQueue, TaskTransition};

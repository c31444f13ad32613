//! Progress tracking: snapshot histories, persistence and real-time delivery
//! to subscribed connections.

pub mod messages;
pub mod rate_limit;
pub mod snapshot;
pub mod store;
mod tracker;

pub use messages::{ClientMessage, ServerMessage};
pub use rate_limit::RateWindow;
pub use snapshot::{
    JobProgressHistory, ProcessingStatus, ProgressAnalytics, ProgressSnapshot, ProgressUpdate,
};
pub use store::{MemoryProgressStore, ProgressStore};
pub use tracker::{ProgressTracker, SweepReport, TrackerConfig};

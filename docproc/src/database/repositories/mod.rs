//! SQLx implementations of the persistence traits.

pub mod progress;
pub mod queue;

pub use progress::SqlxProgressStore;
pub use queue::SqlxQueueStore;

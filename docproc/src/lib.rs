//! docproc library crate.
//!
//! Job orchestration for document processing: a priority task queue with
//! delayed retries, a stage pipeline coordinator and a progress tracker with
//! real-time fan-out to subscribed connections.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod services;
pub mod storage;

pub use error::{Error, Result};

//! Application configuration.
//!
//! Every section has serde defaults, so an empty document is a valid
//! configuration. Environment variables override individual settings.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::pipeline::{CleanupConfig, CoordinatorConfig};
use crate::progress::TrackerConfig;
use crate::queue::QueueConfig;

/// Queue backend that keeps everything in process memory.
pub const MEMORY_QUEUE_URL: &str = "memory";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// `memory` or a sqlx SQLite URL such as `sqlite:docproc.db?mode=rwc`.
    #[serde(default = "default_queue_url")]
    pub queue_url: String,
    /// Root directory of the local object store.
    #[serde(default = "default_storage_root")]
    pub storage_root: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// Write the log file as JSON lines.
    #[serde(default)]
    pub log_json: bool,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

fn default_queue_url() -> String {
    "sqlite:docproc.db?mode=rwc".to_string()
}

fn default_storage_root() -> String {
    "./data/storage".to_string()
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            queue_url: default_queue_url(),
            storage_root: default_storage_root(),
            log_dir: default_log_dir(),
            log_json: false,
            queue: QueueConfig::default(),
            coordinator: CoordinatorConfig::default(),
            tracker: TrackerConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load `.env` if present, then apply `DOCPROC_*` overrides.
    ///
    /// Supported env vars:
    /// - `DOCPROC_QUEUE_URL`
    /// - `DOCPROC_STORAGE_ROOT`
    /// - `DOCPROC_LOG_DIR`
    /// - `DOCPROC_MAX_CONCURRENT_TASKS`
    /// - `DOCPROC_MAX_RETRIES`
    /// - `DOCPROC_RATE_LIMIT_PER_SECOND`
    /// - `DOCPROC_RETENTION_DAYS`
    /// - `DOCPROC_HEARTBEAT_INTERVAL_SECS`
    /// - `DOCPROC_TASK_RETENTION_HOURS`
    pub fn from_env_or_default() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str| text(key).and_then(|v| parse_number(key, &v));

        if let Some(url) = text("DOCPROC_QUEUE_URL") {
            config.queue_url = url;
        }
        if let Some(root) = text("DOCPROC_STORAGE_ROOT") {
            config.storage_root = root;
        }
        if let Some(dir) = text("DOCPROC_LOG_DIR") {
            config.log_dir = dir;
        }
        if let Some(flag) = text("DOCPROC_LOG_JSON") {
            config.log_json = matches!(
                flag.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes"
            );
        }

        if let Some(max) = number("DOCPROC_MAX_CONCURRENT_TASKS") {
            config.coordinator.limits.max_concurrent_tasks = (max as usize).max(1);
        }
        if let Some(retries) = number("DOCPROC_MAX_RETRIES") {
            let retries = retries as u32;
            config.coordinator.max_retries = retries;
            config.queue.default_max_retries = retries;
        }
        if let Some(rate) = number("DOCPROC_RATE_LIMIT_PER_SECOND") {
            config.tracker.rate_limit_per_second = rate as u32;
        }
        if let Some(days) = number("DOCPROC_RETENTION_DAYS") {
            config.tracker.retention_days = days as u32;
        }
        if let Some(secs) = number("DOCPROC_HEARTBEAT_INTERVAL_SECS") {
            let secs = secs.max(1);
            config.tracker.heartbeat_interval_secs = secs;
            config.tracker.stale_after_secs = secs.saturating_mul(2);
        }
        if let Some(hours) = number("DOCPROC_TASK_RETENTION_HOURS") {
            config.cleanup.task_retention_hours = hours;
        }

        config
    }

    pub fn uses_memory_queue(&self) -> bool {
        self.queue_url.eq_ignore_ascii_case(MEMORY_QUEUE_URL)
    }
}

fn parse_number(key: &str, value: &str) -> Option<u64> {
    match u64::from_str(value.trim()) {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::warn!(key, value, error = %e, "Ignoring invalid numeric setting");
            None
        }
    }
}

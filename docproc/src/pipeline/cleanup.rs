//! Periodic cleanup of finished tasks, jobs and expired progress history.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::coordinator::JobCoordinator;
use crate::Result;

/// Configuration for the cleanup sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Hours finished tasks and jobs stay in memory.
    #[serde(default = "default_task_retention_hours")]
    pub task_retention_hours: u64,

    /// Interval between sweeps in seconds.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_task_retention_hours() -> u64 {
    24
}

fn default_check_interval_secs() -> u64 {
    3600
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            task_retention_hours: default_task_retention_hours(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl CleanupConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task_retention_hours(mut self, hours: u64) -> Self {
        self.task_retention_hours = hours;
        self
    }

    pub fn with_check_interval_secs(mut self, secs: u64) -> Self {
        self.check_interval_secs = secs;
        self
    }

    fn retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_hours.saturating_mul(3600))
    }
}

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub tasks: usize,
    pub jobs: usize,
    pub tracked_jobs: usize,
    pub expired_histories: u64,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct CleanupService {
    config: CleanupConfig,
    coordinator: Arc<JobCoordinator>,
}

impl CleanupService {
    pub fn new(config: CleanupConfig, coordinator: Arc<JobCoordinator>) -> Self {
        Self {
            config,
            coordinator,
        }
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    /// Run a single sweep.
    pub async fn run_once(&self) -> Result<CleanupReport> {
        let retention = self.config.retention();
        let tracker = self.coordinator.tracker();

        let report = CleanupReport {
            tasks: self.coordinator.queue().purge_finished(retention),
            jobs: self.coordinator.purge_jobs(retention),
            tracked_jobs: tracker.evict_finished(retention).await,
            expired_histories: tracker.purge_expired().await?,
        };

        if report.is_empty() {
            debug!("Nothing to clean up");
        } else {
            info!(
                tasks = report.tasks,
                jobs = report.jobs,
                tracked_jobs = report.tracked_jobs,
                expired_histories = report.expired_histories,
                "Cleanup sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweep every `check_interval_secs` until cancelled.
    pub fn start(self: &Arc<Self>, cancel_token: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut check_interval =
                interval(Duration::from_secs(service.config.check_interval_secs.max(1)));
            // The first tick fires immediately; skip it so startup stays quiet.
            check_interval.tick().await;

            info!(
                retention_hours = service.config.task_retention_hours,
                interval_secs = service.config.check_interval_secs,
                "Cleanup service started"
            );

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        info!("Cleanup service shutting down");
                        break;
                    }
                    _ = check_interval.tick() => {
                        if let Err(e) = service.run_once().await {
                            error!(error = %e, "Cleanup sweep failed");
                        }
                    }
                }
            }
        })
    }
}

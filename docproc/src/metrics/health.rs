//! Health reporting and host resource sampling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use sysinfo::{
    CpuRefreshKind, MemoryRefreshKind, Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind,
    System,
};

/// Ordered from best to worst, so the aggregate is the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ComponentHealth {
    pub fn ok(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            detail: None,
        }
    }

    pub fn with_status(mut self, status: HealthStatus, detail: impl Into<String>) -> Self {
        self.status = status;
        self.detail = Some(detail.into());
        self
    }
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
    pub version: String,
    pub uptime_secs: u64,
    pub checked_at: DateTime<Utc>,
}

impl SystemHealth {
    pub fn from_components(components: Vec<ComponentHealth>, started: Instant) -> Self {
        let status = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self {
            status,
            components,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: started.elapsed().as_secs(),
            checked_at: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// One sample of host and process resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Global CPU usage as a fraction (0.0 - 1.0).
    pub cpu_fraction: f64,
    /// Resident memory of this process in megabytes.
    pub process_memory_mb: u64,
    /// Host memory in use as a fraction (0.0 - 1.0).
    pub system_memory_fraction: f64,
}

/// Samples CPU and memory through `sysinfo`.
///
/// CPU usage is computed between two refreshes, so the first sample after
/// construction reads as idle.
pub struct ResourceSampler {
    system: System,
    pid: Option<Pid>,
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler {
    pub fn new() -> Self {
        Self {
            system: System::new_with_specifics(
                RefreshKind::nothing()
                    .with_cpu(CpuRefreshKind::everything())
                    .with_memory(MemoryRefreshKind::everything()),
            ),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    pub fn sample(&mut self) -> ResourceUsage {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();

        let total_mem = self.system.total_memory();
        let used_mem = self.system.used_memory();
        let system_memory_fraction = if total_mem > 0 {
            used_mem as f64 / total_mem as f64
        } else {
            0.0
        };

        let process_memory_mb = match self.pid {
            Some(pid) => {
                self.system.refresh_processes_specifics(
                    ProcessesToUpdate::Some(&[pid]),
                    true,
                    ProcessRefreshKind::nothing().with_memory(),
                );
                self.system
                    .process(pid)
                    .map(|p| p.memory() / (1024 * 1024))
                    .unwrap_or(0)
            }
            None => 0,
        };

        ResourceUsage {
            cpu_fraction: (self.system.global_cpu_usage() as f64 / 100.0).clamp(0.0, 1.0),
            process_memory_mb,
            system_memory_fraction,
        }
    }
}

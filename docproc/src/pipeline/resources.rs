//! Resource limits and soft throttling of task dispatch.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::{ResourceSampler, ResourceUsage};

/// Limits applied to stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Tasks executing at the same time.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Process memory above which dispatch is throttled.
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    /// Per-task execution timeout, and the lifetime after which an unfinished
    /// job is failed by the watchdog.
    #[serde(default = "default_max_processing_time_minutes")]
    pub max_processing_time_minutes: u64,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    /// CPU fraction (0.0 - 1.0) above which dispatch is throttled.
    #[serde(default = "default_cpu_throttle_threshold")]
    pub cpu_throttle_threshold: f64,
}

fn default_max_concurrent_tasks() -> usize {
    10
}

fn default_max_memory_mb() -> u64 {
    2048
}

fn default_max_processing_time_minutes() -> u64 {
    60
}

fn default_max_file_size_mb() -> u64 {
    100
}

fn default_cpu_throttle_threshold() -> f64 {
    0.8
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_memory_mb: default_max_memory_mb(),
            max_processing_time_minutes: default_max_processing_time_minutes(),
            max_file_size_mb: default_max_file_size_mb(),
            cpu_throttle_threshold: default_cpu_throttle_threshold(),
        }
    }
}

impl ResourceLimits {
    pub fn max_processing_time(&self) -> Duration {
        Duration::from_secs(self.max_processing_time_minutes.saturating_mul(60))
    }
}

/// Delay inserted before each dispatch while the host is under pressure.
pub const THROTTLE_DELAY: Duration = Duration::from_secs(2);

/// Default sampling interval.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

/// Tracks resource pressure and exposes the current dispatch delay.
pub struct ResourceMonitor {
    limits: ResourceLimits,
    throttle_delay_ms: AtomicU64,
    last_usage: Mutex<ResourceUsage>,
}

impl ResourceMonitor {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            throttle_delay_ms: AtomicU64::new(0),
            last_usage: Mutex::new(ResourceUsage::default()),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Record a sample and update the throttle. Returns whether dispatch is
    /// now throttled.
    pub fn evaluate(&self, usage: ResourceUsage) -> bool {
        *self.last_usage.lock() = usage;

        let cpu_hot = usage.cpu_fraction > self.limits.cpu_throttle_threshold;
        let memory_hot = usage.process_memory_mb > self.limits.max_memory_mb;
        let throttled = cpu_hot || memory_hot;

        let delay = if throttled {
            THROTTLE_DELAY.as_millis() as u64
        } else {
            0
        };
        let previous = self.throttle_delay_ms.swap(delay, Ordering::SeqCst);

        match (previous > 0, throttled) {
            (false, true) => warn!(
                cpu = usage.cpu_fraction,
                memory_mb = usage.process_memory_mb,
                "Resource pressure, throttling task dispatch"
            ),
            (true, false) => info!(
                cpu = usage.cpu_fraction,
                memory_mb = usage.process_memory_mb,
                "Resource pressure cleared"
            ),
            _ => {}
        }
        throttled
    }

    /// Delay to wait before admitting the next task.
    pub fn dispatch_delay(&self) -> Duration {
        Duration::from_millis(self.throttle_delay_ms.load(Ordering::SeqCst))
    }

    pub fn is_throttled(&self) -> bool {
        self.throttle_delay_ms.load(Ordering::SeqCst) > 0
    }

    pub fn last_usage(&self) -> ResourceUsage {
        *self.last_usage.lock()
    }

    /// Sample the host every `interval` until cancelled.
    pub fn start_monitoring(
        self: &Arc<Self>,
        interval: Duration,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut sampler = ResourceSampler::new();
            loop {
                let usage = sampler.sample();
                monitor.evaluate(usage);

                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Resource monitor shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(cpu: f64, memory_mb: u64) -> ResourceUsage {
        ResourceUsage {
            cpu_fraction: cpu,
            process_memory_mb: memory_mb,
            system_memory_fraction: 0.5,
        }
    }

    #[test]
    fn test_throttle_on_cpu_and_memory() {
        let monitor = ResourceMonitor::new(ResourceLimits::default());
        assert_eq!(monitor.dispatch_delay(), Duration::ZERO);

        assert!(monitor.evaluate(usage(0.95, 100)));
        assert_eq!(monitor.dispatch_delay(), THROTTLE_DELAY);

        assert!(!monitor.evaluate(usage(0.2, 100)));
        assert_eq!(monitor.dispatch_delay(), Duration::ZERO);

        assert!(monitor.evaluate(usage(0.2, 4096)));
        assert!(monitor.is_throttled());
        assert_eq!(monitor.last_usage().process_memory_mb, 4096);
    }

    #[test]
    fn test_limits_defaults() {
        let limits: ResourceLimits = serde_json::from_str("{}").unwrap();
        assert_eq!(limits.max_concurrent_tasks, 10);
        assert_eq!(limits.max_processing_time(), Duration::from_secs(3600));
        assert_eq!(limits.cpu_throttle_threshold, 0.8);
    }
}

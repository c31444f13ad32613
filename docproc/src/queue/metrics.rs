//! Task queue counters.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::store::QueueDepths;
use crate::metrics::Ema;

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub tasks_enqueued: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub tasks_cancelled: u64,
    pub depths: QueueDepths,
    /// Exponential moving average of successful task durations (α = 0.1).
    pub average_task_duration_secs: f64,
    pub failed_tasks_last_hour: usize,
}

#[derive(Default)]
struct RecorderState {
    enqueued: u64,
    completed: u64,
    failed: u64,
    retried: u64,
    cancelled: u64,
    duration: Ema,
    recent_failures: VecDeque<DateTime<Utc>>,
}

impl RecorderState {
    fn prune_failures(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::hours(1);
        while let Some(front) = self.recent_failures.front() {
            if *front >= cutoff {
                break;
            }
            self.recent_failures.pop_front();
        }
    }
}

/// Thread-safe recorder behind [`QueueMetrics`].
#[derive(Default)]
pub(crate) struct MetricsRecorder {
    state: Mutex<RecorderState>,
}

impl MetricsRecorder {
    pub(crate) fn record_enqueued(&self) {
        self.state.lock().enqueued += 1;
    }

    pub(crate) fn record_completed(&self, duration_secs: Option<f64>) {
        let mut state = self.state.lock();
        state.completed += 1;
        if let Some(secs) = duration_secs {
            state.duration.record(secs);
        }
    }

    pub(crate) fn record_failed(&self, at: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.failed += 1;
        state.recent_failures.push_back(at);
        state.prune_failures(at);
    }

    pub(crate) fn record_retried(&self) {
        self.state.lock().retried += 1;
    }

    pub(crate) fn record_cancelled(&self) {
        self.state.lock().cancelled += 1;
    }

    pub(crate) fn snapshot(&self, depths: QueueDepths, now: DateTime<Utc>) -> QueueMetrics {
        let mut state = self.state.lock();
        state.prune_failures(now);
        QueueMetrics {
            tasks_enqueued: state.enqueued,
            tasks_completed: state.completed,
            tasks_failed: state.failed,
            tasks_retried: state.retried,
            tasks_cancelled: state.cancelled,
            depths,
            average_task_duration_secs: state.duration.value(),
            failed_tasks_last_hour: state.recent_failures.len(),
        }
    }
}

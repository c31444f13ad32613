//! Priority task queue with delayed execution and retry scheduling.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::backoff::{RetryDecision, RetryPolicy};
use super::metrics::{MetricsRecorder, QueueMetrics};
use super::store::{MemoryQueueStore, QueueStore};
use super::task::{TaskInfo, TaskStatus};
use crate::{Error, Result};

/// Configuration for the task queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Retry budget given to tasks that do not set their own.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Backoff applied between retries.
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    /// How often a blocked dequeue re-checks the delayed set, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_retries: default_max_retries(),
            retry_policy: RetryPolicy::default(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Result reported by whoever ran a task.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success(Option<serde_json::Value>),
    Failure { error: String, retryable: bool },
}

impl TaskOutcome {
    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            retryable: true,
        }
    }

    pub fn permanent_failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            retryable: false,
        }
    }
}

/// What `mark_complete` did with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTransition {
    Completed,
    /// Re-enqueued with a delay; `attempt` is the new retry count.
    Retry { attempt: u32, delay: Duration },
    /// Terminally failed. `exhausted` is false for non-retryable errors.
    Failed { exhausted: bool },
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Priority-ordered, delayable work queue.
///
/// Task records live in an in-memory registry; the [`QueueStore`] holds the
/// ordering of tasks that still have to be handed out.
pub struct TaskQueue {
    config: QueueConfig,
    store: Arc<dyn QueueStore>,
    tasks: DashMap<String, TaskInfo>,
    initialized: AtomicBool,
    notify: Arc<Notify>,
    metrics: MetricsRecorder,
}

impl TaskQueue {
    /// Create a queue backed by an in-memory store.
    pub fn new(config: QueueConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryQueueStore::new()))
    }

    pub fn with_store(config: QueueConfig, store: Arc<dyn QueueStore>) -> Self {
        Self {
            config,
            store,
            tasks: DashMap::new(),
            initialized: AtomicBool::new(false),
            notify: Arc::new(Notify::new()),
            metrics: MetricsRecorder::default(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Connect to the store and rebuild the registry from persisted entries.
    pub async fn initialize(&self) -> Result<()> {
        self.store.ping().await?;

        let persisted = self.store.load_all().await?;
        let recovered = persisted.len();
        for task in persisted {
            self.tasks.entry(task.task_id.clone()).or_insert(task);
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!(recovered, "Task queue initialized");
        Ok(())
    }

    /// Stop accepting work and wake any blocked dequeuers.
    pub fn shutdown(&self) {
        if self.initialized.swap(false, Ordering::SeqCst) {
            self.notify.notify_waiters();
            info!("Task queue shut down");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(Error::QueueNotInitialized)
        }
    }

    /// Insert a task for immediate execution, or after `delay` when it is non-zero.
    pub async fn enqueue(&self, mut task: TaskInfo, delay: Option<Duration>) -> Result<bool> {
        self.ensure_initialized()?;

        let execute_at = delay
            .filter(|d| !d.is_zero())
            .map(|d| now_ms() + d.as_millis() as i64);
        if task.status != TaskStatus::Retry {
            task.status = TaskStatus::Pending;
        }

        self.store.push(&task, execute_at).await?;

        debug!(
            task_id = %task.task_id,
            job_id = %task.job_id,
            priority = %task.priority,
            delayed = execute_at.is_some(),
            "Task enqueued"
        );
        self.tasks.insert(task.task_id.clone(), task);
        self.metrics.record_enqueued();
        if execute_at.is_none() {
            self.notify.notify_one();
        }
        Ok(true)
    }

    /// Take the next ready task, waiting up to `timeout` for one to appear.
    ///
    /// Due delayed tasks are promoted before every pop. Returns `None` when the
    /// timeout elapses. The returned task keeps its queued status until
    /// [`TaskQueue::mark_running`] is called.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<TaskInfo>> {
        let deadline = Instant::now() + timeout;
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(1));

        loop {
            self.ensure_initialized()?;
            self.store.promote_due(now_ms()).await?;

            while let Some(popped) = self.store.pop().await? {
                let current = self
                    .tasks
                    .entry(popped.task_id.clone())
                    .or_insert(popped)
                    .clone();
                if current.status.is_cancellable() {
                    return Ok(Some(current));
                }
                debug!(task_id = %current.task_id, status = %current.status, "Skipping stale queue entry");
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(poll_interval);
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Move a dequeued task to Running.
    pub fn mark_running(&self, task_id: &str) -> Result<TaskInfo> {
        let mut entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| Error::not_found("Task", task_id))?;
        if !entry.status.is_cancellable() {
            return Err(Error::invalid_transition(entry.status, TaskStatus::Running));
        }
        entry.status = TaskStatus::Running;
        entry.started_at = Some(Utc::now());
        Ok(entry.clone())
    }

    pub fn get_status(&self, task_id: &str) -> Option<TaskInfo> {
        self.tasks.get(task_id).map(|t| t.clone())
    }

    /// Cancel a task that has not started yet.
    ///
    /// Returns false when the task is unknown or already running/finished.
    pub async fn cancel(&self, task_id: &str) -> Result<bool> {
        {
            let Some(mut entry) = self.tasks.get_mut(task_id) else {
                return Ok(false);
            };
            if !entry.status.is_cancellable() {
                return Ok(false);
            }
            entry.status = TaskStatus::Cancelled;
            entry.completed_at = Some(Utc::now());
        }

        self.store.remove(task_id).await?;
        self.metrics.record_cancelled();
        debug!(task_id, "Task cancelled");
        Ok(true)
    }

    /// Tasks still waiting in the queue (pending or scheduled for retry).
    pub fn queued_tasks(&self) -> Vec<TaskInfo> {
        self.tasks
            .iter()
            .filter(|t| t.status.is_cancellable())
            .map(|t| t.clone())
            .collect()
    }

    /// Record the outcome of a running task and apply the retry policy.
    pub async fn mark_complete(&self, task_id: &str, outcome: TaskOutcome) -> Result<TaskTransition> {
        let now = Utc::now();
        let (transition, retry_task) = {
            let mut entry = self
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| Error::not_found("Task", task_id))?;
            if entry.status != TaskStatus::Running {
                let target = match outcome {
                    TaskOutcome::Success(_) => TaskStatus::Success,
                    TaskOutcome::Failure { .. } => TaskStatus::Failure,
                };
                return Err(Error::invalid_transition(entry.status, target));
            }

            match outcome {
                TaskOutcome::Success(result) => {
                    entry.status = TaskStatus::Success;
                    entry.completed_at = Some(now);
                    entry.result = result;
                    entry.error = None;
                    self.metrics.record_completed(entry.duration_secs());
                    (TaskTransition::Completed, None)
                }
                TaskOutcome::Failure { error, retryable } => {
                    let decision = self.config.retry_policy.transition(
                        entry.retry_count,
                        entry.max_retries,
                        retryable,
                    );
                    entry.error = Some(error);
                    match decision {
                        RetryDecision::Retry { attempt, delay } => {
                            entry.retry_count = attempt;
                            entry.status = TaskStatus::Retry;
                            entry.started_at = None;
                            (
                                TaskTransition::Retry { attempt, delay },
                                Some((entry.clone(), delay)),
                            )
                        }
                        RetryDecision::Exhausted | RetryDecision::Permanent => {
                            entry.status = TaskStatus::Failure;
                            entry.completed_at = Some(now);
                            self.metrics.record_failed(now);
                            (
                                TaskTransition::Failed {
                                    exhausted: decision == RetryDecision::Exhausted,
                                },
                                None,
                            )
                        }
                    }
                }
            }
        };

        if let Some((task, delay)) = retry_task {
            let execute_at = now_ms() + delay.as_millis() as i64;
            if let Err(e) = self.store.push(&task, Some(execute_at)).await {
                warn!(task_id, error = %e, "Failed to schedule retry, failing task");
                if let Some(mut entry) = self.tasks.get_mut(task_id) {
                    entry.status = TaskStatus::Failure;
                    entry.completed_at = Some(Utc::now());
                }
                self.metrics.record_failed(Utc::now());
                return Err(e);
            }
            self.metrics.record_retried();
            info!(
                task_id,
                attempt = task.retry_count,
                max_retries = task.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Task scheduled for retry"
            );
        }

        Ok(transition)
    }

    /// Put a dequeued task back because its dependencies are not done yet.
    ///
    /// Returns the number of times the task has waited so far.
    pub async fn requeue_waiting(&self, task_id: &str, delay: Duration) -> Result<u32> {
        let task = {
            let mut entry = self
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| Error::not_found("Task", task_id))?;
            if !entry.status.is_cancellable() {
                return Err(Error::invalid_transition(entry.status, TaskStatus::Pending));
            }
            entry.dependency_waits += 1;
            entry.clone()
        };

        let execute_at = (!delay.is_zero()).then(|| now_ms() + delay.as_millis() as i64);
        self.store.push(&task, execute_at).await?;
        Ok(task.dependency_waits)
    }

    /// Fail a task that has not started, without consulting the retry policy.
    pub async fn force_fail(&self, task_id: &str, error: impl Into<String>) -> Result<bool> {
        let now = Utc::now();
        {
            let Some(mut entry) = self.tasks.get_mut(task_id) else {
                return Ok(false);
            };
            if entry.status.is_terminal() {
                return Ok(false);
            }
            entry.status = TaskStatus::Failure;
            entry.error = Some(error.into());
            entry.completed_at = Some(now);
        }
        self.store.remove(task_id).await?;
        self.metrics.record_failed(now);
        Ok(true)
    }

    /// Drop finished task records that completed before `older_than` ago.
    pub fn purge_finished(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let before = self.tasks.len();
        self.tasks.retain(|_, task| {
            !(task.status.is_terminal() && task.completed_at.is_some_and(|at| at < cutoff))
        });
        before.saturating_sub(self.tasks.len())
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub async fn metrics(&self) -> Result<QueueMetrics> {
        let depths = self.store.depths().await?;
        Ok(self.metrics.snapshot(depths, Utc::now()))
    }

    /// Check that the backing store is reachable.
    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }
}

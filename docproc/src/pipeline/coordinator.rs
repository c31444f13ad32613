//! Job coordinator: turns submissions into stage tasks, admits them under the
//! concurrency limit and drives job state from task outcomes.
//!
//! The scheduling loop is the only place that admits work. Within a job,
//! ordering comes from the dependency check at admission: a task whose
//! predecessor has not succeeded goes back to the queue with a delay.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::graph::TaskGraph;
use super::job::{JobRecord, JobState, ProcessingRequest};
use super::resources::{ResourceLimits, ResourceMonitor};
use super::stage::{ProcessingStage, StageContext, StageError, StageRegistry};
use crate::metrics::{Ema, ResourceUsage};
use crate::progress::{ProcessingStatus, ProgressTracker, ProgressUpdate};
use crate::queue::{
    QueueMetrics, TaskInfo, TaskOutcome, TaskPriority, TaskQueue, TaskStatus, TaskTransition,
};
use crate::storage::ObjectStore;
use crate::{Error, Result};

/// Failure message recorded for jobs cut off by a restart.
pub const INTERRUPTED_MESSAGE: &str = "interrupted by service restart";

/// Outcome of [`JobCoordinator::recover_interrupted`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub failed_jobs: usize,
    pub cancelled_tasks: usize,
}

/// Configuration for the job coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Retry budget of every stage task.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before re-checking a task whose dependencies are not done.
    #[serde(default = "default_dependency_delay_ms")]
    pub dependency_delay_ms: u64,
    /// Dependency re-checks after which a task is considered deadlocked.
    #[serde(default = "default_max_dependency_waits")]
    pub max_dependency_waits: u32,
    /// Longest a single dequeue blocks.
    #[serde(default = "default_dequeue_timeout_ms")]
    pub dequeue_timeout_ms: u64,
    /// Pause after a queue error.
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
    /// How long shutdown waits for running stages.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_dependency_delay_ms() -> u64 {
    5000
}

fn default_max_dependency_waits() -> u32 {
    720
}

fn default_dequeue_timeout_ms() -> u64 {
    1000
}

fn default_error_backoff_ms() -> u64 {
    5000
}

fn default_watchdog_interval_secs() -> u64 {
    60
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            max_retries: default_max_retries(),
            dependency_delay_ms: default_dependency_delay_ms(),
            max_dependency_waits: default_max_dependency_waits(),
            dequeue_timeout_ms: default_dequeue_timeout_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_dependency_wait(mut self, delay: Duration, max_waits: u32) -> Self {
        self.dependency_delay_ms = delay.as_millis() as u64;
        self.max_dependency_waits = max_waits;
        self
    }

    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

/// Counters reported by [`JobCoordinator::processing_metrics`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingMetrics {
    pub active_tasks: usize,
    pub tracked_jobs: usize,
    pub total_processed: u64,
    pub total_failed: u64,
    pub average_task_time_seconds: f64,
    pub throttled: bool,
    pub resource_usage: ResourceUsage,
    pub resource_limits: ResourceLimits,
    pub queue: QueueMetrics,
}

#[derive(Default)]
struct ProcessingStats {
    total_processed: u64,
    total_failed: u64,
    task_time: Ema,
}

enum DependencyState {
    Satisfied,
    Waiting,
    Broken(String),
}

/// Decrements the active-task counter when a stage task ends, panics included.
struct ActiveTaskGuard(Arc<AtomicUsize>);

impl ActiveTaskGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for ActiveTaskGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs document jobs through the stage pipeline.
pub struct JobCoordinator {
    config: CoordinatorConfig,
    queue: Arc<TaskQueue>,
    tracker: Arc<ProgressTracker>,
    registry: StageRegistry,
    storage: Arc<dyn ObjectStore>,
    monitor: Arc<ResourceMonitor>,
    jobs: DashMap<String, JobRecord>,
    user_jobs: DashMap<String, Vec<String>>,
    semaphore: Arc<Semaphore>,
    active_tasks: Arc<AtomicUsize>,
    stats: Mutex<ProcessingStats>,
}

impl JobCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        queue: Arc<TaskQueue>,
        tracker: Arc<ProgressTracker>,
        registry: StageRegistry,
        storage: Arc<dyn ObjectStore>,
    ) -> Self {
        let permits = config.limits.max_concurrent_tasks.max(1);
        Self {
            monitor: Arc::new(ResourceMonitor::new(config.limits.clone())),
            semaphore: Arc::new(Semaphore::new(permits)),
            config,
            queue,
            tracker,
            registry,
            storage,
            jobs: DashMap::new(),
            user_jobs: DashMap::new(),
            active_tasks: Arc::new(AtomicUsize::new(0)),
            stats: Mutex::new(ProcessingStats::default()),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Stage tasks currently executing.
    pub fn active_task_count(&self) -> usize {
        self.active_tasks.load(Ordering::SeqCst)
    }

    /// Accept a document for processing and return its job id.
    ///
    /// The job is registered with the progress tracker before this returns,
    /// so the id can be subscribed to immediately.
    pub async fn submit_job(
        &self,
        request: ProcessingRequest,
        user_id: &str,
        priority: TaskPriority,
    ) -> Result<String> {
        request.validate()?;
        if user_id.trim().is_empty() {
            return Err(Error::validation("user_id must not be empty"));
        }

        let job_id = Uuid::new_v4().to_string();
        let payload = serde_json::to_value(&request)?;
        let graph = TaskGraph::linear(
            &job_id,
            &ProcessingStage::ALL,
            priority,
            self.config.max_retries,
            payload,
        );
        graph.validate()?;

        let mut record = JobRecord::new(&job_id, user_id, priority, request);
        record.task_ids = graph.tasks().iter().map(|t| t.task_id.clone()).collect();

        let mut metadata = serde_json::Map::new();
        metadata.insert("documentId".into(), record.request.document_id.clone().into());
        metadata.insert(
            "documentType".into(),
            record.request.document_type.as_str().into(),
        );
        metadata.insert("priority".into(), priority.as_str().into());

        self.tracker
            .create_job(&job_id, graph.len() as u32, user_id, Some(metadata))
            .await?;
        self.jobs.insert(job_id.clone(), record);
        self.user_jobs
            .entry(user_id.to_string())
            .or_default()
            .push(job_id.clone());

        for task in graph.into_tasks() {
            if let Err(e) = self.queue.enqueue(task, None).await {
                error!(job_id = %job_id, error = %e, "Failed to enqueue stage task");
                self.fail_job(&job_id, format!("Failed to schedule processing: {}", e))
                    .await;
                return Err(e);
            }
        }

        info!(job_id = %job_id, user_id, priority = %priority, "Job submitted");
        Ok(job_id)
    }

    /// Cancel a job on behalf of its owner.
    ///
    /// Tasks that have not started are cancelled; a running stage finishes
    /// but its result is discarded. Returns false if the job already finished.
    pub async fn cancel_job(&self, job_id: &str, user_id: &str) -> Result<bool> {
        let (task_ids, document_id) = {
            let mut job = self
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| Error::not_found("Job", job_id))?;
            if job.user_id != user_id {
                return Err(Error::Forbidden(format!(
                    "job {} does not belong to user {}",
                    job_id, user_id
                )));
            }
            if !job.finish(JobState::Cancelled, None) {
                return Ok(false);
            }
            (job.task_ids.clone(), job.request.document_id.clone())
        };

        let cancelled = self.cancel_pending_tasks(&task_ids).await;
        self.report_status(
            job_id,
            ProcessingStatus::Cancelled,
            Some("Job cancelled by user".to_string()),
        )
        .await;
        self.tracker.notify_user(
            user_id,
            "job_cancelled",
            json!({ "jobId": job_id, "documentId": document_id }),
        );

        info!(job_id, cancelled_tasks = cancelled, "Job cancelled");
        Ok(true)
    }

    pub fn job_status(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.get(job_id).map(|j| j.clone())
    }

    /// Jobs of a user, oldest first.
    pub fn list_jobs(&self, user_id: &str) -> Vec<JobRecord> {
        let ids = self
            .user_jobs
            .get(user_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.job_status(id)).collect()
    }

    pub async fn processing_metrics(&self) -> Result<ProcessingMetrics> {
        let queue = self.queue.metrics().await?;
        let stats = self.stats.lock();
        Ok(ProcessingMetrics {
            active_tasks: self.active_task_count(),
            tracked_jobs: self.jobs.len(),
            total_processed: stats.total_processed,
            total_failed: stats.total_failed,
            average_task_time_seconds: stats.task_time.value(),
            throttled: self.monitor.is_throttled(),
            resource_usage: self.monitor.last_usage(),
            resource_limits: self.config.limits.clone(),
            queue,
        })
    }

    /// Start the scheduling loop.
    pub fn start(self: &Arc<Self>, cancel_token: CancellationToken) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.run(cancel_token).await })
    }

    async fn run(self: Arc<Self>, cancel_token: CancellationToken) {
        let dequeue_timeout = Duration::from_millis(self.config.dequeue_timeout_ms.max(1));
        let error_backoff = Duration::from_millis(self.config.error_backoff_ms);
        let mut running: JoinSet<()> = JoinSet::new();

        info!(
            max_concurrent_tasks = self.config.limits.max_concurrent_tasks,
            "Job coordinator started"
        );

        loop {
            while let Some(joined) = running.try_join_next() {
                if let Err(e) = joined
                    && e.is_panic()
                {
                    error!(error = %e, "Stage task panicked");
                }
            }

            let permit = tokio::select! {
                _ = cancel_token.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let throttle = self.monitor.dispatch_delay();
            if !throttle.is_zero() {
                debug!(delay_ms = throttle.as_millis() as u64, "Dispatch throttled");
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = tokio::time::sleep(throttle) => {}
                }
            }

            // Not raced against cancellation: a dropped dequeue could lose a popped task.
            let task = match self.queue.dequeue(dequeue_timeout).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    if cancel_token.is_cancelled() {
                        break;
                    }
                    continue;
                }
                Err(Error::QueueNotInitialized) if cancel_token.is_cancelled() => break,
                Err(e) => {
                    error!(error = %e, "Failed to dequeue task");
                    tokio::select! {
                        _ = cancel_token.cancelled() => break,
                        _ = tokio::time::sleep(error_backoff) => {}
                    }
                    continue;
                }
            };

            let Some(stage) = self.admit(&task).await else {
                continue;
            };

            let task = match self.queue.mark_running(&task.task_id) {
                Ok(task) => task,
                Err(e) => {
                    debug!(task_id = %task.task_id, error = %e, "Task no longer runnable");
                    continue;
                }
            };

            let guard = ActiveTaskGuard::enter(&self.active_tasks);
            let coordinator = self.clone();
            running.spawn(async move {
                let _permit = permit;
                let _guard = guard;
                coordinator.execute(task, stage).await;
            });
        }

        info!(running = running.len(), "Job coordinator stopping");
        let shutdown_timeout = Duration::from_secs(self.config.shutdown_timeout_secs);
        let drained = tokio::time::timeout(shutdown_timeout, async {
            while running.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = running.len(),
                "Stage tasks did not finish in time, aborting"
            );
            running.abort_all();
        }
        info!("Job coordinator stopped");
    }

    /// Settle work left over by a previous process.
    ///
    /// Job records only live in memory, so jobs that were unfinished at the
    /// last shutdown cannot resume. Their persisted progress is closed as
    /// Failed and their recovered queue entries are cancelled. Call after
    /// [`TaskQueue::initialize`] and before [`JobCoordinator::start`].
    pub async fn recover_interrupted(&self) -> Result<RecoveryReport> {
        let failed = self.tracker.fail_interrupted(INTERRUPTED_MESSAGE).await?;

        let mut cancelled_tasks = 0;
        for task in self.queue.queued_tasks() {
            if self.jobs.contains_key(&task.job_id) {
                continue;
            }
            if self.queue.cancel(&task.task_id).await? {
                cancelled_tasks += 1;
            }
        }

        let report = RecoveryReport {
            failed_jobs: failed.len(),
            cancelled_tasks,
        };
        if report.failed_jobs > 0 || report.cancelled_tasks > 0 {
            warn!(
                failed_jobs = report.failed_jobs,
                cancelled_tasks = report.cancelled_tasks,
                "Closed jobs interrupted by restart"
            );
        }
        Ok(report)
    }

    /// Decide whether a dequeued task may run now.
    async fn admit(&self, task: &TaskInfo) -> Option<ProcessingStage> {
        let job_state = self.jobs.get(&task.job_id).map(|j| j.state);
        match job_state {
            None => {
                warn!(task_id = %task.task_id, job_id = %task.job_id, "Dropping task of unknown job");
                self.force_fail_task(&task.task_id, "job no longer exists").await;
                return None;
            }
            Some(state) if state.is_terminal() => {
                if let Err(e) = self.queue.cancel(&task.task_id).await {
                    warn!(task_id = %task.task_id, error = %e, "Failed to cancel task of finished job");
                }
                return None;
            }
            Some(_) => {}
        }

        let stage = match task.stage.parse::<ProcessingStage>() {
            Ok(stage) => stage,
            Err(e) => {
                self.force_fail_task(&task.task_id, e.to_string()).await;
                self.fail_job(&task.job_id, e.to_string()).await;
                return None;
            }
        };

        match self.dependency_state(task) {
            DependencyState::Satisfied => Some(stage),
            DependencyState::Broken(reason) => {
                let message = format!("Stage {} cannot run: {}", stage, reason);
                self.force_fail_task(&task.task_id, message.clone()).await;
                self.fail_job(&task.job_id, message).await;
                None
            }
            DependencyState::Waiting if task.dependency_waits >= self.config.max_dependency_waits => {
                let message = format!(
                    "Stage {} dependencies not satisfied after {} checks",
                    stage, task.dependency_waits
                );
                warn!(job_id = %task.job_id, task_id = %task.task_id, "{}", message);
                self.force_fail_task(&task.task_id, message.clone()).await;
                self.fail_job(&task.job_id, message).await;
                None
            }
            DependencyState::Waiting => {
                let delay = Duration::from_millis(self.config.dependency_delay_ms);
                if let Err(e) = self.queue.requeue_waiting(&task.task_id, delay).await {
                    warn!(task_id = %task.task_id, error = %e, "Failed to requeue waiting task");
                    let message = format!("Stage {} could not be rescheduled: {}", stage, e);
                    self.force_fail_task(&task.task_id, message.clone()).await;
                    self.fail_job(&task.job_id, message).await;
                }
                None
            }
        }
    }

    fn dependency_state(&self, task: &TaskInfo) -> DependencyState {
        let mut waiting = false;
        for dep in &task.dependencies {
            match self.queue.get_status(dep).map(|t| t.status) {
                Some(TaskStatus::Success) => {}
                Some(TaskStatus::Failure) => {
                    return DependencyState::Broken(format!("dependency {} failed", dep));
                }
                Some(TaskStatus::Cancelled) => {
                    return DependencyState::Broken(format!("dependency {} was cancelled", dep));
                }
                Some(_) => waiting = true,
                None => return DependencyState::Broken(format!("dependency {} is unknown", dep)),
            }
        }
        if waiting {
            DependencyState::Waiting
        } else {
            DependencyState::Satisfied
        }
    }

    async fn execute(&self, task: TaskInfo, stage: ProcessingStage) {
        let job_id = task.job_id.clone();
        let request = self.jobs.get(&job_id).map(|j| j.request.clone());
        let Some(request) = request else {
            self.finish_task(&task, stage, Err(StageError::permanent("job no longer exists")), Duration::ZERO)
                .await;
            return;
        };
        if let Some(mut job) = self.jobs.get_mut(&job_id)
            && job.state == JobState::Pending
        {
            job.state = JobState::Processing;
        }

        debug!(job_id = %job_id, task_id = %task.task_id, stage = %stage, attempt = task.retry_count, "Running stage");
        let started = Instant::now();

        let update = ProgressUpdate::new()
            .percentage(stage.progress_percentage())
            .step(stage.label())
            .completed_steps(stage.step() - 1);
        if let Err(e) = self.tracker.update_progress(&job_id, update).await {
            debug!(job_id = %job_id, error = %e, "Failed to report stage start");
        }

        let result = match self.registry.get(stage) {
            Some(handler) => {
                let ctx = StageContext {
                    job_id: job_id.clone(),
                    task_id: task.task_id.clone(),
                    stage,
                    request,
                    storage: self.storage.clone(),
                    attempt: task.retry_count,
                    max_file_size_mb: self.config.limits.max_file_size_mb,
                    tracker: self.tracker.clone(),
                };
                let timeout = self.config.limits.max_processing_time();
                match tokio::time::timeout(timeout, handler.run(&ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(StageError::transient(format!(
                        "{} handler timed out after {}s",
                        handler.name(),
                        timeout.as_secs()
                    ))),
                }
            }
            None => Err(StageError::permanent(format!(
                "no handler registered for stage {}",
                stage
            ))),
        };

        self.finish_task(&task, stage, result, started.elapsed()).await;
    }

    async fn finish_task(
        &self,
        task: &TaskInfo,
        stage: ProcessingStage,
        result: std::result::Result<serde_json::Value, StageError>,
        elapsed: Duration,
    ) {
        let job_id = task.job_id.as_str();
        let job_finished = self
            .jobs
            .get(job_id)
            .map(|j| j.state.is_terminal())
            .unwrap_or(true);

        let outcome = match &result {
            Ok(value) => TaskOutcome::Success(Some(value.clone())),
            Err(e) => TaskOutcome::Failure {
                error: e.message.clone(),
                retryable: e.retryable && !job_finished,
            },
        };

        let transition = match self.queue.mark_complete(&task.task_id, outcome).await {
            Ok(transition) => transition,
            Err(e) => {
                error!(job_id, task_id = %task.task_id, error = %e, "Failed to record task outcome");
                if !job_finished {
                    self.fail_job(job_id, format!("Stage {} could not be recorded: {}", stage, e))
                        .await;
                }
                return;
            }
        };

        if job_finished {
            debug!(job_id, task_id = %task.task_id, "Discarding result for finished job");
            return;
        }

        {
            let mut stats = self.stats.lock();
            stats.task_time.record(elapsed.as_secs_f64());
            if transition == TaskTransition::Completed {
                stats.total_processed += 1;
            }
        }

        match (transition, result) {
            (TaskTransition::Completed, _) if stage.is_last() => {
                self.complete_job(job_id).await;
            }
            (TaskTransition::Completed, _) => {
                debug!(job_id, stage = %stage, elapsed_ms = elapsed.as_millis() as u64, "Stage completed");
                let update = ProgressUpdate::new().completed_steps(stage.step());
                if let Err(e) = self.tracker.update_progress(job_id, update).await {
                    debug!(job_id, error = %e, "Failed to report stage completion");
                }
            }
            (TaskTransition::Retry { attempt, delay }, Err(e)) => {
                warn!(
                    job_id,
                    stage = %stage,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Stage failed, retrying"
                );
                let mut metadata = serde_json::Map::new();
                metadata.insert("stage".into(), stage.as_str().into());
                metadata.insert("attempt".into(), attempt.into());
                metadata.insert("maxRetries".into(), task.max_retries.into());
                metadata.insert("retryInSeconds".into(), delay.as_secs_f64().into());
                if let Err(err) = self
                    .tracker
                    .update_status(
                        job_id,
                        ProcessingStatus::Retrying,
                        Some(format!("Stage {} failed: {}", stage, e)),
                        Some(metadata),
                    )
                    .await
                {
                    debug!(job_id, error = %err, "Failed to report retry");
                }
            }
            (TaskTransition::Failed { exhausted }, Err(e)) => {
                let message = if exhausted {
                    format!(
                        "Stage {} failed after {} attempts: {}",
                        stage,
                        task.max_retries + 1,
                        e
                    )
                } else {
                    format!("Stage {} failed: {}", stage, e)
                };
                self.fail_job(job_id, message).await;
            }
            (transition, Ok(_)) => {
                warn!(job_id, ?transition, "Unexpected transition for successful stage");
            }
        }
    }

    async fn complete_job(&self, job_id: &str) {
        let (user_id, document_id, processing_secs) = {
            let Some(mut job) = self.jobs.get_mut(job_id) else {
                return;
            };
            if !job.finish(JobState::Completed, None) {
                return;
            }
            (
                job.user_id.clone(),
                job.request.document_id.clone(),
                job.processing_time_secs(),
            )
        };

        self.report_status(
            job_id,
            ProcessingStatus::Completed,
            Some("Processing completed".to_string()),
        )
        .await;
        self.tracker.notify_user(
            &user_id,
            "job_completed",
            json!({
                "jobId": job_id,
                "documentId": document_id,
                "processingTimeSeconds": processing_secs,
            }),
        );
        info!(job_id, processing_secs, "Job completed");
    }

    /// Fail a job, cancel its remaining tasks and report the terminal snapshot.
    async fn fail_job(&self, job_id: &str, message: String) {
        let (user_id, task_ids) = {
            let Some(mut job) = self.jobs.get_mut(job_id) else {
                return;
            };
            if !job.finish(JobState::Failed, Some(message.clone())) {
                return;
            }
            (job.user_id.clone(), job.task_ids.clone())
        };

        self.stats.lock().total_failed += 1;
        let cancelled = self.cancel_pending_tasks(&task_ids).await;
        self.report_status(job_id, ProcessingStatus::Failed, Some(message.clone()))
            .await;
        self.tracker.notify_user(
            &user_id,
            "job_failed",
            json!({ "jobId": job_id, "error": message }),
        );
        error!(job_id, cancelled_tasks = cancelled, error = %message, "Job failed");
    }

    async fn report_status(&self, job_id: &str, status: ProcessingStatus, message: Option<String>) {
        if let Err(e) = self
            .tracker
            .update_status(job_id, status, message, None)
            .await
        {
            warn!(job_id, status = %status, error = %e, "Failed to report job status");
        }
    }

    async fn cancel_pending_tasks(&self, task_ids: &[String]) -> usize {
        let mut cancelled = 0;
        for task_id in task_ids {
            match self.queue.cancel(task_id).await {
                Ok(true) => cancelled += 1,
                Ok(false) => {}
                Err(e) => warn!(task_id = %task_id, error = %e, "Failed to cancel task"),
            }
        }
        cancelled
    }

    async fn force_fail_task(&self, task_id: &str, reason: impl Into<String>) {
        if let Err(e) = self.queue.force_fail(task_id, reason).await {
            warn!(task_id, error = %e, "Failed to force-fail task");
        }
    }

    /// Fail every unfinished job older than the maximum processing time.
    pub async fn fail_overdue_jobs(&self, now: DateTime<Utc>) -> usize {
        let lifetime = self.config.limits.max_processing_time();
        let max_age =
            chrono::Duration::from_std(lifetime).unwrap_or_else(|_| chrono::Duration::days(365));
        let overdue: Vec<String> = self
            .jobs
            .iter()
            .filter(|job| !job.state.is_terminal() && now - job.created_at > max_age)
            .map(|job| job.job_id.clone())
            .collect();

        for job_id in &overdue {
            self.fail_job(
                job_id,
                format!(
                    "Job exceeded maximum processing time of {} minutes",
                    self.config.limits.max_processing_time_minutes
                ),
            )
            .await;
        }
        overdue.len()
    }

    /// Periodically fail jobs stuck past their lifetime.
    pub fn start_watchdog(self: &Arc<Self>, cancel_token: CancellationToken) -> JoinHandle<()> {
        let coordinator = self.clone();
        let interval = Duration::from_secs(self.config.watchdog_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Job watchdog shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let failed = coordinator.fail_overdue_jobs(Utc::now()).await;
                        if failed > 0 {
                            warn!(failed, "Watchdog failed overdue jobs");
                        }
                    }
                }
            }
        })
    }

    /// Forget finished jobs that completed before `older_than` ago.
    pub fn purge_jobs(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let mut removed = Vec::new();
        self.jobs.retain(|job_id, job| {
            let expired = job.state.is_terminal() && job.completed_at.is_some_and(|at| at < cutoff);
            if expired {
                removed.push((job.user_id.clone(), job_id.clone()));
            }
            !expired
        });

        for (user_id, job_id) in &removed {
            if let Some(mut ids) = self.user_jobs.get_mut(user_id) {
                ids.retain(|id| id != job_id);
            }
        }
        self.user_jobs.retain(|_, ids| !ids.is_empty());
        removed.len()
    }
}

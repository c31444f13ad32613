//! End-to-end runs of the coordinator with scripted stage handlers.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use docproc::pipeline::{
    CoordinatorConfig, DocumentType, JobCoordinator, JobRecord, JobState, ProcessingRequest,
    ProcessingStage, ResourceLimits, StageContext, StageError, StageHandler, StageRegistry,
};
use docproc::progress::{ProcessingStatus, ProgressTracker, ServerMessage, TrackerConfig};
use docproc::queue::{QueueConfig, RetryPolicy, TaskPriority, TaskQueue, TaskStatus};
use docproc::storage::MemoryObjectStore;

const WAIT_LIMIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct CallLog {
    calls: Mutex<Vec<(String, ProcessingStage, u32)>>,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

impl CallLog {
    fn peak(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }

    fn stages_of(&self, job_id: &str) -> Vec<ProcessingStage> {
        self.calls
            .lock()
            .iter()
            .filter(|(job, _, _)| job == job_id)
            .map(|(_, stage, _)| *stage)
            .collect()
    }

    fn count(&self, stage: ProcessingStage) -> usize {
        self.calls.lock().iter().filter(|(_, s, _)| *s == stage).count()
    }

    fn jobs_in_order(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(job, _, _)| job.clone()).collect()
    }
}

#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
}

enum Behavior {
    Succeed,
    /// Fail transiently on the first `n` attempts.
    FailFirst(u32),
    FailAlways,
    FailPermanently,
    /// Block until released.
    Wait(Arc<Gate>),
    /// Succeed after holding the stage for a while.
    Slow(Duration),
}

struct ScriptedHandler {
    log: Arc<CallLog>,
    behavior: Behavior,
}

#[async_trait]
impl StageHandler for ScriptedHandler {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn run(&self, ctx: &StageContext) -> Result<serde_json::Value, StageError> {
        self.log
            .calls
            .lock()
            .push((ctx.job_id.clone(), ctx.stage, ctx.attempt));

        let running = self.log.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.peak_running.fetch_max(running, Ordering::SeqCst);
        let result = self.act(ctx).await;
        self.log.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl ScriptedHandler {
    async fn act(&self, ctx: &StageContext) -> Result<serde_json::Value, StageError> {
        match &self.behavior {
            Behavior::Succeed => {}
            Behavior::FailFirst(n) if ctx.attempt < *n => {
                return Err(StageError::transient("temporary outage"));
            }
            Behavior::FailFirst(_) => {}
            Behavior::FailAlways => return Err(StageError::transient("still broken")),
            Behavior::FailPermanently => return Err(StageError::permanent("corrupt document")),
            Behavior::Wait(gate) => {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
            Behavior::Slow(hold) => tokio::time::sleep(*hold).await,
        }
        Ok(serde_json::json!({ "stage": ctx.stage.as_str() }))
    }
}

struct Harness {
    coordinator: Arc<JobCoordinator>,
    tracker: Arc<ProgressTracker>,
    queue: Arc<TaskQueue>,
    log: Arc<CallLog>,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct HarnessBuilder {
    overrides: Vec<(ProcessingStage, Behavior)>,
    max_retries: u32,
    max_concurrent: usize,
}

impl HarnessBuilder {
    fn new() -> Self {
        Self {
            overrides: Vec::new(),
            max_retries: 3,
            max_concurrent: 4,
        }
    }

    fn stage(mut self, stage: ProcessingStage, behavior: Behavior) -> Self {
        self.overrides.push((stage, behavior));
        self
    }

    fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    async fn build(self) -> Harness {
        let log = Arc::new(CallLog::default());
        let mut registry = StageRegistry::new();
        for stage in ProcessingStage::ALL {
            registry.register(
                stage,
                Arc::new(ScriptedHandler {
                    log: log.clone(),
                    behavior: Behavior::Succeed,
                }),
            );
        }
        for (stage, behavior) in self.overrides {
            registry.register(
                stage,
                Arc::new(ScriptedHandler {
                    log: log.clone(),
                    behavior,
                }),
            );
        }

        let queue = Arc::new(TaskQueue::new(QueueConfig {
            retry_policy: RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(40)),
            poll_interval_ms: 5,
            ..Default::default()
        }));
        queue.initialize().await.unwrap();
        let tracker = Arc::new(ProgressTracker::new(
            TrackerConfig::default().with_rate_limit(0),
        ));
        let limits = ResourceLimits {
            max_concurrent_tasks: self.max_concurrent,
            ..Default::default()
        };
        let coordinator = Arc::new(JobCoordinator::new(
            CoordinatorConfig::default()
                .with_limits(limits)
                .with_max_retries(self.max_retries)
                .with_dependency_wait(Duration::from_millis(5), 400)
                .with_dequeue_timeout(Duration::from_millis(20)),
            queue.clone(),
            tracker.clone(),
            registry,
            Arc::new(MemoryObjectStore::new()),
        ));

        Harness {
            coordinator,
            tracker,
            queue,
            log,
            token: CancellationToken::new(),
            handle: None,
        }
    }
}

impl Harness {
    fn start(&mut self) {
        self.handle = Some(self.coordinator.start(self.token.child_token()));
    }

    async fn submit(&self, user: &str, priority: TaskPriority) -> String {
        let request = ProcessingRequest::new("doc-1", "/tmp/doc-1.pdf", DocumentType::Pdf);
        self.coordinator
            .submit_job(request, user, priority)
            .await
            .unwrap()
    }

    async fn wait_finished(&self, job_id: &str) -> JobRecord {
        tokio::time::timeout(WAIT_LIMIT, async {
            loop {
                if let Some(job) = self.coordinator.job_status(job_id)
                    && job.state.is_terminal()
                {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job did not finish in time")
    }

    async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await.unwrap();
        }
    }
}

#[tokio::test]
async fn test_all_stages_succeed() {
    let mut harness = HarnessBuilder::new().build().await;
    harness.start();
    let job_id = harness.submit("alice", TaskPriority::Normal).await;

    let job = harness.wait_finished(&job_id).await;
    assert_eq!(job.state, JobState::Completed);
    assert!(job.error.is_none());
    assert_eq!(harness.log.stages_of(&job_id), ProcessingStage::ALL.to_vec());

    let latest = harness
        .tracker
        .get_job_progress(&job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.status, ProcessingStatus::Completed);
    assert_eq!(latest.progress_percentage, 100.0);
    assert_eq!(latest.completed_steps, 6);

    let history = harness.tracker.get_job_history(&job_id).await.unwrap().unwrap();
    assert_eq!(history.final_status, Some(ProcessingStatus::Completed));
    let percentages: Vec<f64> = history
        .snapshots
        .iter()
        .map(|s| s.progress_percentage)
        .collect();
    assert!(percentages.windows(2).all(|w| w[0] <= w[1]));

    harness.stop().await;
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let mut harness = HarnessBuilder::new()
        .stage(ProcessingStage::Extraction, Behavior::FailFirst(2))
        .build()
        .await;
    harness.start();
    let job_id = harness.submit("alice", TaskPriority::Normal).await;

    let job = harness.wait_finished(&job_id).await;
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(harness.log.count(ProcessingStage::Extraction), 3);

    let extraction = harness.queue.get_status(&job.task_ids[2]).unwrap();
    assert_eq!(extraction.status, TaskStatus::Success);
    assert_eq!(extraction.retry_count, 2);

    let history = harness.tracker.get_job_history(&job_id).await.unwrap().unwrap();
    let retrying: Vec<_> = history
        .snapshots
        .iter()
        .filter(|s| s.status == ProcessingStatus::Retrying)
        .collect();
    assert_eq!(retrying.len(), 2);
    for snapshot in &retrying {
        assert!(snapshot.error_message.is_some());
        assert_eq!(snapshot.metadata["stage"], "extraction");
        assert_eq!(snapshot.metadata["maxRetries"], 3);
    }
    assert_eq!(history.final_status, Some(ProcessingStatus::Completed));

    harness.stop().await;
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_job() {
    let mut harness = HarnessBuilder::new()
        .stage(ProcessingStage::Validation, Behavior::FailAlways)
        .build()
        .await;
    harness.start();
    let job_id = harness.submit("alice", TaskPriority::Normal).await;

    let job = harness.wait_finished(&job_id).await;
    assert_eq!(job.state, JobState::Failed);
    let error = job.error.unwrap();
    assert!(error.contains("validation"), "unexpected error: {}", error);
    assert!(error.contains("4 attempts"), "unexpected error: {}", error);

    // One initial attempt plus three retries, and nothing downstream ran.
    assert_eq!(harness.log.count(ProcessingStage::Validation), 4);
    assert_eq!(
        harness.log.stages_of(&job_id).last(),
        Some(&ProcessingStage::Validation)
    );
    for task_id in &job.task_ids[2..] {
        assert_eq!(
            harness.queue.get_status(task_id).unwrap().status,
            TaskStatus::Cancelled
        );
    }

    let latest = harness
        .tracker
        .get_job_progress(&job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.status, ProcessingStatus::Failed);
    assert!(latest.error_message.is_some());

    harness.stop().await;
}

#[tokio::test]
async fn test_permanent_failure_skips_retries() {
    let mut harness = HarnessBuilder::new()
        .stage(ProcessingStage::Validation, Behavior::FailPermanently)
        .build()
        .await;
    harness.start();
    let job_id = harness.submit("alice", TaskPriority::Normal).await;

    let job = harness.wait_finished(&job_id).await;
    assert_eq!(job.state, JobState::Failed);
    assert!(job.error.unwrap().contains("corrupt document"));
    assert_eq!(harness.log.count(ProcessingStage::Validation), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_high_priority_job_is_dispatched_first() {
    let mut harness = HarnessBuilder::new().max_concurrent(1).build().await;
    let low = harness.submit("alice", TaskPriority::Low).await;
    let high = harness.submit("bob", TaskPriority::High).await;
    harness.start();

    harness.wait_finished(&high).await;
    harness.wait_finished(&low).await;

    let order = harness.log.jobs_in_order();
    assert_eq!(order.first(), Some(&high));
    let first_low = order.iter().position(|job| *job == low).unwrap();
    let last_high = order.iter().rposition(|job| *job == high).unwrap();
    assert!(last_high < first_low, "low job ran before high job finished");

    harness.stop().await;
}

#[tokio::test]
async fn test_late_subscriber_gets_latest_snapshot() {
    let gate = Arc::new(Gate::default());
    let mut harness = HarnessBuilder::new()
        .stage(ProcessingStage::Analysis, Behavior::Wait(gate.clone()))
        .build()
        .await;
    harness.start();
    let job_id = harness.submit("alice", TaskPriority::Normal).await;

    tokio::time::timeout(WAIT_LIMIT, gate.entered.notified())
        .await
        .unwrap();
    let latest = harness
        .tracker
        .get_job_progress(&job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.status, ProcessingStatus::Processing);
    assert_eq!(latest.completed_steps, 3);
    assert_eq!(latest.current_step, ProcessingStage::Analysis.label());

    let (sink, mut rx) = mpsc::channel(64);
    harness
        .tracker
        .subscribe(sink, Some("alice".to_string()), vec![job_id.clone()], Vec::new())
        .await;

    assert!(matches!(
        rx.recv().await.unwrap(),
        ServerMessage::SubscriptionConfirmed { .. }
    ));
    match rx.recv().await.unwrap() {
        ServerMessage::ProgressUpdate { data, .. } => assert_eq!(data, latest),
        other => panic!("expected the latest snapshot, got {:?}", other),
    }

    gate.release.notify_one();

    let mut received = vec![latest];
    let notice = tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            match rx.recv().await.unwrap() {
                ServerMessage::ProgressUpdate { data, .. } => received.push(data),
                ServerMessage::ChannelMessage { message_type, .. } => return message_type,
                _ => {}
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(notice, "job_completed");

    // Each snapshot arrives once, in order, ending with the terminal one.
    assert!(received.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    assert!(received.windows(2).all(|w| w[0] != w[1]));
    assert_eq!(received.last().unwrap().status, ProcessingStatus::Completed);

    harness.stop().await;
}

#[tokio::test]
async fn test_cancel_discards_running_stage() {
    let gate = Arc::new(Gate::default());
    let mut harness = HarnessBuilder::new()
        .stage(ProcessingStage::Extraction, Behavior::Wait(gate.clone()))
        .build()
        .await;
    harness.start();
    let job_id = harness.submit("alice", TaskPriority::Normal).await;

    tokio::time::timeout(WAIT_LIMIT, gate.entered.notified())
        .await
        .unwrap();
    assert!(harness.coordinator.cancel_job(&job_id, "alice").await.unwrap());
    gate.release.notify_one();

    tokio::time::timeout(WAIT_LIMIT, async {
        while harness.coordinator.active_task_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    // Give the loop a chance to pick up anything wrongly left in the queue.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        harness.coordinator.job_status(&job_id).unwrap().state,
        JobState::Cancelled
    );
    assert_eq!(harness.log.count(ProcessingStage::Analysis), 0);

    let history = harness.tracker.get_job_history(&job_id).await.unwrap().unwrap();
    assert_eq!(history.final_status, Some(ProcessingStatus::Cancelled));
    assert_eq!(
        history.latest().unwrap().status,
        ProcessingStatus::Cancelled
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_jobs_run_concurrently_and_all_finish() {
    let mut harness = HarnessBuilder::new().max_concurrent(3).build().await;
    harness.start();

    let mut job_ids = Vec::new();
    for i in 0..5 {
        job_ids.push(harness.submit(&format!("user-{}", i), TaskPriority::Normal).await);
    }
    for job_id in &job_ids {
        assert_eq!(harness.wait_finished(job_id).await.state, JobState::Completed);
        assert_eq!(harness.log.stages_of(job_id), ProcessingStage::ALL.to_vec());
    }

    let metrics = harness.coordinator.processing_metrics().await.unwrap();
    assert_eq!(metrics.total_processed, 30);
    assert_eq!(metrics.total_failed, 0);
    assert_eq!(metrics.active_tasks, 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_concurrency_ceiling_bounds_running_stages() {
    let hold = Duration::from_millis(25);
    let mut harness = HarnessBuilder::new()
        .max_concurrent(2)
        .stage(ProcessingStage::Upload, Behavior::Slow(hold))
        .stage(ProcessingStage::Extraction, Behavior::Slow(hold))
        .build()
        .await;
    harness.start();

    let mut job_ids = Vec::new();
    for i in 0..4 {
        job_ids.push(harness.submit(&format!("user-{}", i), TaskPriority::Normal).await);
    }
    for job_id in &job_ids {
        assert_eq!(harness.wait_finished(job_id).await.state, JobState::Completed);
    }

    assert_eq!(harness.log.peak(), 2);
    assert_eq!(harness.coordinator.active_task_count(), 0);

    harness.stop().await;
}

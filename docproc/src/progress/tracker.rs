//! Progress tracker: per-job snapshot history, durable persistence and push
//! fan-out to subscribed connections.
//!
//! Each job's state sits behind its own mutex. Rate limiting, the terminal
//! check, the append and the fan-out for a snapshot all happen while that
//! mutex is held, so subscribers observe snapshots of one job in order and a
//! newly subscribed connection never misses or duplicates one.
//!
//! Lock order is job state, then the subscription index.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::messages::ServerMessage;
use super::rate_limit::RateWindow;
use super::snapshot::{
    JobProgressHistory, ProcessingStatus, ProgressAnalytics, ProgressSnapshot, ProgressUpdate,
};
use super::store::{MemoryProgressStore, ProgressStore};
use crate::metrics::Ema;
use crate::{Error, Result};

const PERSIST_CHANNEL_CAPACITY: usize = 1024;

/// Hourly buckets kept in `jobs_by_hour`.
const HOURLY_BUCKETS: i64 = 24;

/// Configuration for the progress tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Accepted progress updates per job per second. Zero disables the limit.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_second: u32,
    /// Interval of the liveness sweep, in seconds.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Connections silent for longer than this are dropped, in seconds.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Retention of persisted histories, in days.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Snapshots kept per job; the initial snapshot is always kept.
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots_per_job: usize,
    /// Coalescing interval of the history writer, in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Outbound buffer per connection.
    #[serde(default = "default_connection_buffer")]
    pub connection_buffer: usize,
}

fn default_rate_limit() -> u32 {
    10
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_stale_after_secs() -> u64 {
    60
}

fn default_retention_days() -> u32 {
    30
}

fn default_max_snapshots() -> usize {
    1000
}

fn default_flush_interval_ms() -> u64 {
    250
}

fn default_connection_buffer() -> usize {
    64
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_second: default_rate_limit(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            retention_days: default_retention_days(),
            max_snapshots_per_job: default_max_snapshots(),
            flush_interval_ms: default_flush_interval_ms(),
            connection_buffer: default_connection_buffer(),
        }
    }
}

impl TrackerConfig {
    pub fn with_rate_limit(mut self, per_second: u32) -> Self {
        self.rate_limit_per_second = per_second;
        self
    }

    pub fn with_heartbeat(mut self, interval_secs: u64, stale_after_secs: u64) -> Self {
        self.heartbeat_interval_secs = interval_secs;
        self.stale_after_secs = stale_after_secs;
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days as i64)
    }
}

struct JobState {
    history: JobProgressHistory,
    limiter: RateWindow,
}

type Sink = mpsc::Sender<ServerMessage>;

struct Connection {
    user_id: Option<String>,
    sink: Sink,
    job_ids: HashSet<String>,
    channels: HashSet<String>,
    last_seen: Instant,
}

#[derive(Default)]
struct SubscriptionIndex {
    connections: HashMap<String, Connection>,
    by_job: HashMap<String, HashSet<String>>,
    by_channel: HashMap<String, HashSet<String>>,
}

impl SubscriptionIndex {
    fn add_job(&mut self, connection_id: &str, job_id: &str) -> bool {
        let Some(conn) = self.connections.get_mut(connection_id) else {
            return false;
        };
        conn.job_ids.insert(job_id.to_string());
        self.by_job
            .entry(job_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        true
    }

    fn add_channel(&mut self, connection_id: &str, channel: &str) -> bool {
        let Some(conn) = self.connections.get_mut(connection_id) else {
            return false;
        };
        conn.channels.insert(channel.to_string());
        self.by_channel
            .entry(channel.to_string())
            .or_default()
            .insert(connection_id.to_string());
        true
    }

    fn remove_job(&mut self, connection_id: &str, job_id: &str) {
        if let Some(conn) = self.connections.get_mut(connection_id) {
            conn.job_ids.remove(job_id);
        }
        if let Some(set) = self.by_job.get_mut(job_id) {
            set.remove(connection_id);
            if set.is_empty() {
                self.by_job.remove(job_id);
            }
        }
    }

    fn remove_channel(&mut self, connection_id: &str, channel: &str) {
        if let Some(conn) = self.connections.get_mut(connection_id) {
            conn.channels.remove(channel);
        }
        if let Some(set) = self.by_channel.get_mut(channel) {
            set.remove(connection_id);
            if set.is_empty() {
                self.by_channel.remove(channel);
            }
        }
    }

    fn remove_connection(&mut self, connection_id: &str) -> bool {
        let Some(conn) = self.connections.remove(connection_id) else {
            return false;
        };
        for job_id in &conn.job_ids {
            if let Some(set) = self.by_job.get_mut(job_id) {
                set.remove(connection_id);
                if set.is_empty() {
                    self.by_job.remove(job_id);
                }
            }
        }
        for channel in &conn.channels {
            if let Some(set) = self.by_channel.get_mut(channel) {
                set.remove(connection_id);
                if set.is_empty() {
                    self.by_channel.remove(channel);
                }
            }
        }
        true
    }

    fn sinks(&self, ids: Option<&HashSet<String>>) -> Vec<(String, Sink)> {
        ids.map(|ids| {
            ids.iter()
                .filter_map(|id| {
                    self.connections
                        .get(id)
                        .map(|conn| (id.clone(), conn.sink.clone()))
                })
                .collect()
        })
        .unwrap_or_default()
    }
}

#[derive(Default)]
struct AnalyticsState {
    total_jobs: u64,
    active_jobs: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    peak_concurrent: u64,
    processing_time: Ema,
    jobs_by_hour: BTreeMap<DateTime<Utc>, u64>,
}

impl AnalyticsState {
    fn record_created(&mut self, at: DateTime<Utc>) {
        self.total_jobs += 1;
        self.active_jobs += 1;
        self.peak_concurrent = self.peak_concurrent.max(self.active_jobs);
        let hour = at.duration_trunc(TimeDelta::hours(1)).unwrap_or(at);
        *self.jobs_by_hour.entry(hour).or_default() += 1;
        let oldest = hour - TimeDelta::hours(HOURLY_BUCKETS - 1);
        self.jobs_by_hour = self.jobs_by_hour.split_off(&oldest);
    }

    fn record_finished(&mut self, status: ProcessingStatus, processing_secs: f64) {
        self.active_jobs = self.active_jobs.saturating_sub(1);
        match status {
            ProcessingStatus::Completed => self.completed += 1,
            ProcessingStatus::Failed => self.failed += 1,
            ProcessingStatus::Cancelled => self.cancelled += 1,
            _ => {}
        }
        self.processing_time.record(processing_secs);
    }
}

enum PersistCommand {
    Save(Box<JobProgressHistory>),
    Flush(oneshot::Sender<()>),
}

/// Result of one liveness sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub removed: usize,
}

/// Tracks job progress and pushes snapshots to subscribers.
pub struct ProgressTracker {
    config: TrackerConfig,
    store: Arc<dyn ProgressStore>,
    jobs: DashMap<String, Arc<Mutex<JobState>>>,
    subscriptions: Mutex<SubscriptionIndex>,
    analytics: Mutex<AnalyticsState>,
    updates_sent: AtomicU64,
    persist_tx: mpsc::Sender<PersistCommand>,
}

impl ProgressTracker {
    /// Create a tracker backed by an in-memory store.
    pub fn new(config: TrackerConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryProgressStore::new()))
    }

    /// Create a tracker persisting histories to `store`.
    ///
    /// Histories are written by a background task that coalesces updates of the
    /// same job; [`ProgressTracker::flush`] forces a write.
    pub fn with_store(config: TrackerConfig, store: Arc<dyn ProgressStore>) -> Self {
        let (persist_tx, persist_rx) = mpsc::channel(PERSIST_CHANNEL_CAPACITY);
        spawn_history_writer(
            store.clone(),
            persist_rx,
            config.retention(),
            Duration::from_millis(config.flush_interval_ms.max(1)),
        );

        Self {
            config,
            store,
            jobs: DashMap::new(),
            subscriptions: Mutex::new(SubscriptionIndex::default()),
            analytics: Mutex::new(AnalyticsState::default()),
            updates_sent: AtomicU64::new(0),
            persist_tx,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Register a job and emit its initial 0% snapshot.
    pub async fn create_job(
        &self,
        job_id: &str,
        total_steps: u32,
        user_id: &str,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<()> {
        let mut initial = ProgressSnapshot::initial(job_id, total_steps);
        initial.metadata = metadata.unwrap_or_default();
        let created_at = initial.timestamp;

        let state = Arc::new(Mutex::new(JobState {
            history: JobProgressHistory::new(job_id, user_id, initial.clone()),
            limiter: RateWindow::per_second(self.config.rate_limit_per_second),
        }));

        let history = {
            let guard = state.lock();
            match self.jobs.entry(job_id.to_string()) {
                Entry::Occupied(_) => {
                    return Err(Error::validation(format!("job {} is already tracked", job_id)));
                }
                Entry::Vacant(slot) => {
                    slot.insert(state.clone());
                }
            }
            self.fan_out(&initial);
            guard.history.clone()
        };

        self.analytics.lock().record_created(created_at);
        debug!(job_id, user_id, total_steps, "Tracking job");
        self.persist(history).await;
        Ok(())
    }

    fn job_state(&self, job_id: &str) -> Result<Arc<Mutex<JobState>>> {
        self.jobs
            .get(job_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::not_found("Job", job_id))
    }

    /// Append a progress snapshot.
    ///
    /// Returns `Ok(false)` when the update was dropped by the rate limiter or
    /// the job already reached a terminal status.
    pub async fn update_progress(&self, job_id: &str, update: ProgressUpdate) -> Result<bool> {
        let state = self.job_state(job_id)?;

        let history = {
            let mut st = state.lock();
            if st.history.is_finished() {
                trace!(job_id, "Ignoring progress for finished job");
                return Ok(false);
            }
            if !st.limiter.try_acquire(Instant::now()) {
                trace!(job_id, "Progress update rate limited");
                return Ok(false);
            }

            let Some(previous) = st.history.latest() else {
                return Err(Error::Other(format!("job {} has no snapshots", job_id)));
            };
            let snapshot = next_progress_snapshot(previous, update, Utc::now());
            self.append(&mut st, snapshot.clone());
            self.fan_out(&snapshot);
            st.history.clone()
        };

        self.persist(history).await;
        Ok(true)
    }

    /// Append a status-transition snapshot.
    ///
    /// Status snapshots are not rate limited. Once a terminal status is
    /// recorded every later call returns `Ok(false)`.
    pub async fn update_status(
        &self,
        job_id: &str,
        status: ProcessingStatus,
        message: Option<String>,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<bool> {
        let state = self.job_state(job_id)?;

        let (history, finished) = {
            let mut st = state.lock();
            if st.history.is_finished() {
                debug!(
                    job_id,
                    requested = %status,
                    "Job already finished, ignoring status change"
                );
                return Ok(false);
            }
            let Some(previous) = st.history.latest() else {
                return Err(Error::Other(format!("job {} has no snapshots", job_id)));
            };

            let now = Utc::now();
            let snapshot = status_snapshot(previous, status, message, metadata, now);
            self.append(&mut st, snapshot.clone());

            let mut finished = None;
            if status.is_terminal() {
                let total_secs = (now - st.history.created_at).num_milliseconds().max(0) as f64 / 1000.0;
                st.history.final_status = Some(status);
                st.history.total_processing_time_seconds = Some(total_secs);
                st.history.average_step_time_seconds = (snapshot.completed_steps > 0)
                    .then(|| total_secs / snapshot.completed_steps as f64);
                finished = Some(total_secs);
            }

            self.fan_out(&snapshot);
            (st.history.clone(), finished)
        };

        if let Some(total_secs) = finished {
            self.analytics.lock().record_finished(status, total_secs);
            info!(job_id, status = %status, total_secs, "Job finished");
        }
        self.persist(history).await;
        Ok(true)
    }

    fn append(&self, state: &mut JobState, snapshot: ProgressSnapshot) {
        let history = &mut state.history;
        history.updated_at = snapshot.timestamp;
        history.snapshots.push(snapshot);
        let cap = self.config.max_snapshots_per_job.max(2);
        if history.snapshots.len() > cap {
            history.snapshots.remove(1);
        }
    }

    /// Latest snapshot of a job, from memory or the persisted history.
    pub async fn get_job_progress(&self, job_id: &str) -> Result<Option<ProgressSnapshot>> {
        Ok(self
            .get_job_history(job_id)
            .await?
            .and_then(|h| h.snapshots.last().cloned()))
    }

    pub async fn get_job_history(&self, job_id: &str) -> Result<Option<JobProgressHistory>> {
        if let Some(state) = self.jobs.get(job_id).map(|s| s.value().clone()) {
            return Ok(Some(state.lock().history.clone()));
        }
        self.store.load_history(job_id).await
    }

    /// Whether the job is tracked in memory and has not finished.
    pub fn is_active(&self, job_id: &str) -> bool {
        self.jobs
            .get(job_id)
            .map(|s| !s.value().lock().history.is_finished())
            .unwrap_or(false)
    }

    /// Register a connection and push the latest snapshot of every requested job.
    ///
    /// A `user_{id}` channel is added for the connection's user. Returns the
    /// connection id used for heartbeats and unsubscription.
    pub async fn subscribe(
        &self,
        sink: mpsc::Sender<ServerMessage>,
        user_id: Option<String>,
        job_ids: Vec<String>,
        channels: Vec<String>,
    ) -> String {
        let connection_id = Uuid::new_v4().to_string();
        let mut channels = channels;
        if let Some(user) = &user_id {
            channels.push(user_channel(user));
        }
        channels.sort();
        channels.dedup();

        {
            let mut index = self.subscriptions.lock();
            index.connections.insert(
                connection_id.clone(),
                Connection {
                    user_id: user_id.clone(),
                    sink: sink.clone(),
                    job_ids: HashSet::new(),
                    channels: HashSet::new(),
                    last_seen: Instant::now(),
                },
            );
            for channel in &channels {
                index.add_channel(&connection_id, channel);
            }
        }

        let confirmed = ServerMessage::SubscriptionConfirmed {
            connection_id: connection_id.clone(),
            job_ids: job_ids.clone(),
            channels: channels.clone(),
        };
        self.deliver(vec![(connection_id.clone(), sink.clone())], &confirmed);
        self.attach_jobs(&connection_id, &sink, &job_ids).await;

        info!(
            connection_id = %connection_id,
            user_id = user_id.as_deref().unwrap_or("-"),
            jobs = job_ids.len(),
            channels = channels.len(),
            "Connection subscribed"
        );
        connection_id
    }

    /// Add jobs and channels to an existing connection.
    pub async fn extend_subscription(
        &self,
        connection_id: &str,
        job_ids: Vec<String>,
        channels: Vec<String>,
    ) -> Result<()> {
        let sink = {
            let mut index = self.subscriptions.lock();
            let Some(conn) = index.connections.get_mut(connection_id) else {
                return Err(Error::not_found("Connection", connection_id));
            };
            conn.last_seen = Instant::now();
            let sink = conn.sink.clone();
            for channel in &channels {
                index.add_channel(connection_id, channel);
            }
            sink
        };

        let confirmed = ServerMessage::SubscriptionConfirmed {
            connection_id: connection_id.to_string(),
            job_ids: job_ids.clone(),
            channels,
        };
        if self.deliver(vec![(connection_id.to_string(), sink.clone())], &confirmed) == 0 {
            debug!(connection_id, "Subscription confirmation not delivered");
        }
        self.attach_jobs(connection_id, &sink, &job_ids).await;
        Ok(())
    }

    async fn attach_jobs(&self, connection_id: &str, sink: &Sink, job_ids: &[String]) {
        for job_id in job_ids {
            let state = self.jobs.get(job_id.as_str()).map(|s| s.value().clone());
            match state {
                Some(state) => {
                    let st = state.lock();
                    if !self.subscriptions.lock().add_job(connection_id, job_id) {
                        return;
                    }
                    if let Some(latest) = st.history.latest() {
                        self.send_snapshot(connection_id, sink, latest);
                    }
                }
                None => {
                    if !self.subscriptions.lock().add_job(connection_id, job_id) {
                        return;
                    }
                    match self.store.load_history(job_id).await {
                        Ok(Some(history)) => {
                            if let Some(latest) = history.latest() {
                                self.send_snapshot(connection_id, sink, latest);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(job_id = %job_id, error = %e, "Failed to load progress history"),
                    }
                }
            }
        }
    }

    fn send_snapshot(&self, connection_id: &str, sink: &Sink, snapshot: &ProgressSnapshot) {
        let msg = ServerMessage::ProgressUpdate {
            job_id: snapshot.job_id.clone(),
            data: snapshot.clone(),
        };
        self.deliver(vec![(connection_id.to_string(), sink.clone())], &msg);
    }

    /// Remove jobs and channels from a connection.
    pub fn unsubscribe_topics(&self, connection_id: &str, job_ids: &[String], channels: &[String]) {
        let mut index = self.subscriptions.lock();
        for job_id in job_ids {
            index.remove_job(connection_id, job_id);
        }
        for channel in channels {
            index.remove_channel(connection_id, channel);
        }
    }

    /// Drop a connection and all of its subscriptions.
    pub fn unsubscribe(&self, connection_id: &str) -> bool {
        let removed = self.subscriptions.lock().remove_connection(connection_id);
        if removed {
            debug!(connection_id, "Connection unsubscribed");
        }
        removed
    }

    /// Record that a connection is alive.
    pub fn heartbeat(&self, connection_id: &str) -> bool {
        match self.subscriptions.lock().connections.get_mut(connection_id) {
            Some(conn) => {
                conn.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.subscriptions.lock().connections.len()
    }

    /// Deliver to every connection subscribed to the snapshot's job.
    fn fan_out(&self, snapshot: &ProgressSnapshot) {
        let targets = {
            let index = self.subscriptions.lock();
            index.sinks(index.by_job.get(&snapshot.job_id))
        };
        if targets.is_empty() {
            return;
        }
        let msg = ServerMessage::ProgressUpdate {
            job_id: snapshot.job_id.clone(),
            data: snapshot.clone(),
        };
        self.deliver(targets, &msg);
    }

    /// Send a message to every connection on a named channel.
    ///
    /// Returns the number of connections that accepted the message.
    pub fn broadcast_to_channel(
        &self,
        channel: &str,
        message_type: &str,
        data: serde_json::Value,
    ) -> usize {
        let targets = {
            let index = self.subscriptions.lock();
            index.sinks(index.by_channel.get(channel))
        };
        if targets.is_empty() {
            return 0;
        }
        let msg = ServerMessage::ChannelMessage {
            channel: channel.to_string(),
            message_type: message_type.to_string(),
            data,
            timestamp: Utc::now(),
        };
        self.deliver(targets, &msg)
    }

    /// Send a message on the per-user channel.
    pub fn notify_user(&self, user_id: &str, message_type: &str, data: serde_json::Value) -> usize {
        self.broadcast_to_channel(&user_channel(user_id), message_type, data)
    }

    /// Push to each sink without blocking. Closed sinks are unsubscribed and a
    /// full sink loses this message only.
    fn deliver(&self, targets: Vec<(String, Sink)>, msg: &ServerMessage) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        for (connection_id, sink) in targets {
            match sink.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(connection_id = %connection_id, "Subscriber buffer full, dropping message");
                }
                Err(TrySendError::Closed(_)) => closed.push(connection_id),
            }
        }
        if delivered > 0 {
            self.updates_sent
                .fetch_add(delivered as u64, Ordering::Relaxed);
        }
        if !closed.is_empty() {
            let mut index = self.subscriptions.lock();
            for connection_id in &closed {
                index.remove_connection(connection_id);
            }
            debug!(count = closed.len(), "Removed closed connections");
        }
        delivered
    }

    /// Ping idle connections and drop the ones silent past the stale window.
    pub fn sweep_connections(&self, now: Instant) -> SweepReport {
        let ping_after = Duration::from_secs(self.config.heartbeat_interval_secs);
        let stale_after = Duration::from_secs(self.config.stale_after_secs);

        let (stale, idle) = {
            let index = self.subscriptions.lock();
            let mut stale = Vec::new();
            let mut idle = Vec::new();
            for (id, conn) in &index.connections {
                let silent = now.saturating_duration_since(conn.last_seen);
                if silent > stale_after {
                    stale.push(id.clone());
                } else if silent >= ping_after {
                    idle.push((id.clone(), conn.sink.clone()));
                }
            }
            (stale, idle)
        };

        let removed = {
            let mut index = self.subscriptions.lock();
            stale
                .iter()
                .filter(|id| index.remove_connection(id))
                .count()
        };
        if removed > 0 {
            info!(removed, "Dropped stale connections");
        }

        let pinged = idle.len();
        if pinged > 0 {
            self.deliver(idle, &ServerMessage::ping());
        }
        SweepReport { pinged, removed }
    }

    /// Run the liveness sweep until cancelled.
    pub fn start_heartbeat(self: &Arc<Self>, cancel_token: CancellationToken) -> JoinHandle<()> {
        let tracker = self.clone();
        let interval = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Heartbeat sweep shutting down");
                        break;
                    }
                    _ = tick.tick() => {
                        tracker.sweep_connections(Instant::now());
                    }
                }
            }
        })
    }

    pub fn analytics(&self) -> ProgressAnalytics {
        let state = self.analytics.lock();
        let finished = state.completed + state.failed + state.cancelled;
        ProgressAnalytics {
            total_jobs_tracked: state.total_jobs,
            active_jobs: state.active_jobs,
            completed_jobs: state.completed,
            failed_jobs: state.failed,
            cancelled_jobs: state.cancelled,
            success_rate: if finished > 0 {
                state.completed as f64 / finished as f64
            } else {
                0.0
            },
            average_processing_time_seconds: state.processing_time.value(),
            active_connections: self.connection_count(),
            total_progress_updates_sent: self.updates_sent.load(Ordering::Relaxed),
            peak_concurrent_jobs: state.peak_concurrent,
            jobs_by_hour: state.jobs_by_hour.clone(),
        }
    }

    /// Drop finished jobs from memory once their last update is older than
    /// `older_than`. Histories are flushed to the store first.
    pub async fn evict_finished(&self, older_than: Duration) -> usize {
        self.flush().await;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let before = self.jobs.len();
        self.jobs.retain(|_, state| {
            let st = state.lock();
            !(st.history.is_finished() && st.history.updated_at < cutoff)
        });
        before.saturating_sub(self.jobs.len())
    }

    /// Close persisted histories that a previous process left unfinished.
    ///
    /// Every unexpired history without a final status that is not tracked in
    /// memory gets a terminal Failed snapshot carrying `message`. Returns the
    /// affected job ids.
    pub async fn fail_interrupted(&self, message: &str) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut failed = Vec::new();
        for mut history in self.store.load_unfinished().await? {
            if self.jobs.contains_key(&history.job_id) {
                continue;
            }
            let Some(previous) = history.latest() else {
                continue;
            };
            let snapshot = status_snapshot(
                previous,
                ProcessingStatus::Failed,
                Some(message.to_string()),
                None,
                now,
            );
            let total_secs = (now - history.created_at).num_milliseconds().max(0) as f64 / 1000.0;
            history.updated_at = now;
            history.snapshots.push(snapshot);
            history.final_status = Some(ProcessingStatus::Failed);
            history.total_processing_time_seconds = Some(total_secs);

            self.store
                .save_history(&history, now + self.config.retention())
                .await?;
            self.notify_user(
                &history.user_id,
                "job_failed",
                serde_json::json!({ "jobId": history.job_id, "error": message }),
            );
            warn!(job_id = %history.job_id, "Closed progress of interrupted job");
            failed.push(history.job_id);
        }
        Ok(failed)
    }

    /// Delete persisted histories past their retention.
    pub async fn purge_expired(&self) -> Result<u64> {
        self.store.purge_expired(Utc::now()).await
    }

    /// Wait until every queued history write reached the store.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .persist_tx
            .send(PersistCommand::Flush(done_tx))
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }

    /// Flush pending writes and close every connection.
    pub async fn shutdown(&self) {
        self.flush().await;
        let mut index = self.subscriptions.lock();
        let count = index.connections.len();
        *index = SubscriptionIndex::default();
        info!(connections = count, "Progress tracker shut down");
    }

    async fn persist(&self, history: JobProgressHistory) {
        if let Err(mpsc::error::SendError(cmd)) = self
            .persist_tx
            .send(PersistCommand::Save(Box::new(history)))
            .await
            && let PersistCommand::Save(history) = cmd
        {
            let expires_at = history.updated_at + self.config.retention();
            if let Err(e) = self.store.save_history(&history, expires_at).await {
                warn!(job_id = %history.job_id, error = %e, "Failed to persist progress history");
            }
        }
    }
}

fn user_channel(user_id: &str) -> String {
    format!("user_{}", user_id)
}

/// Build the snapshot that follows `previous` for a progress update.
fn next_progress_snapshot(
    previous: &ProgressSnapshot,
    update: ProgressUpdate,
    now: DateTime<Utc>,
) -> ProgressSnapshot {
    let percentage = update
        .percentage
        .map(|p| p.clamp(0.0, 100.0))
        .unwrap_or(previous.progress_percentage)
        .max(previous.progress_percentage);
    let completed_steps = update
        .completed_steps
        .unwrap_or(previous.completed_steps)
        .max(previous.completed_steps)
        .min(previous.total_steps);

    let elapsed_secs = (now - previous.timestamp).num_milliseconds() as f64 / 1000.0;
    let throughput = if completed_steps > previous.completed_steps && elapsed_secs > 0.0 {
        Some((completed_steps - previous.completed_steps) as f64 / elapsed_secs)
    } else {
        previous.throughput
    };

    let eta_seconds = update.eta_seconds.or_else(|| {
        throughput
            .filter(|t| *t > 0.0)
            .map(|t| previous.total_steps.saturating_sub(completed_steps) as f64 / t)
    });

    let status = match previous.status {
        ProcessingStatus::Pending | ProcessingStatus::Retrying => ProcessingStatus::Processing,
        other => other,
    };

    ProgressSnapshot {
        timestamp: now,
        job_id: previous.job_id.clone(),
        status,
        progress_percentage: percentage,
        current_step: update.step.unwrap_or_else(|| previous.current_step.clone()),
        completed_steps,
        total_steps: previous.total_steps,
        eta_seconds,
        throughput,
        error_message: None,
        metadata: update.metadata.unwrap_or_default(),
    }
}

/// Build the snapshot recording a status transition.
fn status_snapshot(
    previous: &ProgressSnapshot,
    status: ProcessingStatus,
    message: Option<String>,
    metadata: Option<serde_json::Map<String, serde_json::Value>>,
    now: DateTime<Utc>,
) -> ProgressSnapshot {
    let mut snapshot = ProgressSnapshot {
        timestamp: now,
        status,
        error_message: None,
        metadata: metadata.unwrap_or_default(),
        ..previous.clone()
    };

    match status {
        ProcessingStatus::Completed => {
            snapshot.progress_percentage = 100.0;
            snapshot.completed_steps = snapshot.total_steps;
            snapshot.current_step = "completed".to_string();
            snapshot.eta_seconds = Some(0.0);
        }
        ProcessingStatus::Failed | ProcessingStatus::Retrying => {
            snapshot.error_message = message;
            snapshot.eta_seconds = None;
        }
        ProcessingStatus::Cancelled | ProcessingStatus::Pending | ProcessingStatus::Processing => {
            if let Some(message) = message {
                snapshot
                    .metadata
                    .insert("message".to_string(), serde_json::Value::String(message));
            }
            if status == ProcessingStatus::Cancelled {
                snapshot.eta_seconds = None;
            }
        }
    }
    snapshot
}

fn spawn_history_writer(
    store: Arc<dyn ProgressStore>,
    mut rx: mpsc::Receiver<PersistCommand>,
    retention: chrono::Duration,
    flush_every: Duration,
) {
    if tokio::runtime::Handle::try_current().is_err() {
        // Without a runtime the channel closes and `persist` writes directly.
        return;
    }

    tokio::spawn(async move {
        let mut pending: HashMap<String, JobProgressHistory> = HashMap::new();
        let mut tick = tokio::time::interval(flush_every);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    flush_pending(store.as_ref(), &mut pending, retention).await;
                }
                cmd = rx.recv() => match cmd {
                    Some(PersistCommand::Save(history)) => {
                        pending.insert(history.job_id.clone(), *history);
                    }
                    Some(PersistCommand::Flush(done)) => {
                        flush_pending(store.as_ref(), &mut pending, retention).await;
                        let _ = done.send(());
                    }
                    None => {
                        flush_pending(store.as_ref(), &mut pending, retention).await;
                        break;
                    }
                }
            }
        }
    });
}

async fn flush_pending(
    store: &dyn ProgressStore,
    pending: &mut HashMap<String, JobProgressHistory>,
    retention: chrono::Duration,
) {
    for (job_id, history) in pending.drain() {
        let expires_at = history.updated_at + retention;
        if let Err(e) = store.save_history(&history, expires_at).await {
            warn!(job_id = %job_id, error = %e, "Failed to persist progress history");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ProgressTracker {
        ProgressTracker::new(TrackerConfig::default().with_rate_limit(0))
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn progress_updates(messages: &[ServerMessage]) -> Vec<&ProgressSnapshot> {
        messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::ProgressUpdate { data, .. } => Some(data),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_create_job_writes_initial_snapshot() {
        let tracker = tracker();
        tracker.create_job("job-1", 6, "user-1", None).await.unwrap();

        let snapshot = tracker.get_job_progress("job-1").await.unwrap().unwrap();
        assert_eq!(snapshot.status, ProcessingStatus::Pending);
        assert_eq!(snapshot.progress_percentage, 0.0);
        assert_eq!(snapshot.total_steps, 6);

        assert!(tracker.create_job("job-1", 6, "user-1", None).await.is_err());
        assert_eq!(tracker.analytics().total_jobs_tracked, 1);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let tracker = tracker();
        let err = tracker
            .update_progress("missing", ProgressUpdate::new().percentage(10.0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(tracker.get_job_progress("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_percentage_never_decreases() {
        let tracker = tracker();
        tracker.create_job("job", 6, "user", None).await.unwrap();
        tracker
            .update_progress("job", ProgressUpdate::new().percentage(50.0))
            .await
            .unwrap();
        tracker
            .update_progress("job", ProgressUpdate::new().percentage(20.0))
            .await
            .unwrap();
        tracker
            .update_progress("job", ProgressUpdate::new().percentage(250.0))
            .await
            .unwrap();

        let history = tracker.get_job_history("job").await.unwrap().unwrap();
        let percentages: Vec<f64> = history.snapshots.iter().map(|s| s.progress_percentage).collect();
        assert_eq!(percentages, vec![0.0, 50.0, 50.0, 100.0]);
        assert_eq!(history.snapshots[1].status, ProcessingStatus::Processing);
    }

    #[tokio::test]
    async fn test_rate_limit_drops_excess_updates() {
        let tracker = ProgressTracker::new(TrackerConfig::default().with_rate_limit(10));
        tracker.create_job("job", 6, "user", None).await.unwrap();

        let mut accepted = 0;
        for i in 0..30 {
            if tracker
                .update_progress("job", ProgressUpdate::new().percentage(i as f64))
                .await
                .unwrap()
            {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 10);

        let history = tracker.get_job_history("job").await.unwrap().unwrap();
        assert_eq!(history.snapshots.len(), 11);

        // Status transitions are never rate limited.
        assert!(
            tracker
                .update_status("job", ProcessingStatus::Completed, None, None)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_single_terminal_status() {
        let tracker = tracker();
        tracker.create_job("job", 6, "user", None).await.unwrap();
        assert!(
            tracker
                .update_status("job", ProcessingStatus::Failed, Some("boom".into()), None)
                .await
                .unwrap()
        );
        assert!(
            !tracker
                .update_status("job", ProcessingStatus::Completed, None, None)
                .await
                .unwrap()
        );
        assert!(
            !tracker
                .update_progress("job", ProgressUpdate::new().percentage(90.0))
                .await
                .unwrap()
        );

        let history = tracker.get_job_history("job").await.unwrap().unwrap();
        let terminal: Vec<_> = history
            .snapshots
            .iter()
            .filter(|s| s.status.is_terminal())
            .collect();
        assert_eq!(terminal.len(), 1);
        assert_eq!(history.final_status, Some(ProcessingStatus::Failed));
        assert_eq!(history.latest().unwrap().error_message.as_deref(), Some("boom"));
        assert!(history.total_processing_time_seconds.is_some());

        let analytics = tracker.analytics();
        assert_eq!(analytics.failed_jobs, 1);
        assert_eq!(analytics.active_jobs, 0);
        assert_eq!(analytics.success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_completed_status_fills_progress() {
        let tracker = tracker();
        tracker.create_job("job", 6, "user", None).await.unwrap();
        tracker
            .update_progress("job", ProgressUpdate::new().percentage(70.0).completed_steps(4))
            .await
            .unwrap();
        tracker
            .update_status("job", ProcessingStatus::Completed, None, None)
            .await
            .unwrap();

        let latest = tracker.get_job_progress("job").await.unwrap().unwrap();
        assert_eq!(latest.progress_percentage, 100.0);
        assert_eq!(latest.completed_steps, 6);
        assert!(!tracker.is_active("job"));

        let history = tracker.get_job_history("job").await.unwrap().unwrap();
        assert!(history.average_step_time_seconds.is_some());
        assert_eq!(tracker.analytics().success_rate, 1.0);
    }

    #[tokio::test]
    async fn test_throughput_from_step_delta() {
        let tracker = tracker();
        tracker.create_job("job", 6, "user", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker
            .update_progress("job", ProgressUpdate::new().completed_steps(2))
            .await
            .unwrap();

        let latest = tracker.get_job_progress("job").await.unwrap().unwrap();
        let throughput = latest.throughput.unwrap();
        assert!(throughput > 0.0);
        assert!(latest.eta_seconds.unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_fan_out_exactly_once_until_unsubscribed() {
        let tracker = tracker();
        tracker.create_job("job", 6, "user", None).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let connection = tracker
            .subscribe(tx, Some("user".into()), vec!["job".into()], vec![])
            .await;
        let initial = drain(&mut rx);
        assert!(matches!(initial[0], ServerMessage::SubscriptionConfirmed { .. }));
        assert_eq!(progress_updates(&initial).len(), 1);

        tracker
            .update_progress("job", ProgressUpdate::new().percentage(10.0))
            .await
            .unwrap();
        let delivered = drain(&mut rx);
        let updates = progress_updates(&delivered);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].progress_percentage, 10.0);

        assert!(tracker.unsubscribe(&connection));
        tracker
            .update_progress("job", ProgressUpdate::new().percentage(20.0))
            .await
            .unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_subscriber_mid_job_gets_latest_snapshot() {
        let tracker = tracker();
        tracker.create_job("job", 6, "user", None).await.unwrap();
        for pct in [10.0, 20.0, 50.0] {
            tracker
                .update_progress("job", ProgressUpdate::new().percentage(pct))
                .await
                .unwrap();
        }

        let (tx, mut rx) = mpsc::channel(16);
        tracker.subscribe(tx, None, vec!["job".into()], vec![]).await;
        let messages = drain(&mut rx);
        let updates = progress_updates(&messages);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].progress_percentage, 50.0);
    }

    #[tokio::test]
    async fn test_closed_connection_is_unsubscribed() {
        let tracker = tracker();
        tracker.create_job("job", 6, "user", None).await.unwrap();

        let (dead_tx, dead_rx) = mpsc::channel(16);
        let (live_tx, mut live_rx) = mpsc::channel(16);
        tracker.subscribe(dead_tx, None, vec!["job".into()], vec![]).await;
        tracker.subscribe(live_tx, None, vec!["job".into()], vec![]).await;
        drop(dead_rx);
        drain(&mut live_rx);

        tracker
            .update_progress("job", ProgressUpdate::new().percentage(30.0))
            .await
            .unwrap();
        assert_eq!(progress_updates(&drain(&mut live_rx)).len(), 1);
        assert_eq!(tracker.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_full_buffer_does_not_fail_broadcast() {
        let tracker = tracker();
        tracker.create_job("job", 6, "user", None).await.unwrap();
        let (tx, mut rx) = mpsc::channel(2);
        tracker.subscribe(tx, None, vec!["job".into()], vec![]).await;

        for pct in [10.0, 20.0, 30.0] {
            assert!(
                tracker
                    .update_progress("job", ProgressUpdate::new().percentage(pct))
                    .await
                    .unwrap()
            );
        }
        assert_eq!(drain(&mut rx).len(), 2);
        assert_eq!(tracker.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_channel_broadcast() {
        let tracker = tracker();
        let (tx, mut rx) = mpsc::channel(16);
        tracker
            .subscribe(tx, Some("alice".into()), vec![], vec!["notifications".into()])
            .await;
        drain(&mut rx);

        assert_eq!(
            tracker.broadcast_to_channel("notifications", "maintenance", serde_json::json!({"in": 5})),
            1
        );
        assert_eq!(tracker.notify_user("alice", "job_completed", serde_json::json!({})), 1);
        assert_eq!(tracker.notify_user("bob", "job_completed", serde_json::json!({})), 0);

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 2);
        assert!(matches!(
            &messages[1],
            ServerMessage::ChannelMessage { channel, message_type, .. }
                if channel == "user_alice" && message_type == "job_completed"
        ));
    }

    #[tokio::test]
    async fn test_sweep_pings_idle_and_drops_stale() {
        let tracker = ProgressTracker::new(TrackerConfig::default().with_heartbeat(30, 60));
        let (tx, mut rx) = mpsc::channel(16);
        let connection = tracker.subscribe(tx, None, vec![], vec![]).await;
        drain(&mut rx);

        let now = Instant::now();
        assert_eq!(tracker.sweep_connections(now), SweepReport::default());

        let report = tracker.sweep_connections(now + Duration::from_secs(35));
        assert_eq!(report, SweepReport { pinged: 1, removed: 0 });
        assert!(matches!(drain(&mut rx)[0], ServerMessage::Ping { .. }));

        let report = tracker.sweep_connections(now + Duration::from_secs(61));
        assert_eq!(report, SweepReport { pinged: 0, removed: 1 });
        assert!(!tracker.heartbeat(&connection));
    }

    #[tokio::test]
    async fn test_history_is_persisted_and_evicted() {
        let store = Arc::new(MemoryProgressStore::new());
        let tracker = ProgressTracker::with_store(TrackerConfig::default(), store.clone());
        tracker.create_job("job", 6, "user", None).await.unwrap();
        tracker
            .update_status("job", ProcessingStatus::Cancelled, Some("stopped".into()), None)
            .await
            .unwrap();

        assert_eq!(tracker.evict_finished(Duration::ZERO).await, 1);
        assert_eq!(store.len(), 1);

        let history = tracker.get_job_history("job").await.unwrap().unwrap();
        assert_eq!(history.final_status, Some(ProcessingStatus::Cancelled));
        let latest = history.latest().unwrap();
        assert_eq!(latest.metadata["message"], "stopped");
    }

    #[tokio::test]
    async fn test_subscribe_replays_persisted_history() {
        let store = Arc::new(MemoryProgressStore::new());
        let tracker = ProgressTracker::with_store(TrackerConfig::default(), store.clone());
        tracker.create_job("job", 6, "user", None).await.unwrap();
        tracker
            .update_status("job", ProcessingStatus::Completed, None, None)
            .await
            .unwrap();
        tracker.evict_finished(Duration::ZERO).await;

        let (tx, mut rx) = mpsc::channel(16);
        tracker.subscribe(tx, None, vec!["job".into()], vec![]).await;
        let messages = drain(&mut rx);
        let updates = progress_updates(&messages);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, ProcessingStatus::Completed);
    }

    #[tokio::test]
    async fn test_fail_interrupted_closes_orphaned_histories_once() {
        let store = Arc::new(MemoryProgressStore::new());
        let previous = ProgressTracker::with_store(
            TrackerConfig::default().with_rate_limit(0),
            store.clone(),
        );
        previous.create_job("orphan", 6, "user", None).await.unwrap();
        previous
            .update_progress("orphan", ProgressUpdate::new().percentage(40.0).completed_steps(2))
            .await
            .unwrap();
        previous.create_job("done", 6, "user", None).await.unwrap();
        previous
            .update_status("done", ProcessingStatus::Completed, None, None)
            .await
            .unwrap();
        previous.flush().await;

        let tracker = ProgressTracker::with_store(TrackerConfig::default(), store.clone());
        tracker.create_job("live", 6, "user", None).await.unwrap();
        tracker.flush().await;

        let failed = tracker.fail_interrupted("restarted").await.unwrap();
        assert_eq!(failed, vec!["orphan".to_string()]);
        assert!(tracker.is_active("live"));

        let latest = tracker.get_job_progress("orphan").await.unwrap().unwrap();
        assert_eq!(latest.status, ProcessingStatus::Failed);
        assert_eq!(latest.error_message.as_deref(), Some("restarted"));
        assert_eq!(latest.progress_percentage, 40.0);

        assert!(tracker.fail_interrupted("restarted").await.unwrap().is_empty());
    }

    #[test]
    fn test_jobs_by_hour_keeps_last_day() {
        let mut state = AnalyticsState::default();
        let start = DateTime::parse_from_rfc3339("2024-06-01T10:15:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let hour = |s: &str| DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc);
        state.record_created(start);
        state.record_created(start + TimeDelta::minutes(30));
        assert_eq!(state.jobs_by_hour.get(&hour("2024-06-01T10:00:00Z")), Some(&2));

        state.record_created(start + TimeDelta::hours(23));
        assert_eq!(state.jobs_by_hour.len(), 2);

        state.record_created(start + TimeDelta::days(1) + TimeDelta::hours(1));
        assert_eq!(state.jobs_by_hour.len(), 2);
        assert!(!state.jobs_by_hour.contains_key(&hour("2024-06-01T10:00:00Z")));
        assert_eq!(state.jobs_by_hour.get(&hour("2024-06-02T11:00:00Z")), Some(&1));
    }

    #[tokio::test]
    async fn test_closed_sink_is_dropped_on_confirmation() {
        let tracker = tracker();
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        tracker.subscribe(tx, Some("user".into()), vec![], vec![]).await;
        assert_eq!(tracker.connection_count(), 0);
    }
}

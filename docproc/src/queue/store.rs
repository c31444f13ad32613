//! Backing stores for the task queue.
//!
//! A store keeps one bucket per priority for tasks that are ready to run and a
//! delayed set ordered by execute-at time. The queue never inspects stage
//! semantics; stores only order and hand out [`TaskInfo`] records.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use super::task::{TaskInfo, TaskPriority};
use crate::Result;

/// Per-bucket depths of a queue store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepths {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub delayed: usize,
}

impl QueueDepths {
    pub fn ready(&self) -> usize {
        self.critical + self.high + self.normal + self.low
    }

    pub fn total(&self) -> usize {
        self.ready() + self.delayed
    }

    pub fn for_priority(&self, priority: TaskPriority) -> usize {
        match priority {
            TaskPriority::Critical => self.critical,
            TaskPriority::High => self.high,
            TaskPriority::Normal => self.normal,
            TaskPriority::Low => self.low,
        }
    }

    fn slot_mut(&mut self, priority: TaskPriority) -> &mut usize {
        match priority {
            TaskPriority::Critical => &mut self.critical,
            TaskPriority::High => &mut self.high,
            TaskPriority::Normal => &mut self.normal,
            TaskPriority::Low => &mut self.low,
        }
    }
}

/// Persistence backend of the task queue.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Check that the backend is reachable.
    async fn ping(&self) -> Result<()>;

    /// Insert a task, replacing any entry with the same id.
    ///
    /// `execute_at_ms` (epoch milliseconds) puts the task in the delayed set.
    async fn push(&self, task: &TaskInfo, execute_at_ms: Option<i64>) -> Result<()>;

    /// Move delayed entries whose execute-at time is `<= now_ms` into their
    /// priority bucket. Returns how many were promoted.
    async fn promote_due(&self, now_ms: i64) -> Result<usize>;

    /// Pop the head of the highest non-empty priority bucket.
    async fn pop(&self) -> Result<Option<TaskInfo>>;

    /// Remove a task from both the ready buckets and the delayed set.
    async fn remove(&self, task_id: &str) -> Result<bool>;

    async fn depths(&self) -> Result<QueueDepths>;

    /// Every entry currently held, ready or delayed.
    async fn load_all(&self) -> Result<Vec<TaskInfo>>;
}

#[derive(Default)]
struct MemoryState {
    buckets: [VecDeque<TaskInfo>; 4],
    /// Keyed by (execute_at_ms, insertion sequence).
    delayed: BTreeMap<(i64, u64), TaskInfo>,
    seq: u64,
}

impl MemoryState {
    fn bucket_mut(&mut self, priority: TaskPriority) -> &mut VecDeque<TaskInfo> {
        &mut self.buckets[priority.rank() as usize]
    }

    fn remove(&mut self, task_id: &str) -> bool {
        let mut removed = false;
        for bucket in self.buckets.iter_mut() {
            let before = bucket.len();
            bucket.retain(|t| t.task_id != task_id);
            removed |= bucket.len() != before;
        }
        let before = self.delayed.len();
        self.delayed.retain(|_, t| t.task_id != task_id);
        removed || self.delayed.len() != before
    }
}

/// In-process queue store.
#[derive(Default)]
pub struct MemoryQueueStore {
    state: Mutex<MemoryState>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn push(&self, task: &TaskInfo, execute_at_ms: Option<i64>) -> Result<()> {
        let mut state = self.state.lock();
        state.remove(&task.task_id);
        match execute_at_ms {
            Some(at) => {
                state.seq += 1;
                let seq = state.seq;
                state.delayed.insert((at, seq), task.clone());
            }
            None => state.bucket_mut(task.priority).push_back(task.clone()),
        }
        Ok(())
    }

    async fn promote_due(&self, now_ms: i64) -> Result<usize> {
        let mut state = self.state.lock();
        let mut promoted = 0;
        loop {
            let due = match state.delayed.first_key_value() {
                Some((&(at, _), _)) => at <= now_ms,
                None => false,
            };
            if !due {
                break;
            }
            if let Some((_, task)) = state.delayed.pop_first() {
                let priority = task.priority;
                state.bucket_mut(priority).push_back(task);
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn pop(&self) -> Result<Option<TaskInfo>> {
        let mut state = self.state.lock();
        for priority in TaskPriority::DESCENDING {
            if let Some(task) = state.bucket_mut(priority).pop_front() {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    async fn remove(&self, task_id: &str) -> Result<bool> {
        Ok(self.state.lock().remove(task_id))
    }

    async fn depths(&self) -> Result<QueueDepths> {
        let state = self.state.lock();
        let mut depths = QueueDepths {
            delayed: state.delayed.len(),
            ..Default::default()
        };
        for priority in TaskPriority::DESCENDING {
            *depths.slot_mut(priority) = state.buckets[priority.rank() as usize].len();
        }
        Ok(depths)
    }

    async fn load_all(&self) -> Result<Vec<TaskInfo>> {
        let state = self.state.lock();
        let mut all: Vec<TaskInfo> = state.buckets.iter().flatten().cloned().collect();
        all.extend(state.delayed.values().cloned());
        Ok(all)
    }
}

//! Persistence of job progress histories.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

use super::snapshot::JobProgressHistory;
use crate::Result;

/// Durable storage for [`JobProgressHistory`] records with a retention TTL.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Insert or replace the history of a job.
    async fn save_history(&self, history: &JobProgressHistory, expires_at: DateTime<Utc>) -> Result<()>;

    async fn load_history(&self, job_id: &str) -> Result<Option<JobProgressHistory>>;

    /// Unexpired histories that have no final status yet.
    async fn load_unfinished(&self) -> Result<Vec<JobProgressHistory>>;

    /// Delete records whose TTL elapsed before `now`. Returns the number removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// In-process progress store.
#[derive(Default)]
pub struct MemoryProgressStore {
    records: Mutex<HashMap<String, (JobProgressHistory, DateTime<Utc>)>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn save_history(&self, history: &JobProgressHistory, expires_at: DateTime<Utc>) -> Result<()> {
        self.records
            .lock()
            .insert(history.job_id.clone(), (history.clone(), expires_at));
        Ok(())
    }

    async fn load_history(&self, job_id: &str) -> Result<Option<JobProgressHistory>> {
        let now = Utc::now();
        Ok(self
            .records
            .lock()
            .get(job_id)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(history, _)| history.clone()))
    }

    async fn load_unfinished(&self) -> Result<Vec<JobProgressHistory>> {
        let now = Utc::now();
        Ok(self
            .records
            .lock()
            .values()
            .filter(|(history, expires_at)| *expires_at > now && history.final_status.is_none())
            .map(|(history, _)| history.clone())
            .collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, (_, expires_at)| *expires_at > now);
        Ok((before - records.len()) as u64)
    }
}

//! In-memory implementation of the coordination store for tests and
//! development.
//!
//! Mirrors the Redis backend's ordering semantics: the waiting and delayed
//! indexes are ordered by `(score, id)` so equal scores fall back to the id
//! tie-break, and every multi-step transition runs under one lock so it is
//! atomic with respect to other operations.

use super::CoordinationStore;
use crate::{
    job::JobId,
    priority::{queue_score, JobPriority},
    store::MockClock,
    Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::sync::Mutex;

#[derive(Default)]
struct QueueIndexes {
    waiting: BTreeSet<(i64, JobId)>,
    processing: HashSet<JobId>,
    delayed: BTreeSet<(i64, JobId)>,
    dlq: Vec<JobId>,
}

#[derive(Default)]
struct CoordinationState {
    queues: HashMap<String, QueueIndexes>,
    poison: HashMap<JobId, Vec<i64>>,
}

/// Coordination store kept entirely in process memory.
#[derive(Clone)]
pub struct InMemoryCoordination {
    state: Arc<Mutex<CoordinationState>>,
    clock: MockClock,
}

impl InMemoryCoordination {
    pub fn new() -> Self {
        Self::with_clock(MockClock::new())
    }

    /// Create a store reading time from the given clock.
    pub fn with_clock(clock: MockClock) -> Self {
        Self {
            state: Arc::new(Mutex::new(CoordinationState::default())),
            clock,
        }
    }
}

impl Default for InMemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordination {
    async fn enqueue(&self, queue: &str, job_id: JobId, priority: JobPriority) -> Result<()> {
        let score = queue_score(priority, self.clock.now().timestamp_millis()) as i64;
        let mut state = self.state.lock().await;
        let indexes = state.queues.entry(queue.to_string()).or_default();
        indexes.waiting.retain(|(_, id)| *id != job_id);
        indexes.waiting.insert((score, job_id));
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<JobId>> {
        let mut state = self.state.lock().await;
        let indexes = state.queues.entry(queue.to_string()).or_default();
        let first = indexes.waiting.iter().next().copied();
        match first {
            Some(entry) => {
                indexes.waiting.remove(&entry);
                indexes.processing.insert(entry.1);
                Ok(Some(entry.1))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, queue: &str, job_id: JobId) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(indexes) = state.queues.get_mut(queue) {
            indexes.processing.remove(&job_id);
        }
        Ok(())
    }

    async fn remove_waiting(&self, queue: &str, job_id: JobId) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(indexes) = state.queues.get_mut(queue) {
            indexes.waiting.retain(|(_, id)| *id != job_id);
        }
        Ok(())
    }

    async fn is_waiting(&self, queue: &str, job_id: JobId) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state
            .queues
            .get(queue)
            .map(|indexes| indexes.waiting.iter().any(|(_, id)| *id == job_id))
            .unwrap_or(false))
    }

    async fn schedule_at(&self, queue: &str, job_id: JobId, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        let indexes = state.queues.entry(queue.to_string()).or_default();
        indexes.delayed.retain(|(_, id)| *id != job_id);
        indexes.delayed.insert((at.timestamp_millis(), job_id));
        Ok(())
    }

    async fn remove_delayed(&self, queue: &str, job_id: JobId) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(indexes) = state.queues.get_mut(queue) {
            indexes.delayed.retain(|(_, id)| *id != job_id);
        }
        Ok(())
    }

    async fn pop_due(&self, queue: &str) -> Result<Vec<JobId>> {
        let now_ms = self.clock.now().timestamp_millis();
        let mut state = self.state.lock().await;
        let indexes = state.queues.entry(queue.to_string()).or_default();
        let due: Vec<(i64, JobId)> = indexes
            .delayed
            .iter()
            .take_while(|(at_ms, _)| *at_ms <= now_ms)
            .copied()
            .collect();
        for entry in &due {
            indexes.delayed.remove(entry);
        }
        Ok(due.into_iter().map(|(_, id)| id).collect())
    }

    async fn processing_ids(&self, queue: &str) -> Result<Vec<JobId>> {
        let state = self.state.lock().await;
        Ok(state
            .queues
            .get(queue)
            .map(|indexes| indexes.processing.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn move_to_dlq(&self, queue: &str, job_id: JobId) -> Result<()> {
        let mut state = self.state.lock().await;
        let indexes = state.queues.entry(queue.to_string()).or_default();
        indexes.processing.remove(&job_id);
        indexes.dlq.push(job_id);
        Ok(())
    }

    async fn dlq_ids(&self, queue: &str) -> Result<Vec<JobId>> {
        let state = self.state.lock().await;
        Ok(state
            .queues
            .get(queue)
            .map(|indexes| indexes.dlq.clone())
            .unwrap_or_default())
    }

    async fn remove_from_dlq(&self, queue: &str, job_id: JobId) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(indexes) = state.queues.get_mut(queue) {
            indexes.dlq.retain(|id| *id != job_id);
        }
        Ok(())
    }

    async fn record_failure(&self, job_id: JobId, window: Duration) -> Result<u64> {
        let now_ms = self.clock.now().timestamp_millis();
        let cutoff = now_ms - window.as_millis() as i64;
        let mut state = self.state.lock().await;
        let failures = state.poison.entry(job_id).or_default();
        failures.push(now_ms);
        failures.retain(|at_ms| *at_ms > cutoff);
        Ok(failures.len() as u64)
    }

    async fn ping(&self) -> Result<Duration> {
        Ok(Duration::from_micros(1))
    }
}

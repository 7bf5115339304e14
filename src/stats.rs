//! Statistics collection for job processing.
//!
//! Workers record lifecycle events through a [`StatisticsCollector`]; the
//! bundled [`InMemoryStatsCollector`] aggregates them into time-windowed
//! [`JobStatistics`]. Exposition (HTTP, Prometheus, dashboards) is left to
//! the embedding application.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

use crate::priority::JobPriority;

/// Aggregated processing statistics over a time window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStatistics {
    pub total_processed: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
    pub avg_processing_time_ms: f64,
    pub min_processing_time_ms: u64,
    pub max_processing_time_ms: u64,
    pub error_rate: f64,
}

/// Per-queue statistics snapshot, with a breakdown of processed jobs by
/// priority class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    /// Name of the queue
    pub queue: String,
    /// Aggregated processing statistics for the queue
    pub statistics: JobStatistics,
    /// Processed job counts (completed, failed, dead) per priority
    pub jobs_by_priority: HashMap<JobPriority, u64>,
}

/// Job processing event for statistics collection.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub queue: String,
    pub event_type: JobEventType,
    pub priority: JobPriority,
    pub processing_time_ms: Option<u64>,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEventType {
    Started,
    Completed,
    Failed,
    Dead,
}

/// Trait for collecting and storing job statistics
#[async_trait::async_trait]
pub trait StatisticsCollector: Send + Sync {
    /// Record a job processing event
    async fn record_event(&self, event: JobEvent) -> crate::Result<()>;

    /// Get statistics for a specific queue over a time window
    async fn get_queue_statistics(
        &self,
        queue: &str,
        window: Duration,
    ) -> crate::Result<JobStatistics>;

    /// Get statistics for all queues seen in the window
    async fn get_all_statistics(&self, window: Duration) -> crate::Result<Vec<QueueStats>>;

    /// Get overall system statistics
    async fn get_system_statistics(&self, window: Duration) -> crate::Result<JobStatistics>;
}

/// In-memory statistics collector with bounded, time-windowed storage.
pub struct InMemoryStatsCollector {
    events: Arc<RwLock<Vec<JobEvent>>>,
    max_events: usize,
}

impl InMemoryStatsCollector {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            max_events,
        }
    }

    pub fn new_default() -> Self {
        Self::new(100_000)
    }

    fn calculate(&self, events: &[&JobEvent]) -> JobStatistics {
        let completed = events
            .iter()
            .filter(|e| e.event_type == JobEventType::Completed)
            .count() as u64;
        let failed = events
            .iter()
            .filter(|e| e.event_type == JobEventType::Failed)
            .count() as u64;
        let dead = events
            .iter()
            .filter(|e| e.event_type == JobEventType::Dead)
            .count() as u64;
        let total_processed = completed + failed + dead;

        let times: Vec<u64> = events.iter().filter_map(|e| e.processing_time_ms).collect();
        let (avg, min, max) = if times.is_empty() {
            (0.0, 0, 0)
        } else {
            let sum: u64 = times.iter().sum();
            (
                sum as f64 / times.len() as f64,
                *times.iter().min().unwrap(),
                *times.iter().max().unwrap(),
            )
        };

        let error_rate = if total_processed > 0 {
            (failed + dead) as f64 / total_processed as f64
        } else {
            0.0
        };

        JobStatistics {
            total_processed,
            completed,
            failed,
            dead,
            avg_processing_time_ms: avg,
            min_processing_time_ms: min,
            max_processing_time_ms: max,
            error_rate,
        }
    }

    fn window_cutoff(window: Duration) -> DateTime<Utc> {
        Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::hours(1))
    }

    fn windowed<F>(&self, window: Duration, filter: F) -> JobStatistics
    where
        F: Fn(&JobEvent) -> bool,
    {
        let cutoff = Self::window_cutoff(window);
        let events = self.events.read().unwrap();
        let matching: Vec<&JobEvent> = events
            .iter()
            .filter(|e| e.timestamp >= cutoff && filter(e))
            .collect();
        self.calculate(&matching)
    }
}

#[async_trait::async_trait]
impl StatisticsCollector for InMemoryStatsCollector {
    async fn record_event(&self, event: JobEvent) -> crate::Result<()> {
        let mut events = self.events.write().unwrap();
        events.push(event);
        if events.len() > self.max_events {
            let excess = events.len() - self.max_events;
            events.drain(0..excess);
        }
        Ok(())
    }

    async fn get_queue_statistics(
        &self,
        queue: &str,
        window: Duration,
    ) -> crate::Result<JobStatistics> {
        Ok(self.windowed(window, |e| e.queue == queue))
    }

    async fn get_all_statistics(&self, window: Duration) -> crate::Result<Vec<QueueStats>> {
        let cutoff = Self::window_cutoff(window);
        let events = self.events.read().unwrap();

        let mut by_queue: BTreeMap<&str, Vec<&JobEvent>> = BTreeMap::new();
        for event in events.iter().filter(|e| e.timestamp >= cutoff) {
            by_queue.entry(event.queue.as_str()).or_default().push(event);
        }

        Ok(by_queue
            .into_iter()
            .map(|(queue, queue_events)| {
                let mut jobs_by_priority: HashMap<JobPriority, u64> = JobPriority::all_priorities()
                    .into_iter()
                    .map(|priority| (priority, 0))
                    .collect();
                for event in &queue_events {
                    if matches!(
                        event.event_type,
                        JobEventType::Completed | JobEventType::Failed | JobEventType::Dead
                    ) {
                        *jobs_by_priority.entry(event.priority).or_insert(0) += 1;
                    }
                }
                QueueStats {
                    queue: queue.to_string(),
                    statistics: self.calculate(&queue_events),
                    jobs_by_priority,
                }
            })
            .collect())
    }

    async fn get_system_statistics(&self, window: Duration) -> crate::Result<JobStatistics> {
        Ok(self.windowed(window, |_| true))
    }
}

//! Periodic promotion, reclaim and reconciliation.
//!
//! The scheduler is one long-lived loop per process. Every step it takes is
//! idempotent, so running several scheduler instances against the same stores
//! is safe. Each tick, per queue:
//!
//! - due entries in the delayed index are promoted back into the waiting
//!   index (retry delays and future-scheduled jobs),
//! - processing entries whose visibility timeout elapsed are reclaimed,
//! - and, periodically, PENDING rows missing from the waiting index are
//!   re-enqueued (crash between the two coordination writes).

use crate::{
    config::Config,
    coordination::CoordinationStore,
    job::{JobId, JobStatus},
    store::{history_entry, DurableStore},
    Result,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::{sync::mpsc, time::sleep};
use tracing::{debug, error, info, warn};

/// How many ticks pass between orphan sweeps.
const ORPHAN_SWEEP_EVERY: u64 = 60;

/// Scheduler loop driving delayed promotion and visibility-timeout reclaim.
pub struct Scheduler<D, C> {
    durable: Arc<D>,
    coordination: Arc<C>,
    queues: Vec<String>,
    tick_interval: Duration,
}

impl<D, C> Scheduler<D, C>
where
    D: DurableStore,
    C: CoordinationStore,
{
    pub fn new(durable: Arc<D>, coordination: Arc<C>, config: &Config) -> Self {
        Self {
            durable,
            coordination,
            queues: config.queues.clone(),
            tick_interval: config.scheduler_interval,
        }
    }

    /// Run until a shutdown signal arrives. The orphan sweep runs once at
    /// startup and then every [`ORPHAN_SWEEP_EVERY`] ticks.
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        info!(queues = ?self.queues, "scheduler started");

        if let Err(e) = self.sweep_orphans().await {
            warn!("startup orphan sweep failed: {}", e);
        }

        let mut ticks: u64 = 0;
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("scheduler shutting down");
                    break;
                }
                _ = sleep(self.tick_interval) => {
                    if let Err(e) = self.tick().await {
                        error!("scheduler tick failed: {}", e);
                    }
                    ticks += 1;
                    if ticks % ORPHAN_SWEEP_EVERY == 0 {
                        if let Err(e) = self.sweep_orphans().await {
                            warn!("orphan sweep failed: {}", e);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// One scheduler pass over every configured queue.
    pub async fn tick(&self) -> Result<()> {
        for queue in &self.queues {
            self.promote_due(queue).await?;
            self.reclaim_timed_out(queue).await?;
        }
        Ok(())
    }

    /// Move due entries from the delayed index into the waiting index.
    ///
    /// The durable row decides what promotion means: SCHEDULED rows become
    /// PENDING, FAILED/PENDING rows are simply re-enqueued, anything else
    /// (cancelled during the delay, completed externally) is dropped.
    async fn promote_due(&self, queue: &str) -> Result<()> {
        let due = self.coordination.pop_due(queue).await?;
        for job_id in due {
            let Some(job) = self.durable.get_job(job_id).await? else {
                debug!(job_id = %job_id, queue, "due job no longer exists, dropping");
                continue;
            };
            match job.status {
                JobStatus::Scheduled => {
                    if self.durable.promote_scheduled(job_id).await?.is_some() {
                        self.durable
                            .append_history(&history_entry(
                                self.durable.as_ref(),
                                job_id,
                                JobStatus::Pending,
                                Some("Promoted from schedule".to_string()),
                                None,
                            ))
                            .await?;
                        self.coordination
                            .enqueue(queue, job_id, job.priority)
                            .await?;
                        debug!(job_id = %job_id, queue, "scheduled job promoted");
                    }
                }
                JobStatus::Pending | JobStatus::Failed => {
                    self.coordination
                        .enqueue(queue, job_id, job.priority)
                        .await?;
                    debug!(job_id = %job_id, queue, status = %job.status, "due job re-enqueued");
                }
                status => {
                    debug!(job_id = %job_id, queue, %status, "due job moved on, dropping");
                }
            }
        }
        Ok(())
    }

    /// Return expired claims to the waiting index.
    ///
    /// The reclaim is conditional on the observed `locked_at`, so a finalize
    /// racing this sweep wins and the reclaim becomes a no-op.
    async fn reclaim_timed_out(&self, queue: &str) -> Result<()> {
        let now = self.durable.now();
        for job_id in self.coordination.processing_ids(queue).await? {
            let Some(job) = self.durable.get_job(job_id).await? else {
                self.coordination.ack(queue, job_id).await?;
                continue;
            };
            if job.status != JobStatus::Processing {
                // Finalize wrote the row but crashed before the ack.
                self.coordination.ack(queue, job_id).await?;
                debug!(job_id = %job_id, queue, status = %job.status, "cleared stale processing entry");
                continue;
            }
            let Some(locked_at) = job.locked_at else {
                continue;
            };
            let held_ms = (now - locked_at).num_milliseconds();
            if held_ms <= job.visibility_timeout_ms {
                continue;
            }
            if self
                .durable
                .reclaim_job(job_id, locked_at)
                .await?
                .is_some()
            {
                self.coordination.ack(queue, job_id).await?;
                self.coordination
                    .enqueue(queue, job_id, job.priority)
                    .await?;
                self.durable
                    .append_history(&history_entry(
                        self.durable.as_ref(),
                        job_id,
                        JobStatus::Pending,
                        Some(format!(
                            "Reclaimed after visibility timeout ({} ms)",
                            job.visibility_timeout_ms
                        )),
                        job.locked_by.clone(),
                    ))
                    .await?;
                warn!(job_id = %job_id, queue, held_ms, "reclaimed timed-out job");
            }
        }
        Ok(())
    }

    /// Re-enqueue PENDING rows that lost their waiting-index entry.
    ///
    /// A crash between the delayed-index pop and the waiting-index add leaves
    /// a PENDING row referenced by neither index; the visibility-timeout
    /// reclaim never sees it because the row is not PROCESSING.
    pub async fn sweep_orphans(&self) -> Result<()> {
        for queue in &self.queues {
            let in_flight: Vec<JobId> = self.coordination.processing_ids(queue).await?;
            for job_id in self.durable.pending_job_ids(queue).await? {
                if in_flight.contains(&job_id) {
                    continue;
                }
                if self.coordination.is_waiting(queue, job_id).await? {
                    continue;
                }
                let Some(job) = self.durable.get_job(job_id).await? else {
                    continue;
                };
                if job.status != JobStatus::Pending {
                    continue;
                }
                self.coordination
                    .enqueue(queue, job_id, job.priority)
                    .await?;
                info!(job_id = %job_id, queue, "re-enqueued orphaned pending job");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryCoordination;
    use crate::job::Job;
    use crate::store::{InMemoryStore, MockClock};
    use serde_json::json;

    struct Harness {
        durable: Arc<InMemoryStore>,
        coordination: Arc<InMemoryCoordination>,
        clock: MockClock,
        scheduler: Scheduler<InMemoryStore, InMemoryCoordination>,
    }

    fn harness() -> Harness {
        let clock = MockClock::new();
        let durable = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let coordination = Arc::new(InMemoryCoordination::with_clock(clock.clone()));
        let config = Config::default().with_queues(vec!["q".to_string()]);
        let scheduler = Scheduler::new(durable.clone(), coordination.clone(), &config);
        Harness {
            durable,
            coordination,
            clock,
            scheduler,
        }
    }

    #[tokio::test]
    async fn test_promote_due_scheduled_job() {
        let h = harness();
        let at = h.clock.now() + chrono::Duration::seconds(5);
        let job = Job::new("q", "echo", json!({})).scheduled_for(at);
        h.durable.insert_job(&job).await.unwrap();
        h.coordination.schedule_at("q", job.id, at).await.unwrap();

        h.scheduler.tick().await.unwrap();
        assert!(!h.coordination.is_waiting("q", job.id).await.unwrap());

        h.clock.advance(chrono::Duration::seconds(6));
        h.scheduler.tick().await.unwrap();

        let promoted = h.durable.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(promoted.status, JobStatus::Pending);
        assert!(promoted.scheduled_at.is_none());
        assert!(h.coordination.is_waiting("q", job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_promote_drops_cancelled_job() {
        let h = harness();
        let at = h.clock.now() + chrono::Duration::seconds(5);
        let job = Job::new("q", "echo", json!({})).scheduled_for(at);
        h.durable.insert_job(&job).await.unwrap();
        h.coordination.schedule_at("q", job.id, at).await.unwrap();
        h.durable.cancel_job(job.id).await.unwrap();

        h.clock.advance(chrono::Duration::seconds(6));
        h.scheduler.tick().await.unwrap();
        assert!(!h.coordination.is_waiting("q", job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_promote_requeues_failed_job_after_backoff() {
        let h = harness();
        let job = Job::new("q", "echo", json!({}));
        h.durable.insert_job(&job).await.unwrap();
        h.durable.claim_job(job.id, "w1").await.unwrap();
        h.durable.fail_job(job.id, "boom").await.unwrap();
        let retry_at = h.clock.now() + chrono::Duration::seconds(2);
        h.coordination
            .schedule_at("q", job.id, retry_at)
            .await
            .unwrap();

        h.clock.advance(chrono::Duration::seconds(3));
        h.scheduler.tick().await.unwrap();
        assert!(h.coordination.is_waiting("q", job.id).await.unwrap());
        // Row stays FAILED until a worker claims it again.
        let row = h.durable.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_reclaim_expired_claim() {
        let h = harness();
        let job = Job::new("q", "echo", json!({})).with_visibility_timeout_ms(5_000);
        h.durable.insert_job(&job).await.unwrap();
        h.coordination
            .enqueue("q", job.id, job.priority)
            .await
            .unwrap();
        h.coordination.dequeue("q").await.unwrap();
        h.durable.claim_job(job.id, "w1").await.unwrap();

        // Claim still fresh: nothing happens.
        h.scheduler.tick().await.unwrap();
        assert_eq!(h.coordination.processing_ids("q").await.unwrap().len(), 1);

        h.clock.advance(chrono::Duration::seconds(6));
        h.scheduler.tick().await.unwrap();

        let reclaimed = h.durable.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(reclaimed.status, JobStatus::Pending);
        assert_eq!(reclaimed.attempts, 1);
        assert!(reclaimed.locked_by.is_none());
        assert!(h.coordination.processing_ids("q").await.unwrap().is_empty());
        assert!(h.coordination.is_waiting("q", job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_reclaim_clears_stale_processing_entry() {
        let h = harness();
        let job = Job::new("q", "echo", json!({}));
        h.durable.insert_job(&job).await.unwrap();
        h.coordination
            .enqueue("q", job.id, job.priority)
            .await
            .unwrap();
        h.coordination.dequeue("q").await.unwrap();
        h.durable.claim_job(job.id, "w1").await.unwrap();
        // Finalize wrote the row but the ack never happened.
        h.durable
            .complete_job(job.id, "w1", None)
            .await
            .unwrap()
            .unwrap();

        h.scheduler.tick().await.unwrap();
        assert!(h.coordination.processing_ids("q").await.unwrap().is_empty());
        let row = h.durable.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_orphan_sweep_restores_missing_waiting_entry() {
        let h = harness();
        let job = Job::new("q", "echo", json!({}));
        // Row exists but the waiting-index add never happened.
        h.durable.insert_job(&job).await.unwrap();

        h.scheduler.sweep_orphans().await.unwrap();
        assert!(h.coordination.is_waiting("q", job.id).await.unwrap());

        // Sweep is idempotent.
        h.scheduler.sweep_orphans().await.unwrap();
        assert_eq!(h.coordination.dequeue("q").await.unwrap(), Some(job.id));
        assert_eq!(h.coordination.dequeue("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_orphan_sweep_skips_in_flight_jobs() {
        let h = harness();
        let job = Job::new("q", "echo", json!({}));
        h.durable.insert_job(&job).await.unwrap();
        h.coordination
            .enqueue("q", job.id, job.priority)
            .await
            .unwrap();
        // Popped but not yet claimed: row still PENDING, id in processing.
        h.coordination.dequeue("q").await.unwrap();

        h.scheduler.sweep_orphans().await.unwrap();
        assert!(!h.coordination.is_waiting("q", job.id).await.unwrap());
    }
}

//! Worker: concurrency-bounded dequeue → execute → finalize loop.
//!
//! A worker runs N polling lanes against its queue list. Each lane pops a job
//! id from the coordination store, claims the durable row (the conditional
//! update is what makes the claim authoritative), runs the registered handler,
//! and finalizes: success writes COMPLETED, failure either schedules a retry
//! with exponential backoff or routes the job to the dead-letter queue when
//! its retries are exhausted or poison detection trips.
//!
//! Handlers run on their own task, so a panicking handler surfaces as a
//! normal job failure instead of killing the lane. Delivery is at-least-once:
//! a worker that dies mid-job leaves the claim to expire and the scheduler
//! re-dispatches it, so handlers must tolerate re-execution.

use crate::{
    config::Config,
    coordination::CoordinationStore,
    error::ConveyorError,
    job::{Job, JobId, JobStatus, WorkerHeartbeat},
    registry::HandlerRegistry,
    retry::RetryPolicy,
    stats::{JobEvent, JobEventType, StatisticsCollector},
    store::{history_entry, DurableStore},
    Result,
};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};
use tokio::{sync::mpsc, time::sleep};
use tracing::{debug, error, info, warn};

/// How long a draining worker waits for in-flight jobs before exiting anyway.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Heartbeat upsert period.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// A worker that processes jobs from a set of queues.
///
/// # Examples
///
/// ```rust,no_run
/// use conveyor::{Config, HandlerRegistry, JobResult, Worker};
/// use conveyor::coordination::RedisCoordination;
/// use conveyor::store::PostgresStore;
/// use std::sync::Arc;
/// use tokio::sync::mpsc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::from_env()?;
/// let durable = Arc::new(PostgresStore::connect(&config.database_url).await?);
/// let coordination = Arc::new(RedisCoordination::connect(&config.redis_url).await?);
///
/// let mut registry = HandlerRegistry::new();
/// registry.register("echo", |job| async move {
///     Ok(JobResult::with_data(job.payload))
/// });
///
/// let worker = Worker::new(durable, coordination, registry, &config);
/// let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
/// tokio::spawn(async move {
///     // send on shutdown_tx to drain and stop
///     let _ = shutdown_tx;
/// });
/// worker.run(shutdown_rx).await?;
/// # Ok(())
/// # }
/// ```
pub struct Worker<D, C> {
    durable: Arc<D>,
    coordination: Arc<C>,
    registry: HandlerRegistry,
    worker_id: String,
    queues: Vec<String>,
    concurrency: usize,
    poll_interval: Duration,
    retry_policy: RetryPolicy,
    poison_window: Duration,
    poison_threshold: u32,
    stats_collector: Option<Arc<dyn StatisticsCollector>>,
    draining: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
}

impl<D, C> Clone for Worker<D, C> {
    fn clone(&self) -> Self {
        Self {
            durable: self.durable.clone(),
            coordination: self.coordination.clone(),
            registry: self.registry.clone(),
            worker_id: self.worker_id.clone(),
            queues: self.queues.clone(),
            concurrency: self.concurrency,
            poll_interval: self.poll_interval,
            retry_policy: self.retry_policy,
            poison_window: self.poison_window,
            poison_threshold: self.poison_threshold,
            stats_collector: self.stats_collector.clone(),
            draining: self.draining.clone(),
            in_flight: self.in_flight.clone(),
        }
    }
}

impl<D, C> Worker<D, C>
where
    D: DurableStore + 'static,
    C: CoordinationStore + 'static,
{
    pub fn new(
        durable: Arc<D>,
        coordination: Arc<C>,
        registry: HandlerRegistry,
        config: &Config,
    ) -> Self {
        Self {
            durable,
            coordination,
            registry,
            worker_id: config.worker_id.clone(),
            queues: config.queues.clone(),
            concurrency: config.concurrency,
            poll_interval: config.poll_interval,
            retry_policy: RetryPolicy::new(config.retry_base_ms),
            poison_window: Duration::from_millis(config.poison_window_ms),
            poison_threshold: config.poison_threshold,
            stats_collector: None,
            draining: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Attach a statistics collector recording job lifecycle events.
    pub fn with_stats_collector(mut self, collector: Arc<dyn StatisticsCollector>) -> Self {
        self.stats_collector = Some(collector);
        self
    }

    /// Override the lane poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Identity this worker claims jobs under.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Number of jobs currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run lanes until a shutdown signal arrives, then drain.
    ///
    /// On shutdown the draining flag stops lanes from picking up new work,
    /// in-flight jobs get up to 30 seconds to finish, and the heartbeat row
    /// is removed. Jobs still running after the timeout are abandoned; their
    /// claims expire and the scheduler re-dispatches them.
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        info!(
            worker_id = %self.worker_id,
            queues = ?self.queues,
            concurrency = self.concurrency,
            handlers = ?self.registry.job_types(),
            "worker started"
        );

        let heartbeat_task = self.start_heartbeat_task();
        let mut lanes = Vec::with_capacity(self.concurrency);
        for lane in 0..self.concurrency {
            let worker = self.clone();
            lanes.push(tokio::spawn(async move {
                worker.run_lane(lane).await;
            }));
        }

        let _ = shutdown_rx.recv().await;
        info!(worker_id = %self.worker_id, "worker draining");
        self.draining.store(true, Ordering::SeqCst);

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
        }
        let abandoned = self.in_flight.load(Ordering::SeqCst);
        if abandoned > 0 {
            warn!(
                worker_id = %self.worker_id,
                abandoned,
                "drain timeout reached; unfinished jobs will be reclaimed"
            );
        }

        for lane in &lanes {
            lane.abort();
        }
        heartbeat_task.abort();
        if let Err(e) = self.durable.remove_heartbeat(&self.worker_id).await {
            warn!("failed to remove heartbeat: {}", e);
        }
        info!(worker_id = %self.worker_id, "worker stopped");
        Ok(())
    }

    async fn run_lane(&self, lane: usize) {
        debug!(worker_id = %self.worker_id, lane, "lane started");
        while !self.draining.load(Ordering::SeqCst) {
            match self.poll_once().await {
                Ok(true) => {
                    // Got a job; look for the next one immediately.
                }
                Ok(false) => sleep(self.poll_interval).await,
                Err(e) => {
                    error!(worker_id = %self.worker_id, lane, "polling pass failed: {}", e);
                    sleep(self.poll_interval).await;
                }
            }
        }
        debug!(worker_id = %self.worker_id, lane, "lane exited");
    }

    /// Try each queue in order and process at most one job. Returns whether
    /// a job was dequeued. Exposed for callers that drive polling manually.
    pub async fn poll_once(&self) -> Result<bool> {
        for queue in &self.queues {
            if let Some(job_id) = self.coordination.dequeue(queue).await? {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                let outcome = self.process_claimed(queue, job_id).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                outcome?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn process_claimed(&self, queue: &str, job_id: JobId) -> Result<()> {
        // The conditional claim settles races with cancellation and
        // concurrent workers: zero rows means the pop was stale.
        let Some(job) = self.durable.claim_job(job_id, &self.worker_id).await? else {
            debug!(job_id = %job_id, queue, "job not eligible, releasing claim");
            self.coordination.ack(queue, job_id).await?;
            return Ok(());
        };

        self.durable
            .append_history(&history_entry(
                self.durable.as_ref(),
                job.id,
                JobStatus::Processing,
                Some(format!("Attempt {}", job.attempts)),
                Some(self.worker_id.clone()),
            ))
            .await?;
        self.record_event(&job, JobEventType::Started, None, None).await;
        debug!(job_id = %job.id, queue, job_type = %job.job_type, attempt = job.attempts, "processing job");

        let started = Instant::now();
        let handler_result = match self.registry.resolve(&job.job_type) {
            Some(handler) => match tokio::spawn(handler(job.clone())).await {
                Ok(result) => result,
                Err(join_error) => Err(ConveyorError::Worker {
                    message: format!("handler panicked: {join_error}"),
                }),
            },
            None => Err(ConveyorError::Worker {
                message: format!("No handler registered for type '{}'", job.job_type),
            }),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match handler_result {
            Ok(job_result) => {
                match self
                    .durable
                    .complete_job(job.id, &self.worker_id, job_result.data)
                    .await?
                {
                    Some(completed) => {
                        self.durable
                            .append_history(&history_entry(
                                self.durable.as_ref(),
                                completed.id,
                                JobStatus::Completed,
                                Some(format!("Completed in {elapsed_ms} ms")),
                                Some(self.worker_id.clone()),
                            ))
                            .await?;
                        self.coordination.ack(queue, job.id).await?;
                        self.record_event(&job, JobEventType::Completed, Some(elapsed_ms), None)
                            .await;
                        debug!(job_id = %job.id, queue, elapsed_ms, "job completed");
                    }
                    None => {
                        // The claim was reclaimed while the handler ran; the
                        // re-dispatched execution owns the row now.
                        warn!(job_id = %job.id, queue, "claim lost during execution, dropping result");
                        self.coordination.ack(queue, job.id).await?;
                    }
                }
            }
            Err(handler_error) => {
                let message = handler_error.to_string();
                if let Err(finalize_error) = self
                    .handle_failure(queue, job.id, &message, elapsed_ms)
                    .await
                {
                    // Swallow so a broken failure path cannot wedge the
                    // processing set; the row will be reclaimed if needed.
                    error!(
                        job_id = %job.id,
                        queue,
                        "failure handling failed: {}",
                        finalize_error
                    );
                    let _ = self.coordination.ack(queue, job.id).await;
                }
            }
        }
        Ok(())
    }

    /// Failure path: poison check, then retry-with-backoff or dead-letter.
    async fn handle_failure(
        &self,
        queue: &str,
        job_id: JobId,
        error_message: &str,
        elapsed_ms: u64,
    ) -> Result<()> {
        // Fresh read to pick up the attempts increment from the claim.
        let Some(job) = self.durable.get_job(job_id).await? else {
            self.coordination.ack(queue, job_id).await?;
            return Ok(());
        };

        let in_window_failures = self
            .coordination
            .record_failure(job_id, self.poison_window)
            .await?;
        let poisoned = in_window_failures >= self.poison_threshold as u64;
        let retries_exhausted = job.attempts > job.max_retries;

        if poisoned || retries_exhausted {
            let reason = if poisoned {
                "Poison pill detected".to_string()
            } else {
                error_message.to_string()
            };
            self.durable.mark_job_dead(job_id, &reason).await?;
            self.durable
                .append_history(&history_entry(
                    self.durable.as_ref(),
                    job_id,
                    JobStatus::Dead,
                    Some(reason.clone()),
                    Some(self.worker_id.clone()),
                ))
                .await?;
            self.coordination.move_to_dlq(queue, job_id).await?;
            self.record_event(&job, JobEventType::Dead, Some(elapsed_ms), Some(reason.clone()))
                .await;
            warn!(
                job_id = %job_id,
                queue,
                attempts = job.attempts,
                poisoned,
                "job dead-lettered: {}",
                reason
            );
        } else {
            let delay = self.retry_policy.delay_for_attempt(job.attempts);
            let retry_at =
                self.durable.now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
            self.coordination.schedule_at(queue, job_id, retry_at).await?;
            self.durable.fail_job(job_id, error_message).await?;
            self.durable
                .append_history(&history_entry(
                    self.durable.as_ref(),
                    job_id,
                    JobStatus::Failed,
                    Some(format!(
                        "{error_message} (retry in {} ms)",
                        delay.as_millis()
                    )),
                    Some(self.worker_id.clone()),
                ))
                .await?;
            self.coordination.ack(queue, job_id).await?;
            self.record_event(
                &job,
                JobEventType::Failed,
                Some(elapsed_ms),
                Some(error_message.to_string()),
            )
            .await;
            info!(
                job_id = %job_id,
                queue,
                attempt = job.attempts,
                retry_in_ms = delay.as_millis() as u64,
                "job failed, retry scheduled"
            );
        }
        Ok(())
    }

    async fn record_event(
        &self,
        job: &Job,
        event_type: JobEventType,
        processing_time_ms: Option<u64>,
        error_message: Option<String>,
    ) {
        if let Some(collector) = &self.stats_collector {
            let event = JobEvent {
                job_id: job.id,
                queue: job.queue.clone(),
                event_type,
                priority: job.priority,
                processing_time_ms,
                error_message,
                timestamp: self.durable.now(),
            };
            if let Err(e) = collector.record_event(event).await {
                warn!("failed to record job event: {}", e);
            }
        }
    }

    fn start_heartbeat_task(&self) -> tokio::task::JoinHandle<()> {
        let worker = self.clone();
        tokio::spawn(async move {
            let started_at = worker.durable.now();
            let hostname =
                std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            loop {
                let heartbeat = WorkerHeartbeat {
                    worker_id: worker.worker_id.clone(),
                    hostname: hostname.clone(),
                    queues: worker.queues.clone(),
                    concurrency: worker.concurrency as u32,
                    active_jobs: worker.in_flight.load(Ordering::SeqCst) as u32,
                    started_at,
                    last_heartbeat: worker.durable.now(),
                };
                if let Err(e) = worker.durable.upsert_heartbeat(&heartbeat).await {
                    warn!(worker_id = %worker.worker_id, "heartbeat upsert failed: {}", e);
                }
                sleep(HEARTBEAT_INTERVAL).await;
            }
        })
    }
}

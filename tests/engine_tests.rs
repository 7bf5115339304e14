//! End-to-end scenarios driving intake, scheduler and worker together.


use conveyor::coordination::CoordinationStore;
use conveyor::intake::CreateJob;
use conveyor::job::JobStatus;
use conveyor::store::{DurableStore, JobFilter};
use conveyor::{ConveyorError, JobPriority};
use serde_json::json;
use test_utils::{advance_and_tick, engine};

fn create_request(queue: &str, job_type: &str, payload: serde_json::Value) -> CreateJob {
    CreateJob {
        queue: queue.to_string(),
        job_type: job_type.to_string(),
        priority: JobPriority::default(),
        payload,
        idempotency_key: None,
        max_retries: None,
        scheduled_at: None,
        visibility_timeout_ms: None,
    }
}

#[tokio::test]
async fn high_priority_beats_low_priority_submitted_at_same_instant() {
    let e = engine(&["q"]);

    let mut low = create_request("q", "echo", json!({"x": 2}));
    low.priority = JobPriority::Low;
    let mut high = create_request("q", "echo", json!({"x": 1}));
    high.priority = JobPriority::High;

    // The mock clock is frozen, so both enqueue at the same instant; the
    // priority weight alone decides the order.
    let low = e.intake.create(low).await.unwrap();
    let high = e.intake.create(high).await.unwrap();

    assert_eq!(e.coordination.dequeue("q").await.unwrap(), Some(high.job.id));
    assert_eq!(e.coordination.dequeue("q").await.unwrap(), Some(low.job.id));
}

#[tokio::test]
async fn fifo_order_within_one_priority() {
    let e = engine(&["q"]);
    let mut ids = Vec::new();
    for i in 0..4 {
        let created = e
            .intake
            .create(create_request("q", "echo", json!({"i": i})))
            .await
            .unwrap();
        ids.push(created.job.id);
        e.clock.advance(chrono::Duration::milliseconds(1));
    }
    for expected in ids {
        assert_eq!(e.coordination.dequeue("q").await.unwrap(), Some(expected));
    }
}

#[tokio::test]
async fn completed_job_stores_handler_result() {
    let e = engine(&["q"]);
    let created = e
        .intake
        .create(create_request("q", "echo", json!({"value": 42})))
        .await
        .unwrap();

    assert!(e.worker.poll_once().await.unwrap());

    let (job, history) = e.intake.get_job(created.job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(json!({"echo": {"value": 42}})));

    let statuses: Vec<JobStatus> = history.iter().map(|h| h.status).collect();
    assert_eq!(
        statuses,
        vec![
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed
        ]
    );
}

#[tokio::test]
async fn failing_job_walks_through_retries_to_the_dead_letter_queue() {
    let e = engine(&["q"]);
    let mut request = create_request("q", "always-fail", json!({}));
    request.max_retries = Some(2);
    let created = e.intake.create(request).await.unwrap();
    let id = created.job.id;

    let mut seen_attempts = Vec::new();
    for _round in 0..3 {
        assert!(e.worker.poll_once().await.unwrap());
        let job = e.durable.get_job(id).await.unwrap().unwrap();
        seen_attempts.push(job.attempts);
        // Leave the poison window between failures so exhaustion, not
        // poison detection, is what kills the job.
        advance_and_tick(&e, chrono::Duration::seconds(61)).await;
    }

    // Attempts observed on successive reads are monotonically non-decreasing.
    assert_eq!(seen_attempts, vec![1, 2, 3]);

    let dead = e.durable.get_job(id).await.unwrap().unwrap();
    assert_eq!(dead.status, JobStatus::Dead);
    assert_eq!(dead.attempts, 3);
    assert_eq!(dead.error.as_deref(), Some("Worker error: handler failed"));
    assert_eq!(e.coordination.dlq_ids("q").await.unwrap(), vec![id]);

    // Intermediate statuses walked PENDING→PROCESSING→FAILED cycles.
    let history = e.durable.get_history(id).await.unwrap();
    let statuses: Vec<JobStatus> = history.iter().map(|h| h.status).collect();
    assert_eq!(
        statuses,
        vec![
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Failed,
            JobStatus::Processing,
            JobStatus::Failed,
            JobStatus::Processing,
            JobStatus::Dead,
        ]
    );
}

#[tokio::test]
async fn repeated_failures_inside_the_window_trip_poison_detection() {
    let e = engine(&["q"]);
    let mut request = create_request("q", "always-fail", json!({}));
    request.max_retries = Some(50);
    let created = e.intake.create(request).await.unwrap();

    for _ in 0..3 {
        assert!(e.worker.poll_once().await.unwrap());
        // Well inside the 60 s window.
        advance_and_tick(&e, chrono::Duration::seconds(10)).await;
    }

    let dead = e.durable.get_job(created.job.id).await.unwrap().unwrap();
    assert_eq!(dead.status, JobStatus::Dead);
    assert_eq!(dead.error.as_deref(), Some("Poison pill detected"));
    assert_eq!(
        e.coordination.dlq_ids("q").await.unwrap(),
        vec![created.job.id]
    );
}

#[tokio::test]
async fn manual_retries_of_one_job_inside_the_window_also_trip_poison() {
    let e = engine(&["q"]);
    let mut request = create_request("q", "always-fail", json!({}));
    request.max_retries = Some(0);
    let created = e.intake.create(request).await.unwrap();
    let id = created.job.id;

    // First failure dead-letters immediately (no retries); an operator
    // re-submits the same job twice within the window.
    assert!(e.worker.poll_once().await.unwrap());
    for _ in 0..2 {
        e.clock.advance(chrono::Duration::seconds(5));
        e.intake.retry(id).await.unwrap();
        assert!(e.worker.poll_once().await.unwrap());
    }

    let dead = e.durable.get_job(id).await.unwrap().unwrap();
    assert_eq!(dead.status, JobStatus::Dead);
    // The third in-window failure is classified as poison, not plain
    // retry exhaustion.
    assert_eq!(dead.error.as_deref(), Some("Poison pill detected"));
}

#[tokio::test]
async fn duplicate_submissions_with_one_idempotency_key_collapse() {
    let e = engine(&["q"]);
    let mut request = create_request("q", "echo", json!({}));
    request.idempotency_key = Some("k1".to_string());

    let (a, b, c) = tokio::join!(
        e.intake.create(request.clone()),
        e.intake.create(request.clone()),
        e.intake.create(request.clone())
    );
    let results = [a.unwrap(), b.unwrap(), c.unwrap()];

    let fresh: Vec<_> = results.iter().filter(|r| !r.idempotent).collect();
    assert_eq!(fresh.len(), 1);
    let id = fresh[0].job.id;
    assert!(results.iter().all(|r| r.job.id == id));

    // Exactly one row exists for the key.
    let page = e
        .intake
        .list_jobs(&JobFilter {
            queue: Some("q".to_string()),
            status: None,
            limit: 10,
            offset: 0,
        })
        .await
        .unwrap();
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn scheduled_job_promotes_and_completes_after_its_instant() {
    let e = engine(&["q"]);
    let mut request = create_request("q", "echo", json!({"later": true}));
    request.scheduled_at = Some(e.clock.now() + chrono::Duration::seconds(2));
    let created = e.intake.create(request).await.unwrap();
    let id = created.job.id;

    // One second in: still scheduled, nothing to dequeue.
    advance_and_tick(&e, chrono::Duration::seconds(1)).await;
    assert_eq!(
        e.durable.get_job(id).await.unwrap().unwrap().status,
        JobStatus::Scheduled
    );
    assert!(!e.worker.poll_once().await.unwrap());

    // Past the instant: promoted, claimed, completed.
    advance_and_tick(&e, chrono::Duration::seconds(2)).await;
    let promoted = e.durable.get_job(id).await.unwrap().unwrap();
    assert_eq!(promoted.status, JobStatus::Pending);
    assert!(promoted.scheduled_at.is_none());

    assert!(e.worker.poll_once().await.unwrap());
    let done = e.durable.get_job(id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
}

#[tokio::test]
async fn crashed_worker_claim_is_reclaimed_and_redispatched() {
    let e = engine(&["q"]);
    let mut request = create_request("q", "echo", json!({}));
    request.visibility_timeout_ms = Some(5_000);
    let created = e.intake.create(request).await.unwrap();
    let id = created.job.id;

    // A worker popped and claimed the job, then died mid-handler.
    assert_eq!(e.coordination.dequeue("q").await.unwrap(), Some(id));
    e.durable.claim_job(id, "crashed-worker").await.unwrap();

    advance_and_tick(&e, chrono::Duration::seconds(6)).await;
    let reclaimed = e.durable.get_job(id).await.unwrap().unwrap();
    assert_eq!(reclaimed.status, JobStatus::Pending);
    assert_eq!(reclaimed.attempts, 1);
    assert!(reclaimed.locked_by.is_none());

    // Next worker claim increments to 2 and finishes the job.
    assert!(e.worker.poll_once().await.unwrap());
    let done = e.durable.get_job(id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempts, 2);
}

#[tokio::test]
async fn cancel_is_rejected_for_processing_and_allowed_for_pending() {
    let e = engine(&["q"]);

    let pending = e
        .intake
        .create(create_request("q", "echo", json!({})))
        .await
        .unwrap();
    let cancelled = e.intake.cancel(pending.job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let processing = e
        .intake
        .create(create_request("q", "echo", json!({})))
        .await
        .unwrap();
    e.coordination.dequeue("q").await.unwrap();
    e.durable
        .claim_job(processing.job.id, "w1")
        .await
        .unwrap();
    assert!(matches!(
        e.intake.cancel(processing.job.id).await,
        Err(ConveyorError::Conflict { .. })
    ));
}

#[tokio::test]
async fn retry_reopens_a_dead_job_with_attempts_reset() {
    let e = engine(&["q"]);
    let mut request = create_request("q", "always-fail", json!({}));
    request.max_retries = Some(0);
    let created = e.intake.create(request).await.unwrap();
    let id = created.job.id;

    assert!(e.worker.poll_once().await.unwrap());
    assert_eq!(
        e.durable.get_job(id).await.unwrap().unwrap().status,
        JobStatus::Dead
    );

    let retried = e.intake.retry(id).await.unwrap();
    assert_eq!(retried.status, JobStatus::Pending);
    assert_eq!(retried.attempts, 0);
    assert!(retried.error.is_none());
    assert!(e.coordination.dlq_ids("q").await.unwrap().is_empty());

    // It runs again (and fails again, back to the DLQ).
    assert!(e.worker.poll_once().await.unwrap());
    assert_eq!(
        e.durable.get_job(id).await.unwrap().unwrap().status,
        JobStatus::Dead
    );
}

#[tokio::test]
async fn worker_round_robins_across_queues() {
    let e = engine(&["alpha", "beta"]);
    let a = e
        .intake
        .create(create_request("alpha", "echo", json!({})))
        .await
        .unwrap();
    let b = e
        .intake
        .create(create_request("beta", "echo", json!({})))
        .await
        .unwrap();

    assert!(e.worker.poll_once().await.unwrap());
    assert!(e.worker.poll_once().await.unwrap());
    assert!(!e.worker.poll_once().await.unwrap());

    for id in [a.job.id, b.job.id] {
        assert_eq!(
            e.durable.get_job(id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }
}

#[tokio::test]
async fn listing_supports_status_filter_and_pagination() {
    let e = engine(&["q"]);
    for i in 0..3 {
        e.intake
            .create(create_request("q", "echo", json!({"i": i})))
            .await
            .unwrap();
        e.clock.advance(chrono::Duration::milliseconds(1));
    }
    assert!(e.worker.poll_once().await.unwrap());

    let completed = e
        .intake
        .list_jobs(&JobFilter {
            queue: Some("q".to_string()),
            status: Some(JobStatus::Completed),
            limit: 10,
            offset: 0,
        })
        .await
        .unwrap();
    assert_eq!(completed.total, 1);

    let pending = e
        .intake
        .list_jobs(&JobFilter {
            queue: Some("q".to_string()),
            status: Some(JobStatus::Pending),
            limit: 1,
            offset: 0,
        })
        .await
        .unwrap();
    assert_eq!(pending.total, 2);
    assert_eq!(pending.jobs.len(), 1);
}

#[tokio::test]
async fn processing_entries_always_resolve_within_the_reclaim_horizon() {
    // Any id sitting in processing(Q) either belongs to a PROCESSING row or
    // is cleared by the next scheduler pass after the visibility timeout.
    let e = engine(&["q"]);
    let mut request = create_request("q", "echo", json!({}));
    request.visibility_timeout_ms = Some(5_000);
    let created = e.intake.create(request).await.unwrap();

    e.coordination.dequeue("q").await.unwrap();
    e.durable.claim_job(created.job.id, "w1").await.unwrap();

    let row = e.durable.get_job(created.job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Processing);

    advance_and_tick(&e, chrono::Duration::seconds(6)).await;
    assert!(e.coordination.processing_ids("q").await.unwrap().is_empty());
}

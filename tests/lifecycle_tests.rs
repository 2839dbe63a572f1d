mod test_utils;

use leasework::{
    Clock, EntryOutcome, HandlerRegistry, HealthMonitor, Job, JobKind, JobStatus, LeaseworkError,
    RetryPromoter, RetryStrategy,
};
use serde_json::json;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};
use test_utils::Harness;
use tokio::sync::mpsc;
use uuid::Uuid;

fn flag_on_run(flag: Arc<AtomicBool>) -> HandlerRegistry {
    HandlerRegistry::new().register(JobKind::Download, move |_job, _ctx| {
        let flag = flag.clone();
        async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }
    })
}

#[tokio::test]
async fn test_orphan_without_retries_fails_and_redelivery_is_absorbed() {
    let h = Harness::new();
    let mut job = Job::new_at(JobKind::Download, json!({"object": "a.bin"}), h.clock.now())
        .with_max_retries(0);
    job.id = Uuid::from_u128(101);
    h.client.enqueue(&job).await.unwrap();

    // C1 receives the entry, starts the job and dies
    let mut c1 = h.queue().start_consuming("c1");
    let delivered = c1.next_batch().await.unwrap();
    assert_eq!(delivered.len(), 1);
    h.start_and_crash(&job, "c1").await;

    // Seven minutes later the monitor finds a stale heartbeat and an expired lease
    h.clock.advance(chrono::Duration::minutes(7));
    let report = HealthMonitor::new(&h.stores).scan_once().await.unwrap();
    assert_eq!(report.failed, 1);

    let stored = h.client.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.last_change().unwrap().reason, "heartbeat timeout");

    // C2 claims the idle entry, sees the terminal job and acknowledges it
    let ran = Arc::new(AtomicBool::new(false));
    let worker = h.worker("c2", flag_on_run(ran.clone()));
    let mut c2 = h.queue().start_consuming("c2");
    let claimed = c2.next_batch().await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].delivery_count, 2);

    let outcome = worker.process_entry(&claimed[0]).await.unwrap();
    assert_eq!(outcome, EntryOutcome::AlreadyTerminal(JobStatus::Failed));
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(h.store.unacknowledged(), 0);
    assert_eq!(
        h.statuses(&job).await,
        vec![JobStatus::Queued, JobStatus::Running, JobStatus::Failed]
    );
}

#[tokio::test]
async fn test_crashed_owner_is_taken_over_by_claiming_consumer() {
    let h = Harness::new();
    let job = h.client.submit(JobKind::Download, json!({})).await.unwrap();

    let mut c1 = h.queue().start_consuming("c1");
    assert_eq!(c1.next_batch().await.unwrap().len(), 1);
    h.start_and_crash(&job, "c1").await;

    // Lease expired, monitor has not run yet
    h.clock.advance(chrono::Duration::minutes(6));

    let ran = Arc::new(AtomicBool::new(false));
    let worker = h.worker("c2", flag_on_run(ran.clone()));
    let mut c2 = h.queue().start_consuming("c2");
    let claimed = c2.next_batch().await.unwrap();
    let outcome = worker.process_entry(&claimed[0]).await.unwrap();

    assert_eq!(outcome, EntryOutcome::Committed(JobStatus::Completed));
    assert!(ran.load(Ordering::SeqCst));

    let stored = h.client.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.owner_id.as_deref(), Some("c2"));
    assert_eq!(
        h.statuses(&job).await,
        vec![
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed
        ]
    );
}

#[tokio::test]
async fn test_live_owner_blocks_competing_consumer() {
    let h = Harness::new();
    let job = h.client.submit(JobKind::Upload, json!({})).await.unwrap();

    let handlers = HandlerRegistry::new().register(JobKind::Upload, |_job, _ctx| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    });
    let first = h.worker("c1", handlers.clone());
    let second = h.worker("c2", handlers);

    let mut consumer = h.queue().start_consuming("c1");
    let entry = consumer.next_batch().await.unwrap().remove(0);

    let (a, b) = tokio::join!(first.process_entry(&entry), second.process_entry(&entry));
    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|outcome| matches!(outcome, EntryOutcome::LeaseBusy { .. }));

    assert_eq!(outcomes[0], EntryOutcome::Committed(JobStatus::Completed));
    assert!(matches!(outcomes[1], EntryOutcome::LeaseBusy { .. }));

    let history = h.client.job_history(job.id).await.unwrap();
    let runs = history
        .iter()
        .filter(|change| change.to_status == JobStatus::Running)
        .count();
    assert_eq!(runs, 1);
}

#[tokio::test]
async fn test_recoverable_failure_is_retried_after_backoff() {
    let h = Harness::new();
    let job = h.client.submit(JobKind::Sync, json!({})).await.unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    let handler_attempts = attempts.clone();
    let handlers = HandlerRegistry::new().register(JobKind::Sync, move |_job, _ctx| {
        let attempts = handler_attempts.clone();
        async move {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(LeaseworkError::recoverable("remote timed out"));
            }
            Ok(())
        }
    });
    let worker = h
        .worker("c1", handlers)
        .with_retry_strategy(RetryStrategy::fixed(Duration::from_secs(10)));
    let mut consumer = h.queue().start_consuming("c1");

    let entry = consumer.next_batch().await.unwrap().remove(0);
    assert_eq!(
        worker.process_entry(&entry).await.unwrap(),
        EntryOutcome::Committed(JobStatus::RetryPending)
    );

    let promoter = RetryPromoter::new(&h.stores, h.queue());
    assert_eq!(promoter.promote_due().await.unwrap().promoted, 0);

    h.clock.advance(chrono::Duration::seconds(11));
    assert_eq!(promoter.promote_due().await.unwrap().promoted, 1);

    let entry = consumer.next_batch().await.unwrap().remove(0);
    assert_eq!(
        worker.process_entry(&entry).await.unwrap(),
        EntryOutcome::Committed(JobStatus::Completed)
    );

    let stored = h.client.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.retry_count, 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(
        h.statuses(&job).await,
        vec![
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::RetryPending,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed
        ]
    );
}

#[tokio::test]
async fn test_cancellation_requested_before_start() {
    let h = Harness::new();
    let job = h.client.submit(JobKind::Download, json!({})).await.unwrap();
    assert!(h.client.request_cancellation(job.id).await.unwrap());

    let ran = Arc::new(AtomicBool::new(false));
    let worker = h.worker("c1", flag_on_run(ran.clone()));
    let mut consumer = h.queue().start_consuming("c1");
    let entry = consumer.next_batch().await.unwrap().remove(0);

    assert_eq!(
        worker.process_entry(&entry).await.unwrap(),
        EntryOutcome::Committed(JobStatus::Cancelled)
    );
    assert!(!ran.load(Ordering::SeqCst));
    assert!(!h.client.request_cancellation(job.id).await.unwrap());
}

#[tokio::test]
async fn test_worker_run_drains_queue_until_shutdown() {
    let h = Harness::new();
    let mut jobs = Vec::new();
    for n in 0..3 {
        jobs.push(
            h.client
                .submit(JobKind::Upload, json!({ "part": n }))
                .await
                .unwrap(),
        );
    }

    let handlers = HandlerRegistry::new().register(JobKind::Upload, |_job, _ctx| async { Ok(()) });
    let worker = h.worker("c1", handlers);
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stats = h.client.queue_stats().await.unwrap();
        if stats.count(JobStatus::Completed) == 3 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "jobs never completed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown_tx.send(()).await.unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(h.store.unacknowledged(), 0);
}

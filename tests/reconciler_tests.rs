mod test_utils;

use leasework::{
    ExecutorFailure, JobKind, JobStatus, ReconcileOutcome, StateReconciler, TerminalFailureHook,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use test_utils::Harness;

#[tokio::test]
async fn test_executor_give_up_forces_failed_through_hook() {
    let h = Harness::new();
    let job = h.client.submit(JobKind::Upload, json!({})).await.unwrap();
    h.start_and_crash(&job, "c1").await;

    let hook: Arc<dyn TerminalFailureHook> =
        Arc::new(StateReconciler::new(&h.stores, Duration::from_secs(3600)));
    let failure = ExecutorFailure {
        job_id: job.id,
        attempts: 4,
        reason: "worker process exited".to_string(),
    };

    assert_eq!(
        hook.on_terminal_failure(failure.clone()).await.unwrap(),
        ReconcileOutcome::ForcedFailed
    );
    assert_eq!(
        hook.on_terminal_failure(failure).await.unwrap(),
        ReconcileOutcome::AlreadyTerminal(JobStatus::Failed)
    );

    let stored = h.client.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.error_message.as_deref(), Some("worker process exited"));
    assert!(h.leases.current(job.id).await.unwrap().is_none());
    assert_eq!(
        h.statuses(&job).await,
        vec![JobStatus::Queued, JobStatus::Running, JobStatus::Failed]
    );
}

#[tokio::test]
async fn test_executor_give_up_on_queued_job() {
    let h = Harness::new();
    let job = h.client.submit(JobKind::Sync, json!({})).await.unwrap();
    let reconciler = StateReconciler::new(&h.stores, Duration::from_secs(3600));

    let outcome = reconciler
        .reconcile(&ExecutorFailure {
            job_id: job.id,
            attempts: 1,
            reason: "rejected".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(outcome, ReconcileOutcome::ForcedFailed);
    let stats = h.client.queue_stats().await.unwrap();
    assert_eq!(stats.count(JobStatus::Failed), 1);
    assert_eq!(stats.count(JobStatus::Queued), 0);
}

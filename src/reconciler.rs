//! Bridges an external executor's failure bookkeeping with the job state machine.
//!
//! An executor runtime may track its own attempts and give up on a job on its
//! own schedule. When it does, [`StateReconciler`] forces the job record to FAILED
//! so the executor and the record can never disagree about a dead job.

use crate::{
    Result,
    cancellation::CancellationSignals,
    job::{JobId, JobStatus},
    lease::LeaseRegistry,
    state::{StateMachine, TransitionOutcome},
    store::{JobRepository, Stores, TransientRetryPolicy, with_backoff},
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

/// A terminal-failure notification from the executor runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorFailure {
    pub job_id: JobId,
    /// Attempts the executor made before giving up.
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    ForcedFailed,
    AlreadyTerminal(JobStatus),
    NotFound,
}

/// Hook the executor runtime calls once it has given up on a job.
#[async_trait]
pub trait TerminalFailureHook: Send + Sync {
    async fn on_terminal_failure(&self, failure: ExecutorFailure) -> Result<ReconcileOutcome>;
}

pub struct StateReconciler {
    repository: Arc<dyn JobRepository>,
    machine: StateMachine,
    leases: LeaseRegistry,
    signals: CancellationSignals,
    retry_policy: TransientRetryPolicy,
    max_conflicts: u32,
}

impl StateReconciler {
    pub fn new(stores: &Stores, signal_ttl: Duration) -> Self {
        Self {
            repository: stores.jobs.clone(),
            machine: StateMachine::new(stores.jobs.clone(), stores.clock.clone()),
            leases: LeaseRegistry::new(stores.kv.clone(), stores.clock.clone()),
            signals: CancellationSignals::new(stores.kv.clone(), stores.clock.clone(), signal_ttl),
            retry_policy: TransientRetryPolicy::default(),
            max_conflicts: 5,
        }
    }

    pub fn with_retry_policy(mut self, policy: TransientRetryPolicy) -> Self {
        self.machine = self.machine.with_retry_policy(policy.clone());
        self.leases = self.leases.with_retry_policy(policy.clone());
        self.signals = self.signals.with_retry_policy(policy.clone());
        self.retry_policy = policy;
        self
    }

    /// Forces the job to FAILED unless it is already terminal.
    ///
    /// A concurrent transition is retried against the fresh record, so the job
    /// always ends up terminal.
    pub async fn reconcile(&self, failure: &ExecutorFailure) -> Result<ReconcileOutcome> {
        let reason = format!(
            "executor gave up after {} attempt(s): {}",
            failure.attempts, failure.reason
        );

        for _ in 0..self.max_conflicts {
            let job = with_backoff(&self.retry_policy, "get_job", || {
                self.repository.get(failure.job_id)
            })
            .await?;
            let Some(job) = job else {
                warn!(job_id = %failure.job_id, "Executor failure for unknown job");
                return Ok(ReconcileOutcome::NotFound);
            };

            let previous_owner = job.owner_id.clone();
            let error_message = failure.reason.clone();
            match self
                .machine
                .force_fail(&job, reason.clone(), |j| {
                    j.raise_retry_count(failure.attempts);
                    j.error_message = Some(error_message);
                })
                .await?
            {
                TransitionOutcome::Applied(failed) => {
                    info!(job_id = %failed.id, "Forced job to FAILED: {}", reason);
                    self.signals.clear(failed.id).await?;
                    if let Some(owner) = previous_owner {
                        self.leases.release(failed.id, &owner).await?;
                    }
                    return Ok(ReconcileOutcome::ForcedFailed);
                }
                TransitionOutcome::RejectedTerminal { status } => {
                    return Ok(ReconcileOutcome::AlreadyTerminal(status));
                }
                TransitionOutcome::Conflict { current: None } => {
                    return Ok(ReconcileOutcome::NotFound);
                }
                TransitionOutcome::Conflict { .. } => continue,
            }
        }

        Err(crate::LeaseworkError::Worker {
            message: format!(
                "job {} kept changing while reconciling executor failure",
                failure.job_id
            ),
        })
    }
}

#[async_trait]
impl TerminalFailureHook for StateReconciler {
    async fn on_terminal_failure(&self, failure: ExecutorFailure) -> Result<ReconcileOutcome> {
        self.reconcile(&failure).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::{Clock, MockClock},
        job::{Job, JobKind},
        memory::MemoryStore,
    };
    use serde_json::json;

    fn setup() -> (Stores, StateReconciler, MockClock) {
        let clock = MockClock::new();
        let stores = Stores::from_backend(Arc::new(MemoryStore::new(clock.shared())), clock.shared());
        let reconciler = StateReconciler::new(&stores, Duration::from_secs(3600));
        (stores, reconciler, clock)
    }

    fn failure(job_id: JobId) -> ExecutorFailure {
        ExecutorFailure {
            job_id,
            attempts: 5,
            reason: "max attempts reached".to_string(),
        }
    }

    #[tokio::test]
    async fn test_running_job_is_forced_failed() {
        let (stores, reconciler, clock) = setup();
        let job = Job::new_at(JobKind::Upload, json!({}), clock.now());
        stores.jobs.insert(&job).await.unwrap();
        let machine = StateMachine::new(stores.jobs.clone(), clock.shared());
        machine
            .transition(&job, JobStatus::Running, "lease acquired", |j| {
                j.owner_id = Some("c1".to_string());
            })
            .await
            .unwrap();
        LeaseRegistry::new(stores.kv.clone(), clock.shared())
            .acquire(job.id, "c1", Duration::from_secs(300))
            .await
            .unwrap();

        let outcome = reconciler.on_terminal_failure(failure(job.id)).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::ForcedFailed);

        let stored = stores.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 5);
        assert!(stored.last_change().unwrap().reason.contains("executor gave up"));
        assert!(stores.kv.get_entry(&format!("lease:{}", job.id)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_terminal_job_is_untouched() {
        let (stores, reconciler, clock) = setup();
        let job = Job::new_at(JobKind::Upload, json!({}), clock.now());
        stores.jobs.insert(&job).await.unwrap();
        reconciler.reconcile(&failure(job.id)).await.unwrap();

        let outcome = reconciler.reconcile(&failure(job.id)).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::AlreadyTerminal(JobStatus::Failed));
        assert_eq!(stores.jobs.history(job.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let (_stores, reconciler, _clock) = setup();
        let outcome = reconciler
            .reconcile(&failure(uuid::Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::NotFound);
    }
}

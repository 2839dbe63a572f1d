//! Job state machine.
//!
//! Every status change goes through [`StateMachine`]: it checks the edge, stamps the
//! job, appends exactly one [`StatusChange`] and commits both atomically through a
//! conditional [`JobRepository::record_transition`]. Transitions out of a terminal
//! status are rejected as logged no-ops.

use crate::{
    LeaseworkError, Result,
    clock::SharedClock,
    job::{Job, JobStatus, StatusChange},
    store::{JobRepository, TransientRetryPolicy, with_backoff},
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of a transition attempt.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// The transition was committed; carries the job as stored.
    Applied(Job),
    /// The job was already terminal. Nothing was written.
    RejectedTerminal { status: JobStatus },
    /// The stored status no longer matched the caller's view. Nothing was written.
    Conflict { current: Option<JobStatus> },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }

    pub fn into_applied(self) -> Option<Job> {
        match self {
            TransitionOutcome::Applied(job) => Some(job),
            _ => None,
        }
    }
}

/// Whether `from -> to` is a regular lifecycle edge.
pub fn is_allowed(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;

    if from.is_terminal() {
        return false;
    }
    matches!(
        (from, to),
        (Queued, Running)
            | (Running, Completed)
            | (Running, RetryPending)
            | (Running, Failed)
            | (Running, Queued)
            | (RetryPending, Queued)
            | (_, Cancelled)
    )
}

#[derive(Clone)]
pub struct StateMachine {
    repository: Arc<dyn JobRepository>,
    clock: SharedClock,
    retry_policy: TransientRetryPolicy,
}

impl StateMachine {
    pub fn new(repository: Arc<dyn JobRepository>, clock: SharedClock) -> Self {
        Self {
            repository,
            clock,
            retry_policy: TransientRetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: TransientRetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Moves `job` to `to`, applying `mutate` to the record first.
    ///
    /// `job.status` is the status the caller expects to be stored. Returns
    /// [`LeaseworkError::InvalidTransition`] for edges outside the lifecycle.
    pub async fn transition<F>(
        &self,
        job: &Job,
        to: JobStatus,
        reason: impl Into<String>,
        mutate: F,
    ) -> Result<TransitionOutcome>
    where
        F: FnOnce(&mut Job),
    {
        if job.status.is_terminal() {
            warn!(
                job_id = %job.id,
                "Rejected transition {} -> {}: job is terminal",
                job.status,
                to
            );
            return Ok(TransitionOutcome::RejectedTerminal { status: job.status });
        }
        if !is_allowed(job.status, to) {
            return Err(LeaseworkError::InvalidTransition {
                from: job.status,
                to,
            });
        }
        self.commit(job, to, reason.into(), mutate).await
    }

    /// Forces any non-terminal job to FAILED.
    ///
    /// Used when an outside authority (the executor runtime) has already given up
    /// on the job, regardless of which non-terminal status the record is in.
    pub async fn force_fail<F>(
        &self,
        job: &Job,
        reason: impl Into<String>,
        mutate: F,
    ) -> Result<TransitionOutcome>
    where
        F: FnOnce(&mut Job),
    {
        if job.status.is_terminal() {
            warn!(
                job_id = %job.id,
                "Rejected forced failure: job is already {}",
                job.status
            );
            return Ok(TransitionOutcome::RejectedTerminal { status: job.status });
        }
        self.commit(job, JobStatus::Failed, reason.into(), mutate)
            .await
    }

    async fn commit<F>(
        &self,
        job: &Job,
        to: JobStatus,
        reason: String,
        mutate: F,
    ) -> Result<TransitionOutcome>
    where
        F: FnOnce(&mut Job),
    {
        let expected = job.status;
        let now = self.clock.now();
        let mut next = job.clone();
        mutate(&mut next);

        next.status = to;
        if to == JobStatus::Running {
            next.started_at = Some(now);
        }
        if expected == JobStatus::RetryPending {
            next.next_retry_at = None;
        }
        if to.is_terminal() {
            next.completed_at = Some(now);
        }

        let change = StatusChange {
            timestamp: now,
            from_status: Some(expected),
            to_status: to,
            reason,
        };
        next.status_history.push(change.clone());
        next.touch(now);

        let applied = with_backoff(&self.retry_policy, "record_transition", || {
            self.repository.record_transition(&next, expected, &change)
        })
        .await?;

        if applied {
            debug!(job_id = %job.id, "{} -> {} ({})", expected, to, change.reason);
            return Ok(TransitionOutcome::Applied(next));
        }

        let current = with_backoff(&self.retry_policy, "get_job", || {
            self.repository.get(job.id)
        })
        .await?;

        match current {
            // A retried write that actually landed the first time.
            Some(stored) if stored.status == to && stored.last_change() == Some(&change) => {
                Ok(TransitionOutcome::Applied(stored))
            }
            Some(stored) if stored.status.is_terminal() => {
                warn!(
                    job_id = %job.id,
                    "Rejected transition {} -> {}: job became {}",
                    expected,
                    to,
                    stored.status
                );
                Ok(TransitionOutcome::RejectedTerminal {
                    status: stored.status,
                })
            }
            Some(stored) => {
                debug!(
                    job_id = %job.id,
                    "Transition {} -> {} lost a race: job is {}",
                    expected,
                    to,
                    stored.status
                );
                Ok(TransitionOutcome::Conflict {
                    current: Some(stored.status),
                })
            }
            None => Ok(TransitionOutcome::Conflict { current: None }),
        }
    }
}

/// What orphan recovery did with a job.
#[derive(Debug, Clone)]
pub enum OrphanRecovery {
    /// Back to QUEUED with `retry_count` incremented.
    Requeued(Job),
    /// Retries exhausted; the job is FAILED.
    Failed(Job),
    /// Nothing was written: the job was not RUNNING or another party moved it first.
    Skipped(Option<JobStatus>),
}

/// Recovers a RUNNING job whose owner is presumed dead.
///
/// Requeues while retries are left, otherwise fails the job. The caller must
/// already have established that no live lease exists.
pub async fn recover_orphan(
    machine: &StateMachine,
    job: &Job,
    reason: &str,
    error_message: String,
) -> Result<OrphanRecovery> {
    if job.status != JobStatus::Running {
        return Ok(OrphanRecovery::Skipped(Some(job.status)));
    }

    let outcome = if job.has_retries_left() {
        let retry_count = job.retry_count + 1;
        machine
            .transition(job, JobStatus::Queued, reason, |j| {
                j.raise_retry_count(retry_count);
                j.error_message = Some(error_message);
                j.owner_id = None;
            })
            .await?
    } else {
        machine
            .transition(job, JobStatus::Failed, reason, |j| {
                j.error_message = Some(error_message);
            })
            .await?
    };

    Ok(match outcome {
        TransitionOutcome::Applied(updated) if updated.status == JobStatus::Queued => {
            OrphanRecovery::Requeued(updated)
        }
        TransitionOutcome::Applied(updated) => OrphanRecovery::Failed(updated),
        TransitionOutcome::RejectedTerminal { status } => OrphanRecovery::Skipped(Some(status)),
        TransitionOutcome::Conflict { current } => OrphanRecovery::Skipped(current),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::{Clock, MockClock}, job::JobKind, memory::MemoryStore};
    use serde_json::json;

    async fn setup() -> (Arc<MemoryStore>, StateMachine, MockClock) {
        let clock = MockClock::new();
        let store = Arc::new(MemoryStore::new(clock.shared()));
        let machine = StateMachine::new(store.clone(), clock.shared());
        (store, machine, clock)
    }

    async fn queued_job(store: &MemoryStore, clock: &MockClock) -> Job {
        let job = Job::new_at(JobKind::Download, json!({"url": "s3://a"}), clock.now());
        store.insert(&job).await.unwrap();
        job
    }

    #[test]
    fn test_lifecycle_edges() {
        use JobStatus::*;
        assert!(is_allowed(Queued, Running));
        assert!(is_allowed(Running, RetryPending));
        assert!(is_allowed(RetryPending, Queued));
        assert!(is_allowed(RetryPending, Cancelled));
        assert!(!is_allowed(Queued, Completed));
        assert!(!is_allowed(RetryPending, Running));
        for terminal in [Completed, Failed, Cancelled] {
            for to in JobStatus::ALL {
                assert!(!is_allowed(terminal, to));
            }
        }
    }

    #[tokio::test]
    async fn test_transition_appends_history_and_stamps() {
        let (store, machine, clock) = setup().await;
        let job = queued_job(&store, &clock).await;

        clock.advance(chrono::Duration::seconds(5));
        let running = machine
            .transition(&job, JobStatus::Running, "lease acquired", |j| {
                j.owner_id = Some("c1".to_string());
            })
            .await
            .unwrap()
            .into_applied()
            .unwrap();

        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.started_at, Some(clock.now()));
        assert_eq!(running.updated_at, clock.now());

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status_history.len(), 2);
        assert_eq!(stored.status_history[1].from_status, Some(JobStatus::Queued));
        assert_eq!(stored.owner_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_transition_from_terminal_is_rejected() {
        let (store, machine, clock) = setup().await;
        let job = queued_job(&store, &clock).await;
        let running = machine
            .transition(&job, JobStatus::Running, "lease acquired", |_| {})
            .await
            .unwrap()
            .into_applied()
            .unwrap();
        let done = machine
            .transition(&running, JobStatus::Completed, "success", |_| {})
            .await
            .unwrap()
            .into_applied()
            .unwrap();

        for to in JobStatus::ALL {
            let outcome = machine.transition(&done, to, "late", |_| {}).await.unwrap();
            assert!(matches!(
                outcome,
                TransitionOutcome::RejectedTerminal {
                    status: JobStatus::Completed
                }
            ));
        }
        assert_eq!(store.history(job.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_stale_view_is_rejected_when_store_is_terminal() {
        let (store, machine, clock) = setup().await;
        let job = queued_job(&store, &clock).await;
        let running = machine
            .transition(&job, JobStatus::Running, "lease acquired", |_| {})
            .await
            .unwrap()
            .into_applied()
            .unwrap();
        machine
            .transition(&running, JobStatus::Cancelled, "cancellation observed", |_| {})
            .await
            .unwrap();

        // `running` is now a stale snapshot
        let outcome = machine
            .transition(&running, JobStatus::Completed, "success", |_| {})
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            TransitionOutcome::RejectedTerminal {
                status: JobStatus::Cancelled
            }
        ));
        assert_eq!(store.history(job.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_invalid_edge_is_an_error() {
        let (store, machine, clock) = setup().await;
        let job = queued_job(&store, &clock).await;

        let result = machine
            .transition(&job, JobStatus::Completed, "skip ahead", |_| {})
            .await;
        assert!(matches!(
            result,
            Err(LeaseworkError::InvalidTransition {
                from: JobStatus::Queued,
                to: JobStatus::Completed
            })
        ));
    }

    #[tokio::test]
    async fn test_force_fail_from_any_non_terminal() {
        let (store, machine, clock) = setup().await;
        let job = queued_job(&store, &clock).await;

        let failed = machine
            .force_fail(&job, "executor gave up", |j| {
                j.error_message = Some("boom".to_string());
            })
            .await
            .unwrap()
            .into_applied()
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_recover_orphan_requeues_then_fails() {
        let (store, machine, clock) = setup().await;
        let job = Job::new_at(JobKind::Sync, json!({}), clock.now()).with_max_retries(1);
        store.insert(&job).await.unwrap();

        let running = machine
            .transition(&job, JobStatus::Running, "lease acquired", |j| {
                j.owner_id = Some("c1".to_string());
            })
            .await
            .unwrap()
            .into_applied()
            .unwrap();

        let requeued = match recover_orphan(&machine, &running, "heartbeat timeout", "stale".into())
            .await
            .unwrap()
        {
            OrphanRecovery::Requeued(job) => job,
            other => panic!("expected requeue, got {:?}", other),
        };
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(requeued.owner_id, None);

        let running = machine
            .transition(&requeued, JobStatus::Running, "lease acquired", |_| {})
            .await
            .unwrap()
            .into_applied()
            .unwrap();
        let outcome = recover_orphan(&machine, &running, "heartbeat timeout", "stale".into())
            .await
            .unwrap();
        assert!(matches!(outcome, OrphanRecovery::Failed(ref j) if j.status == JobStatus::Failed));
    }
}

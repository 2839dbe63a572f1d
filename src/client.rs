//! Producer and operator entry points.

use crate::{
    Result,
    cancellation::CancellationSignals,
    clock::SharedClock,
    config::LeaseworkConfig,
    job::{Job, JobId, JobKind, JobStatus, StatusChange},
    queue::WorkQueue,
    stats::QueueStats,
    store::{JobRepository, Stores, TransientRetryPolicy, with_backoff},
};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct JobClient {
    repository: Arc<dyn JobRepository>,
    queue: WorkQueue,
    signals: CancellationSignals,
    clock: SharedClock,
    default_max_retries: u32,
    retry_policy: TransientRetryPolicy,
}

impl JobClient {
    pub fn new(stores: &Stores) -> Self {
        Self::from_config(stores, &LeaseworkConfig::default())
    }

    pub fn from_config(stores: &Stores, config: &LeaseworkConfig) -> Self {
        let policy = config.transient_retry_policy();
        Self {
            repository: stores.jobs.clone(),
            queue: WorkQueue::new(stores.broker.clone(), stores.clock.clone())
                .with_retry_policy(policy.clone()),
            signals: CancellationSignals::new(
                stores.kv.clone(),
                stores.clock.clone(),
                config.cancellation.signal_ttl,
            )
            .with_retry_policy(policy.clone()),
            clock: stores.clock.clone(),
            default_max_retries: config.retry.max_attempts,
            retry_policy: policy,
        }
    }

    /// Creates a QUEUED job with the configured retry bound and enqueues it.
    pub async fn submit(&self, kind: JobKind, payload: serde_json::Value) -> Result<Job> {
        let job = Job::new_at(kind, payload, self.clock.now())
            .with_max_retries(self.default_max_retries);
        self.enqueue(&job).await?;
        Ok(job)
    }

    /// Persists `job` and appends its delivery entry.
    ///
    /// The record is written first, so a delivered entry always refers to an
    /// existing job.
    pub async fn enqueue(&self, job: &Job) -> Result<JobId> {
        with_backoff(&self.retry_policy, "insert_job", || self.repository.insert(job)).await?;
        let entry_id = self
            .queue
            .enqueue(job.id, json!({ "kind": job.kind, "retry_count": job.retry_count }))
            .await?;
        info!(job_id = %job.id, kind = %job.kind, entry_id, "Job enqueued");
        Ok(job.id)
    }

    /// Asks the job's owner to stop. Returns `false` if the job is unknown or
    /// already terminal, in which case no signal is written.
    pub async fn request_cancellation(&self, job_id: JobId) -> Result<bool> {
        match self.get_job(job_id).await? {
            Some(job) if !job.is_terminal() => {
                self.signals.signal(job_id).await?;
                info!(%job_id, "Cancellation requested");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        with_backoff(&self.retry_policy, "get_job", || self.repository.get(job_id)).await
    }

    /// Jobs in any of `statuses` (all statuses when empty), oldest first.
    pub async fn list_jobs(&self, statuses: &[JobStatus], limit: Option<u32>) -> Result<Vec<Job>> {
        let statuses = if statuses.is_empty() {
            &JobStatus::ALL[..]
        } else {
            statuses
        };
        with_backoff(&self.retry_policy, "list_jobs", || {
            self.repository.list_by_status(statuses, limit)
        })
        .await
    }

    pub async fn job_history(&self, job_id: JobId) -> Result<Vec<StatusChange>> {
        with_backoff(&self.retry_policy, "job_history", || {
            self.repository.history(job_id)
        })
        .await
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let jobs_by_status = with_backoff(&self.retry_policy, "count_by_status", || {
            self.repository.count_by_status()
        })
        .await?;
        let pending = self.queue.pending_summary().await?;
        let now = self.clock.now();

        Ok(QueueStats {
            jobs_by_status,
            pending_entries: pending.undelivered,
            oldest_pending_age: pending
                .oldest_unacked_at
                .and_then(|oldest| (now - oldest).to_std().ok()),
            claimed_by_consumer: pending.claimed_by_consumer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::{Clock, MockClock}, memory::MemoryStore, store::Broker};
    use std::time::Duration;

    fn client() -> (JobClient, Arc<MemoryStore>, MockClock) {
        let clock = MockClock::new();
        let store = Arc::new(MemoryStore::new(clock.shared()));
        let stores = Stores::from_backend(store.clone(), clock.shared());
        (JobClient::new(&stores), store, clock)
    }

    #[tokio::test]
    async fn test_submit_persists_and_enqueues() {
        let (client, store, _clock) = client();
        let job = client
            .submit(JobKind::Download, json!({"url": "s3://bucket/key"}))
            .await
            .unwrap();
        assert_eq!(job.max_retries, 3);

        let stored = client.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);

        let delivered = store
            .read_group("c1", 10, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].job_id, job.id);
        assert_eq!(delivered[0].metadata["kind"], "download");
    }

    #[tokio::test]
    async fn test_request_cancellation_skips_terminal_jobs() {
        let (client, store, clock) = client();
        let job = client.submit(JobKind::Sync, json!({})).await.unwrap();
        assert!(client.request_cancellation(job.id).await.unwrap());

        let mut done = Job::new_at(JobKind::Sync, json!({}), clock.now());
        done.status = JobStatus::Completed;
        store.insert(&done).await.unwrap();
        assert!(!client.request_cancellation(done.id).await.unwrap());
        assert!(!client
            .request_cancellation(uuid::Uuid::new_v4())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_queue_stats() {
        let (client, store, clock) = client();
        for _ in 0..3 {
            client.submit(JobKind::Upload, json!({})).await.unwrap();
        }
        store
            .read_group("c1", 1, Duration::from_millis(1))
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(90));

        let stats = client.queue_stats().await.unwrap();
        assert_eq!(stats.count(JobStatus::Queued), 3);
        assert_eq!(stats.pending_entries, 2);
        assert_eq!(stats.claimed_entries(), 1);
        assert_eq!(stats.oldest_pending_age, Some(Duration::from_secs(90)));

        let listed = client.list_jobs(&[], None).await.unwrap();
        assert_eq!(listed.len(), 3);
        let history = client.job_history(listed[0].id).await.unwrap();
        assert_eq!(history.len(), 1);
    }
}

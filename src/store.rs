//! Storage contracts consumed by the lifecycle core.
//!
//! Three collaborators are abstracted here:
//!
//! - [`JobRepository`]: the authoritative job records and their append-only history
//! - [`KeyValueStore`]: atomic set-if-absent / compare-and-set with TTL, backing
//!   leases and cancellation signals
//! - [`Broker`]: a durable log with consumer-group delivery, acknowledgement and
//!   idle-claim of unacknowledged entries
//!
//! Every mutation that can race between processes is conditional at the store
//! level. [`crate::memory::MemoryStore`] implements all three in-process and the
//! `postgres` feature provides [`crate::postgres::PostgresStore`].

use crate::{
    LeaseworkError, Result,
    clock::SharedClock,
    job::{Job, JobId, JobStatus, StatusChange},
    retry::RetryStrategy,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};
use tracing::warn;

/// Identifier of a delivery entry in the broker log. Increases with enqueue order.
pub type EntryId = i64;

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Stores a new job. Fails if the id already exists.
    async fn insert(&self, job: &Job) -> Result<()>;

    /// Loads a job together with its full status history.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Lists jobs in any of `statuses`, oldest first.
    async fn list_by_status(&self, statuses: &[JobStatus], limit: Option<u32>) -> Result<Vec<Job>>;

    /// Lists jobs in `status` whose last sign of life (heartbeat, else start, else
    /// creation) is strictly before `cutoff`, least recently alive first.
    async fn list_stale(
        &self,
        status: JobStatus,
        cutoff: DateTime<Utc>,
        limit: Option<u32>,
    ) -> Result<Vec<Job>>;

    /// Lists RETRY_PENDING jobs whose `next_retry_at` is unset or at or before `now`,
    /// earliest due first.
    async fn list_due_retries(&self, now: DateTime<Utc>, limit: Option<u32>) -> Result<Vec<Job>>;

    /// Persists the mutable fields of `job` if the stored status is still `expected`.
    ///
    /// Never touches status history. Returns `false` when the stored status differs.
    async fn update(&self, job: &Job, expected: JobStatus) -> Result<bool>;

    /// Atomically persists `job` and appends `change` to its history, if the stored
    /// status is still `expected`. Returns `false` when the stored status differs.
    async fn record_transition(
        &self,
        job: &Job,
        expected: JobStatus,
        change: &StatusChange,
    ) -> Result<bool>;

    /// Advances the stored heartbeat of a RUNNING job to `at`.
    ///
    /// Returns `false` if the job is not RUNNING or already has a newer heartbeat.
    async fn record_heartbeat(&self, job_id: JobId, at: DateTime<Utc>) -> Result<bool>;

    /// The job's status history in append order.
    async fn history(&self, job_id: JobId) -> Result<Vec<StatusChange>>;

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>>;
}

/// A live key-value entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

/// Atomic key-value operations with TTL. Expired entries behave as absent.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Sets `key` only if it is absent or expired. Returns whether it was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Replaces `key` with `value` and a fresh TTL only if it currently holds `expected`
    /// and has not expired.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool>;

    /// Deletes `key` only if it currently holds `expected`. Expired entries match too,
    /// so a stale holder can still be cleared by whoever observed it.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Unconditionally sets `key`.
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Reads `key`, including entries whose TTL has passed but which have not been
    /// evicted yet; callers compare `expires_at` themselves.
    async fn get_entry(&self, key: &str) -> Result<Option<KvEntry>>;

    async fn delete(&self, key: &str) -> Result<bool>;
}

/// A broker record wrapping a job id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryEntry {
    pub entry_id: EntryId,
    pub job_id: JobId,
    pub owner_hint: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// How many times the entry has been handed to a consumer.
    pub delivery_count: u32,
    /// Consumer currently holding the entry in its pending list.
    pub consumer: Option<String>,
    pub last_delivered_at: Option<DateTime<Utc>>,
}

/// Unacknowledged work in a consumer group.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PendingSummary {
    /// Entries appended but not yet delivered to any consumer.
    pub undelivered: u64,
    /// Delivered-but-unacknowledged entries per consumer.
    pub claimed_by_consumer: HashMap<String, u64>,
    pub oldest_unacked_at: Option<DateTime<Utc>>,
}

impl PendingSummary {
    pub fn claimed(&self) -> u64 {
        self.claimed_by_consumer.values().sum()
    }

    pub fn total_unacked(&self) -> u64 {
        self.undelivered + self.claimed()
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Appends an entry. Never overwrites existing entries.
    async fn enqueue(
        &self,
        job_id: JobId,
        owner_hint: Option<&str>,
        metadata: serde_json::Value,
    ) -> Result<EntryId>;

    /// Delivers up to `count` never-delivered entries to `consumer`, waiting up to
    /// `block` for new entries when none are available.
    async fn read_group(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<DeliveryEntry>>;

    /// Removes an entry from the pending list. Returns `false` if already acknowledged.
    async fn acknowledge(&self, entry_id: EntryId) -> Result<bool>;

    /// Reassigns up to `max_batch` entries idle longer than `idle` to `consumer`.
    async fn claim_stale(
        &self,
        consumer: &str,
        idle: Duration,
        max_batch: usize,
    ) -> Result<Vec<DeliveryEntry>>;

    async fn pending_summary(&self) -> Result<PendingSummary>;
}

/// The three stores plus the clock every component reads time from.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobRepository>,
    pub kv: Arc<dyn KeyValueStore>,
    pub broker: Arc<dyn Broker>,
    pub clock: SharedClock,
}

impl Stores {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        kv: Arc<dyn KeyValueStore>,
        broker: Arc<dyn Broker>,
        clock: SharedClock,
    ) -> Self {
        Self {
            jobs,
            kv,
            broker,
            clock,
        }
    }

    /// Uses one backend for all three contracts.
    pub fn from_backend<B>(backend: Arc<B>, clock: SharedClock) -> Self
    where
        B: JobRepository + KeyValueStore + Broker + 'static,
    {
        Self {
            jobs: backend.clone(),
            kv: backend.clone(),
            broker: backend,
            clock,
        }
    }
}

/// How transient store failures are retried before surfacing as fatal.
#[derive(Debug, Clone)]
pub struct TransientRetryPolicy {
    pub max_attempts: u32,
    pub strategy: RetryStrategy,
}

impl TransientRetryPolicy {
    pub fn new(max_attempts: u32, strategy: RetryStrategy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            strategy,
        }
    }
}

impl Default for TransientRetryPolicy {
    fn default() -> Self {
        Self::new(
            5,
            RetryStrategy::exponential(
                Duration::from_millis(100),
                2.0,
                Some(Duration::from_secs(5)),
            ),
        )
    }
}

/// Runs `op`, retrying while it fails with a transient error.
///
/// Non-transient errors are returned immediately. After `max_attempts` transient
/// failures the last one is reported as [`LeaseworkError::StoreUnavailable`].
pub async fn with_backoff<T, F, Fut>(
    policy: &TransientRetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                if attempt >= policy.max_attempts {
                    return Err(LeaseworkError::StoreUnavailable {
                        message: format!("{}: {}", op_name, e),
                        attempts: attempt,
                    });
                }
                let delay = policy.strategy.calculate_delay(attempt);
                warn!(
                    operation = op_name,
                    attempt,
                    "Transient store error, retrying in {:?}: {}",
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> TransientRetryPolicy {
        TransientRetryPolicy::new(max_attempts, RetryStrategy::fixed(Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_with_backoff_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(&fast_policy(5), "flaky", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(LeaseworkError::transient("connection reset"))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_backoff_gives_up_after_cap() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_backoff(&fast_policy(3), "down", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LeaseworkError::transient("refused"))
        })
        .await;

        assert!(matches!(
            result,
            Err(LeaseworkError::StoreUnavailable { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_backoff_passes_through_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_backoff(&fast_policy(5), "missing", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LeaseworkError::JobNotFound {
                id: "x".to_string(),
            })
        })
        .await;

        assert!(matches!(result, Err(LeaseworkError::JobNotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pending_summary_totals() {
        let mut summary = PendingSummary {
            undelivered: 4,
            ..Default::default()
        };
        summary.claimed_by_consumer.insert("c1".to_string(), 2);
        summary.claimed_by_consumer.insert("c2".to_string(), 1);

        assert_eq!(summary.claimed(), 3);
        assert_eq!(summary.total_unacked(), 7);
    }
}

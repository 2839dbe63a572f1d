//! Lease registry.
//!
//! A lease is time-bounded exclusive ownership of a job id. Leases live only in the
//! shared [`KeyValueStore`]; every operation is a single conditional store call, so
//! two processes racing for the same job can never both win.
//!
//! - **Acquire**: set-if-absent, succeeds only when no unexpired lease exists
//! - **Renew**: compare-and-set, succeeds only while the caller still holds it
//! - **Release**: compare-and-delete, idempotent

use crate::{
    LeaseworkError, Result,
    clock::SharedClock,
    job::JobId,
    store::{KeyValueStore, TransientRetryPolicy, with_backoff},
};
use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

/// A lease as currently stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: JobId,
    pub owner_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

fn lease_key(job_id: JobId) -> String {
    format!("lease:{}", job_id)
}

#[derive(Clone)]
pub struct LeaseRegistry {
    store: Arc<dyn KeyValueStore>,
    clock: SharedClock,
    retry_policy: TransientRetryPolicy,
}

impl LeaseRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            retry_policy: TransientRetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: TransientRetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Takes the lease on `job_id` for `duration`.
    ///
    /// Fails with [`LeaseworkError::LeaseConflict`] while any unexpired lease exists,
    /// including one held by `owner_id` itself, unless that lease was written by an
    /// earlier attempt of this same call that reported a transient failure.
    pub async fn acquire(&self, job_id: JobId, owner_id: &str, duration: Duration) -> Result<Lease> {
        let key = lease_key(job_id);
        let mut attempts = 0u32;
        let acquired = with_backoff(&self.retry_policy, "lease_acquire", || {
            attempts += 1;
            self.store.set_if_absent(&key, owner_id, duration)
        })
        .await?;

        if acquired {
            debug!(%job_id, owner = owner_id, "Lease acquired for {:?}", duration);
            return Ok(self.granted(job_id, owner_id, duration));
        }

        let current = self.live(job_id).await?;
        match current {
            // The failed attempt landed before the error was reported.
            Some(lease) if attempts > 1 && lease.owner_id == owner_id => {
                debug!(%job_id, owner = owner_id, "Lease acquired on retry");
                Ok(lease)
            }
            current => {
                let holder = current
                    .map(|lease| lease.owner_id)
                    .unwrap_or_else(|| "unknown".to_string());
                debug!(%job_id, owner = owner_id, holder = %holder, "Lease conflict");
                Err(LeaseworkError::LeaseConflict { job_id, holder })
            }
        }
    }

    /// Extends the lease for another `duration` from now.
    ///
    /// Fails with [`LeaseworkError::LeaseLost`] if the lease expired or another owner
    /// holds it; the caller must stop working on the job immediately.
    pub async fn renew(&self, job_id: JobId, owner_id: &str, duration: Duration) -> Result<Lease> {
        let key = lease_key(job_id);
        let renewed = with_backoff(&self.retry_policy, "lease_renew", || {
            self.store.compare_and_set(&key, owner_id, owner_id, duration)
        })
        .await?;

        if renewed {
            return Ok(self.granted(job_id, owner_id, duration));
        }

        warn!(%job_id, owner = owner_id, "Lease lost");
        Err(LeaseworkError::LeaseLost {
            job_id,
            owner: owner_id.to_string(),
        })
    }

    /// Clears the lease if `owner_id` still holds it. Returns whether anything was removed.
    pub async fn release(&self, job_id: JobId, owner_id: &str) -> Result<bool> {
        let key = lease_key(job_id);
        let released = with_backoff(&self.retry_policy, "lease_release", || {
            self.store.compare_and_delete(&key, owner_id)
        })
        .await?;
        debug!(%job_id, owner = owner_id, released, "Lease release");
        Ok(released)
    }

    /// The stored lease, which may already be expired.
    pub async fn current(&self, job_id: JobId) -> Result<Option<Lease>> {
        let key = lease_key(job_id);
        let entry = with_backoff(&self.retry_policy, "lease_get", || {
            self.store.get_entry(&key)
        })
        .await?;
        Ok(entry.map(|entry| Lease {
            job_id,
            owner_id: entry.value,
            expires_at: entry.expires_at,
        }))
    }

    /// The lease if it is still valid at the current time.
    pub async fn live(&self, job_id: JobId) -> Result<Option<Lease>> {
        let now = self.clock.now();
        Ok(self
            .current(job_id)
            .await?
            .filter(|lease| !lease.is_expired(now)))
    }

    fn granted(&self, job_id: JobId, owner_id: &str, duration: Duration) -> Lease {
        let ttl = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
        Lease {
            job_id,
            owner_id: owner_id.to_string(),
            expires_at: self.clock.now() + ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::{Clock, MockClock}, memory::MemoryStore, store::KvEntry};
    use uuid::Uuid;

    const FIVE_MINUTES: Duration = Duration::from_secs(300);

    fn registry() -> (LeaseRegistry, MockClock) {
        let clock = MockClock::new();
        let store = Arc::new(MemoryStore::new(clock.shared()));
        (LeaseRegistry::new(store, clock.shared()), clock)
    }

    #[tokio::test]
    async fn test_acquire_conflicts_while_held() {
        let (registry, _clock) = registry();
        let job_id = Uuid::new_v4();

        registry.acquire(job_id, "c1", FIVE_MINUTES).await.unwrap();
        let err = registry.acquire(job_id, "c2", FIVE_MINUTES).await.unwrap_err();
        assert!(matches!(err, LeaseworkError::LeaseConflict { ref holder, .. } if holder == "c1"));

        // Re-acquiring your own lease is also a conflict
        assert!(registry.acquire(job_id, "c1", FIVE_MINUTES).await.is_err());
    }

    /// Applies the first `set_if_absent` and then reports a transient failure.
    struct AppliedThenFailed {
        inner: MemoryStore,
        tripped: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl KeyValueStore for AppliedThenFailed {
        async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
            let set = self.inner.set_if_absent(key, value, ttl).await?;
            if !self.tripped.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Err(LeaseworkError::transient("connection reset after write"));
            }
            Ok(set)
        }

        async fn compare_and_set(
            &self,
            key: &str,
            expected: &str,
            value: &str,
            ttl: Duration,
        ) -> Result<bool> {
            self.inner.compare_and_set(key, expected, value, ttl).await
        }

        async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
            self.inner.compare_and_delete(key, expected).await
        }

        async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
            self.inner.put(key, value, ttl).await
        }

        async fn get_entry(&self, key: &str) -> Result<Option<KvEntry>> {
            self.inner.get_entry(key).await
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn test_acquire_survives_write_that_landed_before_error() {
        let clock = MockClock::new();
        let store = Arc::new(AppliedThenFailed {
            inner: MemoryStore::new(clock.shared()),
            tripped: Default::default(),
        });
        let registry = LeaseRegistry::new(store, clock.shared()).with_retry_policy(
            TransientRetryPolicy::new(3, crate::RetryStrategy::fixed(Duration::from_millis(1))),
        );
        let job_id = Uuid::new_v4();

        let lease = registry.acquire(job_id, "c1", FIVE_MINUTES).await.unwrap();
        assert_eq!(lease.owner_id, "c1");
        assert_eq!(lease.expires_at, clock.now() + chrono::Duration::minutes(5));

        // Without a transient failure, holding the lease is still a conflict
        let err = registry.acquire(job_id, "c1", FIVE_MINUTES).await.unwrap_err();
        assert!(matches!(err, LeaseworkError::LeaseConflict { ref holder, .. } if holder == "c1"));
        let err = registry.acquire(job_id, "c2", FIVE_MINUTES).await.unwrap_err();
        assert!(matches!(err, LeaseworkError::LeaseConflict { ref holder, .. } if holder == "c1"));
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let (registry, clock) = registry();
        let job_id = Uuid::new_v4();

        registry.acquire(job_id, "c1", FIVE_MINUTES).await.unwrap();
        clock.advance(chrono::Duration::minutes(5));

        let lease = registry.acquire(job_id, "c2", FIVE_MINUTES).await.unwrap();
        assert_eq!(lease.owner_id, "c2");

        let err = registry.renew(job_id, "c1", FIVE_MINUTES).await.unwrap_err();
        assert!(matches!(err, LeaseworkError::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn test_renew_extends_expiry() {
        let (registry, clock) = registry();
        let job_id = Uuid::new_v4();

        registry.acquire(job_id, "c1", FIVE_MINUTES).await.unwrap();
        clock.advance(chrono::Duration::minutes(4));
        let renewed = registry.renew(job_id, "c1", FIVE_MINUTES).await.unwrap();
        assert_eq!(renewed.expires_at, clock.now() + chrono::Duration::minutes(5));

        clock.advance(chrono::Duration::minutes(4));
        assert!(registry.live(job_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_renew_after_expiry_is_lost() {
        let (registry, clock) = registry();
        let job_id = Uuid::new_v4();

        registry.acquire(job_id, "c1", FIVE_MINUTES).await.unwrap();
        clock.advance(chrono::Duration::minutes(6));
        assert!(matches!(
            registry.renew(job_id, "c1", FIVE_MINUTES).await,
            Err(LeaseworkError::LeaseLost { .. })
        ));
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_owner_checked() {
        let (registry, _clock) = registry();
        let job_id = Uuid::new_v4();

        registry.acquire(job_id, "c1", FIVE_MINUTES).await.unwrap();
        assert!(!registry.release(job_id, "c2").await.unwrap());
        assert!(registry.release(job_id, "c1").await.unwrap());
        assert!(!registry.release(job_id, "c1").await.unwrap());
        assert!(registry.current(job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let (registry, _clock) = registry();
        let job_id = Uuid::new_v4();

        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .acquire(job_id, &format!("c{}", i), FIVE_MINUTES)
                    .await
                    .is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}

//! Out-of-band cancellation requests.
//!
//! A signal is a TTL-bounded flag in the [`KeyValueStore`], kept apart from the job
//! record so polling it never contends with heartbeat writes. Signals for jobs that
//! never get picked up expire on their own.

use crate::{
    Result,
    clock::SharedClock,
    job::JobId,
    store::{KeyValueStore, TransientRetryPolicy, with_backoff},
};
use std::{sync::Arc, time::Duration};
use tracing::debug;

fn signal_key(job_id: JobId) -> String {
    format!("cancel:{}", job_id)
}

#[derive(Clone)]
pub struct CancellationSignals {
    store: Arc<dyn KeyValueStore>,
    clock: SharedClock,
    ttl: Duration,
    retry_policy: TransientRetryPolicy,
}

impl CancellationSignals {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: SharedClock, ttl: Duration) -> Self {
        Self {
            store,
            clock,
            ttl,
            retry_policy: TransientRetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: TransientRetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Marks `job_id` for cancellation. Signalling twice refreshes the TTL.
    pub async fn signal(&self, job_id: JobId) -> Result<()> {
        let key = signal_key(job_id);
        let requested_at = self.clock.now().to_rfc3339();
        with_backoff(&self.retry_policy, "cancel_signal", || {
            self.store.put(&key, &requested_at, self.ttl)
        })
        .await?;
        debug!(%job_id, "Cancellation signalled");
        Ok(())
    }

    pub async fn is_cancelled(&self, job_id: JobId) -> Result<bool> {
        let key = signal_key(job_id);
        let entry = with_backoff(&self.retry_policy, "cancel_check", || {
            self.store.get_entry(&key)
        })
        .await?;
        let now = self.clock.now();
        Ok(entry.is_some_and(|entry| entry.expires_at > now))
    }

    /// Removes the signal once the job is terminal.
    pub async fn clear(&self, job_id: JobId) -> Result<()> {
        let key = signal_key(job_id);
        with_backoff(&self.retry_policy, "cancel_clear", || self.store.delete(&key)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::MockClock, memory::MemoryStore};
    use uuid::Uuid;

    fn signals(ttl: Duration) -> (CancellationSignals, MockClock) {
        let clock = MockClock::new();
        let store = Arc::new(MemoryStore::new(clock.shared()));
        (CancellationSignals::new(store, clock.shared(), ttl), clock)
    }

    #[test]
    fn test_signal_is_idempotent() {
        let (signals, _clock) = signals(Duration::from_secs(60));
        let job_id = Uuid::new_v4();

        tokio_test::block_on(async {
            assert!(!signals.is_cancelled(job_id).await.unwrap());
            signals.signal(job_id).await.unwrap();
            signals.signal(job_id).await.unwrap();
            assert!(signals.is_cancelled(job_id).await.unwrap());

            signals.clear(job_id).await.unwrap();
            assert!(!signals.is_cancelled(job_id).await.unwrap());
            signals.clear(job_id).await.unwrap();
        });
    }

    #[tokio::test]
    async fn test_signal_expires_after_ttl() {
        let (signals, clock) = signals(Duration::from_secs(60));
        let job_id = Uuid::new_v4();

        signals.signal(job_id).await.unwrap();
        clock.advance(chrono::Duration::seconds(59));
        assert!(signals.is_cancelled(job_id).await.unwrap());

        clock.advance(chrono::Duration::seconds(1));
        assert!(!signals.is_cancelled(job_id).await.unwrap());
    }
}

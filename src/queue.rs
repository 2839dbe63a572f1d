//! Work queue over a consumer-group [`Broker`].
//!
//! Producers append entries with [`WorkQueue::enqueue`]. Each consumer process
//! calls [`WorkQueue::start_consuming`] and pulls batches from its [`Consumer`],
//! which interleaves two sources:
//!
//! 1. entries idle past the claim threshold in some other consumer's pending list
//!    (claimed at startup and then every threshold period)
//! 2. never-delivered entries, via a bounded blocking read
//!
//! Entries are acknowledged only after the job reached a terminal or
//! retry-scheduled state, so a crash anywhere before that leads to redelivery.

use crate::{
    LeaseworkError, Result,
    clock::SharedClock,
    config::QueueConfig,
    job::JobId,
    retry::RetryStrategy,
    store::{Broker, DeliveryEntry, EntryId, PendingSummary, TransientRetryPolicy, with_backoff},
};
use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub read_batch: usize,
    pub read_block: Duration,
    pub idle_claim_threshold: Duration,
    pub claim_batch: usize,
    /// Delay between failed broker reads
    pub backoff: RetryStrategy,
    /// Consecutive failed reads after which the consumer gives up
    pub max_read_failures: u32,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

impl QueueOptions {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            read_batch: config.read_batch.max(1),
            read_block: config.read_block,
            idle_claim_threshold: config.idle_claim_threshold,
            claim_batch: config.claim_batch.max(1),
            backoff: RetryStrategy::exponential(
                config.read_backoff_base,
                2.0,
                Some(config.read_backoff_max),
            ),
            max_read_failures: config.max_read_failures.max(1),
        }
    }
}

#[derive(Clone)]
pub struct WorkQueue {
    broker: Arc<dyn Broker>,
    clock: SharedClock,
    options: QueueOptions,
    retry_policy: TransientRetryPolicy,
}

impl WorkQueue {
    pub fn new(broker: Arc<dyn Broker>, clock: SharedClock) -> Self {
        Self {
            broker,
            clock,
            options: QueueOptions::default(),
            retry_policy: TransientRetryPolicy::default(),
        }
    }

    pub fn with_options(mut self, options: QueueOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_retry_policy(mut self, policy: TransientRetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Appends a delivery entry for `job_id`.
    pub async fn enqueue(&self, job_id: JobId, metadata: serde_json::Value) -> Result<EntryId> {
        self.enqueue_with_hint(job_id, None, metadata).await
    }

    /// Appends a delivery entry carrying the id of the producer or previous owner.
    pub async fn enqueue_with_hint(
        &self,
        job_id: JobId,
        owner_hint: Option<&str>,
        metadata: serde_json::Value,
    ) -> Result<EntryId> {
        let entry_id = with_backoff(&self.retry_policy, "enqueue", || {
            self.broker.enqueue(job_id, owner_hint, metadata.clone())
        })
        .await?;
        debug!(%job_id, entry_id, "Entry enqueued");
        Ok(entry_id)
    }

    /// Joins the consumer group as `consumer_id`.
    pub fn start_consuming(&self, consumer_id: impl Into<String>) -> Consumer {
        let consumer_id = consumer_id.into();
        info!(consumer = %consumer_id, "Joined consumer group");
        Consumer {
            queue: self.clone(),
            consumer_id,
            last_claim_at: None,
            consecutive_failures: 0,
        }
    }

    /// Reassigns entries idle longer than `idle_threshold` to `consumer_id`.
    pub async fn claim_stale(
        &self,
        consumer_id: &str,
        idle_threshold: Duration,
        max_batch: usize,
    ) -> Result<Vec<DeliveryEntry>> {
        let claimed = self
            .broker
            .claim_stale(consumer_id, idle_threshold, max_batch)
            .await?;
        if !claimed.is_empty() {
            info!(
                consumer = consumer_id,
                "Claimed {} idle entr{}",
                claimed.len(),
                if claimed.len() == 1 { "y" } else { "ies" }
            );
        }
        Ok(claimed)
    }

    pub async fn acknowledge(&self, entry_id: EntryId) -> Result<bool> {
        with_backoff(&self.retry_policy, "acknowledge", || {
            self.broker.acknowledge(entry_id)
        })
        .await
    }

    pub async fn pending_summary(&self) -> Result<PendingSummary> {
        with_backoff(&self.retry_policy, "pending_summary", || {
            self.broker.pending_summary()
        })
        .await
    }
}

/// One consumer's view of the queue.
pub struct Consumer {
    queue: WorkQueue,
    consumer_id: String,
    last_claim_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

impl Consumer {
    pub fn id(&self) -> &str {
        &self.consumer_id
    }

    /// Next batch of entries to process; empty when the blocking read timed out.
    ///
    /// Broker failures are retried with backoff. Once `max_read_failures`
    /// consecutive reads have failed, returns [`LeaseworkError::StoreUnavailable`].
    pub async fn next_batch(&mut self) -> Result<Vec<DeliveryEntry>> {
        loop {
            match self.poll().await {
                Ok(entries) => {
                    self.consecutive_failures = 0;
                    return Ok(entries);
                }
                Err(e) => {
                    self.consecutive_failures += 1;
                    let options = &self.queue.options;
                    if self.consecutive_failures >= options.max_read_failures {
                        return Err(LeaseworkError::StoreUnavailable {
                            message: format!("broker read: {}", e),
                            attempts: self.consecutive_failures,
                        });
                    }
                    let delay = options.backoff.calculate_delay(self.consecutive_failures);
                    warn!(
                        consumer = %self.consumer_id,
                        failures = self.consecutive_failures,
                        "Broker read failed, backing off {:?}: {}",
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn poll(&mut self) -> Result<Vec<DeliveryEntry>> {
        let options = self.queue.options.clone();

        if self.claim_due() {
            let claimed = self
                .queue
                .claim_stale(
                    &self.consumer_id,
                    options.idle_claim_threshold,
                    options.claim_batch,
                )
                .await?;
            self.last_claim_at = Some(self.queue.clock.now());
            if !claimed.is_empty() {
                return Ok(claimed);
            }
        }

        self.queue
            .broker
            .read_group(&self.consumer_id, options.read_batch, options.read_block)
            .await
    }

    fn claim_due(&self) -> bool {
        let threshold = chrono::Duration::from_std(self.queue.options.idle_claim_threshold)
            .unwrap_or(chrono::Duration::MAX);
        match self.last_claim_at {
            None => true,
            Some(last) => self.queue.clock.now() - last >= threshold,
        }
    }
}

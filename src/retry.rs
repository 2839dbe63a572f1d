//! Backoff strategies and retry promotion.
//!
//! [`RetryStrategy`] decides how long a job waits in RETRY_PENDING before it is
//! eligible again, and is reused for the queue read loop and for transient store
//! failures. [`RetryPromoter`] moves due RETRY_PENDING jobs back to QUEUED.
//!
//! # Examples
//!
//! ```rust
//! use leasework::retry::{JitterType, RetryStrategy};
//! use std::time::Duration;
//!
//! // 30s, 60s, 120s ... capped at 10 minutes, ±10% jitter
//! let strategy = RetryStrategy::exponential_with_jitter(
//!     Duration::from_secs(30),
//!     2.0,
//!     Some(Duration::from_secs(10 * 60)),
//!     JitterType::Multiplicative { factor: 0.1 },
//! );
//! let delay = strategy.calculate_delay(2);
//! assert!(delay >= Duration::from_secs(54) && delay <= Duration::from_secs(66));
//! ```

use crate::{
    Result,
    clock::SharedClock,
    config::{duration_opt, duration_secs},
    job::{Job, JobStatus},
    queue::WorkQueue,
    state::{StateMachine, TransitionOutcome},
    store::{JobRepository, Stores, TransientRetryPolicy, with_backoff},
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Types of jitter that can be applied to retry delays.
///
/// Jitter keeps many jobs that failed together from retrying at the same instant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JitterType {
    /// `delay ± rand(0, amount)`
    Additive {
        #[serde(with = "duration_secs")]
        amount: Duration,
    },

    /// `delay * (1 ± rand(0, factor))`
    Multiplicative { factor: f64 },
}

impl JitterType {
    /// Apply jitter to a given delay duration. The result is never negative.
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();

        match self {
            JitterType::Additive { amount } => {
                let jitter_millis = rng.gen_range(0..=amount.as_millis() as u64);
                let jitter = Duration::from_millis(jitter_millis);

                if rng.gen_bool(0.5) {
                    delay.saturating_add(jitter)
                } else {
                    delay.saturating_sub(jitter)
                }
            }
            JitterType::Multiplicative { factor } => {
                let factor = factor.clamp(0.0, 1.0);
                let jitter_factor = rng.gen_range((1.0 - factor)..=(1.0 + factor));
                let jittered_millis = (delay.as_millis() as f64 * jitter_factor) as u64;
                Duration::from_millis(jittered_millis)
            }
        }
    }
}

/// Strategies for the delay between retry attempts.
///
/// Attempt numbers are 1-based: the first retry is attempt 1.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Every attempt waits the same amount of time.
    Fixed {
        #[serde(with = "duration_secs")]
        delay: Duration,
    },

    /// `base + attempt * increment`, optionally capped.
    Linear {
        #[serde(with = "duration_secs")]
        base: Duration,
        #[serde(with = "duration_secs")]
        increment: Duration,
        #[serde(default, skip_serializing_if = "Option::is_none", with = "duration_opt")]
        max_delay: Option<Duration>,
    },

    /// `base * multiplier ^ (attempt - 1)`, optionally capped and jittered.
    Exponential {
        #[serde(with = "duration_secs")]
        base: Duration,
        multiplier: f64,
        #[serde(default, skip_serializing_if = "Option::is_none", with = "duration_opt")]
        max_delay: Option<Duration>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jitter: Option<JitterType>,
    },
}

impl RetryStrategy {
    /// Calculate the delay before retry `attempt`.
    ///
    /// ```rust
    /// use leasework::retry::RetryStrategy;
    /// use std::time::Duration;
    ///
    /// let strategy = RetryStrategy::exponential(Duration::from_secs(1), 2.0, None);
    ///
    /// assert_eq!(strategy.calculate_delay(1), Duration::from_secs(1));
    /// assert_eq!(strategy.calculate_delay(2), Duration::from_secs(2));
    /// assert_eq!(strategy.calculate_delay(4), Duration::from_secs(8));
    /// ```
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay = match self {
            RetryStrategy::Fixed { delay } => *delay,

            RetryStrategy::Linear {
                base,
                increment,
                max_delay,
            } => {
                let delay = increment
                    .checked_mul(attempt)
                    .and_then(|step| base.checked_add(step))
                    .unwrap_or(Duration::MAX);
                cap(delay, *max_delay)
            }

            RetryStrategy::Exponential {
                base,
                multiplier,
                max_delay,
                jitter,
            } => {
                let exponent = attempt.saturating_sub(1).min(63) as i32;
                let factor = multiplier.powi(exponent);
                let delay = Duration::try_from_secs_f64(base.as_secs_f64() * factor)
                    .unwrap_or(Duration::MAX);
                let capped_delay = cap(delay, *max_delay);

                if let Some(jitter_type) = jitter {
                    return jitter_type.apply(capped_delay).max(Duration::from_millis(1));
                }

                capped_delay
            }
        };

        base_delay.max(Duration::from_millis(1))
    }

    pub fn fixed(delay: Duration) -> Self {
        RetryStrategy::Fixed { delay }
    }

    pub fn linear(base: Duration, increment: Duration, max_delay: Option<Duration>) -> Self {
        RetryStrategy::Linear {
            base,
            increment,
            max_delay,
        }
    }

    pub fn exponential(base: Duration, multiplier: f64, max_delay: Option<Duration>) -> Self {
        RetryStrategy::Exponential {
            base,
            multiplier,
            max_delay,
            jitter: None,
        }
    }

    pub fn exponential_with_jitter(
        base: Duration,
        multiplier: f64,
        max_delay: Option<Duration>,
        jitter: JitterType,
    ) -> Self {
        RetryStrategy::Exponential {
            base,
            multiplier,
            max_delay,
            jitter: Some(jitter),
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::exponential(
            Duration::from_secs(30),
            2.0,
            Some(Duration::from_secs(10 * 60)),
        )
    }
}

fn cap(delay: Duration, max_delay: Option<Duration>) -> Duration {
    match max_delay {
        Some(max) => delay.min(max),
        None => delay,
    }
}

/// Summary of one promotion pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromotionReport {
    pub due: usize,
    pub promoted: usize,
    pub errors: usize,
}

/// Moves RETRY_PENDING jobs whose backoff has elapsed back to QUEUED.
///
/// A fresh delivery entry is appended before the transition is committed. If the
/// process dies in between, the consumer that receives the entry sees a due
/// RETRY_PENDING job and promotes it itself; a duplicate entry from a later pass is
/// absorbed by the lease and terminal-status checks.
pub struct RetryPromoter {
    repository: Arc<dyn JobRepository>,
    queue: WorkQueue,
    machine: StateMachine,
    clock: SharedClock,
    batch_size: u32,
    retry_policy: TransientRetryPolicy,
}

impl RetryPromoter {
    pub fn new(stores: &Stores, queue: WorkQueue) -> Self {
        Self {
            repository: stores.jobs.clone(),
            machine: StateMachine::new(stores.jobs.clone(), stores.clock.clone()),
            clock: stores.clock.clone(),
            queue,
            batch_size: 500,
            retry_policy: TransientRetryPolicy::default(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_retry_policy(mut self, policy: TransientRetryPolicy) -> Self {
        self.machine = self.machine.with_retry_policy(policy.clone());
        self.retry_policy = policy;
        self
    }

    /// Promotes every due RETRY_PENDING job, one at a time.
    pub async fn promote_due(&self) -> Result<PromotionReport> {
        let now = self.clock.now();
        let candidates = with_backoff(&self.retry_policy, "list_due_retries", || {
            self.repository.list_due_retries(now, Some(self.batch_size))
        })
        .await?;

        let mut report = PromotionReport::default();
        for job in candidates.into_iter().filter(|job| is_retry_due(job, now)) {
            report.due += 1;
            match self.promote(&job).await {
                Ok(true) => report.promoted += 1,
                Ok(false) => {}
                Err(e) => {
                    report.errors += 1;
                    error!(job_id = %job.id, "Failed to promote retry: {}", e);
                }
            }
        }

        if report.promoted > 0 {
            info!("Promoted {} job(s) from RETRY_PENDING to QUEUED", report.promoted);
        }
        Ok(report)
    }

    async fn promote(&self, job: &Job) -> Result<bool> {
        let metadata = json!({ "kind": job.kind, "retry_count": job.retry_count });
        let entry_id = self.queue.enqueue(job.id, metadata).await?;

        match self
            .machine
            .transition(job, JobStatus::Queued, "retry backoff elapsed", |_| {})
            .await?
        {
            TransitionOutcome::Applied(_) => {
                debug!(job_id = %job.id, entry_id, "Retry promoted");
                Ok(true)
            }
            other => {
                debug!(job_id = %job.id, ?other, "Retry promotion skipped");
                Ok(false)
            }
        }
    }

    /// Runs promotion passes every `interval` until shutdown. Pass failures are
    /// logged and retried on the next tick.
    pub async fn run(&self, interval: Duration, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        info!("Retry promoter started (interval {:?})", interval);
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Retry promoter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.promote_due().await {
                        warn!("Retry promotion pass failed: {}", e);
                    }
                }
            }
        }

        Ok(())
    }
}

/// A RETRY_PENDING job is due once `next_retry_at` has passed (or was never set).
pub fn is_retry_due(job: &Job, now: chrono::DateTime<chrono::Utc>) -> bool {
    job.status == JobStatus::RetryPending && job.next_retry_at.is_none_or(|at| at <= now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_strategy() {
        let strategy = RetryStrategy::fixed(Duration::from_secs(30));
        assert_eq!(strategy.calculate_delay(1), Duration::from_secs(30));
        assert_eq!(strategy.calculate_delay(7), Duration::from_secs(30));
    }

    #[test]
    fn test_linear_strategy_caps() {
        let strategy = RetryStrategy::linear(
            Duration::from_secs(5),
            Duration::from_secs(10),
            Some(Duration::from_secs(60)),
        );
        assert_eq!(strategy.calculate_delay(1), Duration::from_secs(15));
        assert_eq!(strategy.calculate_delay(3), Duration::from_secs(35));
        assert_eq!(strategy.calculate_delay(10), Duration::from_secs(60));
    }

    #[test]
    fn test_exponential_strategy_caps() {
        let strategy = RetryStrategy::exponential(
            Duration::from_secs(1),
            2.0,
            Some(Duration::from_secs(30)),
        );
        assert_eq!(strategy.calculate_delay(1), Duration::from_secs(1));
        assert_eq!(strategy.calculate_delay(5), Duration::from_secs(16));
        assert_eq!(strategy.calculate_delay(6), Duration::from_secs(30));
        assert_eq!(strategy.calculate_delay(500), Duration::from_secs(30));
    }

    #[test]
    fn test_delay_never_zero() {
        let strategy = RetryStrategy::fixed(Duration::ZERO);
        assert_eq!(strategy.calculate_delay(1), Duration::from_millis(1));
    }

    #[test]
    fn test_additive_jitter_bounds() {
        let jitter = JitterType::Additive {
            amount: Duration::from_secs(5),
        };
        for _ in 0..50 {
            let jittered = jitter.apply(Duration::from_secs(30));
            assert!(jittered >= Duration::from_secs(25));
            assert!(jittered <= Duration::from_secs(35));
        }
    }

    #[test]
    fn test_unbounded_exponential_with_jitter_saturates() {
        let strategy = RetryStrategy::exponential_with_jitter(
            Duration::from_secs(30),
            10.0,
            None,
            JitterType::Additive {
                amount: Duration::from_secs(5),
            },
        );
        for _ in 0..20 {
            assert!(strategy.calculate_delay(60) >= Duration::MAX - Duration::from_secs(5));
        }

        let linear = RetryStrategy::linear(Duration::from_secs(1), Duration::MAX, None);
        assert_eq!(linear.calculate_delay(3), Duration::MAX);
    }

    #[test]
    fn test_multiplicative_jitter_bounds() {
        let jitter = JitterType::Multiplicative { factor: 0.2 };
        for _ in 0..50 {
            let jittered = jitter.apply(Duration::from_secs(100));
            assert!(jittered >= Duration::from_secs(80));
            assert!(jittered <= Duration::from_secs(120));
        }
    }

    #[test]
    fn test_strategy_toml_round_trip() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            strategy: RetryStrategy,
        }

        let original = Wrapper {
            strategy: RetryStrategy::exponential_with_jitter(
                Duration::from_secs(30),
                2.0,
                Some(Duration::from_secs(600)),
                JitterType::Multiplicative { factor: 0.1 },
            ),
        };
        let encoded = toml::to_string(&original).unwrap();
        assert!(encoded.contains("type = \"exponential\""));
        assert!(encoded.contains("base = \"30s\""));

        let decoded: Wrapper = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded.strategy, original.strategy);
    }

    #[test]
    fn test_is_retry_due() {
        let now = chrono::Utc::now();
        let mut job = Job::new_at(crate::JobKind::Sync, serde_json::json!({}), now);
        assert!(!is_retry_due(&job, now));

        job.status = JobStatus::RetryPending;
        job.next_retry_at = Some(now + chrono::Duration::seconds(30));
        assert!(!is_retry_due(&job, now));
        assert!(is_retry_due(&job, now + chrono::Duration::seconds(30)));
    }
}

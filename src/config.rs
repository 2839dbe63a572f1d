//! Configuration management for leasework.
//!
//! Every timing knob of the lifecycle core lives here: lease window and refresh
//! cadence, health-check cadence and stale cutoff, idle-claim threshold, retry
//! bounds and the cancellation signal TTL. Configuration loads from TOML files or
//! `LEASEWORK_*` environment variables and durations are written as human-readable
//! strings ("500ms", "30s", "5m", "2h", "1d").

use crate::{LeaseworkError, retry::RetryStrategy, store::TransientRetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Serializes `std::time::Duration` as human-readable strings.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(D::Error::custom)
    }

    pub fn format_duration(duration: &Duration) -> String {
        let millis = duration.as_millis();
        let secs = duration.as_secs();
        if millis == 0 {
            "0s".to_string()
        } else if millis % 1000 != 0 {
            format!("{}ms", millis)
        } else if secs % 86400 == 0 {
            format!("{}d", secs / 86400)
        } else if secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{}s", secs)
        }
    }

    /// Parse a duration string like "250ms", "30s", "5m", "1h", "1d" or "90".
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        // Bare numbers are seconds
        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        if let Some(num_str) = s.strip_suffix("ms") {
            let millis: u64 = num_str
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
            return Ok(Duration::from_millis(millis));
        }

        if s.len() < 2 {
            return Err(format!("Invalid duration format: {}", s));
        }

        let (num_str, suffix) = s.split_at(s.len() - 1);
        let num: u64 = num_str
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

        match suffix {
            "s" => Ok(Duration::from_secs(num)),
            "m" => Ok(Duration::from_secs(num * 60)),
            "h" => Ok(Duration::from_secs(num * 3600)),
            "d" => Ok(Duration::from_secs(num * 86400)),
            _ => Err(format!(
                "Invalid duration suffix: {}. Use ms, s, m, h, or d",
                suffix
            )),
        }
    }
}

/// Same as [`duration_secs`] for optional durations.
pub(crate) mod duration_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&super::duration_secs::format_duration(d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        match Option::<String>::deserialize(deserializer)? {
            Some(s) => super::duration_secs::parse_duration(&s)
                .map(Some)
                .map_err(D::Error::custom),
            None => Ok(None),
        }
    }
}

/// Top-level configuration.
///
/// # Examples
///
/// ```rust
/// use leasework::config::LeaseworkConfig;
/// use std::time::Duration;
///
/// let config = LeaseworkConfig::new()
///     .with_database_url("postgresql://localhost/leasework")
///     .with_lease_duration(Duration::from_secs(300))
///     .with_lease_refresh_interval(Duration::from_secs(30));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LeaseworkConfig {
    pub store: StoreConfig,
    pub lease: LeaseConfig,
    pub monitor: MonitorConfig,
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub cancellation: CancellationConfig,
    pub logging: LoggingConfig,
}

impl LeaseworkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database_url(mut self, url: &str) -> Self {
        self.store.database_url = url.to_string();
        self
    }

    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease.duration = duration;
        self
    }

    pub fn with_lease_refresh_interval(mut self, interval: Duration) -> Self {
        self.lease.refresh_interval = interval;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.monitor.stale_threshold = threshold;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.monitor.interval = interval;
        self
    }

    pub fn with_idle_claim_threshold(mut self, threshold: Duration) -> Self {
        self.queue.idle_claim_threshold = threshold;
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry.max_attempts = attempts;
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &str) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from environment variables on top of the defaults.
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("LEASEWORK_DATABASE_URL") {
            config.store.database_url = url;
        }
        if let Ok(pool_size) = std::env::var("LEASEWORK_DATABASE_POOL_SIZE") {
            config.store.pool_size = pool_size.parse().unwrap_or(config.store.pool_size);
        }
        if let Ok(group) = std::env::var("LEASEWORK_CONSUMER_GROUP") {
            config.queue.group = group;
        }

        env_duration("LEASEWORK_LEASE_DURATION", &mut config.lease.duration)?;
        env_duration(
            "LEASEWORK_LEASE_REFRESH_INTERVAL",
            &mut config.lease.refresh_interval,
        )?;
        env_duration("LEASEWORK_HEALTH_CHECK_INTERVAL", &mut config.monitor.interval)?;
        env_duration("LEASEWORK_STALE_THRESHOLD", &mut config.monitor.stale_threshold)?;
        env_duration(
            "LEASEWORK_IDLE_CLAIM_THRESHOLD",
            &mut config.queue.idle_claim_threshold,
        )?;
        env_duration(
            "LEASEWORK_CANCELLATION_TTL",
            &mut config.cancellation.signal_ttl,
        )?;

        if let Ok(attempts) = std::env::var("LEASEWORK_MAX_RETRY_ATTEMPTS") {
            config.retry.max_attempts = attempts.parse().map_err(|_| {
                LeaseworkError::Config(format!(
                    "LEASEWORK_MAX_RETRY_ATTEMPTS is not a number: {}",
                    attempts
                ))
            })?;
        }
        if let Ok(level) = std::env::var("LEASEWORK_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(json) = std::env::var("LEASEWORK_LOG_JSON") {
            config.logging.json_format = matches!(json.as_str(), "1" | "true" | "yes");
        }

        Ok(config)
    }

    /// Checks that the timing knobs are mutually consistent.
    ///
    /// A lease must outlive its refresh interval, and the stale threshold must not
    /// be shorter than the lease window, otherwise the monitor could reclaim jobs
    /// whose owners are renewing on schedule.
    pub fn validate(&self) -> crate::Result<()> {
        if self.lease.refresh_interval.is_zero() {
            return Err(LeaseworkError::Config(
                "lease.refresh_interval must be greater than zero".to_string(),
            ));
        }
        if self.lease.duration <= self.lease.refresh_interval {
            return Err(LeaseworkError::Config(format!(
                "lease.duration ({:?}) must exceed lease.refresh_interval ({:?})",
                self.lease.duration, self.lease.refresh_interval
            )));
        }
        if self.lease.duration < self.lease.refresh_interval * 5 {
            warn!(
                "lease.duration {:?} is less than 5x lease.refresh_interval {:?}; a single missed renewal may lose the lease",
                self.lease.duration, self.lease.refresh_interval
            );
        }
        if self.monitor.stale_threshold < self.lease.duration {
            return Err(LeaseworkError::Config(format!(
                "monitor.stale_threshold ({:?}) must be at least lease.duration ({:?})",
                self.monitor.stale_threshold, self.lease.duration
            )));
        }
        if self.monitor.interval.is_zero() || self.queue.idle_claim_threshold.is_zero() {
            return Err(LeaseworkError::Config(
                "monitor.interval and queue.idle_claim_threshold must be greater than zero"
                    .to_string(),
            ));
        }
        if self.queue.read_batch == 0 || self.queue.claim_batch == 0 {
            return Err(LeaseworkError::Config(
                "queue.read_batch and queue.claim_batch must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Configuration for local development: short windows, verbose logs.
    pub fn development() -> Self {
        Self {
            store: StoreConfig {
                database_url: "postgresql://localhost/leasework_dev".to_string(),
                pool_size: 5,
                ..Default::default()
            },
            lease: LeaseConfig {
                duration: Duration::from_secs(60),
                refresh_interval: Duration::from_secs(5),
            },
            monitor: MonitorConfig {
                interval: Duration::from_secs(15),
                stale_threshold: Duration::from_secs(60),
                ..Default::default()
            },
            queue: QueueConfig {
                idle_claim_threshold: Duration::from_secs(10),
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                include_location: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Configuration for production: default windows, JSON logs, larger pool.
    pub fn production() -> Self {
        Self {
            store: StoreConfig {
                pool_size: 20,
                transient_retry_attempts: 8,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json_format: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Transient store retry policy derived from the store section.
    pub fn transient_retry_policy(&self) -> TransientRetryPolicy {
        TransientRetryPolicy::new(
            self.store.transient_retry_attempts,
            RetryStrategy::exponential(
                self.queue.read_backoff_base,
                2.0,
                Some(self.queue.read_backoff_max),
            ),
        )
    }
}

fn env_duration(name: &str, target: &mut Duration) -> crate::Result<()> {
    if let Ok(value) = std::env::var(name) {
        *target = duration_secs::parse_duration(&value)
            .map_err(|e| LeaseworkError::Config(format!("{}: {}", name, e)))?;
    }
    Ok(())
}

/// Shared store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database connection URL
    pub database_url: String,

    /// Connection pool size
    pub pool_size: u32,

    /// Attempts before a transient store failure becomes fatal
    pub transient_retry_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/leasework".to_string(),
            pool_size: 10,
            transient_retry_attempts: 5,
        }
    }
}

/// Lease window and renewal cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Exclusive-ownership window granted on acquire and renew
    #[serde(with = "duration_secs")]
    pub duration: Duration,

    /// How often the owner renews its lease and records a heartbeat
    #[serde(with = "duration_secs")]
    pub refresh_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(5 * 60),
            refresh_interval: Duration::from_secs(30),
        }
    }
}

/// Health monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Scan cadence
    #[serde(with = "duration_secs")]
    pub interval: Duration,

    /// Heartbeat age after which a job without a valid lease is orphaned
    #[serde(with = "duration_secs")]
    pub stale_threshold: Duration,

    /// Maximum RUNNING jobs inspected per scan
    pub scan_limit: u32,

    /// How often due RETRY_PENDING jobs are promoted back to QUEUED
    #[serde(with = "duration_secs")]
    pub retry_promotion_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2 * 60),
            stale_threshold: Duration::from_secs(5 * 60),
            scan_limit: 500,
            retry_promotion_interval: Duration::from_secs(10),
        }
    }
}

/// Work queue consumption settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Consumer group name
    pub group: String,

    /// Idle time after which an unacknowledged entry may be claimed by another consumer
    #[serde(with = "duration_secs")]
    pub idle_claim_threshold: Duration,

    /// Maximum entries reclaimed per claim pass
    pub claim_batch: usize,

    /// Entries requested per blocking read
    pub read_batch: usize,

    /// Upper bound a read blocks waiting for new entries
    #[serde(with = "duration_secs")]
    pub read_block: Duration,

    /// Consecutive broker failures tolerated before the consumer gives up
    pub max_read_failures: u32,

    /// First backoff delay after a broker failure
    #[serde(with = "duration_secs")]
    pub read_backoff_base: Duration,

    /// Backoff ceiling
    #[serde(with = "duration_secs")]
    pub read_backoff_max: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            group: "leasework".to_string(),
            idle_claim_threshold: Duration::from_secs(30),
            claim_batch: 100,
            read_batch: 1,
            read_block: Duration::from_secs(5),
            max_read_failures: 10,
            read_backoff_base: Duration::from_millis(500),
            read_backoff_max: Duration::from_secs(30),
        }
    }
}

/// Job retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Bound on RETRY_PENDING cycles per job
    pub max_attempts: u32,

    /// Backoff between attempts
    pub strategy: RetryStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: RetryStrategy::default(),
        }
    }
}

/// Cancellation signal settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CancellationConfig {
    /// Lifetime of a cancellation signal nobody consumed
    #[serde(with = "duration_secs")]
    pub signal_ttl: Duration,
}

impl Default for CancellationConfig {
    fn default() -> Self {
        Self {
            signal_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    pub level: String,

    /// Whether to emit structured JSON lines
    pub json_format: bool,

    /// Whether to include file and line information
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
        }
    }
}

use crate::{
    clock::{SharedClock, system_clock},
    job::{JobId, JobKind, JobStatus},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

/// Statistics for job processing over a time window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatistics {
    /// Number of terminal or retry outcomes recorded in the window
    pub total_processed: u64,
    /// Number of successfully completed jobs
    pub completed: u64,
    /// Number of jobs that ended FAILED
    pub failed: u64,
    /// Number of jobs scheduled for another attempt
    pub retried: u64,
    /// Number of jobs that ended CANCELLED
    pub cancelled: u64,
    /// Number of jobs recovered from a dead owner
    pub orphaned: u64,
    /// Number of executions aborted because the lease was lost
    pub lease_lost: u64,
    /// Number of executions started
    pub started: u64,
    /// Average processing time in milliseconds
    pub avg_processing_time_ms: f64,
    /// Minimum processing time in milliseconds
    pub min_processing_time_ms: u64,
    /// Maximum processing time in milliseconds
    pub max_processing_time_ms: u64,
    /// Outcomes per minute
    pub throughput_per_minute: f64,
    /// (failed + orphaned + lease_lost) / total_processed
    pub error_rate: f64,
    /// Time window these statistics cover
    pub time_window: Duration,
    /// When these statistics were calculated
    pub calculated_at: DateTime<Utc>,
}

impl Default for JobStatistics {
    fn default() -> Self {
        Self {
            total_processed: 0,
            completed: 0,
            failed: 0,
            retried: 0,
            cancelled: 0,
            orphaned: 0,
            lease_lost: 0,
            started: 0,
            avg_processing_time_ms: 0.0,
            min_processing_time_ms: 0,
            max_processing_time_ms: 0,
            throughput_per_minute: 0.0,
            error_rate: 0.0,
            time_window: Duration::from_secs(60),
            calculated_at: Utc::now(),
        }
    }
}

/// Operator snapshot of the job store and the delivery log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Job counts by current status
    pub jobs_by_status: HashMap<JobStatus, u64>,
    /// Entries appended but not yet delivered
    pub pending_entries: u64,
    /// Delivered-but-unacknowledged entries per consumer
    pub claimed_by_consumer: HashMap<String, u64>,
    /// Age of the oldest unacknowledged entry
    pub oldest_pending_age: Option<Duration>,
}

impl QueueStats {
    pub fn count(&self, status: JobStatus) -> u64 {
        self.jobs_by_status.get(&status).copied().unwrap_or(0)
    }

    pub fn claimed_entries(&self) -> u64 {
        self.claimed_by_consumer.values().sum()
    }
}

/// Job processing event for statistics collection
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: JobId,
    pub kind: JobKind,
    pub event_type: JobEventType,
    pub processing_time_ms: Option<u64>,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEventType {
    Started,
    Completed,
    Failed,
    Retried,
    Cancelled,
    Orphaned,
    LeaseLost,
}

impl JobEventType {
    fn is_outcome(&self) -> bool {
        !matches!(self, JobEventType::Started)
    }
}

/// Trait for collecting and storing job statistics
#[async_trait::async_trait]
pub trait StatisticsCollector: Send + Sync {
    /// Record a job processing event
    async fn record_event(&self, event: JobEvent) -> crate::Result<()>;

    /// Get statistics for one job kind over a time window
    async fn get_kind_statistics(
        &self,
        kind: JobKind,
        window: Duration,
    ) -> crate::Result<JobStatistics>;

    /// Get overall system statistics
    async fn get_system_statistics(&self, window: Duration) -> crate::Result<JobStatistics>;

    /// Clear statistics older than the specified duration
    async fn cleanup_old_statistics(&self, older_than: Duration) -> crate::Result<u64>;
}

/// In-memory statistics collector with time-windowed data
pub struct InMemoryStatsCollector {
    events: Arc<RwLock<Vec<JobEvent>>>,
    config: StatsConfig,
    clock: SharedClock,
}

/// Configuration for statistics collection
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Maximum number of events to keep in memory
    pub max_events: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            max_events: 100_000,
        }
    }
}

impl InMemoryStatsCollector {
    pub fn new(config: StatsConfig) -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            config,
            clock: system_clock(),
        }
    }

    pub fn new_default() -> Self {
        Self::new(StatsConfig::default())
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    fn cutoff(&self, window: Duration) -> DateTime<Utc> {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        self.clock
            .now()
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn filter_events_by_window(&self, window: Duration) -> Vec<JobEvent> {
        let cutoff = self.cutoff(window);
        let events = self
            .events
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        events
            .iter()
            .filter(|event| event.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    fn calculate_statistics(&self, events: &[JobEvent], window: Duration) -> JobStatistics {
        let count = |event_type: JobEventType| {
            events
                .iter()
                .filter(|e| e.event_type == event_type)
                .count() as u64
        };

        let total_processed = events.iter().filter(|e| e.event_type.is_outcome()).count() as u64;
        let failed = count(JobEventType::Failed);
        let orphaned = count(JobEventType::Orphaned);
        let lease_lost = count(JobEventType::LeaseLost);

        let processing_times: Vec<u64> =
            events.iter().filter_map(|e| e.processing_time_ms).collect();
        let (avg_processing_time_ms, min_processing_time_ms, max_processing_time_ms) =
            match (processing_times.iter().min(), processing_times.iter().max()) {
                (Some(&min), Some(&max)) => {
                    let sum: u64 = processing_times.iter().sum();
                    (sum as f64 / processing_times.len() as f64, min, max)
                }
                _ => (0.0, 0, 0),
            };

        let error_rate = if total_processed > 0 {
            (failed + orphaned + lease_lost) as f64 / total_processed as f64
        } else {
            0.0
        };

        let throughput_per_minute = if window.as_secs() > 0 {
            total_processed as f64 * 60.0 / window.as_secs() as f64
        } else {
            0.0
        };

        JobStatistics {
            total_processed,
            completed: count(JobEventType::Completed),
            failed,
            retried: count(JobEventType::Retried),
            cancelled: count(JobEventType::Cancelled),
            orphaned,
            lease_lost,
            started: count(JobEventType::Started),
            avg_processing_time_ms,
            min_processing_time_ms,
            max_processing_time_ms,
            throughput_per_minute,
            error_rate,
            time_window: window,
            calculated_at: self.clock.now(),
        }
    }
}

#[async_trait::async_trait]
impl StatisticsCollector for InMemoryStatsCollector {
    async fn record_event(&self, event: JobEvent) -> crate::Result<()> {
        let mut events = self
            .events
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        events.push(event);

        if events.len() > self.config.max_events {
            let excess = events.len() - self.config.max_events;
            events.drain(0..excess);
        }

        Ok(())
    }

    async fn get_kind_statistics(
        &self,
        kind: JobKind,
        window: Duration,
    ) -> crate::Result<JobStatistics> {
        let events: Vec<JobEvent> = self
            .filter_events_by_window(window)
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect();

        Ok(self.calculate_statistics(&events, window))
    }

    async fn get_system_statistics(&self, window: Duration) -> crate::Result<JobStatistics> {
        let events = self.filter_events_by_window(window);
        Ok(self.calculate_statistics(&events, window))
    }

    async fn cleanup_old_statistics(&self, older_than: Duration) -> crate::Result<u64> {
        let cutoff = self.cutoff(older_than);
        let mut events = self
            .events
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let original_len = events.len();
        events.retain(|event| event.timestamp >= cutoff);
        Ok((original_len - events.len()) as u64)
    }
}

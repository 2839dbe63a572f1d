use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

use crate::LeaseworkError;

pub type JobId = Uuid;

/// The kind of work a job performs. Handlers are registered per kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Download,
    Upload,
    Sync,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Download => "download",
            JobKind::Upload => "upload",
            JobKind::Sync => "sync",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = LeaseworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "download" => Ok(JobKind::Download),
            "upload" => Ok(JobKind::Upload),
            "sync" => Ok(JobKind::Sync),
            other => Err(LeaseworkError::NoHandler {
                kind: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    RetryPending,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::RetryPending,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Terminal statuses permit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Statuses in which a worker is expected to hold a lease and send heartbeats.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::RetryPending => "RETRY_PENDING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = LeaseworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| LeaseworkError::Config(format!("Unknown job status: {}", s)))
    }
}

/// One immutable entry of a job's audit trail.
///
/// `from_status` is `None` only for the entry written when the job is created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusChange {
    pub timestamp: DateTime<Utc>,
    pub from_status: Option<JobStatus>,
    pub to_status: JobStatus,
    pub reason: String,
}

/// Progress counters reported by handlers between processing units.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobProgress {
    pub units_done: u64,
    pub units_total: Option<u64>,
    pub bytes_processed: u64,
}

impl JobProgress {
    pub fn percent(&self) -> Option<f64> {
        match self.units_total {
            Some(0) | None => None,
            Some(total) => Some(self.units_done as f64 * 100.0 / total as f64),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Consumer that most recently moved the job to RUNNING.
    pub owner_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: JobProgress,
    pub status_history: Vec<StatusChange>,
}

impl Job {
    pub fn new(kind: JobKind, payload: serde_json::Value) -> Self {
        Self::new_at(kind, payload, Utc::now())
    }

    /// Creates a QUEUED job whose timestamps and initial history entry use `now`.
    pub fn new_at(kind: JobKind, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            status: JobStatus::Queued,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            last_heartbeat: None,
            owner_id: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            progress: JobProgress::default(),
            status_history: vec![StatusChange {
                timestamp: now,
                from_status: None,
                to_status: JobStatus::Queued,
                reason: "enqueued".to_string(),
            }],
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Stamps `updated_at`. Every mutation path goes through here.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    /// Advances `last_heartbeat` to `at`; returns false if `at` is not newer.
    pub fn record_heartbeat(&mut self, at: DateTime<Utc>) -> bool {
        match self.last_heartbeat {
            Some(previous) if previous >= at => false,
            _ => {
                self.last_heartbeat = Some(at);
                self.touch(at);
                true
            }
        }
    }

    /// Raises `retry_count` to `count`, never lowering it.
    pub fn raise_retry_count(&mut self, count: u32) {
        self.retry_count = self.retry_count.max(count);
    }

    /// The instant used to judge liveness: last heartbeat, else start time, else creation.
    pub fn liveness_reference(&self) -> DateTime<Utc> {
        self.last_heartbeat
            .or(self.started_at)
            .unwrap_or(self.created_at)
    }

    /// Time since the job last proved it was alive.
    pub fn stale_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.liveness_reference()
    }

    pub fn last_change(&self) -> Option<&StatusChange> {
        self.status_history.last()
    }
}

use crate::job::{JobId, JobStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LeaseworkError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("UUID parsing error: {0}")]
    UuidParsing(#[from] uuid::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transient store error: {message}")]
    TransientStore { message: String },

    #[error("Store unavailable after {attempts} attempts: {message}")]
    StoreUnavailable { message: String, attempts: u32 },

    #[error("Lease conflict on job {job_id}: held by {holder}")]
    LeaseConflict { job_id: JobId, holder: String },

    #[error("Lease lost on job {job_id} by owner {owner}")]
    LeaseLost { job_id: JobId, owner: String },

    #[error("Recoverable job error: {message}")]
    Recoverable { message: String },

    #[error("Unrecoverable job error: {message}")]
    Unrecoverable { message: String },

    #[error("Job {job_id} was cancelled")]
    Cancelled { job_id: JobId },

    #[error("Orphan detected: job {job_id} has not sent a heartbeat for {stale_for_secs}s")]
    OrphanDetected { job_id: JobId, stale_for_secs: i64 },

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("No handler registered for job kind: {kind}")]
    NoHandler { kind: String },

    #[error("Queue error: {message}")]
    Queue { message: String },

    #[error("Worker error: {message}")]
    Worker { message: String },
}

impl LeaseworkError {
    /// Whether the failure is a short-lived store or broker hiccup worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            LeaseworkError::TransientStore { .. } => true,
            LeaseworkError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }

    /// Whether a handler failure should send the job to RETRY_PENDING.
    ///
    /// Job-level failures are recoverable unless marked otherwise. Cancellation,
    /// lease loss, a missing handler and store outages are not job failures at all.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            LeaseworkError::Unrecoverable { .. }
                | LeaseworkError::Cancelled { .. }
                | LeaseworkError::LeaseLost { .. }
                | LeaseworkError::NoHandler { .. }
                | LeaseworkError::InvalidTransition { .. }
                | LeaseworkError::TransientStore { .. }
                | LeaseworkError::StoreUnavailable { .. }
        )
    }

    /// Whether the store itself failed, as opposed to the job.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            LeaseworkError::TransientStore { .. } | LeaseworkError::StoreUnavailable { .. }
        )
    }

    pub fn recoverable(message: impl Into<String>) -> Self {
        LeaseworkError::Recoverable {
            message: message.into(),
        }
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        LeaseworkError::Unrecoverable {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        LeaseworkError::TransientStore {
            message: message.into(),
        }
    }
}

impl From<toml::de::Error> for LeaseworkError {
    fn from(err: toml::de::Error) -> Self {
        LeaseworkError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for LeaseworkError {
    fn from(err: toml::ser::Error) -> Self {
        LeaseworkError::Config(format!("TOML serialization error: {}", err))
    }
}

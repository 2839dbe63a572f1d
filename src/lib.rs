//! # Leasework
//!
//! Lease-based job lifecycle orchestration for competing worker processes.
//!
//! Jobs are persisted in a [`JobRepository`], delivered through a consumer-group
//! [`Broker`] and executed by [`Worker`]s that hold an exclusive, time-bounded
//! [`Lease`] while they run. A [`HealthMonitor`] recovers jobs whose owner died,
//! producers can request cooperative cancellation, and every status change is
//! recorded in an append-only history.
//!
//! ## Features
//!
//! - **Exclusive leases**: at most one consumer holds a job's lease at a time
//! - **At-least-once delivery**: unacknowledged entries are claimed by other consumers once idle
//! - **Crash recovery**: jobs with a stale heartbeat and no live lease are requeued or failed
//! - **Cooperative cancellation**: signals are polled at handler checkpoints
//! - **Retry with backoff**: fixed, linear or exponential strategies with jitter
//! - **Audit trail**: append-only status history with a reason for every transition
//! - **Pluggable stores**: in-memory backend built in, PostgreSQL behind the `postgres` feature
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use leasework::{
//!     HandlerRegistry, JobClient, JobKind, MemoryStore, Stores, Worker, WorkerPool,
//!     clock::system_clock,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> leasework::Result<()> {
//!     let clock = system_clock();
//!     let stores = Stores::from_backend(Arc::new(MemoryStore::new(clock.clone())), clock);
//!
//!     let handlers = HandlerRegistry::new().register(JobKind::Download, |job, ctx| async move {
//!         ctx.checkpoint().await?;
//!         println!("Downloading {}", job.payload);
//!         Ok(())
//!     });
//!
//!     let client = JobClient::new(&stores);
//!     client.submit(JobKind::Download, json!({"url": "https://example.com/a"})).await?;
//!
//!     let mut pool = WorkerPool::new();
//!     pool.add_worker(Worker::new("consumer-1", &stores, handlers));
//!     pool.start().await
//! }
//! ```
//!
//! ## Job Lifecycle
//!
//! ```text
//! QUEUED -> RUNNING -> COMPLETED
//!              |    -> FAILED
//!              |    -> CANCELLED
//!              +----> RETRY_PENDING -> QUEUED
//! ```
//!
//! Terminal statuses accept no further transitions. Every transition is conditional
//! on the status the caller last observed, so concurrent writers cannot overwrite
//! each other.

pub mod cancellation;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod job;
pub mod lease;
pub mod logging;
pub mod memory;
pub mod migrations;
pub mod monitor;
pub mod queue;
pub mod reconciler;
pub mod retry;
pub mod state;
pub mod stats;
pub mod store;
pub mod worker;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use cancellation::CancellationSignals;
pub use client::JobClient;
pub use clock::{Clock, MockClock, SharedClock, SystemClock};
pub use config::LeaseworkConfig;
pub use error::LeaseworkError;
pub use job::{Job, JobId, JobKind, JobProgress, JobStatus, StatusChange};
pub use lease::{Lease, LeaseRegistry};
pub use memory::MemoryStore;
pub use monitor::{HealthMonitor, ScanReport};
pub use queue::{Consumer, QueueOptions, WorkQueue};
pub use reconciler::{ExecutorFailure, ReconcileOutcome, StateReconciler, TerminalFailureHook};
pub use retry::{JitterType, RetryPromoter, RetryStrategy};
pub use state::{OrphanRecovery, StateMachine, TransitionOutcome};
pub use stats::{
    InMemoryStatsCollector, JobEvent, JobEventType, JobStatistics, QueueStats,
    StatisticsCollector,
};
pub use store::{
    Broker, DeliveryEntry, EntryId, JobRepository, KeyValueStore, KvEntry, PendingSummary, Stores,
    TransientRetryPolicy,
};
pub use worker::{EntryOutcome, HandlerRegistry, JobContext, JobHandler, Worker, WorkerPool};

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

pub type Result<T> = std::result::Result<T, LeaseworkError>;

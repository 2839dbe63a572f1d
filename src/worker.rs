use crate::{
    LeaseworkError, Result,
    cancellation::CancellationSignals,
    clock::SharedClock,
    config::LeaseworkConfig,
    job::{Job, JobId, JobKind, JobProgress, JobStatus},
    lease::LeaseRegistry,
    monitor::HealthMonitor,
    queue::{QueueOptions, WorkQueue},
    retry::{RetryPromoter, RetryStrategy, is_retry_due},
    state::{OrphanRecovery, StateMachine, TransitionOutcome, recover_orphan},
    stats::{JobEvent, JobEventType, StatisticsCollector},
    store::{DeliveryEntry, JobRepository, Stores, TransientRetryPolicy, with_backoff},
};
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub type JobHandler = Arc<
    dyn Fn(Job, JobContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync,
>;

/// Dispatch table from job kind to handler, built once at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, JobHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(self, kind: JobKind, handler: F) -> Self
    where
        F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: JobHandler = Arc::new(move |job, ctx| Box::pin(handler(job, ctx)));
        self.register_handler(kind, handler)
    }

    pub fn register_handler(mut self, kind: JobKind, handler: JobHandler) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<&JobHandler> {
        self.handlers.get(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = JobKind> + '_ {
        self.handlers.keys().copied()
    }
}

/// Handle given to a running handler.
///
/// Handlers process their work in units and call [`JobContext::checkpoint`] between
/// units; cancellation is cooperative and only observed there.
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    owner_id: String,
    repository: Arc<dyn JobRepository>,
    signals: CancellationSignals,
    clock: SharedClock,
    retry_policy: TransientRetryPolicy,
    cancel_requested: Arc<AtomicBool>,
}

impl JobContext {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Whether a cancellation has been observed, without touching the store.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    /// Returns [`LeaseworkError::Cancelled`] if the job has been asked to stop.
    pub async fn checkpoint(&self) -> Result<()> {
        if !self.is_cancel_requested() && self.signals.is_cancelled(self.job_id).await? {
            self.request_cancel();
        }
        if self.is_cancel_requested() {
            return Err(LeaseworkError::Cancelled {
                job_id: self.job_id,
            });
        }
        Ok(())
    }

    /// Persists progress counters. Fails with [`LeaseworkError::LeaseLost`] if the
    /// job is no longer RUNNING.
    pub async fn report_progress(&self, progress: JobProgress) -> Result<()> {
        let Some(mut job) = with_backoff(&self.retry_policy, "get_job", || {
            self.repository.get(self.job_id)
        })
        .await?
        else {
            return Err(LeaseworkError::JobNotFound {
                id: self.job_id.to_string(),
            });
        };

        job.progress = progress;
        job.touch(self.clock.now());
        let updated = with_backoff(&self.retry_policy, "update_progress", || {
            self.repository.update(&job, JobStatus::Running)
        })
        .await?;

        if !updated {
            return Err(LeaseworkError::LeaseLost {
                job_id: self.job_id,
                owner: self.owner_id.clone(),
            });
        }
        Ok(())
    }
}

/// What processing one delivery entry amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    /// This consumer moved the job to the given status; the entry was acknowledged.
    Committed(JobStatus),
    /// The job was already terminal; acknowledged without reprocessing.
    AlreadyTerminal(JobStatus),
    /// No job record exists for the entry; acknowledged.
    MissingJob,
    /// The job is waiting out its retry backoff; acknowledged, the promoter enqueues it again.
    BackoffPending,
    /// Another owner holds a live lease; the entry stays pending.
    LeaseBusy { holder: String },
    /// The lease was lost mid-run; nothing was written and the entry stays pending.
    LeaseLost,
    /// The job changed under this consumer; the entry stays pending for re-evaluation.
    Superseded(Option<JobStatus>),
}

enum Execution {
    Finished(Result<()>),
    Aborted(LeaseworkError),
}

pub struct Worker {
    consumer_id: String,
    stores: Stores,
    queue: WorkQueue,
    leases: LeaseRegistry,
    signals: CancellationSignals,
    machine: StateMachine,
    handlers: HandlerRegistry,
    lease_duration: Duration,
    refresh_interval: Duration,
    retry_strategy: RetryStrategy,
    retry_policy: TransientRetryPolicy,
    stats_collector: Option<Arc<dyn StatisticsCollector>>,
}

impl Worker {
    pub fn new(consumer_id: impl Into<String>, stores: &Stores, handlers: HandlerRegistry) -> Self {
        Self::from_config(consumer_id, stores, handlers, &LeaseworkConfig::default())
    }

    pub fn from_config(
        consumer_id: impl Into<String>,
        stores: &Stores,
        handlers: HandlerRegistry,
        config: &LeaseworkConfig,
    ) -> Self {
        let policy = config.transient_retry_policy();
        let clock = stores.clock.clone();
        Self {
            consumer_id: consumer_id.into(),
            queue: WorkQueue::new(stores.broker.clone(), clock.clone())
                .with_options(QueueOptions::from_config(&config.queue))
                .with_retry_policy(policy.clone()),
            leases: LeaseRegistry::new(stores.kv.clone(), clock.clone())
                .with_retry_policy(policy.clone()),
            signals: CancellationSignals::new(
                stores.kv.clone(),
                clock.clone(),
                config.cancellation.signal_ttl,
            )
            .with_retry_policy(policy.clone()),
            machine: StateMachine::new(stores.jobs.clone(), clock)
                .with_retry_policy(policy.clone()),
            stores: stores.clone(),
            handlers,
            lease_duration: config.lease.duration,
            refresh_interval: config.lease.refresh_interval,
            retry_strategy: config.retry.strategy.clone(),
            retry_policy: policy,
            stats_collector: None,
        }
    }

    pub fn with_stats_collector(mut self, stats_collector: Arc<dyn StatisticsCollector>) -> Self {
        self.stats_collector = Some(stats_collector);
        self
    }

    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = strategy;
        self
    }

    pub fn with_queue_options(mut self, options: QueueOptions) -> Self {
        self.queue = self.queue.with_options(options);
        self
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Consumes entries until shutdown. Returns an error only when the broker or
    /// store stays unavailable past the backoff cap.
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        info!(consumer = %self.consumer_id, "Worker started");
        let mut consumer = self.queue.start_consuming(self.consumer_id.clone());

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(consumer = %self.consumer_id, "Worker shutting down");
                    break;
                }
                batch = consumer.next_batch() => {
                    let entries = match batch {
                        Ok(entries) => entries,
                        Err(e) => {
                            error!(consumer = %self.consumer_id, "Giving up on broker: {}", e);
                            return Err(e);
                        }
                    };
                    for entry in entries {
                        match self.process_entry(&entry).await {
                            Ok(outcome) => {
                                debug!(entry_id = entry.entry_id, job_id = %entry.job_id, ?outcome, "Entry processed");
                            }
                            Err(e @ LeaseworkError::StoreUnavailable { .. }) => {
                                error!(consumer = %self.consumer_id, "Store unavailable: {}", e);
                                return Err(e);
                            }
                            Err(e) => {
                                error!(entry_id = entry.entry_id, job_id = %entry.job_id, "Entry left pending: {}", e);
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Processes one delivery entry end to end.
    ///
    /// The entry is acknowledged only after the job's new state is durable. Any error
    /// leaves it pending so it can be claimed again.
    pub async fn process_entry(&self, entry: &DeliveryEntry) -> Result<EntryOutcome> {
        let job_id = entry.job_id;

        let Some(job) = self.load(job_id).await? else {
            warn!(%job_id, entry_id = entry.entry_id, "Entry refers to an unknown job");
            self.queue.acknowledge(entry.entry_id).await?;
            return Ok(EntryOutcome::MissingJob);
        };
        if job.is_terminal() {
            debug!(%job_id, status = %job.status, "Job already terminal, acknowledging");
            self.queue.acknowledge(entry.entry_id).await?;
            return Ok(EntryOutcome::AlreadyTerminal(job.status));
        }

        match self
            .leases
            .acquire(job_id, &self.consumer_id, self.lease_duration)
            .await
        {
            Ok(_) => {}
            Err(LeaseworkError::LeaseConflict { holder, .. }) => {
                debug!(%job_id, holder = %holder, "Job is leased elsewhere, leaving entry pending");
                return Ok(EntryOutcome::LeaseBusy { holder });
            }
            Err(e) => return Err(e),
        }

        let outcome = self.process_leased(entry).await;
        if !matches!(outcome, Ok(EntryOutcome::LeaseLost)) {
            if let Err(e) = self.leases.release(job_id, &self.consumer_id).await {
                warn!(%job_id, "Failed to release lease: {}", e);
            }
        }
        outcome
    }

    async fn process_leased(&self, entry: &DeliveryEntry) -> Result<EntryOutcome> {
        let job_id = entry.job_id;

        // Reload under the lease; the first read was only a cheap filter.
        let Some(mut job) = self.load(job_id).await? else {
            self.queue.acknowledge(entry.entry_id).await?;
            return Ok(EntryOutcome::MissingJob);
        };

        if job.status == JobStatus::Running {
            job = match self.take_over(&job).await? {
                Some(requeued) => requeued,
                None => {
                    self.queue.acknowledge(entry.entry_id).await?;
                    return Ok(EntryOutcome::Committed(JobStatus::Failed));
                }
            };
        }

        if job.status == JobStatus::RetryPending {
            if !is_retry_due(&job, self.stores.clock.now()) {
                self.queue.acknowledge(entry.entry_id).await?;
                return Ok(EntryOutcome::BackoffPending);
            }
            job = match self
                .machine
                .transition(&job, JobStatus::Queued, "retry backoff elapsed", |_| {})
                .await?
            {
                TransitionOutcome::Applied(job) => job,
                other => return self.superseded(entry, other).await,
            };
        }

        if job.is_terminal() {
            self.queue.acknowledge(entry.entry_id).await?;
            return Ok(EntryOutcome::AlreadyTerminal(job.status));
        }

        if self.signals.is_cancelled(job_id).await? {
            return self
                .commit(entry, &job, JobStatus::Cancelled, "cancellation observed", |_| {})
                .await;
        }

        let now = self.stores.clock.now();
        let owner = self.consumer_id.clone();
        let running = match self
            .machine
            .transition(&job, JobStatus::Running, "lease acquired", |j| {
                j.owner_id = Some(owner);
                j.record_heartbeat(now);
            })
            .await?
        {
            TransitionOutcome::Applied(job) => job,
            other => return self.superseded(entry, other).await,
        };

        self.record_event(&running, JobEventType::Started, None, None)
            .await;
        info!(%job_id, kind = %running.kind, consumer = %self.consumer_id, "Job started");

        let ctx = JobContext {
            job_id,
            owner_id: self.consumer_id.clone(),
            repository: self.stores.jobs.clone(),
            signals: self.signals.clone(),
            clock: self.stores.clock.clone(),
            retry_policy: self.retry_policy.clone(),
            cancel_requested: Arc::new(AtomicBool::new(false)),
        };
        let started = Instant::now();

        let result = match self.execute(&running, &ctx).await {
            Execution::Finished(result) => result,
            Execution::Aborted(e) => return self.abort(&running, e).await,
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        // One last proof of ownership before writing the outcome.
        if let Err(e) = self
            .leases
            .renew(job_id, &self.consumer_id, self.lease_duration)
            .await
        {
            return self.abort(&running, e).await;
        }

        let Some(current) = self.load(job_id).await? else {
            return Ok(EntryOutcome::Superseded(None));
        };
        if current.status != JobStatus::Running {
            return self
                .superseded(
                    entry,
                    TransitionOutcome::Conflict {
                        current: Some(current.status),
                    },
                )
                .await;
        }

        self.finish(entry, &current, &ctx, result, elapsed_ms).await
    }

    /// Runs the handler while keeping the lease, heartbeat and cancellation flag fresh.
    async fn execute(&self, job: &Job, ctx: &JobContext) -> Execution {
        let Some(handler) = self.handlers.get(job.kind) else {
            return Execution::Finished(Err(LeaseworkError::NoHandler {
                kind: job.kind.to_string(),
            }));
        };

        let mut handler_future = handler(job.clone(), ctx.clone());
        let start = tokio::time::Instant::now() + self.refresh_interval;
        let mut ticker = tokio::time::interval_at(start, self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut handler_future => {
                    return match result {
                        Err(e @ LeaseworkError::LeaseLost { .. }) => Execution::Aborted(e),
                        other => Execution::Finished(other),
                    };
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.keep_alive(job.id, ctx).await {
                        // Dropping the future stops the handler at its next await point.
                        return Execution::Aborted(e);
                    }
                }
            }
        }
    }

    async fn keep_alive(&self, job_id: JobId, ctx: &JobContext) -> Result<()> {
        self.leases
            .renew(job_id, &self.consumer_id, self.lease_duration)
            .await?;

        let now = self.stores.clock.now();
        let recorded = with_backoff(&self.retry_policy, "record_heartbeat", || {
            self.stores.jobs.record_heartbeat(job_id, now)
        })
        .await?;
        if !recorded {
            debug!(%job_id, "Heartbeat not recorded");
        }

        if !ctx.is_cancel_requested() && self.signals.is_cancelled(job_id).await? {
            info!(%job_id, "Cancellation requested");
            ctx.request_cancel();
        }
        Ok(())
    }

    async fn finish(
        &self,
        entry: &DeliveryEntry,
        job: &Job,
        ctx: &JobContext,
        result: Result<()>,
        elapsed_ms: u64,
    ) -> Result<EntryOutcome> {
        let cancelled = ctx.is_cancel_requested() || self.signals.is_cancelled(job.id).await?;

        match result {
            Ok(()) if cancelled => {
                self.commit(entry, job, JobStatus::Cancelled, "cancellation observed", |_| {})
                    .await
            }
            Ok(()) => {
                let outcome = self
                    .commit(entry, job, JobStatus::Completed, "success", |_| {})
                    .await?;
                if outcome == EntryOutcome::Committed(JobStatus::Completed) {
                    info!(job_id = %job.id, "Job completed in {}ms", elapsed_ms);
                    self.record_event(job, JobEventType::Completed, Some(elapsed_ms), None)
                        .await;
                }
                Ok(outcome)
            }
            Err(LeaseworkError::Cancelled { .. }) => {
                self.commit(entry, job, JobStatus::Cancelled, "cancellation observed", |_| {})
                    .await
            }
            Err(e) if e.is_store_failure() => {
                // The job did not fail; leave it RUNNING and the entry pending.
                error!(job_id = %job.id, "Store failed under the handler: {}", e);
                Err(e)
            }
            Err(e) if e.is_recoverable() && job.has_retries_left() => {
                let attempt = job.retry_count + 1;
                let delay = self.retry_strategy.calculate_delay(attempt);
                let next_retry_at = self
                    .stores
                    .clock
                    .now()
                    .checked_add_signed(
                        chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX),
                    )
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                let message = e.to_string();
                warn!(job_id = %job.id, attempt, "Job failed, retrying at {}: {}", next_retry_at, message);

                let outcome = self
                    .commit(entry, job, JobStatus::RetryPending, "recoverable error", |j| {
                        j.raise_retry_count(attempt);
                        j.next_retry_at = Some(next_retry_at);
                        j.error_message = Some(message.clone());
                    })
                    .await?;
                if outcome == EntryOutcome::Committed(JobStatus::RetryPending) {
                    self.record_event(job, JobEventType::Retried, Some(elapsed_ms), Some(message))
                        .await;
                }
                Ok(outcome)
            }
            Err(e) => {
                let reason = if e.is_recoverable() {
                    "retries exhausted"
                } else {
                    "unrecoverable error"
                };
                let message = e.to_string();
                error!(job_id = %job.id, "Job failed ({}): {}", reason, message);

                let outcome = self
                    .commit(entry, job, JobStatus::Failed, reason, |j| {
                        j.error_message = Some(message.clone());
                    })
                    .await?;
                if outcome == EntryOutcome::Committed(JobStatus::Failed) {
                    self.record_event(job, JobEventType::Failed, Some(elapsed_ms), Some(message))
                        .await;
                }
                Ok(outcome)
            }
        }
    }

    /// Writes the transition, then cleans up and acknowledges the entry.
    async fn commit<F>(
        &self,
        entry: &DeliveryEntry,
        job: &Job,
        to: JobStatus,
        reason: &str,
        mutate: F,
    ) -> Result<EntryOutcome>
    where
        F: FnOnce(&mut Job),
    {
        let outcome = self.machine.transition(job, to, reason, mutate).await?;
        let TransitionOutcome::Applied(updated) = outcome else {
            return self.superseded(entry, outcome).await;
        };

        if updated.is_terminal() {
            self.signals.clear(updated.id).await?;
        }
        if to == JobStatus::Cancelled {
            info!(job_id = %updated.id, "Job cancelled");
            self.record_event(&updated, JobEventType::Cancelled, None, None)
                .await;
        }
        self.queue.acknowledge(entry.entry_id).await?;
        Ok(EntryOutcome::Committed(to))
    }

    async fn superseded(
        &self,
        entry: &DeliveryEntry,
        outcome: TransitionOutcome,
    ) -> Result<EntryOutcome> {
        match outcome {
            TransitionOutcome::RejectedTerminal { status } => {
                self.queue.acknowledge(entry.entry_id).await?;
                Ok(EntryOutcome::AlreadyTerminal(status))
            }
            TransitionOutcome::Conflict { current } => Ok(EntryOutcome::Superseded(current)),
            TransitionOutcome::Applied(job) => Ok(EntryOutcome::Committed(job.status)),
        }
    }

    /// Recovers a RUNNING job whose previous owner let its lease lapse.
    ///
    /// Returns the requeued job, or `None` if it was failed instead.
    async fn take_over(&self, job: &Job) -> Result<Option<Job>> {
        let stale_for = job.stale_for(self.stores.clock.now());
        warn!(
            job_id = %job.id,
            previous_owner = job.owner_id.as_deref().unwrap_or("unknown"),
            "Taking over job whose lease lapsed"
        );
        let error_message = LeaseworkError::OrphanDetected {
            job_id: job.id,
            stale_for_secs: stale_for.num_seconds(),
        }
        .to_string();

        match recover_orphan(&self.machine, job, "lease expired", error_message.clone()).await? {
            OrphanRecovery::Requeued(requeued) => {
                self.record_event(job, JobEventType::Orphaned, None, Some(error_message))
                    .await;
                Ok(Some(requeued))
            }
            OrphanRecovery::Failed(failed) => {
                self.signals.clear(failed.id).await?;
                self.record_event(job, JobEventType::Orphaned, None, Some(error_message))
                    .await;
                Ok(None)
            }
            OrphanRecovery::Skipped(current) => Err(LeaseworkError::Worker {
                message: format!(
                    "job {} changed during takeover (now {:?})",
                    job.id, current
                ),
            }),
        }
    }

    async fn abort(&self, job: &Job, error: LeaseworkError) -> Result<EntryOutcome> {
        match error {
            LeaseworkError::LeaseLost { .. } => {
                warn!(job_id = %job.id, "Lease lost mid-run, abandoning job without update");
                self.record_event(job, JobEventType::LeaseLost, None, None)
                    .await;
                Ok(EntryOutcome::LeaseLost)
            }
            other => Err(other),
        }
    }

    async fn load(&self, job_id: JobId) -> Result<Option<Job>> {
        with_backoff(&self.retry_policy, "get_job", || self.stores.jobs.get(job_id)).await
    }

    async fn record_event(
        &self,
        job: &Job,
        event_type: JobEventType,
        processing_time_ms: Option<u64>,
        error_message: Option<String>,
    ) {
        if let Some(stats_collector) = &self.stats_collector {
            let event = JobEvent {
                job_id: job.id,
                kind: job.kind,
                event_type,
                processing_time_ms,
                error_message,
                timestamp: self.stores.clock.now(),
            };
            if let Err(e) = stats_collector.record_event(event).await {
                warn!("Failed to record statistics event: {}", e);
            }
        }
    }
}

/// Runs several consumers, and optionally the health monitor and retry promoter,
/// inside one process.
pub struct WorkerPool {
    workers: Vec<Worker>,
    monitor: Option<(HealthMonitor, Duration)>,
    promoter: Option<(RetryPromoter, Duration)>,
    shutdown_tx: Vec<mpsc::Sender<()>>,
    stats_collector: Option<Arc<dyn StatisticsCollector>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            workers: Vec::new(),
            monitor: None,
            promoter: None,
            shutdown_tx: Vec::new(),
            stats_collector: None,
        }
    }

    pub fn with_stats_collector(mut self, stats_collector: Arc<dyn StatisticsCollector>) -> Self {
        self.stats_collector = Some(stats_collector);
        self
    }

    pub fn with_monitor(mut self, monitor: HealthMonitor, interval: Duration) -> Self {
        self.monitor = Some((monitor, interval));
        self
    }

    pub fn with_promoter(mut self, promoter: RetryPromoter, interval: Duration) -> Self {
        self.promoter = Some((promoter, interval));
        self
    }

    pub fn add_worker(&mut self, mut worker: Worker) {
        if let Some(stats_collector) = &self.stats_collector {
            worker.stats_collector = Some(Arc::clone(stats_collector));
        }
        self.workers.push(worker);
    }

    fn shutdown_channel(&mut self) -> mpsc::Receiver<()> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        self.shutdown_tx.push(shutdown_tx);
        shutdown_rx
    }

    /// Spawns every component and waits for all of them to stop.
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting worker pool with {} workers", self.workers.len());

        let mut handles = Vec::new();
        self.shutdown_tx.clear();

        for worker in std::mem::take(&mut self.workers) {
            let shutdown_rx = self.shutdown_channel();
            handles.push(tokio::spawn(async move {
                if let Err(e) = worker.run(shutdown_rx).await {
                    error!(consumer = %worker.consumer_id, "Worker error: {}", e);
                }
            }));
        }

        if let Some((monitor, interval)) = self.monitor.take() {
            let shutdown_rx = self.shutdown_channel();
            handles.push(tokio::spawn(async move {
                if let Err(e) = monitor.run(interval, shutdown_rx).await {
                    error!("Health monitor error: {}", e);
                }
            }));
        }

        if let Some((promoter, interval)) = self.promoter.take() {
            let shutdown_rx = self.shutdown_channel();
            handles.push(tokio::spawn(async move {
                if let Err(e) = promoter.run(interval, shutdown_rx).await {
                    error!("Retry promoter error: {}", e);
                }
            }));
        }

        for handle in handles {
            handle.await.map_err(|e| LeaseworkError::Worker {
                message: format!("Worker task failed: {}", e),
            })?;
        }

        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down worker pool");

        for tx in &self.shutdown_tx {
            if tx.send(()).await.is_err() {
                warn!("Failed to send shutdown signal to worker");
            }
        }

        Ok(())
    }

    /// Get the statistics collector for the worker pool
    pub fn stats_collector(&self) -> Option<Arc<dyn StatisticsCollector>> {
        self.stats_collector.clone()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

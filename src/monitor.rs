//! Health monitor.
//!
//! Periodically scans RUNNING jobs for owners that stopped proving they are alive.
//! A job is orphaned only when its heartbeat is older than the stale threshold
//! **and** its lease is absent or expired: a live lease always wins over a stale
//! heartbeat. Orphans are requeued while retries remain and failed otherwise.

use crate::{
    LeaseworkError, Result,
    cancellation::CancellationSignals,
    clock::SharedClock,
    config::LeaseworkConfig,
    job::{Job, JobStatus},
    lease::LeaseRegistry,
    state::{OrphanRecovery, StateMachine, recover_orphan},
    stats::{JobEvent, JobEventType, StatisticsCollector},
    store::{JobRepository, Stores, TransientRetryPolicy, with_backoff},
};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Summary of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Stale candidates inspected.
    pub scanned: usize,
    /// Heartbeat advanced again before the job was inspected.
    pub fresh: usize,
    /// Heartbeat stale but the lease is still held.
    pub live: usize,
    pub requeued: usize,
    pub failed: usize,
    /// Jobs that moved on before recovery could be applied.
    pub conflicts: usize,
    pub errors: usize,
}

impl ScanReport {
    pub fn recovered(&self) -> usize {
        self.requeued + self.failed
    }
}

pub struct HealthMonitor {
    repository: Arc<dyn JobRepository>,
    leases: LeaseRegistry,
    signals: CancellationSignals,
    machine: StateMachine,
    clock: SharedClock,
    stale_threshold: Duration,
    scan_limit: u32,
    retry_policy: TransientRetryPolicy,
    stats_collector: Option<Arc<dyn StatisticsCollector>>,
}

impl HealthMonitor {
    pub fn new(stores: &Stores) -> Self {
        Self::from_config(stores, &LeaseworkConfig::default())
    }

    pub fn from_config(stores: &Stores, config: &LeaseworkConfig) -> Self {
        let policy = config.transient_retry_policy();
        Self {
            repository: stores.jobs.clone(),
            leases: LeaseRegistry::new(stores.kv.clone(), stores.clock.clone())
                .with_retry_policy(policy.clone()),
            signals: CancellationSignals::new(
                stores.kv.clone(),
                stores.clock.clone(),
                config.cancellation.signal_ttl,
            )
            .with_retry_policy(policy.clone()),
            machine: StateMachine::new(stores.jobs.clone(), stores.clock.clone())
                .with_retry_policy(policy.clone()),
            clock: stores.clock.clone(),
            stale_threshold: config.monitor.stale_threshold,
            scan_limit: config.monitor.scan_limit,
            retry_policy: policy,
            stats_collector: None,
        }
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_scan_limit(mut self, limit: u32) -> Self {
        self.scan_limit = limit.max(1);
        self
    }

    pub fn with_stats_collector(mut self, stats_collector: Arc<dyn StatisticsCollector>) -> Self {
        self.stats_collector = Some(stats_collector);
        self
    }

    /// Inspects the RUNNING jobs whose heartbeat is past the stale threshold,
    /// least recently alive first, up to `scan_limit` of them.
    ///
    /// Failures on individual jobs are counted and logged; only failing to list
    /// jobs at all is returned as an error.
    pub async fn scan_once(&self) -> Result<ScanReport> {
        let threshold =
            chrono::Duration::from_std(self.stale_threshold).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = self.clock.now().checked_sub_signed(threshold) else {
            return Ok(ScanReport::default());
        };
        let jobs = with_backoff(&self.retry_policy, "list_stale_running", || {
            self.repository
                .list_stale(JobStatus::Running, cutoff, Some(self.scan_limit))
        })
        .await?;

        let mut report = ScanReport {
            scanned: jobs.len(),
            ..Default::default()
        };
        for job in &jobs {
            if let Err(e) = self.inspect(job, &mut report).await {
                report.errors += 1;
                error!(job_id = %job.id, "Health check failed: {}", e);
            }
        }

        if report.recovered() > 0 || report.errors > 0 {
            info!(
                scanned = report.scanned,
                requeued = report.requeued,
                failed = report.failed,
                errors = report.errors,
                "Health scan recovered orphaned jobs"
            );
        } else {
            debug!(scanned = report.scanned, "Health scan clean");
        }
        Ok(report)
    }

    async fn inspect(&self, job: &Job, report: &mut ScanReport) -> Result<()> {
        let now = self.clock.now();
        let stale_for = job.stale_for(now);
        let threshold =
            chrono::Duration::from_std(self.stale_threshold).unwrap_or(chrono::Duration::MAX);
        if stale_for <= threshold {
            report.fresh += 1;
            return Ok(());
        }

        let residual = self.leases.current(job.id).await?;
        if let Some(lease) = residual.as_ref().filter(|lease| !lease.is_expired(now)) {
            debug!(
                job_id = %job.id,
                owner = %lease.owner_id,
                "Heartbeat stale but lease still held, leaving job alone"
            );
            report.live += 1;
            return Ok(());
        }

        let error_message = LeaseworkError::OrphanDetected {
            job_id: job.id,
            stale_for_secs: stale_for.num_seconds(),
        }
        .to_string();
        warn!(
            job_id = %job.id,
            owner = job.owner_id.as_deref().unwrap_or("unknown"),
            "{}",
            error_message
        );

        let recovery =
            recover_orphan(&self.machine, job, "heartbeat timeout", error_message.clone()).await?;
        let recovered = match &recovery {
            OrphanRecovery::Requeued(_) => {
                report.requeued += 1;
                true
            }
            OrphanRecovery::Failed(failed) => {
                report.failed += 1;
                self.signals.clear(failed.id).await?;
                true
            }
            OrphanRecovery::Skipped(current) => {
                debug!(job_id = %job.id, ?current, "Orphan moved on before recovery");
                report.conflicts += 1;
                false
            }
        };

        if recovered {
            if let Some(lease) = residual {
                self.leases.release(job.id, &lease.owner_id).await?;
            }
            self.record_event(job, error_message).await;
        }
        Ok(())
    }

    /// Scans every `interval` until shutdown. A failed scan is logged and the
    /// monitor keeps running.
    pub async fn run(&self, interval: Duration, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        info!(
            "Health monitor started (interval {:?}, stale threshold {:?})",
            interval, self.stale_threshold
        );
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Health monitor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.scan_once().await {
                        warn!("Health scan failed, retrying next tick: {}", e);
                    }
                }
            }
        }

        Ok(())
    }

    async fn record_event(&self, job: &Job, error_message: String) {
        if let Some(stats_collector) = &self.stats_collector {
            let event = JobEvent {
                job_id: job.id,
                kind: job.kind,
                event_type: JobEventType::Orphaned,
                processing_time_ms: None,
                error_message: Some(error_message),
                timestamp: self.clock.now(),
            };
            if let Err(e) = stats_collector.record_event(event).await {
                warn!("Failed to record statistics event: {}", e);
            }
        }
    }
}

//! In-process backend implementing every store contract.
//!
//! [`MemoryStore`] keeps jobs, key-value entries and the delivery log behind one
//! mutex, which makes every conditional operation trivially atomic. All expiry and
//! idle computations read the injected [`Clock`](crate::clock::Clock), so tests can
//! move through lease windows and claim thresholds with a
//! [`MockClock`](crate::clock::MockClock).

use crate::{
    LeaseworkError, Result,
    clock::SharedClock,
    job::{Job, JobId, JobStatus, StatusChange},
    retry::is_retry_due,
    store::{
        Broker, DeliveryEntry, EntryId, JobRepository, KeyValueStore, KvEntry, PendingSummary,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};
use tokio::sync::Notify;

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<JobId, Job>,
    kv: HashMap<String, KvEntry>,
    entries: BTreeMap<EntryId, DeliveryEntry>,
    next_entry_id: EntryId,
}

pub struct MemoryStore {
    state: Mutex<MemoryState>,
    new_entries: Notify,
    clock: SharedClock,
    read_failures: AtomicU32,
}

impl MemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                next_entry_id: 1,
                ..Default::default()
            }),
            new_entries: Notify::new(),
            clock,
            read_failures: AtomicU32::new(0),
        }
    }

    /// Makes the next `count` broker reads and claims fail with a transient error.
    pub fn inject_read_failures(&self, count: u32) {
        self.read_failures.store(count, Ordering::SeqCst);
    }

    /// Number of delivery entries not yet acknowledged.
    pub fn unacknowledged(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_injected_failure(&self) -> Result<()> {
        let consumed = self
            .read_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(LeaseworkError::transient("injected broker failure")),
            Err(_) => Ok(()),
        }
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        self.clock.now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX)
    }

    fn deliver_new(&self, consumer: &str, count: usize) -> Vec<DeliveryEntry> {
        let now = self.clock.now();
        let mut state = self.lock();
        state
            .entries
            .values_mut()
            .filter(|entry| entry.consumer.is_none())
            .take(count)
            .map(|entry| {
                entry.consumer = Some(consumer.to_string());
                entry.delivery_count += 1;
                entry.last_delivered_at = Some(now);
                entry.clone()
            })
            .collect()
    }
}

/// Copies the mutable fields of `incoming` onto `stored` without letting the
/// heartbeat or retry count move backwards.
fn merge_fields(stored: &mut Job, incoming: &Job) {
    let history = std::mem::take(&mut stored.status_history);
    let status = stored.status;
    let heartbeat = stored.last_heartbeat.max(incoming.last_heartbeat);
    let retry_count = stored.retry_count.max(incoming.retry_count);

    *stored = incoming.clone();
    stored.status_history = history;
    stored.status = status;
    stored.last_heartbeat = heartbeat;
    stored.retry_count = retry_count;
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        let mut state = self.lock();
        if state.jobs.contains_key(&job.id) {
            return Err(LeaseworkError::Queue {
                message: format!("job {} already exists", job.id),
            });
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn list_by_status(&self, statuses: &[JobStatus], limit: Option<u32>) -> Result<Vec<Job>> {
        let state = self.lock();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| statuses.contains(&job.status))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        if let Some(limit) = limit {
            jobs.truncate(limit as usize);
        }
        Ok(jobs)
    }

    async fn list_stale(
        &self,
        status: JobStatus,
        cutoff: DateTime<Utc>,
        limit: Option<u32>,
    ) -> Result<Vec<Job>> {
        let state = self.lock();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.status == status && job.liveness_reference() < cutoff)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (job.liveness_reference(), job.created_at));
        if let Some(limit) = limit {
            jobs.truncate(limit as usize);
        }
        Ok(jobs)
    }

    async fn list_due_retries(&self, now: DateTime<Utc>, limit: Option<u32>) -> Result<Vec<Job>> {
        let state = self.lock();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| is_retry_due(job, now))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (job.next_retry_at.unwrap_or(job.updated_at), job.created_at));
        if let Some(limit) = limit {
            jobs.truncate(limit as usize);
        }
        Ok(jobs)
    }

    async fn update(&self, job: &Job, expected: JobStatus) -> Result<bool> {
        let mut state = self.lock();
        match state.jobs.get_mut(&job.id) {
            Some(stored) if stored.status == expected => {
                merge_fields(stored, job);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_transition(
        &self,
        job: &Job,
        expected: JobStatus,
        change: &StatusChange,
    ) -> Result<bool> {
        let mut state = self.lock();
        match state.jobs.get_mut(&job.id) {
            Some(stored) if stored.status == expected => {
                merge_fields(stored, job);
                stored.status = change.to_status;
                stored.status_history.push(change.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_heartbeat(&self, job_id: JobId, at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.lock();
        match state.jobs.get_mut(&job_id) {
            Some(stored) if stored.status.is_active() => Ok(stored.record_heartbeat(at)),
            _ => Ok(false),
        }
    }

    async fn history(&self, job_id: JobId) -> Result<Vec<StatusChange>> {
        self.lock()
            .jobs
            .get(&job_id)
            .map(|job| job.status_history.clone())
            .ok_or_else(|| LeaseworkError::JobNotFound {
                id: job_id.to_string(),
            })
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>> {
        let mut counts = HashMap::new();
        for job in self.lock().jobs.values() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut state = self.lock();
        if state.kv.get(key).is_some_and(|entry| entry.expires_at > now) {
            return Ok(false);
        }
        state.kv.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut state = self.lock();
        match state.kv.get_mut(key) {
            Some(entry) if entry.value == expected && entry.expires_at > now => {
                entry.value = value.to_string();
                entry.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut state = self.lock();
        if state.kv.get(key).is_some_and(|entry| entry.value == expected) {
            state.kv.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = self.expiry(ttl);
        self.lock().kv.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get_entry(&self, key: &str) -> Result<Option<KvEntry>> {
        Ok(self.lock().kv.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.lock().kv.remove(key).is_some())
    }
}

#[async_trait]
impl Broker for MemoryStore {
    async fn enqueue(
        &self,
        job_id: JobId,
        owner_hint: Option<&str>,
        metadata: serde_json::Value,
    ) -> Result<EntryId> {
        let created_at = self.clock.now();
        let entry_id = {
            let mut state = self.lock();
            let entry_id = state.next_entry_id;
            state.next_entry_id += 1;
            state.entries.insert(
                entry_id,
                DeliveryEntry {
                    entry_id,
                    job_id,
                    owner_hint: owner_hint.map(str::to_string),
                    metadata,
                    created_at,
                    delivery_count: 0,
                    consumer: None,
                    last_delivered_at: None,
                },
            );
            entry_id
        };
        self.new_entries.notify_waiters();
        Ok(entry_id)
    }

    async fn read_group(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<DeliveryEntry>> {
        self.take_injected_failure()?;

        let deadline = tokio::time::Instant::now() + block;
        loop {
            // Registered before checking so an enqueue in between is not missed
            let notified = self.new_entries.notified();
            let batch = self.deliver_new(consumer, count);
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn acknowledge(&self, entry_id: EntryId) -> Result<bool> {
        Ok(self.lock().entries.remove(&entry_id).is_some())
    }

    async fn claim_stale(
        &self,
        consumer: &str,
        idle: Duration,
        max_batch: usize,
    ) -> Result<Vec<DeliveryEntry>> {
        self.take_injected_failure()?;

        let now = self.clock.now();
        let idle = chrono::Duration::from_std(idle).unwrap_or(chrono::Duration::MAX);
        let mut state = self.lock();
        Ok(state
            .entries
            .values_mut()
            .filter(|entry| {
                entry.consumer.is_some()
                    && entry
                        .last_delivered_at
                        .is_some_and(|delivered| now - delivered >= idle)
            })
            .take(max_batch)
            .map(|entry| {
                entry.consumer = Some(consumer.to_string());
                entry.delivery_count += 1;
                entry.last_delivered_at = Some(now);
                entry.clone()
            })
            .collect())
    }

    async fn pending_summary(&self) -> Result<PendingSummary> {
        let state = self.lock();
        let mut summary = PendingSummary::default();
        for entry in state.entries.values() {
            match &entry.consumer {
                Some(consumer) => {
                    *summary
                        .claimed_by_consumer
                        .entry(consumer.clone())
                        .or_insert(0) += 1;
                }
                None => summary.undelivered += 1,
            }
            summary.oldest_unacked_at = Some(
                summary
                    .oldest_unacked_at
                    .map_or(entry.created_at, |oldest| oldest.min(entry.created_at)),
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::{Clock, MockClock}, job::JobKind};
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;

    fn store() -> (Arc<MemoryStore>, MockClock) {
        let clock = MockClock::new();
        (Arc::new(MemoryStore::new(clock.shared())), clock)
    }

    #[tokio::test]
    async fn test_due_retries_skip_jobs_still_backing_off() {
        let (store, clock) = store();
        let now = clock.now();
        let mut waiting = Job::new_at(JobKind::Upload, json!({}), now);
        waiting.status = JobStatus::RetryPending;
        waiting.next_retry_at = Some(now + chrono::Duration::minutes(10));
        store.insert(&waiting).await.unwrap();

        let mut due = Job::new_at(JobKind::Upload, json!({}), now + chrono::Duration::seconds(1));
        due.status = JobStatus::RetryPending;
        due.next_retry_at = Some(now);
        store.insert(&due).await.unwrap();

        let listed = store.list_due_retries(now, Some(1)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, due.id);
    }

    #[tokio::test]
    async fn test_update_keeps_history_and_status() {
        let (store, clock) = store();
        let job = Job::new_at(JobKind::Upload, json!({}), clock.now());
        store.insert(&job).await.unwrap();

        let mut changed = job.clone();
        changed.status = JobStatus::Completed;
        changed.status_history.clear();
        changed.progress.units_done = 4;
        assert!(store.update(&changed, JobStatus::Queued).await.unwrap());

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.status_history.len(), 1);
        assert_eq!(stored.progress.units_done, 4);

        assert!(!store.update(&changed, JobStatus::Running).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_never_moves_heartbeat_back() {
        let (store, clock) = store();
        let mut job = Job::new_at(JobKind::Sync, json!({}), clock.now());
        job.status = JobStatus::Running;
        store.insert(&job).await.unwrap();

        let later = clock.now() + chrono::Duration::seconds(30);
        assert!(store.record_heartbeat(job.id, later).await.unwrap());
        assert!(!store.record_heartbeat(job.id, clock.now()).await.unwrap());

        // A stale snapshot without the heartbeat must not erase it
        assert!(store.update(&job, JobStatus::Running).await.unwrap());
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.last_heartbeat, Some(later));
    }

    #[tokio::test]
    async fn test_heartbeat_requires_running() {
        let (store, clock) = store();
        let job = Job::new_at(JobKind::Sync, json!({}), clock.now());
        store.insert(&job).await.unwrap();
        assert!(!store.record_heartbeat(job.id, clock.now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_insert_fails() {
        let (store, clock) = store();
        let job = Job::new_at(JobKind::Download, json!({}), clock.now());
        store.insert(&job).await.unwrap();
        assert!(store.insert(&job).await.is_err());
    }

    #[tokio::test]
    async fn test_compare_and_delete_matches_expired_entries() {
        let (store, clock) = store();
        store
            .put("lease:x", "c1", Duration::from_secs(10))
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(11));

        assert!(!store
            .compare_and_set("lease:x", "c1", "c1", Duration::from_secs(10))
            .await
            .unwrap());
        assert!(store.compare_and_delete("lease:x", "c1").await.unwrap());
        assert!(store.get_entry("lease:x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_enqueue() {
        let (store, _clock) = store();
        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .read_group("c1", 1, Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let job_id = Uuid::new_v4();
        store.enqueue(job_id, Some("producer"), json!({})).await.unwrap();

        let batch = reader.await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].job_id, job_id);
        assert_eq!(batch[0].owner_hint.as_deref(), Some("producer"));
    }

    #[tokio::test]
    async fn test_pending_summary_counts() {
        let (store, _clock) = store();
        for _ in 0..3 {
            store.enqueue(Uuid::new_v4(), None, json!({})).await.unwrap();
        }
        store
            .read_group("c1", 2, Duration::from_millis(1))
            .await
            .unwrap();

        let summary = store.pending_summary().await.unwrap();
        assert_eq!(summary.undelivered, 1);
        assert_eq!(summary.claimed_by_consumer.get("c1"), Some(&2));
        assert!(summary.oldest_unacked_at.is_some());
    }
}

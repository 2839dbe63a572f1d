//! PostgreSQL backend implementing every store contract.
//!
//! Job records, their history, key-value entries and the delivery log live in
//! four tables created by [`crate::migrations`]. Conditional operations are single
//! statements guarded by `WHERE` clauses, and delivery uses `FOR UPDATE SKIP LOCKED`
//! so competing consumers never receive the same entry from one read.
//!
//! Timestamps are bound from the injected clock rather than `NOW()`, so expiry
//! decisions agree with the in-process components that read the same clock.

use crate::{
    LeaseworkError, Result,
    clock::SharedClock,
    job::{Job, JobId, JobProgress, JobStatus, StatusChange},
    store::{
        Broker, DeliveryEntry, EntryId, JobRepository, KeyValueStore, KvEntry, PendingSummary,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use std::{collections::HashMap, time::Duration};
use tracing::debug;

/// Interval between polls while a blocking read waits for new entries.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(200);

const JOB_COLUMNS: &str = "id, kind, payload, status, retry_count, max_retries, next_retry_at, \
     last_heartbeat, owner_id, error_message, created_at, updated_at, started_at, completed_at, \
     progress";

const DELIVERY_COLUMNS: &str = "entry_id, job_id, owner_hint, metadata, created_at, \
     delivery_count, consumer, last_delivered_at";

#[derive(FromRow, Clone)]
pub(crate) struct JobRow {
    pub id: uuid::Uuid,
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub owner_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: serde_json::Value,
}

impl JobRow {
    pub fn into_job(self, status_history: Vec<StatusChange>) -> Result<Job> {
        Ok(Job {
            id: self.id,
            kind: self.kind.parse()?,
            payload: self.payload,
            status: self.status.parse()?,
            retry_count: self.retry_count.max(0) as u32,
            max_retries: self.max_retries.max(0) as u32,
            next_retry_at: self.next_retry_at,
            last_heartbeat: self.last_heartbeat,
            owner_id: self.owner_id,
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            progress: serde_json::from_value::<JobProgress>(self.progress)?,
            status_history,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct HistoryRow {
    pub job_id: uuid::Uuid,
    pub changed_at: DateTime<Utc>,
    pub from_status: Option<String>,
    pub to_status: String,
    pub reason: String,
}

impl HistoryRow {
    pub fn into_change(self) -> Result<StatusChange> {
        Ok(StatusChange {
            timestamp: self.changed_at,
            from_status: self
                .from_status
                .map(|s| s.parse::<JobStatus>())
                .transpose()?,
            to_status: self.to_status.parse()?,
            reason: self.reason,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct DeliveryRow {
    pub entry_id: i64,
    pub job_id: uuid::Uuid,
    pub owner_hint: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub delivery_count: i32,
    pub consumer: Option<String>,
    pub last_delivered_at: Option<DateTime<Utc>>,
}

impl From<DeliveryRow> for DeliveryEntry {
    fn from(row: DeliveryRow) -> Self {
        DeliveryEntry {
            entry_id: row.entry_id,
            job_id: row.job_id,
            owner_hint: row.owner_hint,
            metadata: row.metadata,
            created_at: row.created_at,
            delivery_count: row.delivery_count.max(0) as u32,
            consumer: row.consumer,
            last_delivered_at: row.last_delivered_at,
        }
    }
}

/// All store contracts over one connection pool and one consumer group.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    clock: SharedClock,
    group: String,
}

impl PostgresStore {
    pub fn new(pool: PgPool, clock: SharedClock, group: impl Into<String>) -> Self {
        Self {
            pool,
            clock,
            group: group.into(),
        }
    }

    /// Connects using the store section of the configuration.
    pub async fn connect(
        config: &crate::config::StoreConfig,
        group: impl Into<String>,
        clock: SharedClock,
    ) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.pool_size)
            .connect(&config.database_url)
            .await?;
        Ok(Self::new(pool, clock, group))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        self.clock.now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX)
    }

    async fn load_history(&self, job_ids: &[JobId]) -> Result<HashMap<JobId, Vec<StatusChange>>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(
            r#"
            SELECT job_id, changed_at, from_status, to_status, reason
            FROM leasework_job_history
            WHERE job_id = ANY($1)
            ORDER BY id ASC
            "#,
        )
        .bind(job_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut history: HashMap<JobId, Vec<StatusChange>> = HashMap::new();
        for row in rows {
            history.entry(row.job_id).or_default().push(row.into_change()?);
        }
        Ok(history)
    }

    async fn with_history(&self, rows: Vec<JobRow>) -> Result<Vec<Job>> {
        let ids: Vec<JobId> = rows.iter().map(|row| row.id).collect();
        let mut history = self.load_history(&ids).await?;
        rows.into_iter()
            .map(|row| {
                let changes = history.remove(&row.id).unwrap_or_default();
                row.into_job(changes)
            })
            .collect()
    }

    async fn insert_history(
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
        change: &StatusChange,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO leasework_job_history (job_id, changed_at, from_status, to_status, reason)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(job_id)
        .bind(change.timestamp)
        .bind(change.from_status.map(|s| s.as_str()))
        .bind(change.to_status.as_str())
        .bind(&change.reason)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Writes the mutable fields of `job`, optionally moving it to `new_status`,
    /// if the stored status is still `expected`. Heartbeat and retry count never
    /// move backwards.
    async fn update_fields<'e, E>(
        executor: E,
        job: &Job,
        expected: JobStatus,
        new_status: Option<JobStatus>,
    ) -> Result<bool>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let result = sqlx::query(
            r#"
            UPDATE leasework_jobs
            SET status = COALESCE($3, status),
                payload = $4,
                retry_count = GREATEST(retry_count, $5),
                max_retries = $6,
                next_retry_at = $7,
                last_heartbeat = GREATEST(last_heartbeat, $8),
                owner_id = $9,
                error_message = $10,
                updated_at = $11,
                started_at = $12,
                completed_at = $13,
                progress = $14
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(job.id)
        .bind(expected.as_str())
        .bind(new_status.map(|s| s.as_str()))
        .bind(&job.payload)
        .bind(job.retry_count as i32)
        .bind(job.max_retries as i32)
        .bind(job.next_retry_at)
        .bind(job.last_heartbeat)
        .bind(&job.owner_id)
        .bind(&job.error_message)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(serde_json::to_value(&job.progress)?)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl JobRepository for PostgresStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO leasework_jobs (
                id, kind, payload, status, retry_count, max_retries, next_retry_at,
                last_heartbeat, owner_id, error_message, created_at, updated_at,
                started_at, completed_at, progress
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(job.id)
        .bind(job.kind.as_str())
        .bind(&job.payload)
        .bind(job.status.as_str())
        .bind(job.retry_count as i32)
        .bind(job.max_retries as i32)
        .bind(job.next_retry_at)
        .bind(job.last_heartbeat)
        .bind(&job.owner_id)
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(serde_json::to_value(&job.progress)?)
        .execute(&mut *tx)
        .await?;

        for change in &job.status_history {
            Self::insert_history(&mut tx, job.id, change).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM leasework_jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let mut history = self.load_history(&[job_id]).await?;
                let changes = history.remove(&job_id).unwrap_or_default();
                Ok(Some(row.into_job(changes)?))
            }
            None => Ok(None),
        }
    }

    async fn list_by_status(&self, statuses: &[JobStatus], limit: Option<u32>) -> Result<Vec<Job>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM leasework_jobs WHERE status = ANY($1) ORDER BY created_at ASC LIMIT $2",
            JOB_COLUMNS
        ))
        .bind(&statuses)
        .bind(limit.map(i64::from))
        .fetch_all(&self.pool)
        .await?;

        self.with_history(rows).await
    }

    async fn list_stale(
        &self,
        status: JobStatus,
        cutoff: DateTime<Utc>,
        limit: Option<u32>,
    ) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM leasework_jobs \
             WHERE status = $1 AND COALESCE(last_heartbeat, started_at, created_at) < $2 \
             ORDER BY COALESCE(last_heartbeat, started_at, created_at) ASC, created_at ASC \
             LIMIT $3",
            JOB_COLUMNS
        ))
        .bind(status.as_str())
        .bind(cutoff)
        .bind(limit.map(i64::from))
        .fetch_all(&self.pool)
        .await?;

        self.with_history(rows).await
    }

    async fn list_due_retries(&self, now: DateTime<Utc>, limit: Option<u32>) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM leasework_jobs \
             WHERE status = $1 AND (next_retry_at IS NULL OR next_retry_at <= $2) \
             ORDER BY COALESCE(next_retry_at, updated_at) ASC, created_at ASC \
             LIMIT $3",
            JOB_COLUMNS
        ))
        .bind(JobStatus::RetryPending.as_str())
        .bind(now)
        .bind(limit.map(i64::from))
        .fetch_all(&self.pool)
        .await?;

        self.with_history(rows).await
    }

    async fn update(&self, job: &Job, expected: JobStatus) -> Result<bool> {
        Self::update_fields(&self.pool, job, expected, None).await
    }

    async fn record_transition(
        &self,
        job: &Job,
        expected: JobStatus,
        change: &StatusChange,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        if !Self::update_fields(&mut *tx, job, expected, Some(change.to_status)).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        Self::insert_history(&mut tx, job.id, change).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn record_heartbeat(&self, job_id: JobId, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE leasework_jobs
            SET last_heartbeat = $2, updated_at = $2
            WHERE id = $1 AND status = $3
              AND (last_heartbeat IS NULL OR last_heartbeat < $2)
            "#,
        )
        .bind(job_id)
        .bind(at)
        .bind(JobStatus::Running.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn history(&self, job_id: JobId) -> Result<Vec<StatusChange>> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM leasework_jobs WHERE id = $1)")
                .bind(job_id)
                .fetch_one(&self.pool)
                .await?;
        if !exists {
            return Err(LeaseworkError::JobNotFound {
                id: job_id.to_string(),
            });
        }
        let mut history = self.load_history(&[job_id]).await?;
        Ok(history.remove(&job_id).unwrap_or_default())
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM leasework_jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            counts.insert(status.parse()?, count.max(0) as u64);
        }
        Ok(counts)
    }
}

#[async_trait]
impl KeyValueStore for PostgresStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO leasework_kv (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            WHERE leasework_kv.expires_at <= $4
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(self.expiry(ttl))
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE leasework_kv
            SET value = $3, expires_at = $4
            WHERE key = $1 AND value = $2 AND expires_at > $5
            "#,
        )
        .bind(key)
        .bind(expected)
        .bind(value)
        .bind(self.expiry(ttl))
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM leasework_kv WHERE key = $1 AND value = $2")
            .bind(key)
            .bind(expected)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO leasework_kv (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(self.expiry(ttl))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_entry(&self, key: &str) -> Result<Option<KvEntry>> {
        let row = sqlx::query("SELECT value, expires_at FROM leasework_kv WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| KvEntry {
            value: row.get("value"),
            expires_at: row.get("expires_at"),
        }))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM leasework_kv WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl Broker for PostgresStore {
    async fn enqueue(
        &self,
        job_id: JobId,
        owner_hint: Option<&str>,
        metadata: serde_json::Value,
    ) -> Result<EntryId> {
        let entry_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO leasework_deliveries (group_name, job_id, owner_hint, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING entry_id
            "#,
        )
        .bind(&self.group)
        .bind(job_id)
        .bind(owner_hint)
        .bind(&metadata)
        .bind(self.clock.now())
        .fetch_one(&self.pool)
        .await?;

        Ok(entry_id)
    }

    async fn read_group(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<DeliveryEntry>> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let mut rows: Vec<DeliveryRow> = sqlx::query_as(&format!(
                r#"
                UPDATE leasework_deliveries
                SET consumer = $1, delivery_count = delivery_count + 1, last_delivered_at = $2
                WHERE entry_id IN (
                    SELECT entry_id FROM leasework_deliveries
                    WHERE group_name = $3 AND consumer IS NULL
                    ORDER BY entry_id ASC
                    LIMIT $4
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING {}
                "#,
                DELIVERY_COLUMNS
            ))
            .bind(consumer)
            .bind(self.clock.now())
            .bind(&self.group)
            .bind(count as i64)
            .fetch_all(&self.pool)
            .await?;

            if !rows.is_empty() {
                rows.sort_by_key(|row| row.entry_id);
                return Ok(rows.into_iter().map(DeliveryEntry::from).collect());
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(READ_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn acknowledge(&self, entry_id: EntryId) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM leasework_deliveries WHERE entry_id = $1 AND group_name = $2")
                .bind(entry_id)
                .bind(&self.group)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_stale(
        &self,
        consumer: &str,
        idle: Duration,
        max_batch: usize,
    ) -> Result<Vec<DeliveryEntry>> {
        let now = self.clock.now();
        let cutoff = now - chrono::Duration::from_std(idle).unwrap_or(chrono::Duration::MAX);
        let mut rows: Vec<DeliveryRow> = sqlx::query_as(&format!(
            r#"
            UPDATE leasework_deliveries
            SET consumer = $1, delivery_count = delivery_count + 1, last_delivered_at = $2
            WHERE entry_id IN (
                SELECT entry_id FROM leasework_deliveries
                WHERE group_name = $3 AND consumer IS NOT NULL AND last_delivered_at <= $4
                ORDER BY entry_id ASC
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            DELIVERY_COLUMNS
        ))
        .bind(consumer)
        .bind(now)
        .bind(&self.group)
        .bind(cutoff)
        .bind(max_batch as i64)
        .fetch_all(&self.pool)
        .await?;

        if !rows.is_empty() {
            debug!(consumer, claimed = rows.len(), "Claimed idle delivery entries");
        }
        rows.sort_by_key(|row| row.entry_id);
        Ok(rows.into_iter().map(DeliveryEntry::from).collect())
    }

    async fn pending_summary(&self) -> Result<PendingSummary> {
        let rows = sqlx::query(
            r#"
            SELECT consumer, COUNT(*) AS count, MIN(created_at) AS oldest
            FROM leasework_deliveries
            WHERE group_name = $1
            GROUP BY consumer
            "#,
        )
        .bind(&self.group)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = PendingSummary::default();
        for row in rows {
            let consumer: Option<String> = row.get("consumer");
            let count = row.get::<i64, _>("count").max(0) as u64;
            let oldest: Option<DateTime<Utc>> = row.get("oldest");
            match consumer {
                Some(consumer) => {
                    summary.claimed_by_consumer.insert(consumer, count);
                }
                None => summary.undelivered = count,
            }
            summary.oldest_unacked_at = match (summary.oldest_unacked_at, oldest) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        Ok(summary)
    }
}

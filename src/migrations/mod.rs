//! Versioned schema migrations for the PostgreSQL backend.
//!
//! Migrations are embedded in the binary, tracked in `leasework_migrations` and
//! applied in version order, each exactly once.
//!
//! ```bash
//! leasework migrate --database-url postgresql://localhost/leasework
//! ```

#[cfg(feature = "postgres")]
pub mod postgres;

use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::info;

/// Migration identifier and metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Migration {
    /// Unique migration identifier (e.g., "001_initial_schema")
    pub id: String,
    pub description: String,
    /// Version number for ordering
    pub version: u32,
}

/// Migration execution record
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    pub migration_id: String,
    pub executed_at: DateTime<Utc>,
    pub execution_time_ms: u64,
}

/// Database-specific migration execution.
#[async_trait::async_trait]
pub trait MigrationRunner: Send + Sync {
    /// Runs the migration's SQL in a single transaction.
    async fn run_migration(&self, migration: &Migration, sql: &str) -> Result<()>;

    async fn migration_table_exists(&self) -> Result<bool>;

    async fn create_migration_table(&self) -> Result<()>;

    async fn get_executed_migrations(&self) -> Result<Vec<MigrationRecord>>;

    async fn record_migration(&self, migration: &Migration, execution_time_ms: u64) -> Result<()>;
}

pub struct MigrationManager {
    runner: Box<dyn MigrationRunner>,
    migrations: Vec<(Migration, &'static str)>,
}

impl MigrationManager {
    pub fn new(runner: Box<dyn MigrationRunner>) -> Self {
        let mut manager = Self {
            runner,
            migrations: Vec::new(),
        };
        manager.register_builtin_migrations();
        manager
    }

    pub fn register_migration(&mut self, migration: Migration, sql: &'static str) {
        self.migrations.retain(|(existing, _)| existing.id != migration.id);
        self.migrations.push((migration, sql));
        self.migrations.sort_by_key(|(migration, _)| migration.version);
    }

    /// Runs all pending migrations and returns how many were applied.
    pub async fn run_migrations(&self) -> Result<usize> {
        if !self.runner.migration_table_exists().await? {
            info!("Creating migration tracking table...");
            self.runner.create_migration_table().await?;
        }

        let executed: HashSet<String> = self
            .runner
            .get_executed_migrations()
            .await?
            .into_iter()
            .map(|record| record.migration_id)
            .collect();

        let pending: Vec<_> = self
            .migrations
            .iter()
            .filter(|(migration, _)| !executed.contains(&migration.id))
            .collect();

        if pending.is_empty() {
            info!("No pending migrations to run");
            return Ok(0);
        }

        info!("Found {} pending migrations", pending.len());
        for (migration, sql) in &pending {
            info!(
                "Running migration: {} - {}",
                migration.id, migration.description
            );
            let start_time = std::time::Instant::now();
            self.runner.run_migration(migration, sql).await?;
            let execution_time_ms = start_time.elapsed().as_millis() as u64;
            self.runner
                .record_migration(migration, execution_time_ms)
                .await?;
            info!(
                "Completed migration {} in {}ms",
                migration.id, execution_time_ms
            );
        }

        Ok(pending.len())
    }

    /// Every known migration and whether it has been applied, in version order.
    pub async fn get_migration_status(&self) -> Result<Vec<(Migration, bool)>> {
        let executed: HashSet<String> = if self.runner.migration_table_exists().await? {
            self.runner
                .get_executed_migrations()
                .await?
                .into_iter()
                .map(|record| record.migration_id)
                .collect()
        } else {
            HashSet::new()
        };

        Ok(self
            .migrations
            .iter()
            .map(|(migration, _)| (migration.clone(), executed.contains(&migration.id)))
            .collect())
    }

    fn register_builtin_migrations(&mut self) {
        self.register_migration(
            Migration {
                id: "001_initial_schema".to_string(),
                description: "Create leasework_jobs table".to_string(),
                version: 1,
            },
            include_str!("001_initial_schema.postgres.sql"),
        );

        self.register_migration(
            Migration {
                id: "002_status_history".to_string(),
                description: "Add append-only status history".to_string(),
                version: 2,
            },
            include_str!("002_status_history.postgres.sql"),
        );

        self.register_migration(
            Migration {
                id: "003_leases_and_deliveries".to_string(),
                description: "Add key-value entries and the delivery log".to_string(),
                version: 3,
            },
            include_str!("003_leases_and_deliveries.postgres.sql"),
        );
    }
}

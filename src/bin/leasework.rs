//! Operator tool for a PostgreSQL-backed leasework deployment.
//!
//! Usage:
//!   leasework migrate --database-url postgresql://localhost/leasework
//!   leasework jobs --status running
//!   leasework history <JOB_ID>
//!   leasework stats
//!   leasework cancel <JOB_ID>
//!   leasework scan

use clap::{Parser, Subcommand};
use leasework::{
    HealthMonitor, JobClient, JobStatus, LeaseworkConfig, PostgresStore, RetryPromoter, Stores,
    WorkQueue, clock::system_clock, logging,
    migrations::{MigrationManager, postgres::PostgresMigrationRunner},
};
use std::{process, sync::Arc};

#[derive(Parser)]
#[command(
    name = "leasework",
    version,
    about = "Lease-based job lifecycle management tool"
)]
struct Cli {
    #[arg(
        short = 'c',
        long = "config",
        help = "Path to a TOML configuration file",
        value_name = "FILE",
        global = true
    )]
    config: Option<String>,

    #[arg(
        long = "database-url",
        help = "Database connection URL (overrides configuration)",
        value_name = "URL",
        global = true
    )]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Run database migrations")]
    Migrate {
        #[arg(long = "status", help = "Show migration status instead of running migrations")]
        status: bool,
    },

    #[command(about = "List jobs")]
    Jobs {
        #[arg(long = "status", help = "Only jobs in this status (repeatable)")]
        status: Vec<String>,

        #[arg(long = "limit", default_value_t = 50)]
        limit: u32,
    },

    #[command(about = "Show the status history of a job")]
    History { job_id: uuid::Uuid },

    #[command(about = "Show job counts and delivery backlog")]
    Stats,

    #[command(about = "Request cooperative cancellation of a job")]
    Cancel { job_id: uuid::Uuid },

    #[command(about = "Run one health scan and one retry promotion pass")]
    Scan,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(2);
        }
    };
    if let Err(e) = logging::init(&config.logging) {
        eprintln!("Error: {}", e);
        process::exit(2);
    }

    if let Err(e) = run(cli.command, &config).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn load_config(cli: &Cli) -> leasework::Result<LeaseworkConfig> {
    let mut config = match &cli.config {
        Some(path) => LeaseworkConfig::from_file(path)?,
        None => LeaseworkConfig::from_env()?,
    };
    if let Some(url) = &cli.database_url {
        config = config.with_database_url(url);
    }
    config.validate()?;
    Ok(config)
}

async fn run(command: Command, config: &LeaseworkConfig) -> Result<(), Box<dyn std::error::Error>> {
    let clock = system_clock();
    let store =
        Arc::new(PostgresStore::connect(&config.store, &config.queue.group, clock.clone()).await?);

    if let Command::Migrate { status } = command {
        let manager = MigrationManager::new(Box::new(PostgresMigrationRunner::new(
            store.pool().clone(),
        )));
        if status {
            for (migration, executed) in manager.get_migration_status().await? {
                let state = if executed { "EXECUTED" } else { "PENDING" };
                println!("{:<9} {} - {}", state, migration.id, migration.description);
            }
        } else {
            let applied = manager.run_migrations().await?;
            println!("Applied {} migration(s)", applied);
        }
        return Ok(());
    }

    let stores = Stores::from_backend(store, clock);
    let client = JobClient::from_config(&stores, config);

    match command {
        Command::Migrate { .. } => {}
        Command::Jobs { status, limit } => {
            let statuses = status
                .iter()
                .map(|s| s.parse::<JobStatus>())
                .collect::<leasework::Result<Vec<_>>>()?;
            for job in client.list_jobs(&statuses, Some(limit)).await? {
                println!(
                    "{}  {:<8} {:<13} retries {}/{}  owner {}",
                    job.id,
                    job.kind,
                    job.status,
                    job.retry_count,
                    job.max_retries,
                    job.owner_id.as_deref().unwrap_or("-")
                );
            }
        }
        Command::History { job_id } => {
            for change in client.job_history(job_id).await? {
                let from = change
                    .from_status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  {:<13} -> {:<13} {}",
                    change.timestamp.to_rfc3339(),
                    from,
                    change.to_status,
                    change.reason
                );
            }
        }
        Command::Stats => {
            let stats = client.queue_stats().await?;
            for status in JobStatus::ALL {
                println!("{:<13} {}", status, stats.count(status));
            }
            println!("undelivered   {}", stats.pending_entries);
            println!("claimed       {}", stats.claimed_entries());
            if let Some(age) = stats.oldest_pending_age {
                println!("oldest entry  {}s", age.as_secs());
            }
        }
        Command::Cancel { job_id } => {
            if client.request_cancellation(job_id).await? {
                println!("Cancellation requested for {}", job_id);
            } else {
                println!("Job {} is unknown or already terminal", job_id);
            }
        }
        Command::Scan => {
            let report = HealthMonitor::from_config(&stores, config).scan_once().await?;
            println!(
                "Scanned {} running job(s): {} requeued, {} failed, {} errors",
                report.scanned, report.requeued, report.failed, report.errors
            );
            let queue = WorkQueue::new(stores.broker.clone(), stores.clock.clone());
            let promotion = RetryPromoter::new(&stores, queue)
                .with_retry_policy(config.transient_retry_policy())
                .promote_due()
                .await?;
            println!("Promoted {} of {} due retries", promotion.promoted, promotion.due);
        }
    }

    Ok(())
}

pub mod aggregator;
pub mod catalog;
pub mod config;
pub mod db;
pub mod decay;
pub mod driver;
pub mod errors;
pub mod models;
pub mod reconciler;
pub mod registrar;

pub use crate::catalog::MetricCatalog;
pub use crate::config::{ConfigOverrides, JobConfig};
pub use crate::db::Database;
pub use crate::driver::{JobReport, MetricsJob};
pub use crate::errors::{AppError, AppResult};
pub use crate::reconciler::{reconcile, ReconcileOutcome};
pub use crate::registrar::{TypeRegistrar, TypeRegistry};

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

#[derive(Debug, Parser)]
#[command(name = "metrics-job", version, about = "Derive task metrics into snapshots and decayed claims")]
pub struct Cli {
    /// SQLite database holding tasks, owners and metric memory
    #[arg(long, env = "METRICS_DATABASE_PATH")]
    pub database: Option<PathBuf>,

    /// Optional JSON config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Write JSON logs to a daily rolling file in this directory
    #[arg(long, env = "METRICS_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Compute and log values without persisting snapshots or claims
    #[arg(long)]
    pub dry_run: bool,
}

pub fn run() -> anyhow::Result<JobReport> {
    let cli = Cli::parse();
    let config = JobConfig::load(
        cli.config.as_deref(),
        ConfigOverrides {
            database_path: cli.database,
            log_dir: cli.log_dir,
            dry_run: cli.dry_run,
        },
    )
    .context("loading job configuration")?;

    init_tracing(&config.log_filter, config.log_dir.as_deref()).map_err(anyhow::Error::msg)?;

    let db_path = config.database_path()?;
    let db = Database::open(db_path, config.busy_timeout_ms)
        .with_context(|| format!("opening database {}", db_path.to_string_lossy()))?;

    let report = MetricsJob::new(&db, MetricCatalog::default())
        .dry_run(config.dry_run)
        .run()
        .context("metrics job failed")?;
    Ok(report)
}

pub fn init_tracing(default_filter: &str, log_dir: Option<&Path>) -> Result<(), String> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    match log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir).map_err(|error| error.to_string())?;
            let file_appender = tracing_appender::rolling::daily(log_dir, "metrics-job.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = LOG_GUARD.set(guard);

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_writer(non_blocking)
                .try_init()
                .map_err(|error| error.to_string())
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|error| error.to_string()),
    }
}

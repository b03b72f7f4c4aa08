//! # Stackrun Scheduler
//!
//! Host process for the task scheduler. Loads configuration, connects to
//! Postgres, wires the HTTP runner client and filesystem log store, and
//! competes for leadership until Ctrl-C. Shutdown drains every task fiber of
//! the current epoch before exiting.

use anyhow::Context;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use stackrun_core::config::StackrunConfig;
use stackrun_core::leader::PgAdvisoryLock;
use stackrun_core::logging::init_structured_logging;
use stackrun_core::orchestration::{SchedulerContext, SchedulerCoordinator, TaskRecordResolver};
use stackrun_core::repository::PgTaskRepository;
use stackrun_core::runner::{HttpRunnerClient, StaticRunnerDirectory};
use stackrun_core::storage::FsLogStorage;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "stackrun-scheduler")]
#[command(about = "Run the stackrun task scheduler")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file; environment variables prefixed STACKRUN override it
    #[arg(short, long, env = "STACKRUN_CONFIG", default_value = "config/stackrun.toml")]
    config: PathBuf,

    /// Instance identity used as the leader lock holder (default: random)
    #[arg(long, env = "STACKRUN_IDENTITY")]
    identity: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_structured_logging();

    let config = StackrunConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    let identity = cli
        .identity
        .unwrap_or_else(|| format!("scheduler-{}", Uuid::new_v4()));

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .context("connecting to the task database")?;

    let directory = Arc::new(StaticRunnerDirectory::from_config(&config.runner));
    let runner_client = HttpRunnerClient::new(config.runner.request_timeout())
        .context("building the runner HTTP client")?;

    let ctx = Arc::new(SchedulerContext::new(
        Arc::new(PgTaskRepository::new(pool.clone())),
        Arc::new(runner_client),
        Arc::new(TaskRecordResolver::new(directory)),
        Arc::new(FsLogStorage::from_config(&config.storage)),
        config.scheduler.clone(),
    ));
    let lock = Arc::new(PgAdvisoryLock::from_config(pool.clone(), &config.leader));

    info!(
        identity = %identity,
        runners = config.runner.addresses.len(),
        "Starting stackrun scheduler"
    );
    let handle = SchedulerCoordinator::new(ctx, lock, config.leader.clone()).start(identity);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    handle.shutdown().await?;
    pool.close().await;
    info!("Stackrun scheduler stopped");
    Ok(())
}

//! `orchestratord`: the command handler and lifecycle monitor process
//! (§4.5, §4.6). One instance owns job dispatch and per-project stage
//! progression for a deployment; any number of `worker` processes execute
//! the jobs it dispatches.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use pipeline_config::OrchestratorConfig;
use pipeline_db::DbPool;
use pipeline_eventbus::{EventBus, PgEventBus};
use pipeline_handler::CommandHandler;
use pipeline_jobs::{JobStore, LifecycleMonitor};
use pipeline_ledger::LedgerStore;
use pipeline_lock::LockManager;
use pipeline_observability::{init_logging, ProcessKind};
use pipeline_repo::ProjectRepo;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "orchestratord")]
#[command(about = "Job Control Plane command handler and lifecycle monitor")]
struct Cli {
    #[arg(long, default_value_t = false)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs pending `sqlx` migrations against `DATABASE_URL` and exits.
    Migrate,
    /// Runs the command handler and lifecycle monitor until interrupted
    /// (the default when no subcommand is given).
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(ProcessKind::Orchestrator, cli.json_logs)?;

    let config = OrchestratorConfig::from_env()?;
    let pool = Arc::new(DbPool::connect(&config).await?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Migrate => run_migrations(&pool).await,
        Command::Serve => serve(config, pool).await,
    }
}

async fn run_migrations(pool: &DbPool) -> anyhow::Result<()> {
    info!("running migrations");
    sqlx::migrate!("../../migrations").run(pool.sqlx_pool()).await?;
    info!("migrations complete");
    Ok(())
}

async fn serve(config: OrchestratorConfig, pool: Arc<DbPool>) -> anyhow::Result<()> {
    pool.start_background_tasks();

    let locks = Arc::new(LockManager::new(pool.clone()));
    let bus: Arc<dyn EventBus> = Arc::new(PgEventBus::new(pool.clone()));
    let ledger = Arc::new(LedgerStore::new(pool.clone(), locks.clone()));
    let repo = Arc::new(ProjectRepo::new(pool.clone(), ledger.clone()));
    let jobs = Arc::new(JobStore::new(pool.clone(), bus.clone()));
    let lifecycle = Arc::new(LifecycleMonitor::new(pool.clone(), jobs.clone(), config.lifecycle()));
    let handler = Arc::new(CommandHandler::new(
        repo,
        ledger,
        jobs,
        locks,
        bus,
        config.default_max_retries,
    ));

    let cancel = CancellationToken::new();
    let lifecycle_handle = lifecycle.clone().start();
    let handler_handle = tokio::spawn(handler.clone().run(cancel.clone()));

    info!("orchestratord started");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, draining in-flight work");

    cancel.cancel();
    lifecycle.stop();
    let _ = tokio::join!(handler_handle, lifecycle_handle);
    pool.shutdown(Duration::from_secs(10)).await;

    Ok(())
}

//! `worker`: claims jobs dispatched by `orchestratord` and executes the
//! configured `AgentExecutor` for each job type (§4.7).
//!
//! The real generative agents (prompt composition, model calls, media
//! stitching) are out of scope (§1); this binary wires up
//! `MockAgentExecutor` so the dispatch loop, retry classification, and
//! ledger/scene writes can be exercised end to end without one.

use std::sync::Arc;

use clap::Parser;
use pipeline_config::OrchestratorConfig;
use pipeline_db::DbPool;
use pipeline_eventbus::{EventBus, PgEventBus};
use pipeline_ledger::LedgerStore;
use pipeline_lock::LockManager;
use pipeline_observability::{init_logging, ProcessKind};
use pipeline_repo::ProjectRepo;
use pipeline_worker::{AgentExecutor, MockAgentExecutor, WorkerConfig, WorkerLoop};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "Executes dispatched jobs against the configured generative agent")]
struct Cli {
    #[arg(long, default_value_t = false)]
    json_logs: bool,

    /// Identifies this process's claims and its ephemeral event-bus
    /// subscriptions; defaults to `worker-<pid>` so two processes on the
    /// same host never collide.
    #[arg(long)]
    worker_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(ProcessKind::Worker, cli.json_logs)?;

    let worker_id = cli
        .worker_id
        .unwrap_or_else(|| format!("worker-{}", std::process::id()));

    let config = OrchestratorConfig::from_env()?;
    let pool = Arc::new(DbPool::connect(&config).await?);
    pool.start_background_tasks();

    let locks = Arc::new(LockManager::new(pool.clone()));
    let bus: Arc<dyn EventBus> = Arc::new(PgEventBus::new(pool.clone()));
    let ledger = Arc::new(LedgerStore::new(pool.clone(), locks.clone()));
    let repo = Arc::new(ProjectRepo::new(pool.clone(), ledger.clone()));
    let agent: Arc<dyn AgentExecutor> = Arc::new(MockAgentExecutor);

    let worker = Arc::new(WorkerLoop::new(
        WorkerConfig {
            worker_id: worker_id.clone(),
            settings: config.worker(),
        },
        Arc::new(pipeline_jobs::JobStore::new(pool.clone(), bus.clone())),
        ledger,
        repo,
        locks,
        bus,
        agent,
    ));

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let handle = tokio::spawn(worker.run(run_cancel));

    info!(worker_id = %worker_id, "worker started");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, draining in-flight jobs");

    cancel.cancel();
    let _ = handle.await;
    pool.shutdown(std::time::Duration::from_secs(10)).await;

    Ok(())
}

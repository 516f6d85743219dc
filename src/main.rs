use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use coursepulse::analysis::HttpAnalysisExecutor;
use coursepulse::config;
use coursepulse::db;
use coursepulse::fetch::SourceDbFetcher;
use coursepulse::orchestrator::BatchOrchestrator;
use coursepulse::progress::{DbStateStore, ProcessStateTracker};
use coursepulse::queue::{QueueSettings, WorkQueue};
use coursepulse::scheduler::Scheduler;
use coursepulse::tunnel::TunnelClient;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/coursepulse.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let tracker = ProcessStateTracker::new(Arc::new(DbStateStore::new(pool.clone())));
    // A previous process may have died mid-run and left the snapshot active.
    if tracker
        .recover_stale(chrono::Duration::minutes(30))
        .await?
    {
        warn!("recovered a stale active run snapshot from a previous process");
    }

    let tunnel = Arc::new(TunnelClient::new(cfg.tunnel.clone(), cfg.source.clone()));
    let fetcher = Arc::new(SourceDbFetcher::new(Arc::clone(&tunnel)));
    let executor = Arc::new(HttpAnalysisExecutor::from_config(&cfg.analysis)?);

    let queue = WorkQueue::new(pool.clone(), executor, QueueSettings::from_config(&cfg));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumers = queue.spawn_consumers(shutdown_rx);

    let orchestrator = Arc::new(BatchOrchestrator::new(
        pool.clone(),
        cfg.tenants.clone(),
        fetcher,
        Arc::clone(&queue),
        tracker,
    ));
    let scheduler = Scheduler::new(
        orchestrator,
        Duration::from_secs(cfg.app.sync_interval_minutes * 60),
    );
    scheduler.start().await;

    info!("coursepulse daemon running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    scheduler.stop().await;
    let _ = shutdown_tx.send(true);
    for handle in consumers {
        if let Err(err) = handle.await {
            error!(?err, "queue worker did not stop cleanly");
        }
    }
    tunnel.disconnect().await;
    pool.close().await;

    Ok(())
}

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use coursepulse::analysis::HttpAnalysisExecutor;
use coursepulse::config;
use coursepulse::db;
use coursepulse::fetch::SourceDbFetcher;
use coursepulse::orchestrator::BatchOrchestrator;
use coursepulse::progress::{DbStateStore, ProcessStateTracker};
use coursepulse::queue::{QueueSettings, WorkQueue};
use coursepulse::tunnel::TunnelClient;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run one blocking batch-analysis pass and exit when the queue drains"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print the current run state and queue totals, then exit
    #[arg(long)]
    status: bool,
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

    if args.status {
        let view = tracker.state().await;
        println!("{}", serde_json::to_string_pretty(&view)?);
        for tenant in &cfg.tenants {
            let counts = db::queue_counts(&pool, Some(&tenant.name)).await?;
            println!(
                "{}: pending={} processing={} completed={} failed={}",
                tenant.name, counts.pending, counts.processing, counts.completed, counts.failed
            );
        }
        if let Some(job) = db::last_batch_job(&pool).await? {
            println!("last job: {}", serde_json::to_string_pretty(&job)?);
        }
        return Ok(());
    }

    let tunnel = Arc::new(TunnelClient::new(cfg.tunnel.clone(), cfg.source.clone()));
    let fetcher = Arc::new(SourceDbFetcher::new(Arc::clone(&tunnel)));
    let executor = Arc::new(HttpAnalysisExecutor::from_config(&cfg.analysis)?);

    let queue = WorkQueue::new(pool.clone(), executor, QueueSettings::from_config(&cfg));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumers = queue.spawn_consumers(shutdown_rx);

    let orchestrator = BatchOrchestrator::new(
        pool.clone(),
        cfg.tenants.clone(),
        fetcher,
        Arc::clone(&queue),
        tracker,
    );

    info!("starting manual batch run");
    let summary = orchestrator.run(coursepulse::model::RunTrigger::Manual).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    let _ = shutdown_tx.send(true);
    for handle in consumers {
        let _ = handle.await;
    }
    tunnel.disconnect().await;
    pool.close().await;

    std::process::exit(if summary.success { 0 } else { 1 });
}

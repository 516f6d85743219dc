use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

use coursepulse::analysis::{AnalysisExecutor, AnalysisRequest};
use coursepulse::config::Tenant;
use coursepulse::db;
use coursepulse::fetch::{ActivityRecord, ContentFetcher, CourseRecord};
use coursepulse::model::{ActivityKind, QueueStatus, RunTrigger};
use coursepulse::orchestrator::{BatchOrchestrator, RunConflict};
use coursepulse::progress::{DbStateStore, ProcessStateTracker};
use coursepulse::queue::{QueueSettings, WorkQueue};
use coursepulse::scheduler::Scheduler;
use coursepulse::tunnel::TunnelError;

async fn setup_pool(td: &tempfile::TempDir) -> sqlx::SqlitePool {
    let url = format!("sqlite://{}/orchestrator.db", td.path().to_string_lossy());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

fn settings() -> QueueSettings {
    QueueSettings {
        concurrency: 2,
        max_attempts: 3,
        stale_after_hours: 4,
        retain_hours: 24,
        max_backoff_seconds: 3600,
        poll_interval: Duration::from_millis(20),
    }
}

fn tenant(name: &str) -> Tenant {
    Tenant {
        name: name.into(),
        schema: format!("lms_{}", name.replace('-', "_")),
    }
}

fn open_activity(activity_id: i64, course_id: i64) -> ActivityRecord {
    let now = Utc::now();
    ActivityRecord {
        activity_id,
        course_id,
        title: Some(format!("Activity {activity_id}")),
        kind: ActivityKind::Assignment,
        visible: true,
        open_at: Some(now - ChronoDuration::hours(1)),
        close_at: Some(now + ChronoDuration::hours(1)),
    }
}

#[derive(Default)]
struct FakeFetcher {
    courses: HashMap<String, Vec<CourseRecord>>,
    activities: HashMap<String, Vec<ActivityRecord>>,
    tunnel_down: HashSet<String>,
    broken: HashSet<String>,
}

impl FakeFetcher {
    fn with_tenant(mut self, name: &str, activities: Vec<ActivityRecord>) -> Self {
        self.courses.insert(
            name.to_string(),
            vec![CourseRecord {
                id: 100,
                name: "Course 100".into(),
                visible: true,
            }],
        );
        self.activities.insert(name.to_string(), activities);
        self
    }
}

#[async_trait]
impl ContentFetcher for FakeFetcher {
    async fn fetch_courses(&self, tenant: &Tenant) -> Result<Vec<CourseRecord>> {
        if self.tunnel_down.contains(&tenant.name) {
            return Err(TunnelError::HandshakeTimeout(Duration::from_secs(15)).into());
        }
        if self.broken.contains(&tenant.name) {
            return Err(anyhow!("tenant source exploded"));
        }
        Ok(self.courses.get(&tenant.name).cloned().unwrap_or_default())
    }

    async fn fetch_activities(&self, tenant: &Tenant) -> Result<Vec<ActivityRecord>> {
        Ok(self.activities.get(&tenant.name).cloned().unwrap_or_default())
    }
}

#[derive(Clone, Default)]
struct OkExecutor {
    calls: Arc<Mutex<Vec<(String, i64)>>>,
}

#[async_trait]
impl AnalysisExecutor for OkExecutor {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Value> {
        self.calls
            .lock()
            .await
            .push((request.tenant.clone(), request.activity_id));
        Ok(json!({"summary": "ok"}))
    }
}

struct Harness {
    pool: sqlx::SqlitePool,
    queue: Arc<WorkQueue>,
    tracker: ProcessStateTracker,
    shutdown_tx: watch::Sender<bool>,
    consumers: Vec<tokio::task::JoinHandle<()>>,
}

impl Harness {
    async fn new(td: &tempfile::TempDir, executor: Arc<dyn AnalysisExecutor>) -> Self {
        let pool = setup_pool(td).await;
        let queue = WorkQueue::new(pool.clone(), executor, settings());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumers = queue.spawn_consumers(shutdown_rx);
        let tracker = ProcessStateTracker::new(Arc::new(DbStateStore::new(pool.clone())));
        Self {
            pool,
            queue,
            tracker,
            shutdown_tx,
            consumers,
        }
    }

    fn orchestrator(&self, tenants: Vec<Tenant>, fetcher: FakeFetcher) -> BatchOrchestrator {
        BatchOrchestrator::new(
            self.pool.clone(),
            tenants,
            Arc::new(fetcher),
            Arc::clone(&self.queue),
            self.tracker.clone(),
        )
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.consumers {
            handle.await.unwrap();
        }
    }
}

/// Seed already-synced work items so the first run's mark step has
/// something to flag (fresh items only appear after a sync).
async fn seed_item(pool: &sqlx::SqlitePool, tenant: &str, activity_id: i64) {
    let now = Utc::now();
    db::upsert_work_item(
        pool,
        &db::WorkItemUpsert {
            tenant: tenant.into(),
            course_id: 100,
            activity_id,
            kind: ActivityKind::Assignment,
            title: Some(format!("Activity {activity_id}")),
            visible: true,
            open_at: Some(now - ChronoDuration::hours(1)),
            close_at: Some(now + ChronoDuration::hours(1)),
        },
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn manual_run_marks_syncs_enqueues_and_drains() {
    let td = tempfile::tempdir().unwrap();
    let executor = OkExecutor::default();
    let harness = Harness::new(&td, Arc::new(executor.clone())).await;

    seed_item(&harness.pool, "campus-a", 1).await;
    seed_item(&harness.pool, "campus-a", 2).await;

    let fetcher = FakeFetcher::default().with_tenant(
        "campus-a",
        vec![open_activity(1, 100), open_activity(2, 100)],
    );
    let orchestrator = harness.orchestrator(vec![tenant("campus-a")], fetcher);

    let summary = tokio::time::timeout(
        Duration::from_secs(20),
        orchestrator.run(RunTrigger::Manual),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(summary.success, "errors: {:?}", summary.errors);
    assert_eq!(summary.items_marked, 2);
    assert_eq!(summary.tenants_synced, 1);
    assert_eq!(summary.entries_added, 2);
    assert!(summary.errors.is_empty());

    // The queue drained and the analyses landed.
    let stats = harness.queue.status(Some("campus-a")).await.unwrap();
    assert_eq!(stats.completed, 2);
    assert!(!stats.in_progress);
    assert_eq!(executor.calls.lock().await.len(), 2);

    // Completion cleared the flags.
    let item = db::find_work_item(&harness.pool, "campus-a", 1, ActivityKind::Assignment)
        .await
        .unwrap()
        .unwrap();
    assert!(!item.needs_analysis);

    // The job record is finalized and the snapshot inactive.
    let job = db::last_batch_job(&harness.pool).await.unwrap().unwrap();
    assert_eq!(job.success, Some(true));
    assert_eq!(job.entries_added, 2);
    assert!(job.finished_at.is_some());

    let view = harness.tracker.state().await;
    assert!(!view.is_active);
    assert_eq!(view.current_step.as_deref(), Some("finished"));

    harness.stop().await;
}

#[tokio::test]
async fn second_run_is_rejected_while_active() {
    let td = tempfile::tempdir().unwrap();
    let harness = Harness::new(&td, Arc::new(OkExecutor::default())).await;
    let fetcher = FakeFetcher::default().with_tenant("campus-a", vec![]);
    let orchestrator = harness.orchestrator(vec![tenant("campus-a")], fetcher);

    // Simulate another process holding the run.
    harness
        .tracker
        .init_process("batch_analysis", 1)
        .await
        .unwrap();

    let err = orchestrator.run(RunTrigger::Manual).await.unwrap_err();
    assert!(err.downcast_ref::<RunConflict>().is_some());

    // Releasing the snapshot lets the next run through.
    harness.tracker.finish_process(true, None).await.unwrap();
    let summary = orchestrator.run(RunTrigger::Manual).await.unwrap();
    assert!(summary.success);

    harness.stop().await;
}

#[tokio::test]
async fn one_broken_tenant_does_not_stop_the_batch() {
    let td = tempfile::tempdir().unwrap();
    let harness = Harness::new(&td, Arc::new(OkExecutor::default())).await;

    seed_item(&harness.pool, "campus-b", 9).await;
    let mut fetcher =
        FakeFetcher::default().with_tenant("campus-b", vec![open_activity(9, 100)]);
    fetcher.broken.insert("campus-a".into());

    let orchestrator =
        harness.orchestrator(vec![tenant("campus-a"), tenant("campus-b")], fetcher);
    let summary = tokio::time::timeout(
        Duration::from_secs(20),
        orchestrator.run(RunTrigger::Manual),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(!summary.success);
    assert_eq!(summary.tenants_synced, 1);
    assert_eq!(summary.entries_added, 1);
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].contains("campus-a"));

    // The error also lands in the shared snapshot's ring.
    let view = harness.tracker.state().await;
    assert_eq!(view.errors.len(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn tunnel_failure_aborts_the_rest_of_the_run() {
    let td = tempfile::tempdir().unwrap();
    let harness = Harness::new(&td, Arc::new(OkExecutor::default())).await;

    seed_item(&harness.pool, "campus-b", 3).await;
    let mut fetcher =
        FakeFetcher::default().with_tenant("campus-b", vec![open_activity(3, 100)]);
    fetcher.tunnel_down.insert("campus-a".into());

    // campus-a fails first with a tunnel error; campus-b never runs.
    let orchestrator =
        harness.orchestrator(vec![tenant("campus-a"), tenant("campus-b")], fetcher);
    let summary = orchestrator.run(RunTrigger::Manual).await.unwrap();

    assert!(!summary.success);
    assert_eq!(summary.tenants_synced, 0);
    assert_eq!(summary.entries_added, 0, "enqueue step is skipped");
    assert!(summary.errors.iter().any(|e| e.contains("campus-a")));

    // The run still closed its snapshot and job record.
    let view = harness.tracker.state().await;
    assert!(!view.is_active);
    let job = db::last_batch_job(&harness.pool).await.unwrap().unwrap();
    assert_eq!(job.success, Some(false));

    // The marked item is still flagged for the next run.
    let entry = db::entry_by_key(&harness.pool, "campus-b", 3, ActivityKind::Assignment)
        .await
        .unwrap();
    assert!(entry.is_none());

    harness.stop().await;
}

#[tokio::test]
async fn scheduled_trigger_does_not_wait_for_the_queue() {
    let td = tempfile::tempdir().unwrap();
    let harness = Harness::new(&td, Arc::new(OkExecutor::default())).await;

    seed_item(&harness.pool, "campus-a", 4).await;
    let fetcher = FakeFetcher::default().with_tenant("campus-a", vec![open_activity(4, 100)]);
    let orchestrator = harness.orchestrator(vec![tenant("campus-a")], fetcher);

    let summary = orchestrator.run(RunTrigger::Scheduled).await.unwrap();
    assert!(summary.success);
    assert_eq!(summary.entries_added, 1);

    // The entry may still be pending or in flight; the consumers finish it
    // in the background.
    tokio::time::timeout(Duration::from_secs(10), harness.queue.drain())
        .await
        .unwrap()
        .unwrap();
    let entry = db::entry_by_key(&harness.pool, "campus-a", 4, ActivityKind::Assignment)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, QueueStatus::Completed);

    harness.stop().await;
}

#[tokio::test]
async fn scheduler_arms_fires_and_disarms() {
    let td = tempfile::tempdir().unwrap();
    let harness = Harness::new(&td, Arc::new(OkExecutor::default())).await;
    let fetcher = FakeFetcher::default().with_tenant("campus-a", vec![]);
    let orchestrator = Arc::new(harness.orchestrator(vec![tenant("campus-a")], fetcher));

    let scheduler = Scheduler::new(orchestrator, Duration::from_millis(50));

    let report = scheduler.validate_jobs().await;
    assert!(!report.armed);

    assert!(scheduler.start().await);
    assert!(!scheduler.start().await, "second start is a no-op");

    let report = scheduler.validate_jobs().await;
    assert!(report.armed);
    assert!(report.next_fire_at.is_some());

    // Let it fire at least once.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = scheduler.status().await;
    assert!(status.initialized);
    assert!(status.last_fire_at.is_some());

    assert!(scheduler.stop().await);
    assert!(!scheduler.stop().await, "stop is idempotent");
    let report = scheduler.validate_jobs().await;
    assert!(!report.armed);
    assert!(report.next_fire_at.is_none());

    harness.stop().await;
}

//! Shared run-state snapshot: one logical instance system-wide, persisted
//! through a pluggable store so separate processes can watch a run's
//! progress.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::db;

const MAX_ERRORS: usize = 10;

/// Timestamped note kept in the snapshot's error ring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateNote {
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressCounters {
    pub total_units: u64,
    pub processed_units: u64,
    pub total_tenants: u64,
    pub processed_tenants: u64,
    pub total_courses: u64,
    pub processed_courses: u64,
    pub total_analyses: u64,
    pub processed_analyses: u64,
}

/// The persisted snapshot. Mutated only through [`ProcessStateTracker`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessState {
    pub is_active: bool,
    pub process_type: Option<String>,
    pub current_step: Option<String>,
    pub current_tenant: Option<String>,
    pub progress: ProgressCounters,
    pub errors: Vec<StateNote>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

/// Partial update merged into the snapshot by `update_progress`.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub current_step: Option<String>,
    pub current_tenant: Option<String>,
    pub total_units: Option<u64>,
    pub processed_units: Option<u64>,
    pub total_tenants: Option<u64>,
    pub processed_tenants: Option<u64>,
    pub total_courses: Option<u64>,
    pub processed_courses: Option<u64>,
    pub total_analyses: Option<u64>,
    pub processed_analyses: Option<u64>,
}

/// Read-only view returned by `state()`, with the derived fields computed.
#[derive(Debug, Clone, Serialize)]
pub struct StateView {
    pub is_active: bool,
    pub process_type: Option<String>,
    pub current_step: Option<String>,
    pub current_tenant: Option<String>,
    pub progress: ProgressCounters,
    pub progress_percentage: u32,
    pub timing: TimingView,
    pub errors: Vec<StateNote>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimingView {
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed: Option<String>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

/// Where the single snapshot lives. The database row is the default (every
/// process already shares the store file); the JSON file suits single-host
/// deployments and tests.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<Option<ProcessState>>;
    async fn save(&self, state: &ProcessState) -> Result<()>;
}

pub struct DbStateStore {
    pool: SqlitePool,
}

impl DbStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for DbStateStore {
    async fn load(&self) -> Result<Option<ProcessState>> {
        let snapshot = db::load_state_snapshot(&self.pool).await?;
        snapshot
            .map(|s| serde_json::from_str(&s).context("malformed process-state snapshot"))
            .transpose()
    }

    async fn save(&self, state: &ProcessState) -> Result<()> {
        let snapshot = serde_json::to_string(state)?;
        db::save_state_snapshot(&self.pool, &snapshot).await
    }
}

pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<Option<ProcessState>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).context("malformed process-state file")?,
            )),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, state: &ProcessState) -> Result<()> {
        // Write-then-rename so a concurrent reader never sees a torn file.
        let tmp = self.path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Tracks the lifecycle of the single orchestrated run. Every trigger path
/// consults this snapshot before starting a run; it is the sole
/// cross-process exclusivity mechanism.
#[derive(Clone)]
pub struct ProcessStateTracker {
    store: Arc<dyn StateStore>,
}

impl ProcessStateTracker {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Open a fresh active snapshot. Fails when one is already active.
    #[instrument(skip_all)]
    pub async fn init_process(&self, process_type: &str, total_units: u64) -> Result<()> {
        if let Some(existing) = self.store.load().await? {
            if existing.is_active {
                return Err(anyhow!(
                    "a {} process is already active",
                    existing.process_type.as_deref().unwrap_or("batch")
                ));
            }
        }
        let now = Utc::now();
        let state = ProcessState {
            is_active: true,
            process_type: Some(process_type.to_string()),
            current_step: Some("starting".to_string()),
            progress: ProgressCounters {
                total_units,
                ..Default::default()
            },
            started_at: Some(now),
            last_update: Some(now),
            ..Default::default()
        };
        self.store.save(&state).await
    }

    /// Merge a partial update into the snapshot and refresh the ETA once at
    /// least one unit has been processed.
    #[instrument(skip_all)]
    pub async fn update_progress(&self, update: ProgressUpdate) -> Result<()> {
        let Some(mut state) = self.store.load().await? else {
            warn!("progress update with no snapshot; ignoring");
            return Ok(());
        };
        if !state.is_active {
            warn!("progress update on inactive snapshot; ignoring");
            return Ok(());
        }

        if let Some(step) = update.current_step {
            state.current_step = Some(step);
        }
        if let Some(tenant) = update.current_tenant {
            state.current_tenant = Some(tenant);
        }
        let p = &mut state.progress;
        if let Some(v) = update.total_units {
            p.total_units = v;
        }
        if let Some(v) = update.processed_units {
            p.processed_units = v;
        }
        if let Some(v) = update.total_tenants {
            p.total_tenants = v;
        }
        if let Some(v) = update.processed_tenants {
            p.processed_tenants = v;
        }
        if let Some(v) = update.total_courses {
            p.total_courses = v;
        }
        if let Some(v) = update.processed_courses {
            p.processed_courses = v;
        }
        if let Some(v) = update.total_analyses {
            p.total_analyses = v;
        }
        if let Some(v) = update.processed_analyses {
            p.processed_analyses = v;
        }

        let now = Utc::now();
        state.last_update = Some(now);
        state.estimated_completion = estimate_completion(&state, now);
        self.store.save(&state).await
    }

    /// Append a timestamped message, keeping only the most recent entries.
    #[instrument(skip_all)]
    pub async fn add_error(&self, message: &str) -> Result<()> {
        let Some(mut state) = self.store.load().await? else {
            warn!(message, "error reported with no snapshot; ignoring");
            return Ok(());
        };
        state.errors.push(StateNote {
            at: Utc::now(),
            message: message.to_string(),
        });
        if state.errors.len() > MAX_ERRORS {
            let drop = state.errors.len() - MAX_ERRORS;
            state.errors.drain(..drop);
        }
        state.last_update = Some(Utc::now());
        self.store.save(&state).await
    }

    /// Close the snapshot. Idempotent across an already-finished run.
    #[instrument(skip_all)]
    pub async fn finish_process(&self, success: bool, message: Option<&str>) -> Result<()> {
        let mut state = self.store.load().await?.unwrap_or_default();
        state.is_active = false;
        state.current_step = Some(
            message
                .map(str::to_string)
                .unwrap_or_else(|| if success { "finished".into() } else { "failed".into() }),
        );
        state.current_tenant = None;
        state.estimated_completion = None;
        state.last_update = Some(Utc::now());
        self.store.save(&state).await
    }

    /// Current snapshot as a derived view. Never errors: a missing or
    /// unreadable snapshot reads as the inactive default.
    pub async fn state(&self) -> StateView {
        let state = match self.store.load().await {
            Ok(Some(state)) => state,
            Ok(None) => ProcessState::default(),
            Err(err) => {
                warn!(?err, "failed to load process state; reporting inactive");
                ProcessState::default()
            }
        };
        view_of(&state, Utc::now())
    }

    /// Startup recovery: if a previous process died mid-run, its snapshot
    /// stays active forever and blocks every future run. Close it once it
    /// has gone quiet for longer than `older_than`.
    #[instrument(skip_all)]
    pub async fn recover_stale(&self, older_than: Duration) -> Result<bool> {
        let Some(state) = self.store.load().await? else {
            return Ok(false);
        };
        if !state.is_active {
            return Ok(false);
        }
        let quiet_since = state.last_update.or(state.started_at);
        let stale = quiet_since.is_none_or(|t| Utc::now() - t > older_than);
        if !stale {
            return Ok(false);
        }
        info!("closing stale active snapshot from a previous process");
        self.finish_process(false, Some("recovered stale run state"))
            .await?;
        Ok(true)
    }
}

fn estimate_completion(state: &ProcessState, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let p = &state.progress;
    if p.processed_units == 0 || p.total_units == 0 {
        return None;
    }
    let started = state.started_at?;
    let elapsed_ms = (now - started).num_milliseconds().max(0);
    let per_unit_ms = elapsed_ms as f64 / p.processed_units as f64;
    let remaining = p.total_units.saturating_sub(p.processed_units);
    let remaining_ms = (per_unit_ms * remaining as f64) as i64;
    Some(now + Duration::milliseconds(remaining_ms))
}

fn view_of(state: &ProcessState, now: DateTime<Utc>) -> StateView {
    let p = &state.progress;
    let percentage = if !state.is_active || p.total_units == 0 {
        0
    } else {
        ((p.processed_units as f64 / p.total_units as f64) * 100.0).round() as u32
    };
    StateView {
        is_active: state.is_active,
        process_type: state.process_type.clone(),
        current_step: state.current_step.clone(),
        current_tenant: state.current_tenant.clone(),
        progress: *p,
        progress_percentage: percentage,
        timing: TimingView {
            started_at: state.started_at,
            elapsed: state
                .started_at
                .map(|t| human_duration((now - t).num_seconds().max(0))),
            estimated_completion: state.estimated_completion,
        },
        errors: state.errors.clone(),
    }
}

fn human_duration(total_secs: i64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_tracker(dir: &tempfile::TempDir) -> ProcessStateTracker {
        let store = FileStateStore::new(dir.path().join("state.json"));
        ProcessStateTracker::new(Arc::new(store))
    }

    #[tokio::test]
    async fn default_state_is_inactive() {
        let td = tempfile::tempdir().unwrap();
        let tracker = file_tracker(&td);
        let view = tracker.state().await;
        assert!(!view.is_active);
        assert_eq!(view.progress_percentage, 0);
        assert!(view.timing.started_at.is_none());
    }

    #[tokio::test]
    async fn init_rejects_second_active_run() {
        let td = tempfile::tempdir().unwrap();
        let tracker = file_tracker(&td);
        tracker.init_process("batch_analysis", 4).await.unwrap();
        assert!(tracker.init_process("batch_analysis", 4).await.is_err());

        tracker.finish_process(true, None).await.unwrap();
        tracker.init_process("batch_analysis", 4).await.unwrap();
    }

    #[tokio::test]
    async fn percentage_and_eta_arithmetic() {
        let td = tempfile::tempdir().unwrap();
        let tracker = file_tracker(&td);
        tracker.init_process("batch_analysis", 10).await.unwrap();

        // No units processed: ETA stays unset.
        tracker
            .update_progress(ProgressUpdate {
                current_step: Some("sync".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let view = tracker.state().await;
        assert_eq!(view.progress_percentage, 0);
        assert!(view.timing.estimated_completion.is_none());

        tracker
            .update_progress(ProgressUpdate {
                processed_units: Some(4),
                ..Default::default()
            })
            .await
            .unwrap();
        let view = tracker.state().await;
        assert_eq!(view.progress_percentage, 40);
        assert!(view.timing.estimated_completion.is_some());
        assert_eq!(view.current_step.as_deref(), Some("sync"));
    }

    #[tokio::test]
    async fn error_ring_keeps_most_recent_ten() {
        let td = tempfile::tempdir().unwrap();
        let tracker = file_tracker(&td);
        tracker.init_process("batch_analysis", 1).await.unwrap();
        for i in 0..13 {
            tracker.add_error(&format!("err {i}")).await.unwrap();
        }
        let view = tracker.state().await;
        assert_eq!(view.errors.len(), 10);
        assert_eq!(view.errors[0].message, "err 3");
        assert_eq!(view.errors[9].message, "err 12");
    }

    #[tokio::test]
    async fn finish_clears_activity_and_eta() {
        let td = tempfile::tempdir().unwrap();
        let tracker = file_tracker(&td);
        tracker.init_process("batch_analysis", 2).await.unwrap();
        tracker
            .update_progress(ProgressUpdate {
                processed_units: Some(1),
                current_tenant: Some("campus-a".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        tracker.finish_process(false, Some("tunnel lost")).await.unwrap();
        let view = tracker.state().await;
        assert!(!view.is_active);
        assert_eq!(view.current_step.as_deref(), Some("tunnel lost"));
        assert!(view.current_tenant.is_none());
        assert!(view.timing.estimated_completion.is_none());
        // Inactive snapshots always read as 0%.
        assert_eq!(view.progress_percentage, 0);
    }

    #[tokio::test]
    async fn db_store_round_trips() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let tracker = ProcessStateTracker::new(Arc::new(DbStateStore::new(pool)));

        tracker.init_process("batch_analysis", 3).await.unwrap();
        let view = tracker.state().await;
        assert!(view.is_active);
        assert_eq!(view.progress.total_units, 3);
    }

    #[tokio::test]
    async fn recover_stale_only_closes_quiet_snapshots() {
        let td = tempfile::tempdir().unwrap();
        let tracker = file_tracker(&td);
        tracker.init_process("batch_analysis", 1).await.unwrap();

        // Fresh snapshot is left alone.
        assert!(!tracker.recover_stale(Duration::minutes(10)).await.unwrap());
        assert!(tracker.state().await.is_active);

        // A snapshot quiet past the threshold is closed.
        assert!(tracker.recover_stale(Duration::seconds(-1)).await.unwrap());
        assert!(!tracker.state().await.is_active);
    }

    #[test]
    fn human_durations() {
        assert_eq!(human_duration(42), "42s");
        assert_eq!(human_duration(75), "1m 15s");
        assert_eq!(human_duration(3 * 3600 + 125), "3h 2m 5s");
    }
}

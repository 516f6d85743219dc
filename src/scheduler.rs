//! Periodic trigger for batch runs, plus the manual controls.
//!
//! The scheduler is an explicit service object constructed at bootstrap and
//! passed around by reference; it owns the timer task and its bookkeeping.
//! Stopping the timer never interrupts a run already in flight: fired runs
//! are spawned detached and gated by the shared process snapshot.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::model::RunTrigger;
use crate::orchestrator::{BatchOrchestrator, BatchSummary, RunConflict};

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub initialized: bool,
    pub interval_seconds: u64,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fire_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobsReport {
    pub armed: bool,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fire_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct TimerState {
    handle: Option<JoinHandle<()>>,
    next_fire_at: Option<DateTime<Utc>>,
    last_fire_at: Option<DateTime<Utc>>,
    last_outcome: Option<String>,
}

pub struct Scheduler {
    orchestrator: Arc<BatchOrchestrator>,
    period: Duration,
    timer: Mutex<TimerState>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<BatchOrchestrator>, period: Duration) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            period,
            timer: Mutex::new(TimerState::default()),
        })
    }

    /// Arm the periodic timer. Returns false when it is already armed.
    pub async fn start(self: &Arc<Self>) -> bool {
        let mut timer = self.timer.lock().await;
        if timer.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!("scheduler already armed");
            return false;
        }
        timer.next_fire_at = Some(Utc::now() + chrono_period(self.period));
        let this = Arc::clone(self);
        timer.handle = Some(tokio::spawn(this.timer_loop()));
        info!(period_secs = self.period.as_secs(), "scheduler armed");
        true
    }

    /// Disarm the timer. A run already in flight keeps going.
    pub async fn stop(&self) -> bool {
        let mut timer = self.timer.lock().await;
        let Some(handle) = timer.handle.take() else {
            return false;
        };
        handle.abort();
        timer.next_fire_at = None;
        info!("scheduler disarmed");
        true
    }

    pub async fn restart(self: &Arc<Self>) -> bool {
        self.stop().await;
        self.start().await
    }

    /// Run the orchestrator once, immediately and blocking (the run drains
    /// the queue before returning). Conflicts surface as `RunConflict`.
    pub async fn trigger_manual(&self) -> Result<BatchSummary> {
        self.orchestrator.run(RunTrigger::Manual).await
    }

    /// Sanity-check that the timer is armed and report fire times.
    pub async fn validate_jobs(&self) -> JobsReport {
        let timer = self.timer.lock().await;
        let armed = timer.handle.as_ref().is_some_and(|h| !h.is_finished());
        if !armed {
            warn!("scheduler timer is not armed");
        }
        JobsReport {
            armed,
            next_fire_at: timer.next_fire_at,
            last_fire_at: timer.last_fire_at,
        }
    }

    pub async fn status(&self) -> SchedulerStatus {
        let timer = self.timer.lock().await;
        SchedulerStatus {
            initialized: timer.handle.as_ref().is_some_and(|h| !h.is_finished()),
            interval_seconds: self.period.as_secs(),
            next_fire_at: timer.next_fire_at,
            last_fire_at: timer.last_fire_at,
            last_outcome: timer.last_outcome.clone(),
        }
    }

    async fn timer_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.period).await;
            {
                let mut timer = self.timer.lock().await;
                let now = Utc::now();
                timer.last_fire_at = Some(now);
                timer.next_fire_at = Some(now + chrono_period(self.period));
            }
            let this = Arc::clone(&self);
            // Detached: disarming the timer must not cancel the run.
            tokio::spawn(async move {
                match this.orchestrator.run(RunTrigger::Scheduled).await {
                    Ok(summary) => {
                        let mut timer = this.timer.lock().await;
                        timer.last_outcome = Some(if summary.success {
                            format!("ok: {} queued", summary.entries_added)
                        } else {
                            format!("{} step errors", summary.errors.len())
                        });
                    }
                    Err(err) if err.downcast_ref::<RunConflict>().is_some() => {
                        info!("skipping scheduled run; another run is active");
                    }
                    Err(err) => {
                        error!(?err, "scheduled run failed");
                        let mut timer = this.timer.lock().await;
                        timer.last_outcome = Some(format!("failed: {err:#}"));
                    }
                }
            });
        }
    }
}

fn chrono_period(period: Duration) -> chrono::Duration {
    chrono::Duration::seconds(period.as_secs() as i64)
}

//! One batch run: mark eligible → sync tenants → enqueue → drain → cleanup.
//!
//! Step failures are recorded on the job and the run moves on; the one
//! exception is a tunnel failure, after which no further source data can be
//! fetched and the remaining steps are abandoned.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::Tenant;
use crate::db::{self, JobCounters, WorkItemUpsert};
use crate::eligibility::EligibilityMarker;
use crate::fetch::ContentFetcher;
use crate::model::RunTrigger;
use crate::progress::{ProcessStateTracker, ProgressUpdate};
use crate::queue::WorkQueue;
use crate::tunnel::TunnelError;

/// Starting a run while another is active is rejected, never queued.
#[derive(Debug, Error)]
#[error("a batch run is already active")]
pub struct RunConflict;

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub job_id: i64,
    pub run_id: Uuid,
    pub trigger: RunTrigger,
    pub success: bool,
    pub items_marked: i64,
    pub tenants_synced: i64,
    pub entries_added: i64,
    pub entries_existing: i64,
    pub entries_cleaned: i64,
    pub duration_ms: i64,
    pub errors: Vec<String>,
}

struct RunOutcome {
    counters: JobCounters,
    errors: Vec<String>,
}

pub struct BatchOrchestrator {
    pool: SqlitePool,
    tenants: Vec<Tenant>,
    marker: EligibilityMarker,
    fetcher: Arc<dyn ContentFetcher>,
    queue: Arc<WorkQueue>,
    tracker: ProcessStateTracker,
}

impl BatchOrchestrator {
    pub fn new(
        pool: SqlitePool,
        tenants: Vec<Tenant>,
        fetcher: Arc<dyn ContentFetcher>,
        queue: Arc<WorkQueue>,
        tracker: ProcessStateTracker,
    ) -> Self {
        let marker = EligibilityMarker::new(pool.clone());
        Self {
            pool,
            tenants,
            marker,
            fetcher,
            queue,
            tracker,
        }
    }

    pub fn tracker(&self) -> &ProcessStateTracker {
        &self.tracker
    }

    /// Execute one run. The shared snapshot gates entry for every trigger
    /// path; `finish_process` and the job record are finalized exactly once
    /// on every exit.
    #[instrument(skip_all, fields(trigger = trigger.as_str()))]
    pub async fn run(&self, trigger: RunTrigger) -> Result<BatchSummary> {
        if self.tracker.state().await.is_active {
            return Err(RunConflict.into());
        }
        self.tracker
            .init_process("batch_analysis", self.tenants.len() as u64)
            .await?;

        let run_id = Uuid::new_v4();
        let job_id = match db::insert_batch_job(
            &self.pool,
            run_id,
            trigger,
            self.tenants.len() as i64,
        )
        .await
        {
            Ok(id) => id,
            Err(err) => {
                let _ = self
                    .tracker
                    .finish_process(false, Some("failed to open job record"))
                    .await;
                return Err(err);
            }
        };
        info!(job_id, %run_id, "batch run started");
        let started = Instant::now();

        let outcome = self.run_steps(trigger).await;
        let duration_ms = started.elapsed().as_millis() as i64;
        let success = outcome.errors.is_empty();

        if let Err(err) = db::finalize_batch_job(
            &self.pool,
            job_id,
            success,
            &outcome.counters,
            &outcome.errors,
            duration_ms,
        )
        .await
        {
            error!(?err, job_id, "failed to finalize batch job record");
        }
        let closing = if success {
            "finished"
        } else {
            "finished with errors"
        };
        if let Err(err) = self.tracker.finish_process(success, Some(closing)).await {
            error!(?err, "failed to close process state");
        }
        info!(job_id, %run_id, success, duration_ms, "batch run finished");

        Ok(BatchSummary {
            job_id,
            run_id,
            trigger,
            success,
            items_marked: outcome.counters.items_marked,
            tenants_synced: outcome.counters.tenants_synced,
            entries_added: outcome.counters.entries_added,
            entries_existing: outcome.counters.entries_existing,
            entries_cleaned: outcome.counters.entries_cleaned,
            duration_ms,
            errors: outcome.errors,
        })
    }

    async fn run_steps(&self, trigger: RunTrigger) -> RunOutcome {
        let mut counters = JobCounters::default();
        let mut errors = Vec::new();

        // Step 1: flag items inside their window.
        self.step(ProgressUpdate {
            current_step: Some("mark_eligible".into()),
            ..Default::default()
        })
        .await;
        match self.marker.mark_eligible(None).await {
            Ok(marked) => counters.items_marked = marked as i64,
            Err(err) => self.record(&mut errors, "mark_eligible", &err).await,
        }

        // Step 2: pull fresh content per tenant. One tenant's failure is
        // recorded and skipped; a tunnel failure ends the whole run.
        let mut fatal = false;
        let mut courses_seen: u64 = 0;
        for (idx, tenant) in self.tenants.iter().enumerate() {
            self.step(ProgressUpdate {
                current_step: Some("sync".into()),
                current_tenant: Some(tenant.name.clone()),
                total_tenants: Some(self.tenants.len() as u64),
                ..Default::default()
            })
            .await;
            match self.sync_tenant(tenant).await {
                Ok(courses) => {
                    counters.tenants_synced += 1;
                    courses_seen += courses;
                    self.step(ProgressUpdate {
                        processed_tenants: Some(idx as u64 + 1),
                        processed_units: Some(idx as u64 + 1),
                        total_courses: Some(courses_seen),
                        processed_courses: Some(courses_seen),
                        ..Default::default()
                    })
                    .await;
                }
                Err(err) => {
                    self.record(&mut errors, &format!("sync {}", tenant.name), &err)
                        .await;
                    if err.downcast_ref::<TunnelError>().is_some() {
                        error!(tenant = %tenant.name, "tunnel failure is fatal for this run");
                        fatal = true;
                        break;
                    }
                }
            }
        }
        if fatal {
            return RunOutcome { counters, errors };
        }

        // Step 3: queue everything flagged and stale.
        self.step(ProgressUpdate {
            current_step: Some("enqueue".into()),
            ..Default::default()
        })
        .await;
        for tenant in &self.tenants {
            match db::flagged_items(&self.pool, &tenant.name).await {
                Ok(items) => {
                    let outcome = self
                        .queue
                        .enqueue(&tenant.name, &items, Some(trigger.as_str()))
                        .await;
                    counters.entries_added += outcome.added as i64;
                    counters.entries_existing += outcome.existing as i64;
                    for item_err in outcome.errors {
                        self.push_error(&mut errors, format!("enqueue {}: {item_err}", tenant.name))
                            .await;
                    }
                }
                Err(err) => {
                    self.record(&mut errors, &format!("enqueue {}", tenant.name), &err)
                        .await
                }
            }
        }
        self.step(ProgressUpdate {
            total_analyses: Some(counters.entries_added as u64),
            ..Default::default()
        })
        .await;

        // Step 4: a manual run observes the queue until it drains.
        if trigger == RunTrigger::Manual {
            self.step(ProgressUpdate {
                current_step: Some("drain".into()),
                ..Default::default()
            })
            .await;
            match self.queue.drain().await {
                Ok(stats) => {
                    self.step(ProgressUpdate {
                        processed_analyses: Some((stats.completed + stats.failed).max(0) as u64),
                        ..Default::default()
                    })
                    .await;
                }
                Err(err) => self.record(&mut errors, "drain", &err).await,
            }
        }

        // Step 5: retention cleanup of expired terminal entries.
        self.step(ProgressUpdate {
            current_step: Some("cleanup".into()),
            ..Default::default()
        })
        .await;
        match self.queue.cleanup().await {
            Ok(cleaned) => counters.entries_cleaned = cleaned as i64,
            Err(err) => self.record(&mut errors, "cleanup", &err).await,
        }
        if let Err(err) = db::delete_old_batch_jobs(&self.pool, self.retain_hours()).await {
            warn!(?err, "failed to trim batch job history");
        }

        RunOutcome { counters, errors }
    }

    /// Upserts every activity of one tenant; returns the number of courses
    /// seen. An activity is only visible if its course is.
    async fn sync_tenant(&self, tenant: &Tenant) -> Result<u64> {
        let courses = self.fetcher.fetch_courses(tenant).await?;
        let visible_courses: HashSet<i64> = courses
            .iter()
            .filter(|c| c.visible)
            .map(|c| c.id)
            .collect();

        let activities = self.fetcher.fetch_activities(tenant).await?;
        for activity in activities {
            let upsert = WorkItemUpsert {
                tenant: tenant.name.clone(),
                course_id: activity.course_id,
                activity_id: activity.activity_id,
                kind: activity.kind,
                title: activity.title.clone(),
                visible: activity.visible && visible_courses.contains(&activity.course_id),
                open_at: activity.open_at,
                close_at: activity.close_at,
            };
            db::upsert_work_item(&self.pool, &upsert)
                .await
                .with_context(|| {
                    format!(
                        "failed to upsert activity {} for tenant {}",
                        activity.activity_id, tenant.name
                    )
                })?;
        }
        Ok(courses.len() as u64)
    }

    fn retain_hours(&self) -> u32 {
        // Job history shares the queue's retention window.
        self.queue.settings().retain_hours
    }

    async fn step(&self, update: ProgressUpdate) {
        if let Err(err) = self.tracker.update_progress(update).await {
            warn!(?err, "failed to update process state");
        }
    }

    async fn record(&self, errors: &mut Vec<String>, step: &str, err: &anyhow::Error) {
        self.push_error(errors, format!("{step}: {err:#}")).await;
    }

    async fn push_error(&self, errors: &mut Vec<String>, message: String) {
        error!(%message, "batch step failed");
        if let Err(err) = self.tracker.add_error(&message).await {
            warn!(?err, "failed to record error in process state");
        }
        errors.push(message);
    }
}

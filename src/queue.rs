//! Durable, deduplicated analysis queue and its consumer pool.
//!
//! Entries live in the local store with a unique dedup key; enqueueing is a
//! guarded upsert and claiming is a single atomic update, so any number of
//! consumer loops (in this or another process) can share the queue without
//! application-level locking.

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::analysis::{AnalysisExecutor, AnalysisRequest};
use crate::config;
use crate::db::{self, ClaimedEntry, ItemForQueue, StatusCounts};

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub stale_after_hours: u32,
    pub retain_hours: u32,
    pub max_backoff_seconds: u64,
    pub poll_interval: Duration,
}

impl QueueSettings {
    pub fn from_config(cfg: &config::Config) -> Self {
        Self {
            concurrency: cfg.queue.concurrency,
            max_attempts: cfg.queue.max_attempts,
            stale_after_hours: cfg.queue.stale_after_hours,
            retain_hours: cfg.queue.retain_hours,
            max_backoff_seconds: cfg.queue.max_backoff_seconds,
            poll_interval: Duration::from_millis(cfg.app.poll_interval_ms),
        }
    }
}

/// Per-call enqueue tally. `errors` holds per-item failures that were
/// caught and skipped; they never abort the rest of the batch.
#[derive(Debug, Default)]
pub struct EnqueueOutcome {
    pub added: u64,
    pub existing: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
    pub in_progress: bool,
}

impl From<StatusCounts> for QueueStats {
    fn from(c: StatusCounts) -> Self {
        Self {
            pending: c.pending,
            processing: c.processing,
            completed: c.completed,
            failed: c.failed,
            total: c.total(),
            in_progress: c.in_progress(),
        }
    }
}

pub struct WorkQueue {
    pool: SqlitePool,
    executor: Arc<dyn AnalysisExecutor>,
    settings: QueueSettings,
}

impl WorkQueue {
    pub fn new(
        pool: SqlitePool,
        executor: Arc<dyn AnalysisExecutor>,
        settings: QueueSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            executor,
            settings,
        })
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Queue the given items for one tenant. Items with a live entry or a
    /// fresh completion count as `existing`; newly queued items get a
    /// one-second-per-item staggered due time to avoid a submission burst.
    #[instrument(skip_all, fields(tenant = %tenant))]
    pub async fn enqueue(
        &self,
        tenant: &str,
        items: &[ItemForQueue],
        requested_by: Option<&str>,
    ) -> EnqueueOutcome {
        let mut outcome = EnqueueOutcome::default();
        for item in items {
            let queued = db::enqueue_entry(
                &self.pool,
                tenant,
                item,
                requested_by,
                self.settings.max_attempts,
                self.settings.stale_after_hours,
                outcome.added,
            )
            .await;
            match queued {
                Ok(Some(id)) => {
                    debug!(id, tenant, activity_id = item.activity_id, "queued item");
                    outcome.added += 1;
                }
                Ok(None) => outcome.existing += 1,
                Err(err) => {
                    warn!(?err, tenant, activity_id = item.activity_id, "enqueue failed");
                    outcome
                        .errors
                        .push(format!("activity {}: {err:#}", item.activity_id));
                }
            }
        }
        info!(
            tenant,
            added = outcome.added,
            existing = outcome.existing,
            errors = outcome.errors.len(),
            "enqueue finished"
        );
        outcome
    }

    /// Claim and process one due entry. Returns false when nothing is due.
    /// Safe under at-least-once delivery: the atomic claim means a stale or
    /// duplicate wakeup simply finds nothing in `pending`.
    #[instrument(skip_all)]
    pub async fn process_next(&self) -> Result<bool> {
        let Some(claimed) = db::claim_next_entry(&self.pool).await? else {
            return Ok(false);
        };

        let request = self.request_for(&claimed).await?;
        match self.executor.analyze(&request).await {
            Ok(value) => {
                db::complete_entry(&self.pool, claimed.id, &value.to_string()).await?;
                db::clear_needs_analysis(
                    &self.pool,
                    &claimed.tenant,
                    claimed.activity_id,
                    claimed.kind,
                )
                .await?;
                info!(
                    id = claimed.id,
                    tenant = %claimed.tenant,
                    activity_id = claimed.activity_id,
                    "analysis completed"
                );
            }
            Err(err) => {
                let message = format!("{err:#}");
                if claimed.attempts >= claimed.max_attempts {
                    warn!(
                        id = claimed.id,
                        tenant = %claimed.tenant,
                        activity_id = claimed.activity_id,
                        attempts = claimed.attempts,
                        "analysis failed; attempts exhausted"
                    );
                    db::fail_entry(&self.pool, claimed.id, &message).await?;
                } else {
                    let backoff = backoff_secs(claimed.attempts, self.settings.max_backoff_seconds);
                    warn!(
                        id = claimed.id,
                        tenant = %claimed.tenant,
                        activity_id = claimed.activity_id,
                        attempt = claimed.attempts,
                        backoff,
                        "analysis failed; backoff"
                    );
                    db::retry_entry(&self.pool, claimed.id, &message, backoff).await?;
                }
            }
        }
        Ok(true)
    }

    /// Spawn the fixed-size consumer pool. Workers stop after their current
    /// entry once `shutdown` flips to true.
    pub fn spawn_consumers(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        (0..self.settings.concurrency)
            .map(|worker| {
                let queue = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(worker_loop(queue, shutdown, worker))
            })
            .collect()
    }

    pub async fn status(&self, tenant: Option<&str>) -> Result<QueueStats> {
        Ok(db::queue_counts(&self.pool, tenant).await?.into())
    }

    /// Wait until no entry is pending or processing. Used by blocking
    /// (manual) runs; scheduled runs leave the pool to drain on its own.
    #[instrument(skip_all)]
    pub async fn drain(&self) -> Result<QueueStats> {
        let mut ticks: u64 = 0;
        loop {
            let stats = self.status(None).await?;
            if !stats.in_progress {
                return Ok(stats);
            }
            if ticks % 20 == 0 {
                info!(
                    pending = stats.pending,
                    processing = stats.processing,
                    completed = stats.completed,
                    failed = stats.failed,
                    "draining queue"
                );
            }
            ticks += 1;
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Retention pass over terminal entries; only old completed rows go.
    pub async fn cleanup(&self) -> Result<u64> {
        let deleted = db::cleanup_completed(&self.pool, self.settings.retain_hours).await?;
        if deleted > 0 {
            info!(deleted, "cleaned up expired completed entries");
        }
        Ok(deleted)
    }

    async fn request_for(&self, claimed: &ClaimedEntry) -> Result<AnalysisRequest> {
        let item =
            db::find_work_item(&self.pool, &claimed.tenant, claimed.activity_id, claimed.kind)
                .await?;
        Ok(AnalysisRequest {
            tenant: claimed.tenant.clone(),
            course_id: claimed.course_id,
            activity_id: claimed.activity_id,
            kind: claimed.kind,
            title: item.and_then(|i| i.title),
        })
    }
}

async fn worker_loop(queue: Arc<WorkQueue>, mut shutdown: watch::Receiver<bool>, worker: usize) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        match queue.process_next().await {
            Ok(true) => {}
            Ok(false) => {
                tokio::select! {
                    _ = tokio::time::sleep(queue.settings.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(err) => {
                error!(?err, worker, "queue worker error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    debug!(worker, "queue worker stopped");
}

/// Exponential backoff: 5s * 2^(attempt-1), capped.
fn backoff_secs(attempt: i64, max_cap_secs: u64) -> i64 {
    let exp = (attempt - 1).clamp(0, 10) as u32;
    let secs = 5_i64 << exp;
    let cap = if max_cap_secs == 0 {
        secs
    } else {
        max_cap_secs as i64
    };
    secs.min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_secs(1, 3600), 5);
        assert_eq!(backoff_secs(2, 3600), 10);
        assert_eq!(backoff_secs(3, 3600), 20);
        assert_eq!(backoff_secs(11, 3600), 3600);
        // attempt numbers past the shift guard stay finite
        assert_eq!(backoff_secs(40, 0), 5 << 10);
        // a cap below the base wins
        assert_eq!(backoff_secs(4, 15), 15);
    }
}

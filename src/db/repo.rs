use super::model::{ClaimedEntry, ItemForQueue, StatusCounts, WorkItemUpsert};
use crate::model::{ActivityKind, QueueEntry, QueueStatus, RunTrigger, WorkItem};
use anyhow::{anyhow, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)?.create_if_missing(true);
    let pool = SqlitePool::connect_with(options).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = url["sqlite:".len()..].trim_start_matches("//");
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{expanded_path}");
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// work_items

#[instrument(skip_all)]
pub async fn upsert_work_item(pool: &Pool, item: &WorkItemUpsert) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO work_items (tenant, course_id, activity_id, kind, title, visible, open_at, close_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(tenant, activity_id, kind) DO UPDATE SET \
             course_id = excluded.course_id, \
             title = excluded.title, \
             visible = excluded.visible, \
             open_at = excluded.open_at, \
             close_at = excluded.close_at, \
             updated_at = CURRENT_TIMESTAMP \
         RETURNING id",
    )
    .bind(&item.tenant)
    .bind(item.course_id)
    .bind(item.activity_id)
    .bind(item.kind.as_str())
    .bind(&item.title)
    .bind(item.visible)
    .bind(item.open_at)
    .bind(item.close_at)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

/// Flag every unflagged, visible item whose window contains the current
/// instant. One statement, so a failure commits nothing.
#[instrument(skip_all)]
pub async fn mark_eligible(pool: &Pool, scope: Option<&str>) -> Result<u64> {
    let sql = "UPDATE work_items SET needs_analysis = 1, updated_at = CURRENT_TIMESTAMP \
               WHERE needs_analysis = 0 AND visible = 1 \
                 AND (open_at IS NULL OR datetime(open_at) <= CURRENT_TIMESTAMP) \
                 AND (close_at IS NULL OR datetime(close_at) > CURRENT_TIMESTAMP)";
    let done = match scope {
        Some(tenant) => {
            sqlx::query(&format!("{sql} AND tenant = ?"))
                .bind(tenant)
                .execute(pool)
                .await?
        }
        None => sqlx::query(sql).execute(pool).await?,
    };
    Ok(done.rows_affected())
}

#[instrument(skip_all)]
pub async fn flagged_items(pool: &Pool, tenant: &str) -> Result<Vec<ItemForQueue>> {
    let rows = sqlx::query(
        "SELECT course_id, activity_id, kind, title FROM work_items \
         WHERE tenant = ? AND needs_analysis = 1 \
         ORDER BY course_id, activity_id",
    )
    .bind(tenant)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let kind: String = row.get("kind");
            Ok(ItemForQueue {
                course_id: row.get("course_id"),
                activity_id: row.get("activity_id"),
                kind: ActivityKind::parse(&kind)
                    .ok_or_else(|| anyhow!("unknown activity kind {kind}"))?,
                title: row.try_get("title").ok(),
            })
        })
        .collect()
}

pub async fn find_work_item(
    pool: &Pool,
    tenant: &str,
    activity_id: i64,
    kind: ActivityKind,
) -> Result<Option<WorkItem>> {
    let row = sqlx::query(
        "SELECT id, tenant, course_id, activity_id, kind, title, visible, open_at, close_at, \
                needs_analysis, created_at, updated_at \
         FROM work_items WHERE tenant = ? AND activity_id = ? AND kind = ?",
    )
    .bind(tenant)
    .bind(activity_id)
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await?;

    row.map(|row| {
        let kind: String = row.get("kind");
        Ok(WorkItem {
            id: row.get("id"),
            tenant: row.get("tenant"),
            course_id: row.get("course_id"),
            activity_id: row.get("activity_id"),
            kind: ActivityKind::parse(&kind)
                .ok_or_else(|| anyhow!("unknown activity kind {kind}"))?,
            title: row.try_get("title").ok(),
            visible: row.get("visible"),
            open_at: row.try_get("open_at").ok(),
            close_at: row.try_get("close_at").ok(),
            needs_analysis: row.get("needs_analysis"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    })
    .transpose()
}

/// Analysis-completion path: the only place besides the marker allowed to
/// touch the flag.
#[instrument(skip_all)]
pub async fn clear_needs_analysis(
    pool: &Pool,
    tenant: &str,
    activity_id: i64,
    kind: ActivityKind,
) -> Result<()> {
    sqlx::query(
        "UPDATE work_items SET needs_analysis = 0, updated_at = CURRENT_TIMESTAMP \
         WHERE tenant = ? AND activity_id = ? AND kind = ?",
    )
    .bind(tenant)
    .bind(activity_id)
    .bind(kind.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// queue_entries

/// Guarded upsert on the dedup key. Returns the entry id when the item was
/// (re)queued, or `None` when an existing entry blocks it: a live pending or
/// processing row, or a completed row younger than `stale_after_hours`.
/// The store resolves concurrent calls; only one caller gets the row.
#[instrument(skip_all)]
pub async fn enqueue_entry(
    pool: &Pool,
    tenant: &str,
    item: &ItemForQueue,
    requested_by: Option<&str>,
    max_attempts: u32,
    stale_after_hours: u32,
    delay_secs: u64,
) -> Result<Option<i64>> {
    let row = sqlx::query(
        "INSERT INTO queue_entries \
             (tenant, activity_id, kind, course_id, status, attempts, max_attempts, \
              last_error, result, requested_by, due_at) \
         VALUES (?, ?, ?, ?, 'pending', 0, ?, NULL, NULL, ?, datetime('now', ? || ' seconds')) \
         ON CONFLICT(tenant, activity_id, kind) DO UPDATE SET \
             status = 'pending', \
             attempts = 0, \
             max_attempts = excluded.max_attempts, \
             last_error = NULL, \
             result = NULL, \
             requested_by = excluded.requested_by, \
             due_at = excluded.due_at, \
             created_at = CURRENT_TIMESTAMP, \
             started_at = NULL, \
             completed_at = NULL \
         WHERE queue_entries.status NOT IN ('pending', 'processing') \
           AND NOT (queue_entries.status = 'completed' \
                    AND datetime(queue_entries.completed_at) > datetime('now', '-' || ? || ' hours')) \
         RETURNING id",
    )
    .bind(tenant)
    .bind(item.activity_id)
    .bind(item.kind.as_str())
    .bind(item.course_id)
    .bind(max_attempts as i64)
    .bind(requested_by)
    .bind(delay_secs as i64)
    .bind(stale_after_hours as i64)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.get("id")))
}

/// Atomically claim the next due pending entry: flips it to processing and
/// increments attempts in the same statement, so concurrent consumers (in
/// this or any other process) can never claim the same entry twice.
#[instrument(skip_all)]
pub async fn claim_next_entry(pool: &Pool) -> Result<Option<ClaimedEntry>> {
    let row = sqlx::query(
        "UPDATE queue_entries \
         SET status = 'processing', attempts = attempts + 1, started_at = CURRENT_TIMESTAMP \
         WHERE id = ( \
             SELECT id FROM queue_entries \
             WHERE status = 'pending' AND datetime(due_at) <= CURRENT_TIMESTAMP \
             ORDER BY datetime(due_at) ASC LIMIT 1 \
         ) \
         RETURNING id, tenant, activity_id, kind, course_id, attempts, max_attempts, requested_by",
    )
    .fetch_optional(pool)
    .await?;

    row.map(|row| {
        let kind: String = row.get("kind");
        Ok(ClaimedEntry {
            id: row.get("id"),
            tenant: row.get("tenant"),
            activity_id: row.get("activity_id"),
            kind: ActivityKind::parse(&kind)
                .ok_or_else(|| anyhow!("unknown activity kind {kind}"))?,
            course_id: row.get("course_id"),
            attempts: row.get("attempts"),
            max_attempts: row.get("max_attempts"),
            requested_by: row.try_get("requested_by").ok(),
        })
    })
    .transpose()
}

#[instrument(skip_all)]
pub async fn complete_entry(pool: &Pool, id: i64, result_json: &str) -> Result<()> {
    sqlx::query(
        "UPDATE queue_entries \
         SET status = 'completed', completed_at = CURRENT_TIMESTAMP, result = ?, last_error = NULL \
         WHERE id = ? AND status = 'processing'",
    )
    .bind(result_json)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Revert a failed-but-not-exhausted entry to pending with an explicit
/// next-due instant, so a failing downstream never sees a tight retry loop.
#[instrument(skip_all)]
pub async fn retry_entry(pool: &Pool, id: i64, error: &str, backoff_secs: i64) -> Result<()> {
    sqlx::query(
        "UPDATE queue_entries \
         SET status = 'pending', last_error = ?, due_at = datetime('now', ? || ' seconds') \
         WHERE id = ? AND status = 'processing'",
    )
    .bind(error)
    .bind(backoff_secs)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn fail_entry(pool: &Pool, id: i64, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE queue_entries \
         SET status = 'failed', last_error = ?, completed_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND status = 'processing'",
    )
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn queue_counts(pool: &Pool, tenant: Option<&str>) -> Result<StatusCounts> {
    let sql = "SELECT \
                   COALESCE(SUM(status = 'pending'), 0) AS pending, \
                   COALESCE(SUM(status = 'processing'), 0) AS processing, \
                   COALESCE(SUM(status = 'completed'), 0) AS completed, \
                   COALESCE(SUM(status = 'failed'), 0) AS failed \
               FROM queue_entries";
    let row = match tenant {
        Some(t) => {
            sqlx::query(&format!("{sql} WHERE tenant = ?"))
                .bind(t)
                .fetch_one(pool)
                .await?
        }
        None => sqlx::query(sql).fetch_one(pool).await?,
    };
    Ok(StatusCounts {
        pending: row.get("pending"),
        processing: row.get("processing"),
        completed: row.get("completed"),
        failed: row.get("failed"),
    })
}

pub async fn entry_by_key(
    pool: &Pool,
    tenant: &str,
    activity_id: i64,
    kind: ActivityKind,
) -> Result<Option<QueueEntry>> {
    let row = sqlx::query(
        "SELECT id, tenant, activity_id, kind, course_id, status, attempts, max_attempts, \
                last_error, result, requested_by, due_at, created_at, started_at, completed_at \
         FROM queue_entries WHERE tenant = ? AND activity_id = ? AND kind = ?",
    )
    .bind(tenant)
    .bind(activity_id)
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await?;
    row.map(|r| entry_from_row(&r)).transpose()
}

fn entry_from_row(row: &SqliteRow) -> Result<QueueEntry> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    Ok(QueueEntry {
        id: row.get("id"),
        tenant: row.get("tenant"),
        activity_id: row.get("activity_id"),
        kind: ActivityKind::parse(&kind).ok_or_else(|| anyhow!("unknown activity kind {kind}"))?,
        course_id: row.get("course_id"),
        status: QueueStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown queue status {status}"))?,
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
        last_error: row.try_get("last_error").ok(),
        result: row.try_get("result").ok(),
        requested_by: row.try_get("requested_by").ok(),
        due_at: row.get("due_at"),
        created_at: row.get("created_at"),
        started_at: row.try_get("started_at").ok(),
        completed_at: row.try_get("completed_at").ok(),
    })
}

/// Retention cleanup: deletes only old completed rows. Pending, processing
/// and failed entries are never touched here.
#[instrument(skip_all)]
pub async fn cleanup_completed(pool: &Pool, retain_hours: u32) -> Result<u64> {
    let done = sqlx::query(
        "DELETE FROM queue_entries \
         WHERE status = 'completed' \
           AND datetime(completed_at) <= datetime('now', '-' || ? || ' hours')",
    )
    .bind(retain_hours as i64)
    .execute(pool)
    .await?;
    Ok(done.rows_affected())
}

// ---------------------------------------------------------------------------
// batch_jobs

#[instrument(skip_all)]
pub async fn insert_batch_job(
    pool: &Pool,
    run_id: Uuid,
    trigger: RunTrigger,
    tenants_total: i64,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO batch_jobs (run_id, trigger_kind, tenants_total) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(run_id.to_string())
    .bind(trigger.as_str())
    .bind(tenants_total)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JobCounters {
    pub tenants_synced: i64,
    pub items_marked: i64,
    pub entries_added: i64,
    pub entries_existing: i64,
    pub entries_cleaned: i64,
}

#[instrument(skip_all)]
pub async fn finalize_batch_job(
    pool: &Pool,
    id: i64,
    success: bool,
    counters: &JobCounters,
    errors: &[String],
    duration_ms: i64,
) -> Result<()> {
    let errors_json = serde_json::to_string(errors)?;
    sqlx::query(
        "UPDATE batch_jobs SET \
             finished_at = CURRENT_TIMESTAMP, \
             duration_ms = ?, \
             success = ?, \
             tenants_synced = ?, \
             items_marked = ?, \
             entries_added = ?, \
             entries_existing = ?, \
             entries_cleaned = ?, \
             errors = ? \
         WHERE id = ? AND finished_at IS NULL",
    )
    .bind(duration_ms)
    .bind(success)
    .bind(counters.tenants_synced)
    .bind(counters.items_marked)
    .bind(counters.entries_added)
    .bind(counters.entries_existing)
    .bind(counters.entries_cleaned)
    .bind(errors_json)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn delete_old_batch_jobs(pool: &Pool, retain_hours: u32) -> Result<u64> {
    let done = sqlx::query(
        "DELETE FROM batch_jobs \
         WHERE finished_at IS NOT NULL \
           AND datetime(finished_at) <= datetime('now', '-' || ? || ' hours')",
    )
    .bind(retain_hours as i64)
    .execute(pool)
    .await?;
    Ok(done.rows_affected())
}

pub async fn last_batch_job(pool: &Pool) -> Result<Option<crate::model::BatchJob>> {
    let row = sqlx::query(
        "SELECT id, run_id, trigger_kind, started_at, finished_at, duration_ms, success, \
                tenants_total, tenants_synced, items_marked, entries_added, entries_existing, \
                entries_cleaned, errors \
         FROM batch_jobs ORDER BY id DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;

    row.map(|row| {
        let run_id: String = row.get("run_id");
        let trigger: String = row.get("trigger_kind");
        let errors: String = row.get("errors");
        Ok(crate::model::BatchJob {
            id: row.get("id"),
            run_id: run_id.parse()?,
            trigger: match trigger.as_str() {
                "manual" => RunTrigger::Manual,
                _ => RunTrigger::Scheduled,
            },
            started_at: row.get("started_at"),
            finished_at: row.try_get("finished_at").ok(),
            duration_ms: row.try_get("duration_ms").ok(),
            success: row.try_get("success").ok(),
            tenants_total: row.get("tenants_total"),
            tenants_synced: row.get("tenants_synced"),
            items_marked: row.get("items_marked"),
            entries_added: row.get("entries_added"),
            entries_existing: row.get("entries_existing"),
            entries_cleaned: row.get("entries_cleaned"),
            errors: serde_json::from_str(&errors).unwrap_or_default(),
        })
    })
    .transpose()
}

// ---------------------------------------------------------------------------
// process_state

#[instrument(skip_all)]
pub async fn load_state_snapshot(pool: &Pool) -> Result<Option<String>> {
    let snapshot =
        sqlx::query_scalar::<_, String>("SELECT snapshot FROM process_state WHERE id = 1")
            .fetch_optional(pool)
            .await?;
    Ok(snapshot)
}

#[instrument(skip_all)]
pub async fn save_state_snapshot(pool: &Pool, snapshot: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO process_state (id, snapshot) VALUES (1, ?) \
         ON CONFLICT(id) DO UPDATE SET snapshot = excluded.snapshot, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(snapshot)
    .execute(pool)
    .await?;
    Ok(())
}

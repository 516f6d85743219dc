//! Flags persisted work items whose activity window is currently open.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::{info, instrument};

use crate::db;

/// Scans work items and sets `needs_analysis` on every visible item whose
/// `[open_at, close_at)` window contains the current instant. Idempotent: a
/// second pass with no elapsed time marks nothing.
#[derive(Clone)]
pub struct EligibilityMarker {
    pool: SqlitePool,
}

impl EligibilityMarker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Mark eligible items, optionally restricted to one tenant. Returns the
    /// number of items flagged. The underlying mutation is a single bulk
    /// statement, so a data-access failure leaves existing flags untouched.
    #[instrument(skip_all)]
    pub async fn mark_eligible(&self, scope: Option<&str>) -> Result<u64> {
        let marked = db::mark_eligible(&self.pool, scope).await?;
        if marked > 0 {
            info!(marked, tenant = scope.unwrap_or("*"), "flagged items for analysis");
        }
        Ok(marked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::WorkItemUpsert;
    use crate::model::ActivityKind;
    use chrono::{Duration, Utc};

    async fn setup_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn upsert(tenant: &str, activity_id: i64, visible: bool, open_h: i64, close_h: i64) -> WorkItemUpsert {
        let now = Utc::now();
        WorkItemUpsert {
            tenant: tenant.into(),
            course_id: 1,
            activity_id,
            kind: ActivityKind::Discussion,
            title: None,
            visible,
            open_at: Some(now + Duration::hours(open_h)),
            close_at: Some(now + Duration::hours(close_h)),
        }
    }

    #[tokio::test]
    async fn marks_only_items_inside_window() {
        let pool = setup_pool().await;
        let marker = EligibilityMarker::new(pool.clone());

        // open an hour ago, closes in an hour
        db::upsert_work_item(&pool, &upsert("t1", 1, true, -1, 1))
            .await
            .unwrap();
        // already closed
        db::upsert_work_item(&pool, &upsert("t1", 2, true, -3, -1))
            .await
            .unwrap();
        // not yet open
        db::upsert_work_item(&pool, &upsert("t1", 3, true, 1, 3))
            .await
            .unwrap();
        // in window but hidden
        db::upsert_work_item(&pool, &upsert("t1", 4, false, -1, 1))
            .await
            .unwrap();

        assert_eq!(marker.mark_eligible(None).await.unwrap(), 1);
        let item = db::find_work_item(&pool, "t1", 1, ActivityKind::Discussion)
            .await
            .unwrap()
            .unwrap();
        assert!(item.needs_analysis);
    }

    #[tokio::test]
    async fn second_pass_marks_nothing() {
        let pool = setup_pool().await;
        let marker = EligibilityMarker::new(pool.clone());
        db::upsert_work_item(&pool, &upsert("t1", 1, true, -1, 1))
            .await
            .unwrap();

        assert_eq!(marker.mark_eligible(None).await.unwrap(), 1);
        assert_eq!(marker.mark_eligible(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn scope_restricts_to_one_tenant() {
        let pool = setup_pool().await;
        let marker = EligibilityMarker::new(pool.clone());
        db::upsert_work_item(&pool, &upsert("t1", 1, true, -1, 1))
            .await
            .unwrap();
        db::upsert_work_item(&pool, &upsert("t2", 1, true, -1, 1))
            .await
            .unwrap();

        assert_eq!(marker.mark_eligible(Some("t2")).await.unwrap(), 1);
        let untouched = db::find_work_item(&pool, "t1", 1, ActivityKind::Discussion)
            .await
            .unwrap()
            .unwrap();
        assert!(!untouched.needs_analysis);
    }

    #[tokio::test]
    async fn unbounded_sides_count_as_open() {
        let pool = setup_pool().await;
        let marker = EligibilityMarker::new(pool.clone());
        let mut item = upsert("t1", 9, true, -1, 1);
        item.open_at = None;
        item.close_at = None;
        db::upsert_work_item(&pool, &item).await.unwrap();

        assert_eq!(marker.mark_eligible(None).await.unwrap(), 1);
    }
}

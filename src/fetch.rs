//! Pulls raw course and activity payloads from a tenant's source schema.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::sync::Arc;
use tracing::instrument;

use crate::config::Tenant;
use crate::model::ActivityKind;
use crate::tunnel::TunnelClient;

#[derive(Debug, Clone)]
pub struct CourseRecord {
    pub id: i64,
    pub name: String,
    pub visible: bool,
}

#[derive(Debug, Clone)]
pub struct ActivityRecord {
    pub activity_id: i64,
    pub course_id: i64,
    pub title: Option<String>,
    pub kind: ActivityKind,
    pub visible: bool,
    pub open_at: Option<DateTime<Utc>>,
    pub close_at: Option<DateTime<Utc>>,
}

/// Remote content access for one tenant. Kept behind a trait so tests and
/// alternative sources can stand in for the tunneled database.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch_courses(&self, tenant: &Tenant) -> Result<Vec<CourseRecord>>;
    async fn fetch_activities(&self, tenant: &Tenant) -> Result<Vec<ActivityRecord>>;
}

/// Fetcher reading a tenant's schema through the SSH tunnel. Schema names
/// are validated to a plain identifier alphabet at config load, which is
/// what makes splicing them into the statements safe.
pub struct SourceDbFetcher {
    tunnel: Arc<TunnelClient>,
}

impl SourceDbFetcher {
    pub fn new(tunnel: Arc<TunnelClient>) -> Self {
        Self { tunnel }
    }
}

#[async_trait]
impl ContentFetcher for SourceDbFetcher {
    #[instrument(skip_all, fields(tenant = %tenant.name))]
    async fn fetch_courses(&self, tenant: &Tenant) -> Result<Vec<CourseRecord>> {
        let sql = format!(
            "SELECT id, name, visible FROM {}.courses ORDER BY id",
            tenant.schema
        );
        let rows = self
            .tunnel
            .execute_query(&sql, &[])
            .await
            .with_context(|| format!("failed to fetch courses for tenant {}", tenant.name))?;

        Ok(rows
            .into_iter()
            .map(|row| CourseRecord {
                id: row.get("id"),
                name: row.get("name"),
                visible: row.get("visible"),
            })
            .collect())
    }

    #[instrument(skip_all, fields(tenant = %tenant.name))]
    async fn fetch_activities(&self, tenant: &Tenant) -> Result<Vec<ActivityRecord>> {
        let sql = format!(
            "SELECT id, course_id, name, module, visible, open_at, close_at \
             FROM {}.activities ORDER BY course_id, id",
            tenant.schema
        );
        let rows = self
            .tunnel
            .execute_query(&sql, &[])
            .await
            .with_context(|| format!("failed to fetch activities for tenant {}", tenant.name))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let module: String = row.get("module");
                ActivityRecord {
                    activity_id: row.get("id"),
                    course_id: row.get("course_id"),
                    title: row.try_get::<Option<String>, _>("name").ok().flatten(),
                    kind: ActivityKind::from_module(&module),
                    visible: row.get("visible"),
                    open_at: window_bound(row.try_get("open_at").unwrap_or(0)),
                    close_at: window_bound(row.try_get("close_at").unwrap_or(0)),
                }
            })
            .collect())
    }
}

/// Source schemas encode "no bound" as epoch 0.
fn window_bound(epoch: i64) -> Option<DateTime<Utc>> {
    if epoch <= 0 {
        return None;
    }
    DateTime::from_timestamp(epoch, 0)
}

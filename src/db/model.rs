//! Database view and write models used by repositories.
//!
//! Keep these structs focused on the data moved by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};

use crate::model::ActivityKind;

/// Write model for the sync step's work-item upsert. `needs_analysis` is
/// deliberately absent: syncing never touches the flag.
#[derive(Debug, Clone)]
pub struct WorkItemUpsert {
    pub tenant: String,
    pub course_id: i64,
    pub activity_id: i64,
    pub kind: ActivityKind,
    pub title: Option<String>,
    pub visible: bool,
    pub open_at: Option<DateTime<Utc>>,
    pub close_at: Option<DateTime<Utc>>,
}

/// Flagged work-item slice handed to the queue's enqueue step.
#[derive(Debug, Clone)]
pub struct ItemForQueue {
    pub course_id: i64,
    pub activity_id: i64,
    pub kind: ActivityKind,
    pub title: Option<String>,
}

/// Entry slice returned by an atomic claim; the consumer drives the
/// analysis call from this plus the matching work item.
#[derive(Debug, Clone)]
pub struct ClaimedEntry {
    pub id: i64,
    pub tenant: String,
    pub activity_id: i64,
    pub kind: ActivityKind,
    pub course_id: i64,
    pub attempts: i64,
    pub max_attempts: i64,
    pub requested_by: Option<String>,
}

/// Per-status queue totals for one tenant or the whole store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }

    pub fn in_progress(&self) -> bool {
        self.pending + self.processing > 0
    }
}

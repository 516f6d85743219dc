use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of analyzable content kinds. Source modules outside the set
/// map to `Other` so an unknown plugin never aborts a sync.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Assignment,
    Discussion,
    Quiz,
    Other,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Assignment => "assignment",
            ActivityKind::Discussion => "discussion",
            ActivityKind::Quiz => "quiz",
            ActivityKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "assignment" => Some(ActivityKind::Assignment),
            "discussion" => Some(ActivityKind::Discussion),
            "quiz" => Some(ActivityKind::Quiz),
            "other" => Some(ActivityKind::Other),
            _ => None,
        }
    }

    /// Map a source-side module name onto the closed kind set.
    pub fn from_module(module: &str) -> Self {
        match module {
            "assign" | "assignment" => ActivityKind::Assignment,
            "forum" | "discussion" => ActivityKind::Discussion,
            "quiz" => ActivityKind::Quiz,
            _ => ActivityKind::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "completed" => Some(QueueStatus::Completed),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Failed)
    }
}

/// How a batch run was started. Scheduled runs return once the queue is
/// loaded; manual runs drain the queue before returning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Manual => "manual",
        }
    }
}

/// One unit of tenant content eligible for analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub tenant: String,
    pub course_id: i64,
    pub activity_id: i64,
    pub kind: ActivityKind,
    pub title: Option<String>,
    pub visible: bool,
    pub open_at: Option<DateTime<Utc>>,
    pub close_at: Option<DateTime<Utc>>,
    pub needs_analysis: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable lifecycle record for one work item's analysis attempts. Exactly
/// one row exists per (tenant, activity_id, kind).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub tenant: String,
    pub activity_id: i64,
    pub kind: ActivityKind,
    pub course_id: i64,
    pub status: QueueStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub last_error: Option<String>,
    pub result: Option<String>,
    pub requested_by: Option<String>,
    pub due_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Persisted record of one orchestrated run, finalized exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: i64,
    pub run_id: Uuid,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub success: Option<bool>,
    pub tenants_total: i64,
    pub tenants_synced: i64,
    pub items_marked: i64,
    pub entries_added: i64,
    pub entries_existing: i64,
    pub entries_cleaned: i64,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips() {
        for kind in [
            ActivityKind::Assignment,
            ActivityKind::Discussion,
            ActivityKind::Quiz,
            ActivityKind::Other,
        ] {
            assert_eq!(ActivityKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ActivityKind::parse("poll"), None);
    }

    #[test]
    fn module_names_map_into_closed_set() {
        assert_eq!(ActivityKind::from_module("assign"), ActivityKind::Assignment);
        assert_eq!(ActivityKind::from_module("forum"), ActivityKind::Discussion);
        assert_eq!(ActivityKind::from_module("quiz"), ActivityKind::Quiz);
        assert_eq!(ActivityKind::from_module("wiki"), ActivityKind::Other);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!QueueStatus::Pending.is_terminal());
        assert!(!QueueStatus::Processing.is_terminal());
        assert!(QueueStatus::Completed.is_terminal());
        assert!(QueueStatus::Failed.is_terminal());
        assert_eq!(QueueStatus::parse("processing"), Some(QueueStatus::Processing));
        assert_eq!(QueueStatus::parse("done"), None);
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::checkpoint::Checkpoint;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Complete,
    Partial,
    CaughtUp,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Complete => "complete",
            RunStatus::Partial => "partial",
            RunStatus::CaughtUp => "caught_up",
            RunStatus::Failed => "failed",
        }
    }
}

/// Audit record for one Scanner execution on one thread.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestRun {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub status: RunStatus,
    pub items_new: u32,
    pub items_duplicate: u32,
    pub items_failed: u32,
    pub pages_scanned: u32,
    pub checkpoint_before: Option<Checkpoint>,
    pub checkpoint_after: Option<Checkpoint>,
    pub error_summary: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl IngestRun {
    pub fn start(thread_id: Uuid, checkpoint_before: Checkpoint) -> Self {
        Self {
            id: Uuid::new_v4(),
            thread_id,
            status: RunStatus::Running,
            items_new: 0,
            items_duplicate: 0,
            items_failed: 0,
            pages_scanned: 0,
            checkpoint_before: Some(checkpoint_before),
            checkpoint_after: None,
            error_summary: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

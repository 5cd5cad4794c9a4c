use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchUpReason {
    PageCap,
    Timeout,
    Error,
}

/// Partial-run resume marker, saved when a scan is truncated by time or
/// item caps. `catch_up_cursor == None` after any run that reached the
/// checkpoint or exhausted all pages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatchUpCursor {
    pub current_page: i64,
    pub started_at: DateTime<Utc>,
    pub items_ingested: u32,
    pub reason: CatchUpReason,
}

/// Persistent cursor recording the newest item seen for a thread. One per
/// thread, sharing the thread's lifecycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: Uuid,
    pub last_seen_item_id: Option<String>,
    pub last_seen_fingerprint: Option<String>,
    pub last_seen_timestamp: Option<DateTime<Utc>>,
    pub last_seen_page: Option<i64>,
    pub catch_up_cursor: Option<CatchUpCursor>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl Checkpoint {
    pub fn fresh(thread_id: Uuid) -> Self {
        Self {
            thread_id,
            last_seen_item_id: None,
            last_seen_fingerprint: None,
            last_seen_timestamp: None,
            last_seen_page: None,
            catch_up_cursor: None,
            last_run_at: None,
            last_success_at: None,
            consecutive_failures: 0,
        }
    }

    /// `starting_page` from spec.md §4.6: the catch-up cursor's page if
    /// present, else `None` — a three-valued signal the caller must honor
    /// (resume-at-page / start-at-latest).
    pub fn starting_page(&self) -> Option<i64> {
        self.catch_up_cursor.as_ref().map(|c| c.current_page)
    }

    /// True iff the checkpoint has never seen anything — everything
    /// compares as `New` in this state (spec.md §4.6).
    pub fn is_empty(&self) -> bool {
        self.last_seen_item_id.is_none()
            && self.last_seen_fingerprint.is_none()
            && self.last_seen_timestamp.is_none()
    }
}

/// One-minute clock-skew tolerance applied when comparing item timestamps
/// against the checkpoint (spec.md §4.6).
pub const CLOCK_SKEW_TOLERANCE: chrono::Duration = chrono::Duration::seconds(60);

pub const FAILURE_COOLDOWN: chrono::Duration = chrono::Duration::minutes(60);

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A specific feed within a source: a subreddit, a user gallery, a board
/// path. `(source_id, external_id)` is unique.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Thread {
    pub id: Uuid,
    pub source_id: Uuid,
    pub external_id: String,
    pub url: String,
    pub priority: u8,
    pub enabled: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Thread {
    pub fn is_active(&self) -> bool {
        self.enabled && self.deleted_at.is_none()
    }
}

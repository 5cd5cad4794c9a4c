use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use super::scraped_item::MediaType;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MediaUrls {
    pub original: String,
    pub thumbnail: Option<String>,
    pub cdn_original: Option<String>,
    pub cdn_thumbnail: Option<String>,
}

/// Persisted record. `(thread_id, external_item_id)` and
/// `(thread_id, fingerprint)` are both unique. Engagement counters and
/// moderation flags are owned by the read side — the engine populates them
/// with defaults on insert and never overwrites them on re-ingest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub external_item_id: String,
    pub fingerprint: String,
    pub permalink: String,
    pub posted_at: DateTime<Utc>,
    pub author: String,
    pub title: Option<String>,
    pub caption: Option<String>,
    pub media_type: MediaType,
    pub media_urls: MediaUrls,
    pub duration_ms: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Child of a media item, cascade-deleted with it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediaAsset {
    pub id: Uuid,
    pub media_item_id: Uuid,
    pub position: i32,
    pub url: String,
    pub media_type: MediaType,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_ms: Option<u64>,
}

/// Tombstone preventing re-ingestion of admin-deleted content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockedMedia {
    pub thread_id: Uuid,
    pub external_item_id: String,
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Image,
    Gif,
    Video,
    Unknown,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Gif => "gif",
            MediaType::Video => "video",
            MediaType::Unknown => "unknown",
        }
    }
}

/// One asset inside a gallery post: child of a primary scraped item.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScrapedAsset {
    pub url: String,
    pub media_type: MediaType,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Per-source engagement counters as reported by the origin at scan time.
/// The engine never writes these back onto an already-persisted item — see
/// spec.md §3 "Ownership".
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SourceMetrics {
    pub upvotes: Option<i64>,
    pub comments: Option<i64>,
    pub views: Option<i64>,
}

/// Transient adapter output — one scraped post/gallery-item before
/// deduplication and persistence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScrapedItem {
    pub external_id: String,
    pub permalink: String,
    pub posted_at: DateTime<Utc>,
    pub author: String,
    pub author_url: Option<String>,
    pub title: Option<String>,
    pub caption: Option<String>,
    pub media_type: MediaType,
    pub media_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub duration_ms: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub assets: Vec<ScrapedAsset>,
    pub tags: Vec<String>,
    pub source_metrics: Option<SourceMetrics>,
}

impl ScrapedItem {
    /// Validation from spec.md §4.7: excludes items without a media URL,
    /// items of unknown media type, videos/gifs with an out-of-range
    /// duration, and items older than `max_item_age_ms` when that limit is
    /// active.
    pub fn is_valid(&self, max_duration_ms: u64, max_item_age_ms: u64, now: DateTime<Utc>) -> bool {
        if self.media_url.is_none() {
            return false;
        }
        if matches!(self.media_type, MediaType::Unknown) {
            return false;
        }
        if matches!(self.media_type, MediaType::Video | MediaType::Gif) {
            if let Some(d) = self.duration_ms {
                if d == 0 || d > max_duration_ms {
                    return false;
                }
            }
        }
        if max_item_age_ms > 0 {
            let age_ms = (now - self.posted_at).num_milliseconds();
            if age_ms < 0 {
                // future-dated items are never rejected for age
            } else if age_ms as u64 > max_item_age_ms {
                return false;
            }
        }
        true
    }
}

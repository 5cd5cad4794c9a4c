//! C6 — Checkpoint Store: load/save per-thread cursor and failure counters
//! (spec.md §4.6).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::domain::checkpoint::{CLOCK_SKEW_TOLERANCE, FAILURE_COOLDOWN};
use crate::domain::{CatchUpCursor, CatchUpReason, Checkpoint, ScrapedItem};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SeenBy {
    Id,
    Fingerprint,
    Timestamp,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompareStatus {
    New,
    Seen(SeenBy),
    Older,
}

/// Priority: external-id match, then fingerprint match, then timestamp
/// comparison with a one-minute clock-skew tolerance. If all three
/// checkpoint fields are null, everything is `New`.
pub fn compare(
    external_id: &str,
    fingerprint: &str,
    posted_at: DateTime<Utc>,
    checkpoint: &Checkpoint,
) -> CompareStatus {
    if checkpoint.is_empty() {
        return CompareStatus::New;
    }
    if let Some(last_id) = &checkpoint.last_seen_item_id {
        if last_id == external_id {
            return CompareStatus::Seen(SeenBy::Id);
        }
    }
    if let Some(last_fp) = &checkpoint.last_seen_fingerprint {
        if last_fp == fingerprint {
            return CompareStatus::Seen(SeenBy::Fingerprint);
        }
    }
    if let Some(last_ts) = checkpoint.last_seen_timestamp {
        if posted_at <= last_ts - CLOCK_SKEW_TOLERANCE {
            return CompareStatus::Older;
        }
    }
    CompareStatus::New
}

/// `should_skip_due_to_failures`: true iff `consecutive_failures >= max`
/// and `last_run_at` is within the last 60 minutes; older auto-unblocks.
pub fn should_skip_due_to_failures(checkpoint: &Checkpoint, max: u32, now: DateTime<Utc>) -> bool {
    if checkpoint.consecutive_failures < max {
        return false;
    }
    match checkpoint.last_run_at {
        Some(last_run) => now - last_run < FAILURE_COOLDOWN,
        None => false,
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, thread_id: Uuid) -> anyhow::Result<Option<Checkpoint>>;
    async fn get_or_create(&self, thread_id: Uuid) -> anyhow::Result<Checkpoint>;

    async fn update_success(&self, thread_id: Uuid, newest_item: &ScrapedItem, fingerprint: &str, page_number: i64) -> anyhow::Result<()>;
    async fn save_catch_up(&self, thread_id: Uuid, page: i64, items_ingested: u32, reason: CatchUpReason) -> anyhow::Result<()>;
    async fn update_failure(&self, thread_id: Uuid) -> anyhow::Result<u32>;
    async fn clear_catch_up(&self, thread_id: Uuid) -> anyhow::Result<()>;
    async fn reset_failures(&self, thread_id: Uuid) -> anyhow::Result<()>;
}

/// In-memory implementation used by tests and by the Scanner's own unit
/// tests — production wiring uses [`crate::persistence::postgres::PostgresCheckpointStore`].
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: DashMap<Uuid, Checkpoint>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, checkpoint: Checkpoint) {
        self.checkpoints.insert(checkpoint.thread_id, checkpoint);
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, thread_id: Uuid) -> anyhow::Result<Option<Checkpoint>> {
        Ok(self.checkpoints.get(&thread_id).map(|c| c.clone()))
    }

    async fn get_or_create(&self, thread_id: Uuid) -> anyhow::Result<Checkpoint> {
        Ok(self.checkpoints.entry(thread_id).or_insert_with(|| Checkpoint::fresh(thread_id)).clone())
    }

    async fn update_success(&self, thread_id: Uuid, newest_item: &ScrapedItem, fingerprint: &str, page_number: i64) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut entry = self.checkpoints.entry(thread_id).or_insert_with(|| Checkpoint::fresh(thread_id));
        entry.last_seen_item_id = Some(newest_item.external_id.clone());
        entry.last_seen_fingerprint = Some(fingerprint.to_string());
        entry.last_seen_timestamp = Some(newest_item.posted_at);
        entry.last_seen_page = Some(page_number);
        entry.catch_up_cursor = None;
        entry.last_success_at = Some(now);
        entry.last_run_at = Some(now);
        entry.consecutive_failures = 0;
        Ok(())
    }

    async fn save_catch_up(&self, thread_id: Uuid, page: i64, items_ingested: u32, reason: CatchUpReason) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut entry = self.checkpoints.entry(thread_id).or_insert_with(|| Checkpoint::fresh(thread_id));
        entry.catch_up_cursor = Some(CatchUpCursor { current_page: page, started_at: now, items_ingested, reason });
        entry.last_run_at = Some(now);
        Ok(())
    }

    async fn update_failure(&self, thread_id: Uuid) -> anyhow::Result<u32> {
        let mut entry = self.checkpoints.entry(thread_id).or_insert_with(|| Checkpoint::fresh(thread_id));
        entry.consecutive_failures += 1;
        entry.last_run_at = Some(Utc::now());
        Ok(entry.consecutive_failures)
    }

    async fn clear_catch_up(&self, thread_id: Uuid) -> anyhow::Result<()> {
        if let Some(mut entry) = self.checkpoints.get_mut(&thread_id) {
            entry.catch_up_cursor = None;
        }
        Ok(())
    }

    async fn reset_failures(&self, thread_id: Uuid) -> anyhow::Result<()> {
        if let Some(mut entry) = self.checkpoints.get_mut(&thread_id) {
            entry.consecutive_failures = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn item(external_id: &str, posted_at: DateTime<Utc>) -> ScrapedItem {
        ScrapedItem {
            external_id: external_id.to_string(),
            permalink: "https://example.com/p".to_string(),
            posted_at,
            author: "alice".to_string(),
            author_url: None,
            title: None,
            caption: None,
            media_type: crate::domain::MediaType::Image,
            media_url: Some("https://example.com/a.jpg".to_string()),
            thumbnail_url: None,
            duration_ms: None,
            width: None,
            height: None,
            assets: vec![],
            tags: vec![],
            source_metrics: None,
        }
    }

    #[test]
    fn empty_checkpoint_everything_is_new() {
        let cp = Checkpoint::fresh(Uuid::new_v4());
        let now = Utc::now();
        assert_eq!(compare("x", "fp", now, &cp), CompareStatus::New);
    }

    #[test]
    fn matches_by_external_id_first() {
        let mut cp = Checkpoint::fresh(Uuid::new_v4());
        cp.last_seen_item_id = Some("A".to_string());
        cp.last_seen_fingerprint = Some("other-fp".to_string());
        assert_eq!(compare("A", "fp", Utc::now(), &cp), CompareStatus::Seen(SeenBy::Id));
    }

    #[test]
    fn matches_by_fingerprint_when_id_differs() {
        let mut cp = Checkpoint::fresh(Uuid::new_v4());
        cp.last_seen_item_id = Some("B".to_string());
        cp.last_seen_fingerprint = Some("fp".to_string());
        assert_eq!(compare("A", "fp", Utc::now(), &cp), CompareStatus::Seen(SeenBy::Fingerprint));
    }

    #[test]
    fn older_when_timestamp_beyond_skew_tolerance() {
        let mut cp = Checkpoint::fresh(Uuid::new_v4());
        let ts = Utc::now();
        cp.last_seen_timestamp = Some(ts);
        cp.last_seen_item_id = Some("unrelated".to_string());
        let older_item_ts = ts - ChronoDuration::seconds(120);
        assert_eq!(compare("A", "fp", older_item_ts, &cp), CompareStatus::Older);
    }

    #[test]
    fn within_skew_tolerance_is_new() {
        let mut cp = Checkpoint::fresh(Uuid::new_v4());
        let ts = Utc::now();
        cp.last_seen_timestamp = Some(ts);
        cp.last_seen_item_id = Some("unrelated".to_string());
        let near_ts = ts - ChronoDuration::seconds(30);
        assert_eq!(compare("A", "fp", near_ts, &cp), CompareStatus::New);
    }

    #[tokio::test]
    async fn update_success_clears_catch_up_and_resets_failures() {
        let store = InMemoryCheckpointStore::new();
        let thread_id = Uuid::new_v4();
        store.update_failure(thread_id).await.unwrap();
        store.save_catch_up(thread_id, 3, 10, CatchUpReason::PageCap).await.unwrap();

        let newest = item("Z", Utc::now());
        store.update_success(thread_id, &newest, "fp-z", 1).await.unwrap();

        let cp = store.load(thread_id).await.unwrap().unwrap();
        assert!(cp.catch_up_cursor.is_none());
        assert_eq!(cp.consecutive_failures, 0);
        assert_eq!(cp.last_seen_item_id, Some("Z".to_string()));
    }

    #[tokio::test]
    async fn skip_due_to_failures_auto_unblocks_after_cooldown() {
        let mut cp = Checkpoint::fresh(Uuid::new_v4());
        cp.consecutive_failures = 5;
        cp.last_run_at = Some(Utc::now() - ChronoDuration::minutes(90));
        assert!(!should_skip_due_to_failures(&cp, 5, Utc::now()));

        cp.last_run_at = Some(Utc::now() - ChronoDuration::minutes(10));
        assert!(should_skip_due_to_failures(&cp, 5, Utc::now()));
    }
}

//! C8 — Persistence: idempotent item commit and the optional CDN
//! pre-cache sink (spec.md §4.8).

pub mod cdn;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::ScrapedItem;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CommitCounters {
    pub inserted: u32,
    pub duplicates: u32,
    pub failed: u32,
}

impl std::ops::AddAssign for CommitCounters {
    fn add_assign(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.failed += other.failed;
    }
}

/// `(item, fingerprint)` pairs produced by the Scanner, committed one at a
/// time with independent failure (spec.md §4.8) — one item erroring never
/// aborts the rest of the batch.
#[async_trait]
pub trait MediaPersistence: Send + Sync {
    async fn commit_items(&self, thread_id: Uuid, items: &[(ScrapedItem, String)]) -> anyhow::Result<CommitCounters>;
}

//! Postgres-backed checkpoint store and media persistence — the
//! production implementations behind [`crate::checkpoint_store::CheckpointStore`]
//! and [`super::MediaPersistence`] (spec.md §4.6, §4.8).

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::checkpoint_store::CheckpointStore;
use crate::domain::checkpoint::{CatchUpCursor, CatchUpReason};
use crate::domain::{Checkpoint, IngestRun, ScrapedItem};
use crate::ingest_run_store::IngestRunStore;
use crate::persistence::{CommitCounters, MediaPersistence};

pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_checkpoint(row: &sqlx::postgres::PgRow) -> Checkpoint {
        let catch_up_page: Option<i64> = row.get("catch_up_page");
        let catch_up_cursor = catch_up_page.map(|page| CatchUpCursor {
            current_page: page,
            started_at: row.get("catch_up_started_at"),
            items_ingested: row.get::<i32, _>("catch_up_items_ingested") as u32,
            reason: match row.get::<String, _>("catch_up_reason").as_str() {
                "timeout" => CatchUpReason::Timeout,
                "error" => CatchUpReason::Error,
                _ => CatchUpReason::PageCap,
            },
        });

        Checkpoint {
            thread_id: row.get("thread_id"),
            last_seen_item_id: row.get("last_seen_item_id"),
            last_seen_fingerprint: row.get("last_seen_fingerprint"),
            last_seen_timestamp: row.get("last_seen_timestamp"),
            last_seen_page: row.get("last_seen_page"),
            catch_up_cursor,
            last_run_at: row.get("last_run_at"),
            last_success_at: row.get("last_success_at"),
            consecutive_failures: row.get::<i32, _>("consecutive_failures") as u32,
        }
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn load(&self, thread_id: Uuid) -> anyhow::Result<Option<Checkpoint>> {
        let row = sqlx::query("SELECT * FROM checkpoints WHERE thread_id = $1")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load checkpoint: {e}"))?;
        Ok(row.as_ref().map(Self::row_to_checkpoint))
    }

    async fn get_or_create(&self, thread_id: Uuid) -> anyhow::Result<Checkpoint> {
        if let Some(existing) = self.load(thread_id).await? {
            return Ok(existing);
        }
        sqlx::query("INSERT INTO checkpoints (thread_id) VALUES ($1) ON CONFLICT (thread_id) DO NOTHING")
            .bind(thread_id)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("failed to create checkpoint: {e}"))?;
        Ok(self.load(thread_id).await?.unwrap_or_else(|| Checkpoint::fresh(thread_id)))
    }

    async fn update_success(&self, thread_id: Uuid, newest_item: &ScrapedItem, fingerprint: &str, page_number: i64) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE checkpoints SET
                last_seen_item_id = $2,
                last_seen_fingerprint = $3,
                last_seen_timestamp = $4,
                last_seen_page = $5,
                catch_up_page = NULL,
                catch_up_started_at = NULL,
                catch_up_items_ingested = NULL,
                catch_up_reason = NULL,
                last_success_at = now(),
                last_run_at = now(),
                consecutive_failures = 0
             WHERE thread_id = $1",
        )
        .bind(thread_id)
        .bind(&newest_item.external_id)
        .bind(fingerprint)
        .bind(newest_item.posted_at)
        .bind(page_number)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("failed to update checkpoint success: {e}"))?;
        Ok(())
    }

    async fn save_catch_up(&self, thread_id: Uuid, page: i64, items_ingested: u32, reason: CatchUpReason) -> anyhow::Result<()> {
        let reason_str = match reason {
            CatchUpReason::PageCap => "page_cap",
            CatchUpReason::Timeout => "timeout",
            CatchUpReason::Error => "error",
        };
        sqlx::query(
            "UPDATE checkpoints SET
                catch_up_page = $2,
                catch_up_started_at = now(),
                catch_up_items_ingested = $3,
                catch_up_reason = $4,
                last_run_at = now()
             WHERE thread_id = $1",
        )
        .bind(thread_id)
        .bind(page)
        .bind(items_ingested as i32)
        .bind(reason_str)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("failed to save catch-up cursor: {e}"))?;
        Ok(())
    }

    async fn update_failure(&self, thread_id: Uuid) -> anyhow::Result<u32> {
        let row = sqlx::query(
            "UPDATE checkpoints SET consecutive_failures = consecutive_failures + 1, last_run_at = now()
             WHERE thread_id = $1 RETURNING consecutive_failures",
        )
        .bind(thread_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("failed to record checkpoint failure: {e}"))?;
        Ok(row.get::<i32, _>("consecutive_failures") as u32)
    }

    async fn clear_catch_up(&self, thread_id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE checkpoints SET catch_up_page = NULL, catch_up_started_at = NULL,
                catch_up_items_ingested = NULL, catch_up_reason = NULL
             WHERE thread_id = $1",
        )
        .bind(thread_id)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("failed to clear catch-up cursor: {e}"))?;
        Ok(())
    }

    async fn reset_failures(&self, thread_id: Uuid) -> anyhow::Result<()> {
        sqlx::query("UPDATE checkpoints SET consecutive_failures = 0 WHERE thread_id = $1")
            .bind(thread_id)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("failed to reset checkpoint failures: {e}"))?;
        Ok(())
    }
}

pub struct PostgresIngestRunStore {
    pool: PgPool,
}

impl PostgresIngestRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IngestRunStore for PostgresIngestRunStore {
    async fn start(&self, run: &IngestRun) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO ingest_runs (
                id, thread_id, status, items_new, items_duplicate, items_failed,
                pages_scanned, checkpoint_before, checkpoint_after, error_summary,
                started_at, finished_at
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(run.id)
        .bind(run.thread_id)
        .bind(run.status.as_str())
        .bind(run.items_new as i32)
        .bind(run.items_duplicate as i32)
        .bind(run.items_failed as i32)
        .bind(run.pages_scanned as i32)
        .bind(run.checkpoint_before.as_ref().map(|c| sqlx::types::Json(c.clone())))
        .bind(run.checkpoint_after.as_ref().map(|c| sqlx::types::Json(c.clone())))
        .bind(&run.error_summary)
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("failed to insert ingest run: {e}"))?;
        Ok(())
    }

    async fn finish(&self, run: &IngestRun) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE ingest_runs SET
                status = $2,
                items_new = $3,
                items_duplicate = $4,
                items_failed = $5,
                pages_scanned = $6,
                checkpoint_after = $7,
                error_summary = $8,
                finished_at = $9
             WHERE id = $1",
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(run.items_new as i32)
        .bind(run.items_duplicate as i32)
        .bind(run.items_failed as i32)
        .bind(run.pages_scanned as i32)
        .bind(run.checkpoint_after.as_ref().map(|c| sqlx::types::Json(c.clone())))
        .bind(&run.error_summary)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("failed to finalize ingest run: {e}"))?;
        Ok(())
    }
}

const COMMIT_DURATION_CAP_MS: u64 = 30_000;

pub struct PostgresMediaPersistence {
    pool: PgPool,
    cdn: Option<super::cdn::CdnSink>,
}

impl PostgresMediaPersistence {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, cdn: None }
    }

    pub fn with_cdn(pool: PgPool, cdn: super::cdn::CdnSink) -> Self {
        Self { pool, cdn: Some(cdn) }
    }

    /// Fire-and-log: CDN failures never fail the item commit they're
    /// attached to (spec.md §4.8).
    async fn precache(&self, media_item_id: Uuid, item: &ScrapedItem) {
        let Some(cdn) = &self.cdn else { return };

        let cdn_original = match &item.media_url {
            Some(url) => match cdn.precache(media_item_id, super::cdn::Variant::Original, url).await {
                Ok(cdn_url) => Some(cdn_url),
                Err(e) => {
                    tracing::warn!(media_item_id = %media_item_id, error = %e, "cdn pre-cache of original failed");
                    None
                }
            },
            None => None,
        };

        let cdn_thumbnail = match &item.thumbnail_url {
            Some(url) => match cdn.precache(media_item_id, super::cdn::Variant::Thumbnail, url).await {
                Ok(cdn_url) => Some(cdn_url),
                Err(e) => {
                    tracing::warn!(media_item_id = %media_item_id, error = %e, "cdn pre-cache of thumbnail failed");
                    None
                }
            },
            None => None,
        };

        if cdn_original.is_some() || cdn_thumbnail.is_some() {
            if let Err(e) = self.merge_cdn_urls(media_item_id, cdn_original.as_deref(), cdn_thumbnail.as_deref()).await {
                tracing::warn!(media_item_id = %media_item_id, error = %e, "failed to persist cdn urls");
            }
        }
    }

    async fn is_blocked(&self, thread_id: Uuid, external_item_id: &str) -> anyhow::Result<bool> {
        let row = sqlx::query("SELECT 1 FROM blocked_media WHERE thread_id = $1 AND external_item_id = $2")
            .bind(thread_id)
            .bind(external_item_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("failed to check block list: {e}"))?;
        Ok(row.is_some())
    }

    async fn upsert_item(&self, thread_id: Uuid, item: &ScrapedItem, fingerprint: &str) -> anyhow::Result<Option<Uuid>> {
        let media_urls = crate::domain::MediaUrls {
            original: item.media_url.clone().unwrap_or_default(),
            thumbnail: item.thumbnail_url.clone(),
            cdn_original: None,
            cdn_thumbnail: None,
        };

        let row = sqlx::query(
            "INSERT INTO media_items (
                id, thread_id, external_item_id, fingerprint, permalink, posted_at, author,
                title, caption, media_type, media_urls, duration_ms, width, height,
                tags, created_at, updated_at
             ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, now(), now()
             )
             ON CONFLICT (thread_id, external_item_id) DO NOTHING
             RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(thread_id)
        .bind(&item.external_id)
        .bind(fingerprint)
        .bind(&item.permalink)
        .bind(item.posted_at)
        .bind(&item.author)
        .bind(&item.title)
        .bind(&item.caption)
        .bind(item.media_type.as_str())
        .bind(sqlx::types::Json(media_urls))
        .bind(item.duration_ms.map(|d| d as i64))
        .bind(item.width.map(|w| w as i32))
        .bind(item.height.map(|h| h as i32))
        .bind(&item.tags)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("failed to upsert media item: {e}"))?;

        Ok(row.map(|r| r.get::<Uuid, _>("id")))
    }

    /// JSON-merge updates `media_urls` with `{cdn_original, cdn_thumbnail}`
    /// once the CDN sink has uploaded a variant — never overwrites
    /// `original`/`thumbnail` (spec.md §4.8).
    async fn merge_cdn_urls(&self, media_item_id: Uuid, cdn_original: Option<&str>, cdn_thumbnail: Option<&str>) -> anyhow::Result<()> {
        let patch = serde_json::json!({
            "cdn_original": cdn_original,
            "cdn_thumbnail": cdn_thumbnail,
        });
        sqlx::query("UPDATE media_items SET media_urls = media_urls || $2::jsonb, updated_at = now() WHERE id = $1")
            .bind(media_item_id)
            .bind(patch)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("failed to merge cdn urls: {e}"))?;
        Ok(())
    }

    async fn insert_assets(&self, media_item_id: Uuid, item: &ScrapedItem) -> anyhow::Result<()> {
        for (position, asset) in item.assets.iter().enumerate() {
            sqlx::query(
                "INSERT INTO media_assets (id, media_item_id, position, url, media_type, width, height, duration_ms)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (media_item_id, url) DO NOTHING",
            )
            .bind(Uuid::new_v4())
            .bind(media_item_id)
            .bind(position as i32)
            .bind(&asset.url)
            .bind(asset.media_type.as_str())
            .bind(asset.width.map(|w| w as i32))
            .bind(asset.height.map(|h| h as i32))
            .bind(None::<i64>)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("failed to insert media asset: {e}"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl MediaPersistence for PostgresMediaPersistence {
    async fn commit_items(&self, thread_id: Uuid, items: &[(ScrapedItem, String)]) -> anyhow::Result<CommitCounters> {
        let mut counters = CommitCounters::default();

        for (item, fingerprint) in items {
            let result = self.commit_one(thread_id, item, fingerprint).await;
            match result {
                Ok(CommitResult::Inserted) => counters.inserted += 1,
                Ok(CommitResult::Duplicate) => counters.duplicates += 1,
                Err(e) => {
                    tracing::warn!(thread_id = %thread_id, external_id = %item.external_id, error = %e, "failed to commit item");
                    counters.failed += 1;
                }
            }
        }

        Ok(counters)
    }
}

enum CommitResult {
    Inserted,
    Duplicate,
}

impl PostgresMediaPersistence {
    /// One item, independent failure: blocklist and duration-cap skips
    /// count as duplicates per spec.md §4.8; everything else propagates as
    /// an error for the caller to count as `failed`.
    async fn commit_one(&self, thread_id: Uuid, item: &ScrapedItem, fingerprint: &str) -> anyhow::Result<CommitResult> {
        if self.is_blocked(thread_id, &item.external_id).await? {
            return Ok(CommitResult::Duplicate);
        }

        if matches!(item.media_type, crate::domain::MediaType::Video | crate::domain::MediaType::Gif) {
            if item.duration_ms.map(|d| d > COMMIT_DURATION_CAP_MS).unwrap_or(false) {
                return Ok(CommitResult::Duplicate);
            }
        }

        let inserted_id = self.upsert_item(thread_id, item, fingerprint).await?;
        let Some(media_item_id) = inserted_id else {
            return Ok(CommitResult::Duplicate);
        };

        self.insert_assets(media_item_id, item).await?;
        self.precache(media_item_id, item).await;
        Ok(CommitResult::Inserted)
    }
}

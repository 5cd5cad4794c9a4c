//! Source/thread configuration repositories. Loading and writing `Source`/
//! `Thread` rows is out of scope for the ingestion engine's own spec (owned
//! by the admin surface), but the Scheduler's poller still needs to read
//! them to build its job list.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::domain::{AdapterConfig, AdapterKind, RateLimitConfig, Source, Thread};

#[async_trait]
pub trait SourceRepository: Send + Sync {
    async fn find(&self, id: Uuid) -> anyhow::Result<Option<Source>>;
    async fn find_enabled(&self) -> anyhow::Result<Vec<Source>>;
}

#[async_trait]
pub trait ThreadRepository: Send + Sync {
    /// All `(source, thread)` pairs where both are enabled and
    /// `thread.deleted_at is null`, ordered by `thread.priority` descending
    /// (spec.md §4.9).
    async fn active_pairs(&self) -> anyhow::Result<Vec<(Source, Thread)>>;
    async fn find(&self, id: Uuid) -> anyhow::Result<Option<Thread>>;
}

pub struct PostgresSourceRepository {
    pool: PgPool,
}

impl PostgresSourceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_source(row: &sqlx::postgres::PgRow) -> anyhow::Result<Source> {
        let adapter_kind_str: String = row.get("adapter_kind");
        let adapter_kind = match adapter_kind_str.as_str() {
            "generic-html" => AdapterKind::GenericHtml,
            "reddit" => AdapterKind::Reddit,
            "redgifs" => AdapterKind::RedGifs,
            other => anyhow::bail!("unknown adapter kind '{other}'"),
        };
        let rate_limit: sqlx::types::Json<RateLimitConfig> = row.try_get("rate_limit")?;
        let adapter_config: sqlx::types::Json<AdapterConfig> = row.try_get("adapter_config")?;

        Ok(Source {
            id: row.get("id"),
            base_url: row.get("base_url"),
            adapter_kind,
            rate_limit: rate_limit.0,
            adapter_config: adapter_config.0,
            user_agent: row.get("user_agent"),
            enabled: row.get("enabled"),
        })
    }
}

#[async_trait]
impl SourceRepository for PostgresSourceRepository {
    async fn find(&self, id: Uuid) -> anyhow::Result<Option<Source>> {
        let row = sqlx::query("SELECT * FROM sources WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load source: {e}"))?;
        row.as_ref().map(Self::row_to_source).transpose()
    }

    async fn find_enabled(&self) -> anyhow::Result<Vec<Source>> {
        let rows = sqlx::query("SELECT * FROM sources WHERE enabled = true")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("failed to list enabled sources: {e}"))?;
        rows.iter().map(Self::row_to_source).collect()
    }
}

pub struct PostgresThreadRepository {
    pool: PgPool,
}

impl PostgresThreadRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_thread(row: &sqlx::postgres::PgRow) -> Thread {
        Thread {
            id: row.get("id"),
            source_id: row.get("source_id"),
            external_id: row.get("external_id"),
            url: row.get("url"),
            priority: row.get::<i16, _>("priority") as u8,
            enabled: row.get("enabled"),
            deleted_at: row.get("deleted_at"),
        }
    }
}

#[async_trait]
impl ThreadRepository for PostgresThreadRepository {
    async fn find(&self, id: Uuid) -> anyhow::Result<Option<Thread>> {
        let row = sqlx::query("SELECT * FROM threads WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load thread: {e}"))?;
        Ok(row.as_ref().map(Self::row_to_thread))
    }

    async fn active_pairs(&self) -> anyhow::Result<Vec<(Source, Thread)>> {
        let rows = sqlx::query(
            "SELECT s.*, t.id as t_id, t.source_id as t_source_id, t.external_id as t_external_id,
                    t.url as t_url, t.priority as t_priority, t.enabled as t_enabled, t.deleted_at as t_deleted_at
             FROM threads t
             JOIN sources s ON s.id = t.source_id
             WHERE t.enabled = true AND s.enabled = true AND t.deleted_at IS NULL
             ORDER BY t.priority DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("failed to list active thread pairs: {e}"))?;

        rows.iter()
            .map(|row| {
                let source = PostgresSourceRepository::row_to_source(row)?;
                let thread = Thread {
                    id: row.get("t_id"),
                    source_id: row.get("t_source_id"),
                    external_id: row.get("t_external_id"),
                    url: row.get("t_url"),
                    priority: row.get::<i16, _>("t_priority") as u8,
                    enabled: row.get("t_enabled"),
                    deleted_at: row.get("t_deleted_at"),
                };
                Ok((source, thread))
            })
            .collect()
    }
}

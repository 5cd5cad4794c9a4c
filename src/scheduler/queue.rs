//! Redis-backed job queue: `ingestion` (work items) and `scheduler`
//! (periodic poll trigger), per spec.md §4.9.
//!
//! Ready work lives in a sorted set scored by priority (lower = higher
//! priority, ties broken by enqueue order via a monotonic suffix); delayed
//! jobs (retries, catch-up) sit in a second sorted set scored by the
//! wall-clock millisecond they become due and are promoted into the ready
//! set on every dequeue attempt.

use std::time::{SystemTime, UNIX_EPOCH};

use deadpool_redis::Pool;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const READY_KEY: &str = "ingest:queue:ingestion:ready";
const DELAYED_KEY: &str = "ingest:queue:ingestion:delayed";
const JOB_KEY_PREFIX: &str = "ingest:queue:ingestion:job:";
const PAUSED_KEY: &str = "ingest:queue:ingestion:paused";
const COMPLETED_KEY: &str = "ingest:queue:ingestion:completed";
const FAILED_KEY: &str = "ingest:queue:ingestion:failed";

const COMPLETED_RETENTION: isize = 1_000;
const FAILED_RETENTION: isize = 500;
const RETRY_BACKOFFS_MS: [u64; 3] = [30_000, 60_000, 120_000];

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestionJob {
    pub job_id: String,
    pub thread_id: Uuid,
    pub source_id: Uuid,
    pub priority: i64,
    pub is_catch_up: bool,
    pub attempt: u32,
    pub enqueued_at_ms: i64,
}

impl IngestionJob {
    /// `job_id = "ingest-<thread>-<timestamp>"`; uniqueness per thread at a
    /// given instant is enough to dedupe repeated poll cycles.
    pub fn new(thread_id: Uuid, source_id: Uuid, thread_priority: u8, now_ms: i64) -> Self {
        Self {
            job_id: format!("ingest-{thread_id}-{now_ms}"),
            thread_id,
            source_id,
            priority: 10 - thread_priority as i64,
            is_catch_up: false,
            attempt: 0,
            enqueued_at_ms: now_ms,
        }
    }

    pub fn catch_up(thread_id: Uuid, source_id: Uuid, now_ms: i64) -> Self {
        Self {
            job_id: format!("ingest-{thread_id}-catchup-{now_ms}"),
            thread_id,
            source_id,
            priority: -1,
            is_catch_up: true,
            attempt: 0,
            enqueued_at_ms: now_ms,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

pub struct IngestionQueue {
    pool: Pool,
}

impl IngestionQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    fn job_key(job_id: &str) -> String {
        format!("{JOB_KEY_PREFIX}{job_id}")
    }

    pub async fn enqueue(&self, job: &IngestionJob) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await?;
        let payload = serde_json::to_string(job)?;
        let _: () = conn.set(Self::job_key(&job.job_id), payload).await?;
        let _: () = conn.zadd(READY_KEY, &job.job_id, job.priority).await?;
        Ok(())
    }

    pub async fn enqueue_delayed(&self, job: &IngestionJob, delay_ms: u64) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await?;
        let payload = serde_json::to_string(job)?;
        let due_at = now_ms() + delay_ms as i64;
        let _: () = conn.set(Self::job_key(&job.job_id), payload).await?;
        let _: () = conn.zadd(DELAYED_KEY, &job.job_id, due_at).await?;
        Ok(())
    }

    /// Promotes any delayed job whose due time has passed into the ready set.
    async fn promote_due(&self, conn: &mut deadpool_redis::Connection) -> anyhow::Result<()> {
        let due: Vec<String> = conn.zrangebyscore(DELAYED_KEY, i64::MIN, now_ms()).await?;
        for job_id in due {
            let Some(job) = self.load_job(conn, &job_id).await? else { continue };
            let _: () = conn.zrem(DELAYED_KEY, &job_id).await?;
            let _: () = conn.zadd(READY_KEY, &job_id, job.priority).await?;
        }
        Ok(())
    }

    async fn load_job(&self, conn: &mut deadpool_redis::Connection, job_id: &str) -> anyhow::Result<Option<IngestionJob>> {
        let raw: Option<String> = conn.get(Self::job_key(job_id)).await?;
        Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    /// Pops the lowest-scored (highest-priority) ready job, unless the
    /// queue is paused.
    pub async fn dequeue(&self) -> anyhow::Result<Option<IngestionJob>> {
        let mut conn = self.pool.get().await?;
        let paused: bool = conn.exists(PAUSED_KEY).await?;
        if paused {
            return Ok(None);
        }

        self.promote_due(&mut conn).await?;

        let popped: Vec<(String, f64)> = conn.zpopmin(READY_KEY, 1).await?;
        let Some((job_id, _)) = popped.into_iter().next() else { return Ok(None) };
        self.load_job(&mut conn, &job_id).await
    }

    pub async fn retry(&self, mut job: IngestionJob) -> anyhow::Result<()> {
        let attempt = job.attempt as usize;
        if attempt >= RETRY_BACKOFFS_MS.len() {
            self.record_failed(&job).await?;
            return Ok(());
        }
        job.attempt += 1;
        let delay = RETRY_BACKOFFS_MS[attempt];
        self.enqueue_delayed(&job, delay).await
    }

    pub async fn record_completed(&self, job: &IngestionJob) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.lpush(COMPLETED_KEY, &job.job_id).await?;
        let _: () = conn.ltrim(COMPLETED_KEY, 0, COMPLETED_RETENTION - 1).await?;
        let _: () = conn.del(Self::job_key(&job.job_id)).await?;
        Ok(())
    }

    pub async fn record_failed(&self, job: &IngestionJob) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.lpush(FAILED_KEY, &job.job_id).await?;
        let _: () = conn.ltrim(FAILED_KEY, 0, FAILED_RETENTION - 1).await?;
        let _: () = conn.del(Self::job_key(&job.job_id)).await?;
        Ok(())
    }

    pub async fn pause(&self) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.set(PAUSED_KEY, "1").await?;
        Ok(())
    }

    pub async fn resume(&self) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.del(PAUSED_KEY).await?;
        Ok(())
    }

    pub async fn is_paused(&self) -> anyhow::Result<bool> {
        let mut conn = self.pool.get().await?;
        Ok(conn.exists(PAUSED_KEY).await?)
    }

    pub async fn stats(&self) -> anyhow::Result<QueueCounts> {
        let mut conn = self.pool.get().await?;
        let waiting: u64 = conn.zcard(READY_KEY).await?;
        let delayed: u64 = conn.zcard(DELAYED_KEY).await?;
        let completed: u64 = conn.llen(COMPLETED_KEY).await?;
        let failed: u64 = conn.llen(FAILED_KEY).await?;
        Ok(QueueCounts { waiting, active: 0, completed, failed, delayed })
    }
}

/// A singleton repeating-trigger queue: the poller enqueues `poll` once per
/// `ingest_poll_interval_ms`; manual triggers push an immediate one.
pub struct SchedulerQueue {
    pool: Pool,
}

const SCHEDULER_READY_KEY: &str = "ingest:queue:scheduler:ready";

impl SchedulerQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn trigger_poll(&self) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.lpush(SCHEDULER_READY_KEY, now_ms()).await?;
        Ok(())
    }

    pub async fn stats(&self) -> anyhow::Result<(u64, u64)> {
        let mut conn = self.pool.get().await?;
        let waiting: u64 = conn.llen(SCHEDULER_READY_KEY).await?;
        Ok((waiting, 0))
    }
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before unix epoch").as_millis() as i64
}

//! C9 — Scheduler: the poller that turns enabled `(source, thread)` pairs
//! into ingestion jobs, plus the control surface axum exposes (spec.md
//! §4.9, §6).

pub mod queue;
pub mod worker;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::repository::ThreadRepository;

use self::queue::{IngestionJob, IngestionQueue, QueueCounts, SchedulerQueue};

pub struct Scheduler {
    threads: Arc<dyn ThreadRepository>,
    queue: Arc<IngestionQueue>,
    scheduler_queue: Arc<SchedulerQueue>,
}

#[derive(Serialize)]
pub struct SchedulerStats {
    pub ingestion: QueueCounts,
    pub scheduler_waiting: u64,
    pub scheduler_active: u64,
}

impl Scheduler {
    pub fn new(threads: Arc<dyn ThreadRepository>, queue: Arc<IngestionQueue>, scheduler_queue: Arc<SchedulerQueue>) -> Self {
        Self { threads, queue, scheduler_queue }
    }

    /// Enumerates enabled `(source, thread)` pairs and enqueues one
    /// ingestion job per thread, priority-ordered.
    #[instrument(skip(self))]
    pub async fn poll(&self) -> anyhow::Result<usize> {
        let pairs = self.threads.active_pairs().await?;
        let now = now_ms();
        let mut enqueued = 0;
        for (source, thread) in pairs {
            let job = IngestionJob::new(thread.id, source.id, thread.priority, now);
            self.queue.enqueue(&job).await?;
            enqueued += 1;
        }
        info!(enqueued, "poll enumerated active threads");
        Ok(enqueued)
    }

    /// Enqueues a single highest-priority job for one thread, bypassing the
    /// normal priority-from-thread-priority derivation.
    pub async fn trigger_thread(&self, thread_id: Uuid) -> anyhow::Result<()> {
        let Some(thread) = self.threads.find(thread_id).await? else {
            anyhow::bail!("thread {thread_id} not found");
        };
        let mut job = IngestionJob::new(thread.id, thread.source_id, thread.priority, now_ms());
        job.priority = -1;
        self.queue.enqueue(&job).await
    }

    pub async fn trigger_all(&self) -> anyhow::Result<()> {
        self.scheduler_queue.trigger_poll().await
    }

    pub async fn pause(&self) -> anyhow::Result<()> {
        self.queue.pause().await
    }

    pub async fn resume(&self) -> anyhow::Result<()> {
        self.queue.resume().await
    }

    pub async fn stats(&self) -> anyhow::Result<SchedulerStats> {
        let ingestion = self.queue.stats().await?;
        let (scheduler_waiting, scheduler_active) = self.scheduler_queue.stats().await?;
        Ok(SchedulerStats { ingestion, scheduler_waiting, scheduler_active })
    }

    /// The poller's repeating trigger; run as a background task alongside
    /// the worker pool. Interval is enforced by the caller (`main`), which
    /// owns the tick.
    pub async fn run_poll_cycle(&self) {
        if let Err(e) = self.poll().await {
            tracing::error!(error = %e, "scheduled poll failed");
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before unix epoch").as_millis() as i64
}

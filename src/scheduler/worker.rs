//! Per-job execution: build the adapter, run the Scanner wrapped in the
//! circuit breaker and global concurrency limiter, commit buffered items,
//! and enqueue a catch-up job on PARTIAL (spec.md §4.9).

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{error, info, instrument, warn};

use crate::adapters::{self, Adapter};
use crate::checkpoint_store::CheckpointStore;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::concurrency_limiter::ConcurrencyLimiter;
use crate::domain::RunStatus;
use crate::ingest_run_store::IngestRunStore;
use crate::persistence::MediaPersistence;
use crate::rate_limiter::RateLimiterRegistry;
use crate::repository::{SourceRepository, ThreadRepository};
use crate::scanner::Scanner;

use super::queue::{IngestionJob, IngestionQueue};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobOutcome {
    Completed,
    Partial,
    CircuitOpen,
    Failed,
}

pub struct WorkerContext {
    pub scanner: Arc<Scanner>,
    pub persistence: Arc<dyn MediaPersistence>,
    pub checkpoint_store: Arc<dyn CheckpointStore>,
    pub ingest_run_store: Arc<dyn IngestRunStore>,
    pub sources: Arc<dyn SourceRepository>,
    pub threads: Arc<dyn ThreadRepository>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub rate_limiters: Arc<RateLimiterRegistry>,
    pub concurrency_limiter: Arc<ConcurrencyLimiter>,
    pub http: reqwest::Client,
    pub queue: Arc<IngestionQueue>,
}

/// Runs `concurrency` worker loops pulling from `ctx.queue` until
/// `shutdown` resolves.
pub async fn run_pool(ctx: Arc<WorkerContext>, concurrency: usize, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut handles = Vec::with_capacity(concurrency);
    for worker_id in 0..concurrency {
        let ctx = ctx.clone();
        let mut shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    job = ctx.queue.dequeue() => {
                        match job {
                            Ok(Some(job)) => {
                                execute_job(&ctx, job).await;
                            }
                            Ok(None) => {
                                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                            }
                            Err(e) => {
                                error!(worker_id, error = %e, "failed to dequeue job");
                                tokio::time::sleep(std::time::Duration::from_millis(1000)).await;
                            }
                        }
                    }
                }
            }
        }));
    }
    shutdown.changed().await.ok();
    for handle in handles {
        let _ = handle.await;
    }
}

#[instrument(skip(ctx, job), fields(job_id = %job.job_id, thread_id = %job.thread_id))]
async fn execute_job(ctx: &WorkerContext, job: IngestionJob) {
    match run_job(ctx, &job).await {
        Ok(JobOutcome::Completed) => {
            let _ = ctx.queue.record_completed(&job).await;
        }
        Ok(JobOutcome::Partial) => {
            let _ = ctx.queue.record_completed(&job).await;
        }
        Ok(JobOutcome::CircuitOpen) => {
            info!(job_id = %job.job_id, "skipped: circuit open");
            let _ = ctx.queue.record_completed(&job).await;
        }
        Ok(JobOutcome::Failed) | Err(_) => {
            warn!(job_id = %job.job_id, "job failed, scheduling retry");
            let _ = ctx.queue.retry(job).await;
        }
    }
}

async fn run_job(ctx: &WorkerContext, job: &IngestionJob) -> anyhow::Result<JobOutcome> {
    let breaker = ctx.breakers.get_or_create(job.source_id);

    if !breaker.is_allowed() {
        return Ok(JobOutcome::CircuitOpen);
    }

    let Some(source) = ctx.sources.find(job.source_id).await? else {
        anyhow::bail!("source {} not found", job.source_id);
    };
    let Some(thread) = ctx.threads.find(job.thread_id).await? else {
        anyhow::bail!("thread {} not found", job.thread_id);
    };

    let adapter: Box<dyn Adapter> = adapters::build_adapter(&source, &thread, ctx.http.clone())?;
    let validation = adapter.validate().await?;
    if !validation.valid {
        anyhow::bail!("adapter validation failed: {}", validation.error.unwrap_or_default());
    }

    let rate_limiter = ctx.rate_limiters.get_or_create(job.source_id, &source.rate_limit);

    let mut outcome = ctx.scanner.run(job.thread_id, adapter.as_ref(), &breaker, &rate_limiter, &ctx.concurrency_limiter).await?;

    let counters = ctx.persistence.commit_items(job.thread_id, &outcome.buffered_items).await?;
    info!(
        job_id = %job.job_id,
        status = outcome.run.status.as_str(),
        inserted = counters.inserted,
        duplicates = counters.duplicates,
        failed = counters.failed,
        "job committed"
    );

    outcome.run.items_new = counters.inserted;
    outcome.run.items_duplicate = counters.duplicates;
    outcome.run.items_failed = counters.failed;
    let checkpoint_after = ctx.checkpoint_store.load(job.thread_id).await?;
    outcome.run.checkpoint_after = checkpoint_after.clone();
    ctx.ingest_run_store.finish(&outcome.run).await?;

    match outcome.run.status {
        RunStatus::Complete | RunStatus::CaughtUp => Ok(JobOutcome::Completed),
        RunStatus::Partial => {
            if let Some(checkpoint) = checkpoint_after {
                if checkpoint.catch_up_cursor.is_some() {
                    let catch_up = IngestionJob::catch_up(job.thread_id, job.source_id, now_ms());
                    ctx.queue.enqueue_delayed(&catch_up, 60_000).await?;
                }
            }
            Ok(JobOutcome::Partial)
        }
        RunStatus::Failed => Ok(JobOutcome::Failed),
        RunStatus::Running => Ok(JobOutcome::Failed),
    }
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before unix epoch").as_millis() as i64
}

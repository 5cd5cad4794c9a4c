//! C7 — Incremental Scanner: the backward-paging scan loop tying the
//! adapter, checkpoint store, circuit breaker, rate limiter, and
//! concurrency limiter together for one thread (spec.md §4.7).

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::adapters::Adapter;
use crate::checkpoint_store::{self, CheckpointStore, CompareStatus};
use crate::circuit_breaker::{BreakerOutcome, CircuitBreaker};
use crate::concurrency_limiter::ConcurrencyLimiter;
use crate::dedup;
use crate::domain::{CatchUpReason, Checkpoint, IngestRun, RunStatus, ScrapedItem};
use crate::errors::{AdapterError, IngestError};
use crate::ingest_run_store::IngestRunStore;
use crate::rate_limiter::RateLimiter;

#[derive(Clone, Debug)]
pub struct ScannerConfig {
    pub max_pages_per_run: i64,
    pub max_items_per_run: u32,
    pub scan_timeout_ms: u64,
    pub max_duration_ms: u64,
    pub max_item_age_ms: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_pages_per_run: 10,
            max_items_per_run: 100,
            scan_timeout_ms: 300_000,
            max_duration_ms: 600_000,
            max_item_age_ms: 0,
        }
    }
}

/// Output of a single `Scanner::run` call. The `running` row for `run`
/// is already persisted by the time this returns; the caller (worker)
/// passes `buffered_items` to [`crate::persistence::MediaPersistence::commit_items`],
/// reconciles `run`'s counters and `checkpoint_after` from the result,
/// and persists the final row.
pub struct ScanOutcome {
    pub run: IngestRun,
    pub buffered_items: Vec<(ScrapedItem, String)>,
}

pub struct Scanner {
    checkpoint_store: Arc<dyn CheckpointStore>,
    ingest_run_store: Arc<dyn IngestRunStore>,
    config: ScannerConfig,
}

impl Scanner {
    pub fn new(checkpoint_store: Arc<dyn CheckpointStore>, ingest_run_store: Arc<dyn IngestRunStore>, config: ScannerConfig) -> Self {
        Self { checkpoint_store, ingest_run_store, config }
    }

    #[instrument(skip(self, adapter, breaker, rate_limiter, concurrency_limiter))]
    pub async fn run(
        &self,
        thread_id: Uuid,
        adapter: &dyn Adapter,
        breaker: &CircuitBreaker,
        rate_limiter: &RateLimiter,
        concurrency_limiter: &Arc<ConcurrencyLimiter>,
    ) -> Result<ScanOutcome, IngestError> {
        let checkpoint_before = self.checkpoint_store.get_or_create(thread_id).await?;
        let now = Utc::now();

        if checkpoint_store::should_skip_due_to_failures(&checkpoint_before, 5, now) {
            let run = failed_run(thread_id, checkpoint_before, "skipped: consecutive failure cooldown active".to_string());
            self.ingest_run_store.start(&run).await?;
            self.ingest_run_store.finish(&run).await?;
            return Ok(ScanOutcome { run, buffered_items: vec![] });
        }

        let mut checkpoint_before = checkpoint_before;
        if checkpoint_before.consecutive_failures > 0 {
            let cooled_down = checkpoint_before
                .last_run_at
                .map(|t| now - t >= crate::domain::checkpoint::FAILURE_COOLDOWN)
                .unwrap_or(true);
            if cooled_down {
                self.checkpoint_store.reset_failures(thread_id).await?;
                self.checkpoint_store.clear_catch_up(thread_id).await?;
                checkpoint_before.consecutive_failures = 0;
                checkpoint_before.catch_up_cursor = None;
            }
        }

        let mut run = IngestRun::start(thread_id, checkpoint_before.clone());
        self.ingest_run_store.start(&run).await?;

        match self.scan_inner(thread_id, &checkpoint_before, adapter, breaker, rate_limiter, concurrency_limiter, &mut run).await {
            Ok(buffered_items) => {
                run.finished_at = Some(Utc::now());
                Ok(ScanOutcome { run, buffered_items })
            }
            Err(e) => {
                warn!(thread_id = %thread_id, error = %e, "scan failed");
                self.checkpoint_store.update_failure(thread_id).await?;
                self.checkpoint_store.clear_catch_up(thread_id).await?;
                run.status = RunStatus::Failed;
                run.error_summary = Some(e.to_string());
                run.finished_at = Some(Utc::now());
                Ok(ScanOutcome { run, buffered_items: vec![] })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn scan_inner(
        &self,
        thread_id: Uuid,
        checkpoint: &Checkpoint,
        adapter: &dyn Adapter,
        breaker: &CircuitBreaker,
        rate_limiter: &RateLimiter,
        concurrency_limiter: &Arc<ConcurrencyLimiter>,
        run: &mut IngestRun,
    ) -> Result<Vec<(ScrapedItem, String)>, IngestError> {
        let started_at = Instant::now();

        let starting_page = match checkpoint.starting_page() {
            Some(page) => page,
            None => self.fetch_latest_page(adapter, breaker, rate_limiter, concurrency_limiter).await?.latest_page,
        };

        let mut current_page = starting_page;
        let mut pages_scanned = 0u32;
        let mut buffer: Vec<(ScrapedItem, String)> = Vec::new();
        let mut newest_item: Option<(ScrapedItem, String)> = None;
        let mut hit_checkpoint = false;

        'paging: while current_page >= 1 && pages_scanned < self.config.max_pages_per_run as u32 {
            if started_at.elapsed() > Duration::from_millis(self.config.scan_timeout_ms) {
                self.checkpoint_store.save_catch_up(thread_id, current_page, buffer.len() as u32, CatchUpReason::Timeout).await?;
                run.items_new = buffer.len() as u32;
                run.pages_scanned = pages_scanned;
                run.status = RunStatus::Partial;
                return Ok(buffer);
            }

            let page = self.fetch_page(adapter, breaker, rate_limiter, concurrency_limiter, current_page).await?;
            pages_scanned += 1;

            let mut oldest_on_page = None;
            for item in page.items {
                let fingerprint = dedup::generate_fingerprint(
                    item.media_url.as_deref().unwrap_or_default(),
                    &item.author,
                    item.posted_at,
                    item.width,
                    item.height,
                );
                if newest_item.is_none() {
                    newest_item = Some((item.clone(), fingerprint.clone()));
                }
                oldest_on_page = Some(item.posted_at);

                match checkpoint_store::compare(&item.external_id, &fingerprint, item.posted_at, checkpoint) {
                    CompareStatus::Seen(_) => {
                        hit_checkpoint = true;
                        break 'paging;
                    }
                    CompareStatus::Older => continue,
                    CompareStatus::New => {
                        if item.is_valid(self.config.max_duration_ms, self.config.max_item_age_ms, Utc::now()) {
                            buffer.push((item, fingerprint));
                        }
                        // Items failing scan-time validation are dropped silently;
                        // `items_failed` only counts commit-time failures.
                    }
                }

                if buffer.len() as u32 >= self.config.max_items_per_run {
                    self.checkpoint_store.save_catch_up(thread_id, current_page, buffer.len() as u32, CatchUpReason::PageCap).await?;
                    run.items_new = buffer.len() as u32;
                    run.pages_scanned = pages_scanned;
                    run.status = RunStatus::Partial;
                    return Ok(buffer);
                }
            }

            if self.config.max_item_age_ms > 0 {
                if let Some(oldest) = oldest_on_page {
                    let age_ms = (Utc::now() - oldest).num_milliseconds().max(0) as u64;
                    if age_ms > self.config.max_item_age_ms {
                        break;
                    }
                }
            }

            current_page -= 1;
        }

        run.items_new = buffer.len() as u32;
        run.pages_scanned = pages_scanned;

        if hit_checkpoint {
            run.status = RunStatus::Complete;
            if let Some((item, fingerprint)) = &newest_item {
                self.checkpoint_store.update_success(thread_id, item, fingerprint, current_page).await?;
            }
        } else if pages_scanned >= self.config.max_pages_per_run as u32 && current_page >= 1 {
            run.status = RunStatus::Partial;
            self.checkpoint_store.save_catch_up(thread_id, current_page, buffer.len() as u32, CatchUpReason::PageCap).await?;
        } else {
            run.status = RunStatus::CaughtUp;
            if let Some((item, fingerprint)) = &newest_item {
                self.checkpoint_store.update_success(thread_id, item, fingerprint, current_page.max(1)).await?;
            }
        }

        info!(thread_id = %thread_id, status = run.status.as_str(), pages = pages_scanned, items = run.items_new, "scan finished");
        Ok(buffer)
    }

    async fn fetch_latest_page(
        &self,
        adapter: &dyn Adapter,
        breaker: &CircuitBreaker,
        rate_limiter: &RateLimiter,
        concurrency_limiter: &Arc<ConcurrencyLimiter>,
    ) -> Result<crate::adapters::LatestPage, IngestError> {
        let result = concurrency_limiter
            .execute(|| async {
                breaker
                    .execute(|| async { rate_limiter.execute(|| adapter.get_latest_page()).await })
                    .await
            })
            .await;
        unwrap_breaker_outcome(result)
    }

    async fn fetch_page(
        &self,
        adapter: &dyn Adapter,
        breaker: &CircuitBreaker,
        rate_limiter: &RateLimiter,
        concurrency_limiter: &Arc<ConcurrencyLimiter>,
        page: i64,
    ) -> Result<crate::adapters::PageResult, IngestError> {
        let result = concurrency_limiter
            .execute(|| async {
                breaker
                    .execute(|| async { rate_limiter.execute(|| adapter.scan_page(page)).await })
                    .await
            })
            .await;
        unwrap_breaker_outcome(result)
    }
}

fn unwrap_breaker_outcome<T>(result: Result<T, BreakerOutcome<AdapterError>>) -> Result<T, IngestError> {
    match result {
        Ok(v) => Ok(v),
        Err(BreakerOutcome::Open(e)) => Err(IngestError::CircuitOpen(e)),
        Err(BreakerOutcome::Inner(e)) => Err(IngestError::Adapter(e)),
    }
}

fn failed_run(thread_id: Uuid, checkpoint_before: Checkpoint, message: String) -> IngestRun {
    let mut run = IngestRun::start(thread_id, checkpoint_before);
    run.status = RunStatus::Failed;
    run.error_summary = Some(message);
    run.finished_at = Some(Utc::now());
    run
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LatestPage, PageResult, ValidationResult};
    use crate::checkpoint_store::InMemoryCheckpointStore;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::ingest_run_store::InMemoryIngestRunStore;
    use crate::domain::MediaType;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeAdapter {
        pages: StdMutex<std::collections::HashMap<i64, Vec<ScrapedItem>>>,
        latest: i64,
        calls: AtomicI64,
        fail_on_page: Option<i64>,
        sleep_ms: Option<u64>,
    }

    fn item(id: &str, hour: u32) -> ScrapedItem {
        ScrapedItem {
            external_id: id.to_string(),
            permalink: format!("https://example.com/{id}"),
            posted_at: chrono::Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
            author: "alice".to_string(),
            author_url: None,
            title: None,
            caption: None,
            media_type: MediaType::Image,
            media_url: Some(format!("https://cdn.example.com/{id}.jpg")),
            thumbnail_url: None,
            duration_ms: None,
            width: None,
            height: None,
            assets: vec![],
            tags: vec![],
            source_metrics: None,
        }
    }

    #[async_trait]
    impl Adapter for FakeAdapter {
        fn name(&self) -> &str {
            "fake"
        }
        async fn validate(&self) -> Result<ValidationResult, AdapterError> {
            Ok(ValidationResult { valid: true, error: None })
        }
        async fn get_latest_page(&self) -> Result<LatestPage, AdapterError> {
            Ok(LatestPage { latest_page: self.latest, total_pages: Some(self.latest), total_items: None })
        }
        async fn scan_page(&self, page_number: i64) -> Result<PageResult, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(ms) = self.sleep_ms {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            if self.fail_on_page == Some(page_number) {
                return Err(AdapterError::network("boom"));
            }
            let items = self.pages.lock().unwrap().get(&page_number).cloned().unwrap_or_default();
            Ok(PageResult { items, page_number, has_more_pages: page_number > 1, total_items: None })
        }
    }

    fn harness() -> (Arc<InMemoryCheckpointStore>, Arc<InMemoryIngestRunStore>, CircuitBreaker, RateLimiter, Arc<ConcurrencyLimiter>) {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let run_store = Arc::new(InMemoryIngestRunStore::new());
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
        let rate_limiter = RateLimiter::from_config(&crate::domain::RateLimitConfig {
            requests_per_minute: None,
            bucket_size: Some(1000.0),
            refill_rate: Some(1000.0),
            crawl_delay_ms: None,
        });
        let concurrency_limiter = Arc::new(ConcurrencyLimiter::new(4));
        (store, run_store, breaker, rate_limiter, concurrency_limiter)
    }

    #[tokio::test]
    async fn fresh_thread_scans_to_page_one_and_caught_up() {
        let (store, run_store, breaker, rl, cl) = harness();
        let thread_id = Uuid::new_v4();
        let mut pages = std::collections::HashMap::new();
        pages.insert(1, vec![item("a", 1)]);
        pages.insert(2, vec![item("b", 2)]);
        let adapter = FakeAdapter { pages: StdMutex::new(pages), latest: 2, calls: AtomicI64::new(0), fail_on_page: None, sleep_ms: None };

        let scanner = Scanner::new(store.clone(), run_store.clone(), ScannerConfig::default());
        let outcome = scanner.run(thread_id, &adapter, &breaker, &rl, &cl).await.unwrap();

        assert_eq!(outcome.run.status, RunStatus::CaughtUp);
        assert_eq!(outcome.buffered_items.len(), 2);
    }

    #[tokio::test]
    async fn incremental_run_stops_at_checkpoint() {
        let (store, run_store, breaker, rl, cl) = harness();
        let thread_id = Uuid::new_v4();
        let existing_item = item("b", 2);
        let fp = dedup::generate_fingerprint(existing_item.media_url.as_deref().unwrap(), &existing_item.author, existing_item.posted_at, None, None);
        store.seed(Checkpoint {
            thread_id,
            last_seen_item_id: Some("b".to_string()),
            last_seen_fingerprint: Some(fp),
            last_seen_timestamp: Some(existing_item.posted_at),
            last_seen_page: Some(2),
            catch_up_cursor: None,
            last_run_at: Some(Utc::now() - ChronoDuration::hours(1)),
            last_success_at: Some(Utc::now() - ChronoDuration::hours(1)),
            consecutive_failures: 0,
        });

        let mut pages = std::collections::HashMap::new();
        pages.insert(2, vec![item("c", 3), existing_item]);
        let adapter = FakeAdapter { pages: StdMutex::new(pages), latest: 2, calls: AtomicI64::new(0), fail_on_page: None, sleep_ms: None };

        let scanner = Scanner::new(store.clone(), run_store.clone(), ScannerConfig::default());
        let outcome = scanner.run(thread_id, &adapter, &breaker, &rl, &cl).await.unwrap();

        assert_eq!(outcome.run.status, RunStatus::Complete);
        assert_eq!(outcome.buffered_items.len(), 1);
        assert_eq!(outcome.buffered_items[0].0.external_id, "c");
    }

    #[tokio::test]
    async fn page_cap_yields_partial_with_catch_up_cursor() {
        let (store, run_store, breaker, rl, cl) = harness();
        let thread_id = Uuid::new_v4();
        let mut pages = std::collections::HashMap::new();
        for p in 1..=3 {
            pages.insert(p, vec![item(&format!("p{p}"), p as u32)]);
        }
        let adapter = FakeAdapter { pages: StdMutex::new(pages), latest: 3, calls: AtomicI64::new(0), fail_on_page: None, sleep_ms: None };

        let mut config = ScannerConfig::default();
        config.max_items_per_run = 2;
        let scanner = Scanner::new(store.clone(), run_store.clone(), config);
        let outcome = scanner.run(thread_id, &adapter, &breaker, &rl, &cl).await.unwrap();

        assert_eq!(outcome.run.status, RunStatus::Partial);
        let cp = store.load(thread_id).await.unwrap().unwrap();
        assert!(cp.catch_up_cursor.is_some());
        assert_eq!(cp.catch_up_cursor.unwrap().reason, CatchUpReason::PageCap);
    }

    #[tokio::test]
    async fn adapter_failure_marks_run_failed_and_clears_catch_up() {
        let (store, run_store, breaker, rl, cl) = harness();
        let thread_id = Uuid::new_v4();
        store.seed(Checkpoint { catch_up_cursor: Some(crate::domain::CatchUpCursor { current_page: 2, started_at: Utc::now(), items_ingested: 1, reason: CatchUpReason::PageCap }), ..Checkpoint::fresh(thread_id) });

        let adapter = FakeAdapter { pages: StdMutex::new(std::collections::HashMap::new()), latest: 3, calls: AtomicI64::new(0), fail_on_page: Some(2), sleep_ms: None };

        let scanner = Scanner::new(store.clone(), run_store.clone(), ScannerConfig::default());
        let outcome = scanner.run(thread_id, &adapter, &breaker, &rl, &cl).await.unwrap();

        assert_eq!(outcome.run.status, RunStatus::Failed);
        let cp = store.load(thread_id).await.unwrap().unwrap();
        assert!(cp.catch_up_cursor.is_none());
        assert_eq!(cp.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn skip_due_to_cooldown_finalizes_failed_without_touching_cursor() {
        let (store, run_store, breaker, rl, cl) = harness();
        let thread_id = Uuid::new_v4();
        store.seed(Checkpoint { consecutive_failures: 5, last_run_at: Some(Utc::now()), ..Checkpoint::fresh(thread_id) });

        let adapter = FakeAdapter { pages: StdMutex::new(std::collections::HashMap::new()), latest: 1, calls: AtomicI64::new(0), fail_on_page: None, sleep_ms: None };
        let scanner = Scanner::new(store.clone(), run_store.clone(), ScannerConfig::default());
        let outcome = scanner.run(thread_id, &adapter, &breaker, &rl, &cl).await.unwrap();

        assert_eq!(outcome.run.status, RunStatus::Failed);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timeout_mid_scan_saves_catch_up_and_returns_partial() {
        let (store, run_store, breaker, rl, cl) = harness();
        let thread_id = Uuid::new_v4();
        let mut pages = std::collections::HashMap::new();
        for p in 1..=3 {
            pages.insert(p, vec![item(&format!("p{p}"), p as u32)]);
        }
        let adapter = FakeAdapter { pages: StdMutex::new(pages), latest: 3, calls: AtomicI64::new(0), fail_on_page: None, sleep_ms: Some(20) };

        let mut config = ScannerConfig::default();
        config.scan_timeout_ms = 10;
        let scanner = Scanner::new(store.clone(), run_store.clone(), config);
        let outcome = scanner.run(thread_id, &adapter, &breaker, &rl, &cl).await.unwrap();

        assert_eq!(outcome.run.status, RunStatus::Partial);
        let cp = store.load(thread_id).await.unwrap().unwrap();
        assert_eq!(cp.catch_up_cursor.unwrap().reason, CatchUpReason::Timeout);
    }

    #[tokio::test]
    async fn circuit_open_fails_run_then_recovers_after_reset_timeout() {
        let (store, run_store, _unused_breaker, rl, cl) = harness();
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            failure_window: Duration::from_millis(60_000),
            reset_timeout: Duration::from_millis(20),
            success_threshold: 1,
        });
        let thread_id = Uuid::new_v4();
        let _ = breaker.execute(|| async { Err::<(), _>(AdapterError::network("boom")) }).await;
        assert_eq!(breaker.state(), crate::circuit_breaker::State::Open);

        let mut pages = std::collections::HashMap::new();
        pages.insert(1, vec![item("a", 1)]);
        let adapter = FakeAdapter { pages: StdMutex::new(pages), latest: 1, calls: AtomicI64::new(0), fail_on_page: None, sleep_ms: None };
        let scanner = Scanner::new(store.clone(), run_store.clone(), ScannerConfig::default());

        let outcome = scanner.run(thread_id, &adapter, &breaker, &rl, &cl).await.unwrap();
        assert_eq!(outcome.run.status, RunStatus::Failed);
        assert!(outcome.run.error_summary.unwrap().contains("circuit open"));

        tokio::time::sleep(Duration::from_millis(25)).await;

        let outcome = scanner.run(thread_id, &adapter, &breaker, &rl, &cl).await.unwrap();
        assert_ne!(outcome.run.status, RunStatus::Failed);
        assert_eq!(breaker.state(), crate::circuit_breaker::State::Closed);
    }
}

//! C1 — Rate Limiter: a token bucket per source id (spec.md §4.1).
//!
//! Refill is computed lazily from wall-clock elapsed time on every touch,
//! rather than via a separate ticker task — spec.md §9 notes both are
//! correct and a ticker only matters under heavy contention, which this
//! engine's per-source call volume never reaches.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::RateLimitConfig;

struct Bucket {
    tokens: f64,
    bucket_size: f64,
    refill_rate: f64,
    crawl_delay_ms: Option<u64>,
    last_refill: Instant,
    last_request: Option<Instant>,
}

impl Bucket {
    fn from_config(cfg: &RateLimitConfig) -> Self {
        let (bucket_size, refill_rate) = derive(cfg);
        Self {
            tokens: bucket_size,
            bucket_size,
            refill_rate,
            crawl_delay_ms: cfg.crawl_delay_ms,
            last_refill: Instant::now(),
            last_request: None,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.bucket_size);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.tokens = self.tokens.max(0.0);
            true
        } else {
            false
        }
    }

    fn wait_time_ms(&self) -> u64 {
        let deficit = (1.0 - self.tokens).max(0.0);
        ((deficit / self.refill_rate) * 1000.0).ceil() as u64
    }
}

/// `bucket_size = max(ceil(rpm/60 * 10), supplied_burst)` when only
/// requests-per-minute is supplied.
fn derive(cfg: &RateLimitConfig) -> (f64, f64) {
    if let (Some(size), Some(rate)) = (cfg.bucket_size, cfg.refill_rate) {
        return (size, rate);
    }
    let refill_rate = cfg.refill_rate.unwrap_or_else(|| cfg.requests_per_minute.unwrap_or(60.0) / 60.0);
    let derived_burst = (refill_rate * 10.0).ceil();
    let bucket_size = cfg.bucket_size.map(|b| derived_burst.max(b)).unwrap_or(derived_burst);
    (bucket_size.max(1.0), refill_rate.max(0.001))
}

pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

#[derive(Debug, Serialize)]
pub struct RateLimiterSnapshot {
    pub tokens: f64,
    pub bucket_size: f64,
    pub refill_rate: f64,
}

impl RateLimiter {
    pub fn from_config(cfg: &RateLimitConfig) -> Self {
        Self { bucket: Mutex::new(Bucket::from_config(cfg)) }
    }

    /// Refill lazily, then atomically consume one token if available.
    pub fn try_acquire(&self) -> bool {
        self.bucket.lock().try_take()
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let mut bucket = self.bucket.lock();
        bucket.refill();
        RateLimiterSnapshot { tokens: bucket.tokens, bucket_size: bucket.bucket_size, refill_rate: bucket.refill_rate }
    }

    /// Await until a token is available, sleeping in between attempts. If
    /// an explicit crawl delay is configured, sleeps that long since the
    /// last request instead of touching the bucket at all.
    pub async fn acquire(&self) {
        let crawl_delay = { self.bucket.lock().crawl_delay_ms };
        if let Some(delay_ms) = crawl_delay {
            let wait = {
                let mut b = self.bucket.lock();
                let wait = match b.last_request {
                    Some(last) => {
                        let elapsed = last.elapsed().as_millis() as u64;
                        delay_ms.saturating_sub(elapsed)
                    }
                    None => 0,
                };
                b.last_request = Some(Instant::now());
                wait
            };
            if wait > 0 {
                tokio::time::sleep(Duration::from_millis(wait)).await;
            }
            return;
        }

        loop {
            if self.try_acquire() {
                return;
            }
            let wait_ms = self.bucket.lock().wait_time_ms();
            tokio::time::sleep(Duration::from_millis(wait_ms.max(1))).await;
        }
    }

    pub async fn execute<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire().await;
        f().await
    }
}

/// Process-wide registry of per-source rate limiters, keyed by source id.
#[derive(Default)]
pub struct RateLimiterRegistry {
    limiters: DashMap<Uuid, Arc<RateLimiter>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, source_id: Uuid, cfg: &RateLimitConfig) -> Arc<RateLimiter> {
        self.limiters
            .entry(source_id)
            .or_insert_with(|| Arc::new(RateLimiter::from_config(cfg)))
            .clone()
    }

    pub fn try_get(&self, source_id: Uuid) -> Option<Arc<RateLimiter>> {
        self.limiters.get(&source_id).map(|l| l.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(bucket_size: f64, refill_rate: f64) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_minute: None,
            bucket_size: Some(bucket_size),
            refill_rate: Some(refill_rate),
            crawl_delay_ms: None,
        }
    }

    #[test]
    fn derives_bucket_from_rpm() {
        let c = RateLimitConfig { requests_per_minute: Some(120.0), bucket_size: None, refill_rate: None, crawl_delay_ms: None };
        let (size, rate) = derive(&c);
        assert_eq!(rate, 2.0);
        assert_eq!(size, 20.0);
    }

    #[test]
    fn try_acquire_drains_and_refills() {
        let limiter = RateLimiter::from_config(&cfg(2.0, 1000.0));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        std::thread::sleep(Duration::from_millis(5));
        assert!(limiter.try_acquire());
    }

    #[test]
    fn tokens_clamped_to_bucket_size() {
        let mut bucket = Bucket::from_config(&cfg(3.0, 1000.0));
        std::thread::sleep(Duration::from_millis(50));
        bucket.refill();
        assert!(bucket.tokens <= 3.0);
    }

    #[tokio::test]
    async fn acquire_eventually_succeeds_under_contention() {
        let limiter = Arc::new(RateLimiter::from_config(&cfg(1.0, 200.0)));
        limiter.try_acquire();
        tokio::time::timeout(Duration::from_secs(1), limiter.acquire())
            .await
            .expect("acquire should not hang");
    }
}

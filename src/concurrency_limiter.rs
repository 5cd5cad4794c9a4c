//! C3 — Concurrency Limiter: a single process-wide semaphore bounding
//! in-flight source fetches (spec.md §4.3).
//!
//! `tokio::sync::Semaphore` already gives FIFO wakeup order and guaranteed
//! release on drop, which is exactly the acquire/park/release/guaranteed-
//! release contract spec.md §4.3 describes — so it's used directly rather
//! than hand-rolled.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};

pub struct ConcurrencyLimiter {
    semaphore: Semaphore,
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        Self { semaphore: Semaphore::new(capacity) }
    }

    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        self.semaphore.acquire().await.expect("concurrency limiter semaphore closed")
    }

    pub fn active_count(&self, capacity: usize) -> usize {
        capacity.saturating_sub(self.semaphore.available_permits())
    }

    pub async fn execute<F, Fut, T>(self: &Arc<Self>, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self.acquire().await;
        f().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn caps_in_flight_work() {
        let limiter = Arc::new(ConcurrencyLimiter::new(2));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let limiter = limiter.clone();
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .execute(|| async {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }
}

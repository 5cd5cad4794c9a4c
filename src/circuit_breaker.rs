//! C2 — Circuit Breaker: a three-state failure isolator per source id
//! (spec.md §4.2).

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::errors::CircuitOpenError;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub reset_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_millis(60_000),
            reset_timeout: Duration::from_millis(60_000),
            success_threshold: 2,
        }
    }
}

struct Inner {
    state: State,
    failures: Vec<Instant>,
    last_failure: Option<Instant>,
    consecutive_successes: u32,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner { state: State::Closed, failures: Vec::new(), last_failure: None, consecutive_successes: 0 }),
        }
    }

    fn prune(inner: &mut Inner, window: Duration, now: Instant) {
        inner.failures.retain(|t| now.duration_since(*t) <= window);
    }

    /// True in CLOSED and HALF_OPEN; in OPEN only once the reset timeout
    /// has elapsed (at which point this call also performs the OPEN ->
    /// HALF_OPEN transition, per spec.md §4.2).
    pub fn is_allowed(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed | State::HalfOpen => true,
            State::Open => {
                let last_failure = inner.last_failure.unwrap_or_else(Instant::now);
                if last_failure.elapsed() >= self.config.reset_timeout {
                    inner.state = State::HalfOpen;
                    inner.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn retry_after_ms(&self) -> u64 {
        let inner = self.inner.lock();
        match inner.last_failure {
            Some(last) => {
                let elapsed = last.elapsed();
                self.config.reset_timeout.saturating_sub(elapsed).as_millis() as u64
            }
            None => 0,
        }
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            State::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = State::Closed;
                    inner.failures.clear();
                    inner.consecutive_successes = 0;
                }
            }
            State::Closed => {
                inner.failures.clear();
            }
            State::Open => {}
        }
    }

    fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.state {
            State::HalfOpen => {
                inner.state = State::Open;
                inner.last_failure = Some(now);
                inner.consecutive_successes = 0;
            }
            State::Closed => {
                inner.failures.push(now);
                Self::prune(&mut inner, self.config.failure_window, now);
                inner.last_failure = Some(now);
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    inner.state = State::Open;
                }
            }
            State::Open => {
                inner.last_failure = Some(now);
            }
        }
    }

    /// State check, run `f`, record success/failure. Returns
    /// `Err(CircuitOpenError)` without invoking `f` when the breaker is
    /// OPEN.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerOutcome<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.is_allowed() {
            return Err(BreakerOutcome::Open(CircuitOpenError { retry_after_ms: self.retry_after_ms() }));
        }
        match f().await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerOutcome::Inner(e))
            }
        }
    }
}

#[derive(Debug)]
pub enum BreakerOutcome<E> {
    Open(CircuitOpenError),
    Inner(E),
}

/// Process-wide registry of per-source circuit breakers.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<Uuid, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-materializing lookup for the control API: a source with no
    /// recorded breaker activity simply has no entry yet.
    pub fn try_get(&self, source_id: Uuid) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(&source_id).map(|b| b.clone())
    }

    pub fn get_or_create(&self, source_id: Uuid) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(source_id)
            .or_insert_with(|| Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            failure_window: Duration::from_millis(60_000),
            reset_timeout: Duration::from_millis(20),
            success_threshold: 2,
        })
    }

    #[tokio::test]
    async fn trips_open_after_threshold_failures() {
        let cb = fast_breaker();
        for _ in 0..3 {
            let _ = cb.execute(|| async { Err::<(), _>(()) }).await;
        }
        assert_eq!(cb.state(), State::Open);
        let result = cb.execute(|| async { Ok::<_, ()>(()) }).await;
        assert!(matches!(result, Err(BreakerOutcome::Open(_))));
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let cb = fast_breaker();
        for _ in 0..3 {
            let _ = cb.execute(|| async { Err::<(), _>(()) }).await;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(cb.is_allowed());
        assert_eq!(cb.state(), State::HalfOpen);

        let _ = cb.execute(|| async { Ok::<_, ()>(()) }).await;
        assert_eq!(cb.state(), State::HalfOpen);
        let _ = cb.execute(|| async { Ok::<_, ()>(()) }).await;
        assert_eq!(cb.state(), State::Closed);
    }

    #[tokio::test]
    async fn any_half_open_failure_reopens() {
        let cb = fast_breaker();
        for _ in 0..3 {
            let _ = cb.execute(|| async { Err::<(), _>(()) }).await;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(cb.is_allowed());
        let _ = cb.execute(|| async { Err::<(), _>(()) }).await;
        assert_eq!(cb.state(), State::Open);
    }

    #[tokio::test]
    async fn failures_outside_window_do_not_accumulate() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            failure_window: Duration::from_millis(10),
            reset_timeout: Duration::from_millis(1000),
            success_threshold: 2,
        });
        let _ = cb.execute(|| async { Err::<(), _>(()) }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = cb.execute(|| async { Err::<(), _>(()) }).await;
        assert_eq!(cb.state(), State::Closed);
    }
}

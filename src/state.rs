//! Shared application state handed to axum route handlers.

use std::sync::Arc;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::rate_limiter::RateLimiterRegistry;
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub rate_limiters: Arc<RateLimiterRegistry>,
}

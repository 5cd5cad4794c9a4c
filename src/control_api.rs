//! Control API: the operator-facing surface for pausing, triggering, and
//! inspecting the scheduler and per-source limiter/breaker state (spec.md
//! §4.12).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::circuit_breaker::State as BreakerState;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/scheduler/poll", post(poll))
        .route("/scheduler/threads/:thread_id/trigger", post(trigger_thread))
        .route("/scheduler/pause", post(pause))
        .route("/scheduler/resume", post(resume))
        .route("/scheduler/stats", get(stats))
        .route("/sources/:source_id/breaker", get(breaker_state))
        .route("/sources/:source_id/limiter", get(limiter_state))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

/// Runs a full poll cycle synchronously rather than deferring to the
/// scheduler's own ticker, so an operator sees the enqueue count.
async fn poll(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let enqueued = state.scheduler.poll().await?;
    Ok(Json(serde_json::json!({ "enqueued": enqueued })))
}

async fn trigger_thread(State(state): State<AppState>, Path(thread_id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state.scheduler.trigger_thread(thread_id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn pause(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.scheduler.pause().await?;
    Ok(StatusCode::OK)
}

async fn resume(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.scheduler.resume().await?;
    Ok(StatusCode::OK)
}

async fn stats(State(state): State<AppState>) -> Result<Json<crate::scheduler::SchedulerStats>, ApiError> {
    Ok(Json(state.scheduler.stats().await?))
}

#[derive(Serialize)]
struct BreakerView {
    state: &'static str,
    retry_after_ms: u64,
}

async fn breaker_state(State(state): State<AppState>, Path(source_id): Path<Uuid>) -> Result<Json<BreakerView>, ApiError> {
    let Some(breaker) = state.breakers.try_get(source_id) else {
        return Err(ApiError::NotFound);
    };
    let view = BreakerView {
        state: match breaker.state() {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        },
        retry_after_ms: breaker.retry_after_ms(),
    };
    Ok(Json(view))
}

async fn limiter_state(
    State(state): State<AppState>,
    Path(source_id): Path<Uuid>,
) -> Result<Json<crate::rate_limiter::RateLimiterSnapshot>, ApiError> {
    let Some(limiter) = state.rate_limiters.try_get(source_id) else {
        return Err(ApiError::NotFound);
    };
    Ok(Json(limiter.snapshot()))
}

enum ApiError {
    NotFound,
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found").into_response(),
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "control api request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}

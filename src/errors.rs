use thiserror::Error;

/// Error raised by an adapter's `validate`/`get_latest_page`/`scan_page`.
/// Always fatal for the current job (spec.md §4.4); `retriable` only
/// informs whether the queue-level retry (C9) is worth attempting.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub message: String,
    pub retriable: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AdapterErrorKind {
    Network,
    RateLimited,
    Parse,
    NotFound,
    Auth,
}

impl AdapterError {
    pub fn network(message: impl Into<String>) -> Self {
        Self { kind: AdapterErrorKind::Network, message: message.into(), retriable: true }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self { kind: AdapterErrorKind::RateLimited, message: message.into(), retriable: true }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self { kind: AdapterErrorKind::Parse, message: message.into(), retriable: false }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self { kind: AdapterErrorKind::NotFound, message: message.into(), retriable: false }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self { kind: AdapterErrorKind::Auth, message: message.into(), retriable: false }
    }
}

/// Raised by [`crate::circuit_breaker::CircuitBreaker::execute`] when the
/// breaker is OPEN. Carries the wait the caller should honor before trying
/// again (spec.md §4.2).
#[derive(Debug, Error)]
#[error("circuit open, retry after {retry_after_ms}ms")]
pub struct CircuitOpenError {
    pub retry_after_ms: u64,
}

/// Top-level error type for the ingestion pipeline. Transient/hard/
/// validation distinctions follow spec.md §7.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("adapter not found for kind {0}")]
    AdapterNotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum NetError {
    #[error("host '{0}' is not permitted by the outbound allowlist")]
    Disallowed(String),
    #[error("could not parse url: {0}")]
    InvalidUrl(String),
    #[error("too many redirect hops")]
    TooManyRedirects,
}

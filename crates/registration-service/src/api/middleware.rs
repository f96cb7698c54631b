//! Rate limiting and request logging.

use crate::error::ServiceError;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::{num::NonZeroU32, sync::Arc};
use tracing::{debug, warn};

/// Global rate limiter (not keyed by IP).
pub type GlobalLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Paths that bypass the limiter.
const EXEMPT_PATHS: &[&str] = &["/health"];

#[derive(Clone)]
pub struct RateLimitState {
    pub global: Arc<GlobalLimiter>,
}

impl RateLimitState {
    pub fn new(requests_per_minute: u32) -> Self {
        let per_minute = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);

        Self {
            global: Arc::new(RateLimiter::direct(Quota::per_minute(per_minute))),
        }
    }

    /// A limiter tests will not trip.
    pub fn permissive() -> Self {
        Self::new(10_000)
    }
}

/// Returns 429 once the global quota is spent.
pub async fn rate_limit_middleware(
    State(rate_limit): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    if EXEMPT_PATHS.contains(&request.uri().path()) {
        return Ok(next.run(request).await);
    }

    if rate_limit.global.check().is_err() {
        warn!(path = %request.uri().path(), "Global rate limit exceeded");
        return Err(ServiceError::RateLimitExceeded);
    }

    Ok(next.run(request).await)
}

pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let start = std::time::Instant::now();

    let response = next.run(request).await;

    let duration = start.elapsed();
    let status = response.status();

    if status.is_client_error() || status.is_server_error() {
        warn!(%method, %path, %status, ?duration, "Request failed");
    } else {
        debug!(%method, %path, %status, ?duration, "Request completed");
    }

    response
}

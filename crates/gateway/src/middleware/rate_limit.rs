//! Rate limiting middleware using token bucket algorithm

use axum::{extract::Request, middleware::Next, response::Response};
use governor::{
    clock::QuantaClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use storyforge_common::errors::AppError;

/// Rate limiter using governor crate
pub type GlobalRateLimiter = RateLimiter<NotKeyed, InMemoryState, QuantaClock>;

/// Create a new rate limiter; `None` when either bound is zero
pub fn create_rate_limiter(requests_per_second: u32, burst: u32) -> Option<Arc<GlobalRateLimiter>> {
    let rate = NonZeroU32::new(requests_per_second)?;
    let burst = NonZeroU32::new(burst)?;
    let quota = Quota::per_second(rate).allow_burst(burst);

    Some(Arc::new(RateLimiter::direct(quota)))
}

/// Rate limiting middleware
pub async fn rate_limit_middleware(
    limiter: Arc<GlobalRateLimiter>,
    limit: u32,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    match limiter.check() {
        Ok(_) => Ok(next.run(request).await),
        Err(_) => {
            tracing::warn!(path = %request.uri().path(), "Rate limit exceeded");
            Err(AppError::RateLimited { limit })
        }
    }
}

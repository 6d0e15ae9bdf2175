//! Pacing for outbound registration calls
//!
//! Backfill batches call the registration service back to back; the pacer
//! spaces those calls with a token bucket instead of inline sleeps.

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Token bucket gating external registration calls
pub struct RegistrationPacer {
    limiter: Option<DirectRateLimiter>,
}

impl RegistrationPacer {
    /// One permit per `interval`, up to `burst` at once. `None` (or a zero
    /// interval) disables pacing.
    pub fn new(interval: Option<Duration>, burst: u32) -> Self {
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        let limiter = interval
            .and_then(Quota::with_period)
            .map(|quota| RateLimiter::direct(quota.allow_burst(burst)));

        Self { limiter }
    }

    pub fn unpaced() -> Self {
        Self { limiter: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    /// Wait until the next call may go out
    pub async fn until_ready(&self) {
        if let Some(ref limiter) = self.limiter {
            limiter.until_ready().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_unpaced_never_waits() {
        let pacer = RegistrationPacer::new(None, 1);
        assert!(!pacer.is_enabled());

        let start = Instant::now();
        for _ in 0..100 {
            pacer.until_ready().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_zero_interval_disables() {
        assert!(!RegistrationPacer::new(Some(Duration::ZERO), 1).is_enabled());
    }

    #[test]
    fn test_second_permit_waits_for_interval() {
        let pacer = RegistrationPacer::new(Some(Duration::from_secs(60)), 1);

        let mut first = tokio_test::task::spawn(pacer.until_ready());
        tokio_test::assert_ready!(first.poll());

        let mut second = tokio_test::task::spawn(pacer.until_ready());
        tokio_test::assert_pending!(second.poll());
    }

    #[tokio::test]
    async fn test_calls_are_spaced() {
        let pacer = RegistrationPacer::new(Some(Duration::from_millis(40)), 1);
        assert!(pacer.is_enabled());

        let start = Instant::now();
        for _ in 0..3 {
            pacer.until_ready().await;
        }
        // First permit is immediate, the next two wait one interval each
        assert!(start.elapsed() >= Duration::from_millis(70));
    }
}

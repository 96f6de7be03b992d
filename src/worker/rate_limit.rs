//! Per-queue request budget.
//!
//! Limits how fast a queue's workers start jobs, for stages whose upstream
//! provider enforces a request quota. The budget is per process.

use std::num::NonZeroU32;

use governor::{
    clock::DefaultClock,
    state::{direct::NotKeyed, InMemoryState},
    Quota, RateLimiter as GovernorRateLimiter,
};
use tracing::debug;

use crate::config::RateLimit;

/// Token bucket shared by all workers of one pool.
pub struct JobRateLimiter {
    limit: RateLimit,
    limiter: GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl JobRateLimiter {
    /// Creates a limiter allowing `limit.max` starts per `limit.per`, with
    /// the full budget available as a burst.
    ///
    /// Returns `None` for a zero budget or a zero interval.
    pub fn new(limit: RateLimit) -> Option<Self> {
        let burst = NonZeroU32::new(limit.max)?;
        let quota = Quota::with_period(limit.per / limit.max)?.allow_burst(burst);

        debug!(max = limit.max, per_secs = limit.per.as_secs(), "Initialized job rate limiter");

        Some(Self {
            limit,
            limiter: GovernorRateLimiter::direct(quota),
        })
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Takes one token if available.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Waits until a token is available and takes it.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}

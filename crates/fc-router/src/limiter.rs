//! Per-pool token bucket.
//!
//! Capacity is one minute of tokens (burst = rate), refilled continuously at
//! rate/60 per second. `try_acquire` is a gate, not a wait: a worker that
//! misses a token releases its other slots and fast-fail nacks the message.

use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

pub struct PoolRateLimiter {
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    rate_per_minute: Option<u32>,
}

impl PoolRateLimiter {
    /// `None` (or zero) disables limiting: every acquire succeeds.
    pub fn new(rate_per_minute: Option<u32>) -> Self {
        let rate = rate_per_minute.and_then(NonZeroU32::new);
        Self {
            limiter: rate.map(|nz| RateLimiter::direct(Quota::per_minute(nz))),
            rate_per_minute: rate.map(NonZeroU32::get),
        }
    }

    /// Non-blocking: true consumes one token, false leaves state untouched.
    pub fn try_acquire(&self) -> bool {
        match &self.limiter {
            None => true,
            Some(limiter) => limiter.check().is_ok(),
        }
    }

    pub fn rate_per_minute(&self) -> Option<u32> {
        self.rate_per_minute
    }
}

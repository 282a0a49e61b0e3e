//! Client-paced token bucket.
//!
//! Independent of upstream-reported quota: the bucket holds `capacity` tokens
//! and regains one every `refill_interval`. Backed by `governor`'s GCRA
//! limiter, which is equivalent to a token bucket of the same burst size.

use std::num::NonZeroU32;

use core_runtime::config::RateLimitConfig;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tracing::trace;

use crate::error::{Result, SyncError};

pub struct TokenBucket {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    config: RateLimitConfig,
}

impl TokenBucket {
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        let capacity = NonZeroU32::new(config.capacity)
            .ok_or_else(|| SyncError::Config("rate limit capacity must be at least 1".to_string()))?;
        let quota = Quota::with_period(config.refill_interval())
            .ok_or_else(|| {
                SyncError::Config("rate limit refill interval must be non-zero".to_string())
            })?
            .allow_burst(capacity);

        Ok(Self {
            limiter: RateLimiter::direct(quota),
            config,
        })
    }

    /// Take a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        if self.try_acquire() {
            return;
        }
        trace!(
            refill_interval_ms = self.config.refill_interval_ms,
            "Rate limiter empty, waiting for token"
        );
        self.limiter.until_ready().await;
    }

    pub fn capacity(&self) -> u32 {
        self.config.capacity
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.config.capacity)
            .field("refill_interval_ms", &self.config.refill_interval_ms)
            .finish()
    }
}

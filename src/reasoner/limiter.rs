//! Token-bucket rate limiting for stream callbacks.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Cancellable token bucket applied before each callback invocation.
pub struct TokenBucket {
    limiter: DefaultDirectRateLimiter,
}

impl TokenBucket {
    /// A bucket refilled at `per_second` permits per second. Burst is one
    /// permit so callbacks are evenly paced.
    pub fn per_second(per_second: u32) -> Self {
        let rate = NonZeroU32::new(per_second.max(1)).expect("rate is non-zero");
        let burst = NonZeroU32::new(1).expect("burst is non-zero");
        Self {
            limiter: RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)),
        }
    }

    /// Wait for one permit, aborting promptly on cancellation.
    pub async fn acquire(&self, ctx: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = ctx.cancelled() => Err(Error::cancelled("rate limiter acquire")),
            _ = self.limiter.until_ready() => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_first_acquire_is_immediate() {
        let bucket = TokenBucket::per_second(10);
        let ctx = CancellationToken::new();
        let start = Instant::now();
        bucket.acquire(&ctx).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_acquire_throttles() {
        let bucket = TokenBucket::per_second(20);
        let ctx = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..5 {
            bucket.acquire(&ctx).await.unwrap();
        }
        // 5 permits at 20/s needs at least ~200ms beyond the initial burst
        // allowance of one.
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_cancelled_acquire_returns_promptly() {
        let bucket = TokenBucket::per_second(1);
        let ctx = CancellationToken::new();
        bucket.acquire(&ctx).await.unwrap();

        ctx.cancel();
        let start = Instant::now();
        let err = bucket.acquire(&ctx).await.unwrap_err();
        assert_eq!(err.code(), "cancelled");
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}

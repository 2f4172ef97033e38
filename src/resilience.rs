// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backoff, throttling and fan-out limits.
//!
//! - [`retry_with_backoff`] retries local repository reads while an
//!   outbound event is being produced.
//! - [`RateLimiter`] throttles inbound dispatch across all partitions.
//! - [`Bulkhead`] caps member calls in flight for one federated query.

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Doubling backoff, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts including the first; 0 is treated as 1.
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryConfig {
    /// Sleep before retry number `retry` (1 = first retry).
    pub fn backoff(&self, retry: usize) -> Duration {
        let doublings = retry.saturating_sub(1).min(31) as u32;
        self.initial_delay
            .checked_mul(1u32 << doublings)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or runs
/// out of attempts. The last error is returned.
pub async fn retry_with_backoff<T, E, F, Fut>(
    operation: &str,
    config: &RetryConfig,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = config.max_attempts.max(1);
    let mut retry = 1;
    loop {
        let err = match op().await {
            Ok(value) => {
                if retry > 1 {
                    debug!(operation, attempts = retry, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) => e,
        };
        if retry >= attempts || !is_retryable(&err) {
            return Err(err);
        }
        let delay = config.backoff(retry);
        warn!(
            operation,
            attempt = retry,
            attempts,
            backoff_ms = delay.as_millis() as u64,
            error = %err,
            "Attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
        retry += 1;
    }
}

/// Inbound throttle: `per_second` sustained, `burst` at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub per_second: u32,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 1000,
            burst: 100,
        }
    }
}

/// One token bucket shared by every dispatch partition.
pub struct RateLimiter {
    bucket: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let per_second = NonZeroU32::new(config.per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst).unwrap_or(NonZeroU32::MIN);
        Self {
            bucket: GovLimiter::direct(Quota::per_second(per_second).allow_burst(burst)),
        }
    }

    /// Wait for a token.
    pub async fn acquire(&self) {
        self.bucket.until_ready().await;
    }

    pub fn try_acquire(&self) -> bool {
        self.bucket.check().is_ok()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("fan-out limit of {limit} closed")]
pub struct BulkheadClosed {
    pub limit: usize,
}

/// Semaphore shared by the member calls of one query engine.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl Bulkhead {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Wait for a slot; the slot frees when the permit drops.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadClosed> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| BulkheadClosed { limit: self.limit })
    }

    pub fn in_flight(&self) -> usize {
        self.limit - self.permits.available_permits()
    }
}

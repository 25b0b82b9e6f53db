use governor::{Quota, RateLimiter as Governor};
use std::num::NonZeroU32;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

type PacingLimiter = Governor<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Clone, Error)]
#[error("rate limiter closed")]
pub struct LimiterClosed;

/// Bounds in-flight broker calls across the process.
///
/// Clones share the same budget. An optional per-second quota paces
/// request starts on top of the concurrency bound.
#[derive(Clone)]
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    capacity: usize,
    pacing: Option<Arc<PacingLimiter>>,
}

/// Capacity returned to the limiter when dropped
#[derive(Debug)]
pub struct RatePermit {
    _permit: OwnedSemaphorePermit,
}

impl RatePermit {
    pub fn release(self) {}
}

impl RateLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        let capacity = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            pacing: None,
        }
    }

    /// Add a requests-per-second quota
    pub fn with_rate(mut self, per_second: u32) -> Self {
        if let Some(rps) = NonZeroU32::new(per_second) {
            self.pacing = Some(Arc::new(Governor::direct(Quota::per_second(rps))));
        }
        self
    }

    /// Wait for a free slot, then for the pacing quota if one is set
    pub async fn acquire(&self) -> Result<RatePermit, LimiterClosed> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LimiterClosed)?;

        if let Some(pacing) = &self.pacing {
            pacing.until_ready().await;
        }

        Ok(RatePermit { _permit: permit })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

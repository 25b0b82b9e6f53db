// Data acquisition, position reconciliation and order execution
pub mod credit_allocator;
pub mod executor;
pub mod position_tracker;
pub mod price_feed;
pub mod rate_limiter;
pub mod retry;

pub use credit_allocator::{allocate, Allocation};
pub use executor::{ExecutionReport, OrderExecutor, RejectReason};
pub use position_tracker::{PositionTracker, Reconciliation};
pub use price_feed::{FetchError, MarketDataPoller};
pub use rate_limiter::{RateLimiter, RatePermit};
pub use retry::{Backoff, Classify, FailureKind, RetryError, RetryPolicy};

//! Utility modules

pub mod retry;
pub mod rate_limiter;

pub use retry::{retry_with_backoff, BackoffPolicy, RetryOrderConfig, RetryOrderSender, Stamped};
pub use rate_limiter::RateLimiter;

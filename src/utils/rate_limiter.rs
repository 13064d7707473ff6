//! Rate limiting protection
//! At most `permits` acquisitions per sliding `interval`

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Sliding-window rate limiter
pub struct RateLimiter {
    permits: usize,
    interval: Duration,
    grants: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create new rate limiter
    pub fn new(permits: u32, interval: Duration) -> Self {
        let permits = permits.max(1) as usize;
        Self {
            permits,
            interval,
            grants: Mutex::new(VecDeque::with_capacity(permits)),
        }
    }

    /// Wait until a permit is free, then take it.
    ///
    /// Waiters are served in order; the first `permits` calls never wait.
    pub async fn acquire(&self) {
        let mut grants = self.grants.lock().await;

        if grants.len() >= self.permits {
            if let Some(oldest) = grants.pop_front() {
                let ready_at = oldest + self.interval;
                if ready_at > Instant::now() {
                    sleep_until(ready_at).await;
                }
            }
        }

        grants.push_back(Instant::now());
    }

    /// Forget all previous grants
    pub async fn reset(&self) {
        self.grants.lock().await.clear();
    }

    pub fn permits(&self) -> usize {
        self.permits
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_call_is_immediate() {
        let limiter = RateLimiter::new(1, Duration::from_millis(100));
        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_permit_spacing() {
        let limiter = RateLimiter::new(1, Duration::from_millis(100));
        let mut stamps = Vec::new();
        for _ in 0..4 {
            limiter.acquire().await;
            stamps.push(Instant::now());
        }
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_up_to_permits() {
        let limiter = RateLimiter::new(3, Duration::from_millis(100));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_reset() {
        let limiter = RateLimiter::new(1, Duration::from_secs(1));

        limiter.acquire().await;
        limiter.reset().await;

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100), "Expected no delay after reset");
    }
}

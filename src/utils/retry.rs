//! Retry utilities
//! `RetryOrderSender` paces order placement attempts through a rate limiter and
//! only retries soft failures. `retry_with_backoff` covers idempotent reads.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::trading::errors::TradingError;
use crate::utils::rate_limiter::RateLimiter;

/// Messages that carry a send timestamp refreshed on every attempt
pub trait Stamped {
    fn stamp(&mut self, at: DateTime<Utc>);
}

/// Pacing for order placement retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOrderConfig {
    /// Attempts allowed per interval
    pub limit: u32,
    /// Interval length in milliseconds
    pub interval_ms: u64,
}

impl Default for RetryOrderConfig {
    fn default() -> Self {
        Self {
            limit: 1,
            interval_ms: 350,
        }
    }
}

/// Sends an order through a handler, retrying soft failures.
///
/// A handler result of `Ok(None)` or `Err(TradingError::PlaceOrderFail)` is a
/// soft failure and consumes one attempt. Any other error ends the call at
/// once without touching the attempt budget.
#[derive(Debug, Clone)]
pub struct RetryOrderSender {
    config: RetryOrderConfig,
}

impl RetryOrderSender {
    /// Create a sender.
    ///
    /// # Panics
    ///
    /// Panics if `limit` or `interval_ms` is zero.
    pub fn new(config: RetryOrderConfig) -> Self {
        assert!(config.limit > 0, "retry limiter needs at least one permit per interval");
        assert!(config.interval_ms > 0, "retry limiter interval must be positive");
        Self { config }
    }

    pub fn config(&self) -> RetryOrderConfig {
        self.config
    }

    /// Invoke `handler` up to `max_attempts` times (at least once).
    ///
    /// The first attempt goes out immediately; later ones are paced by a
    /// limiter private to this call. Only the message timestamp is refreshed
    /// between attempts.
    pub async fn send_order<M, T, F, Fut>(
        &self,
        msg: &mut M,
        mut handler: F,
        max_attempts: u32,
    ) -> Result<T, TradingError>
    where
        M: Stamped + Clone,
        F: FnMut(M) -> Fut,
        Fut: Future<Output = Result<Option<T>, TradingError>>,
    {
        let max_attempts = max_attempts.max(1);
        let limiter = RateLimiter::new(
            self.config.limit,
            Duration::from_millis(self.config.interval_ms),
        );
        let mut last_failure = String::from("no acknowledgment");

        for attempt in 1..=max_attempts {
            limiter.acquire().await;
            msg.stamp(Utc::now());
            debug!("RetryOrderSender->attempt {}/{} to send order", attempt, max_attempts);

            match handler(msg.clone()).await {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {
                    debug!("RetryOrderSender->place order request failed (no acknowledgment)");
                    last_failure = String::from("no acknowledgment");
                }
                Err(err) if err.is_retryable() => {
                    debug!("RetryOrderSender->place order request failed: {}", err);
                    last_failure = err.to_string();
                }
                Err(err) => {
                    error!("RetryOrderSender->place order failed with {}: {}", err.category(), err);
                    return Err(err);
                }
            }
        }

        error!("RetryOrderSender->place order exceeded retry count ({})", max_attempts);
        Err(TradingError::ExceededRetryCount {
            message: "Exceeded maximum number of retries".to_string(),
            extra: Some(json!({
                "attempts": max_attempts,
                "last_failure": last_failure,
            })),
        })
    }
}

/// Backoff configuration for idempotent requests
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10000,
            backoff_multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_retries: u32, initial_delay_ms: u64) -> Self {
        Self {
            max_retries,
            initial_delay_ms,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Retry an idempotent operation with exponential backoff while
/// `should_retry` accepts its error
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    operation_name: &str,
    policy: &BackoffPolicy,
    should_retry: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let mut delay_ms = policy.initial_delay_ms;
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < policy.max_retries && should_retry(&e) => {
                attempt += 1;
                warn!(
                    "{} failed (attempt {}/{}), retrying in {}ms: {}",
                    operation_name,
                    attempt,
                    policy.max_retries + 1,
                    delay_ms,
                    e
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = ((delay_ms as f64 * policy.backoff_multiplier) as u64)
                    .min(policy.max_delay_ms);
            }
            Err(e) => {
                error!("{} failed after {} attempts: {}", operation_name, attempt + 1, e);
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    struct Msg {
        time: DateTime<Utc>,
        body: &'static str,
    }

    impl Stamped for Msg {
        fn stamp(&mut self, at: DateTime<Utc>) {
            self.time = at;
        }
    }

    fn msg() -> Msg {
        Msg {
            time: DateTime::<Utc>::MIN_UTC,
            body: "order",
        }
    }

    fn sender(limit: u32, interval_ms: u64) -> RetryOrderSender {
        RetryOrderSender::new(RetryOrderConfig { limit, interval_ms })
    }

    fn place_fail() -> TradingError {
        TradingError::PlaceOrderFail {
            message: "Handler Failed".to_string(),
            extra: None,
        }
    }

    #[test]
    #[should_panic]
    fn test_zero_limit_panics() {
        sender(0, 100);
    }

    #[test]
    #[should_panic]
    fn test_zero_interval_panics() {
        sender(1, 0);
    }

    #[tokio::test]
    async fn test_resolves_to_handler_result() {
        let result = sender(100, 1000)
            .send_order(&mut msg(), |_m| async { Ok(Some("passed")) }, 3)
            .await;
        assert_eq!(result.unwrap(), "passed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_null_on_every_attempt_exceeds_retry_count() {
        let count = AtomicU32::new(0);
        let result: Result<(), _> = sender(100, 1000)
            .send_order(
                &mut msg(),
                |_m| {
                    count.fetch_add(1, Ordering::SeqCst);
                    async { Ok(None) }
                },
                4,
            )
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 4);
        assert!(matches!(result, Err(TradingError::ExceededRetryCount { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_place_order_fail_on_every_attempt_exceeds_retry_count() {
        let count = AtomicU32::new(0);
        let result: Result<(), _> = sender(100, 1000)
            .send_order(
                &mut msg(),
                |_m| {
                    count.fetch_add(1, Ordering::SeqCst);
                    async { Err(place_fail()) }
                },
                4,
            )
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 4);
        let err = result.unwrap_err();
        assert!(matches!(err, TradingError::ExceededRetryCount { .. }));
        assert_eq!(err.extra().unwrap()["attempts"], 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolves_on_final_attempt() {
        let count = AtomicU32::new(0);
        let result = sender(100, 1000)
            .send_order(
                &mut msg(),
                |_m| {
                    let n = count.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n < 4 {
                            Err(place_fail())
                        } else {
                            Ok(Some("attempt-4"))
                        }
                    }
                },
                4,
            )
            .await;

        assert_eq!(result.unwrap(), "attempt-4");
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_failure_then_success() {
        let count = AtomicU32::new(0);
        let result = sender(100, 1000)
            .send_order(
                &mut msg(),
                |_m| {
                    let n = count.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n < 2 {
                            Err(place_fail())
                        } else {
                            Ok(Some("passed"))
                        }
                    }
                },
                3,
            )
            .await;

        assert_eq!(result.unwrap(), "passed");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_other_errors_short_circuit() {
        let count = AtomicU32::new(0);
        let result: Result<(), _> = sender(100, 1000)
            .send_order(
                &mut msg(),
                |_m| {
                    count.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err(TradingError::Exchange {
                            message: "Generic Error".to_string(),
                        })
                    }
                },
                4,
            )
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(TradingError::Exchange { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_paced_by_interval() {
        let start = Instant::now();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = calls.clone();

        let result: Result<(), _> = sender(1, 50)
            .send_order(
                &mut msg(),
                move |_m| {
                    recorded.lock().unwrap().push(Instant::now());
                    async { Ok(None) }
                },
                4,
            )
            .await;
        assert!(result.is_err());

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        assert!(calls[0] - start < Duration::from_millis(2));
        for pair in calls.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(50));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_timestamp_changes_between_attempts() {
        let mut original = msg();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();
        let count = AtomicU32::new(0);

        let result = sender(1, 50)
            .send_order(
                &mut original,
                move |m: Msg| {
                    recorded.lock().unwrap().push(m.clone());
                    let n = count.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { Ok(if n == 1 { None } else { Some(m) }) }
                },
                3,
            )
            .await
            .unwrap();

        assert_eq!(result.body, "order");
        assert_ne!(original.time, DateTime::<Utc>::MIN_UTC);
        assert_eq!(result, original);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_backoff_success_after_failures() {
        let counter = AtomicU32::new(0);

        let result = retry_with_backoff(
            "test",
            &BackoffPolicy::new(3, 1),
            |_e: &&str| true,
            || async {
                let count = counter.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err::<&str, &str>("fail")
                } else {
                    Ok("success")
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backoff_stops_on_permanent_error() {
        let counter = AtomicU32::new(0);

        let result = retry_with_backoff(
            "test",
            &BackoffPolicy::new(3, 1),
            |_e: &&str| false,
            || async {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<&str, &str>("permanent")
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

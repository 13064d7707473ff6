//! Error types for the position lifecycle
//! Placement failures are soft and retried; everything else propagates.

use serde_json::Value;
use thiserror::Error;

use crate::api::ApiError;

/// Trading errors with detailed classification
#[derive(Error, Debug, Clone)]
pub enum TradingError {
    /// The exchange did not accept an order placement
    #[error("Place order failed: {message}")]
    PlaceOrderFail { message: String, extra: Option<Value> },

    /// Every placement attempt failed softly
    #[error("Exceeded retry count: {message}")]
    ExceededRetryCount { message: String, extra: Option<Value> },

    /// A pending entry could not be canceled
    #[error("Cannot cancel pending entry: {message}")]
    CancelPendingEntry { message: String, extra: Option<Value> },

    /// Operation not allowed in the current position state
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Order request is missing something it needs
    #[error("Invalid order: {message}")]
    InvalidOrder { message: String },

    /// Balance lookup failed or the currency is unknown
    #[error("Balance error: {message}")]
    Balance { message: String },

    /// Any other exchange failure
    #[error("Exchange error: {message}")]
    Exchange { message: String },
}

impl TradingError {
    pub fn place_order_fail(message: impl Into<String>) -> Self {
        TradingError::PlaceOrderFail {
            message: message.into(),
            extra: None,
        }
    }

    pub fn cancel_pending_entry(message: impl Into<String>, extra: Option<Value>) -> Self {
        TradingError::CancelPendingEntry {
            message: message.into(),
            extra,
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        TradingError::InvalidState {
            message: message.into(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, TradingError::PlaceOrderFail { .. })
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            TradingError::PlaceOrderFail { .. } => "PLACE_ORDER_FAIL",
            TradingError::ExceededRetryCount { .. } => "EXCEEDED_RETRY_COUNT",
            TradingError::CancelPendingEntry { .. } => "CANCEL_PENDING_ENTRY",
            TradingError::InvalidState { .. } => "INVALID_STATE",
            TradingError::InvalidOrder { .. } => "INVALID_ORDER",
            TradingError::Balance { .. } => "BALANCE",
            TradingError::Exchange { .. } => "EXCHANGE",
        }
    }

    /// Structured context attached to the error, if any
    pub fn extra(&self) -> Option<&Value> {
        match self {
            TradingError::PlaceOrderFail { extra, .. }
            | TradingError::ExceededRetryCount { extra, .. }
            | TradingError::CancelPendingEntry { extra, .. } => extra.as_ref(),
            _ => None,
        }
    }
}

impl From<ApiError> for TradingError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Rejected { reason } => TradingError::PlaceOrderFail {
                message: reason,
                extra: None,
            },
            ApiError::RateLimited => TradingError::PlaceOrderFail {
                message: "Rate limited".to_string(),
                extra: None,
            },
            other => TradingError::Exchange {
                message: other.to_string(),
            },
        }
    }
}

//! Exchange boundary
//! Order submission, order cancellation and balance queries as three small
//! traits, plus the message types that cross them.

pub mod rest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

pub use rest::RestExchangeClient;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("Order rejected: {reason}")]
    Rejected { reason: String },
    #[error("Rate limited")]
    RateLimited,
    #[error("Order not found: {order_id}")]
    NotFound { order_id: String },
}

impl ApiError {
    /// Whether repeating the same idempotent request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::HttpError(e) => e.is_timeout() || e.is_connect(),
            ApiError::RateLimited => true,
            ApiError::ApiError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Sanitize API error message to avoid leaking sensitive information
/// In production, returns generic error message for 5xx responses
pub fn sanitize_api_error(status: u16, detailed_message: String) -> ApiError {
    if cfg!(not(debug_assertions)) && status >= 500 {
        tracing::error!("API error {}: {}", status, detailed_message);
        return ApiError::ApiError {
            status,
            message: "Internal server error".to_string(),
        };
    }

    let safe_message = if detailed_message.len() > 500 {
        let mut cut = 500;
        while !detailed_message.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}... (truncated)", &detailed_message[..cut])
    } else {
        detailed_message
    };

    ApiError::ApiError {
        status,
        message: safe_message,
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// Order kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// Stop trigger type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopKind {
    /// Triggers when the price falls to the stop price
    Loss,
    /// Triggers when the price rises to the stop price
    Entry,
}

/// Stop metadata carried by an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopSpec {
    pub kind: StopKind,
    pub trigger_price: Decimal,
}

/// Order request passed to `Position::enter` / `Position::exit`.
///
/// When neither `size` nor `funds` is set, the position fills one in from the
/// available balance before the request goes out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub time: DateTime<Utc>,
    pub product_id: String,
    pub side: Side,
    pub order_type: OrderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funds: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSpec>,
}

impl OrderRequest {
    /// Market order without size or funds
    pub fn market(product_id: &str, side: Side) -> Self {
        Self {
            time: Utc::now(),
            product_id: product_id.to_string(),
            side,
            order_type: OrderType::Market,
            price: None,
            size: None,
            funds: None,
            stop: None,
        }
    }

    /// Limit order without size or funds
    pub fn limit(product_id: &str, side: Side, price: Decimal) -> Self {
        Self {
            price: Some(price),
            order_type: OrderType::Limit,
            ..Self::market(product_id, side)
        }
    }

    pub fn with_size(mut self, size: Decimal) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_funds(mut self, funds: Decimal) -> Self {
        self.funds = Some(funds);
        self
    }

    pub fn with_stop(mut self, kind: StopKind, trigger_price: Decimal) -> Self {
        self.stop = Some(StopSpec {
            kind,
            trigger_price,
        });
        self
    }

    pub fn has_amount(&self) -> bool {
        self.size.is_some() || self.funds.is_some()
    }
}

impl crate::utils::retry::Stamped for OrderRequest {
    fn stamp(&mut self, at: DateTime<Utc>) {
        self.time = at;
    }
}

/// Exchange-side status of an acknowledged order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Received,
    Pending,
    Open,
    Active,
    Done,
    Canceled,
}

/// Order acknowledged by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveOrder {
    pub id: String,
    pub product_id: String,
    pub side: Side,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub size: Option<Decimal>,
    #[serde(default)]
    pub funds: Option<Decimal>,
    pub status: OrderStatus,
    pub time: DateTime<Utc>,
}

/// Balance of one currency
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Balance {
    pub balance: Decimal,
    pub available: Decimal,
    pub hold: Decimal,
}

impl Balance {
    pub fn new(balance: Decimal, hold: Decimal) -> Self {
        Self {
            balance,
            available: balance - hold,
            hold,
        }
    }
}

/// Balances per profile, then per currency
pub type Balances = BTreeMap<String, HashMap<String, Balance>>;

/// Order submission
#[async_trait]
pub trait OrderSubmitter: Send + Sync {
    /// Place an order. `Ok(None)` means the exchange did not acknowledge it.
    async fn place_order(&self, order: &OrderRequest) -> Result<Option<LiveOrder>, ApiError>;
}

/// Order cancellation
#[async_trait]
pub trait OrderCanceller: Send + Sync {
    /// Cancel an order, returning the canceled id
    async fn cancel_order(&self, order_id: &str) -> Result<String, ApiError>;
}

/// Balance query against the authenticated account
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn load_balances(&self) -> Result<Balances, ApiError>;
}

/// Submission and cancellation together, as the trading session needs them
pub trait OrderGateway: OrderSubmitter + OrderCanceller {}

impl<T: OrderSubmitter + OrderCanceller> OrderGateway for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_limit_builder() {
        let order = OrderRequest::limit("BTC-USD", Side::Buy, dec!(1000)).with_size(dec!(0.5));
        assert_eq!(order.order_type, OrderType::Limit);
        assert_eq!(order.price, Some(dec!(1000)));
        assert!(order.has_amount());
        assert!(order.stop.is_none());
    }

    #[test]
    fn test_order_request_wire_format() {
        let order =
            OrderRequest::market("BTC-USD", Side::Sell).with_stop(StopKind::Loss, dec!(950));
        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["side"], "sell");
        assert_eq!(json["order_type"], "market");
        assert_eq!(json["stop"]["kind"], "loss");
        assert!(json.get("size").is_none());
    }

    #[test]
    fn test_balance_available() {
        let balance = Balance::new(dec!(100), dec!(25));
        assert_eq!(balance.available, dec!(75));
    }

    #[test]
    fn test_transient_errors() {
        assert!(ApiError::RateLimited.is_transient());
        assert!(ApiError::ApiError { status: 503, message: String::new() }.is_transient());
        assert!(!ApiError::Rejected { reason: "post only".into() }.is_transient());
        assert!(!ApiError::NotFound { order_id: "x".into() }.is_transient());
    }

    #[test]
    fn test_sanitize_truncates_long_messages() {
        let err = sanitize_api_error(400, "x".repeat(600));
        match err {
            ApiError::ApiError { status, message } => {
                assert_eq!(status, 400);
                assert!(message.ends_with("(truncated)"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

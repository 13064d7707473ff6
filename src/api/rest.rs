//! REST exchange adapter
//! Implements the order and balance boundaries over a JSON REST API
//! (`POST /orders`, `DELETE /orders/{id}`, `GET /accounts`)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::{
    sanitize_api_error, ApiError, Balance, BalanceSource, Balances, LiveOrder, OrderCanceller,
    OrderRequest, OrderStatus, OrderSubmitter, OrderType, Side, StopKind,
};
use crate::utils::retry::{retry_with_backoff, BackoffPolicy};

const DEFAULT_PROFILE: &str = "default";

/// Order body as the exchange expects it
#[derive(Debug, Serialize)]
struct NewOrderBody<'a> {
    product_id: &'a str,
    side: Side,
    #[serde(rename = "type")]
    order_type: OrderType,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    funds: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<StopKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_price: Option<Decimal>,
}

impl<'a> From<&'a OrderRequest> for NewOrderBody<'a> {
    fn from(order: &'a OrderRequest) -> Self {
        Self {
            product_id: &order.product_id,
            side: order.side,
            order_type: order.order_type,
            price: order.price,
            size: order.size,
            funds: order.funds,
            stop: order.stop.as_ref().map(|s| s.kind),
            stop_price: order.stop.as_ref().map(|s| s.trigger_price),
        }
    }
}

/// Order acknowledgment
#[derive(Debug, Deserialize)]
struct OrderAck {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    product_id: Option<String>,
    #[serde(default)]
    price: Option<Decimal>,
    #[serde(default)]
    size: Option<Decimal>,
    #[serde(default)]
    funds: Option<Decimal>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    reject_reason: Option<String>,
}

/// One account row
#[derive(Debug, Deserialize)]
struct AccountEntry {
    currency: String,
    balance: Decimal,
    available: Decimal,
    hold: Decimal,
    #[serde(default)]
    profile_id: Option<String>,
}

/// REST exchange client
pub struct RestExchangeClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    read_retry: BackoffPolicy,
}

impl RestExchangeClient {
    /// Create new client with timeouts
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            read_retry: BackoffPolicy::new(3, 200),
        })
    }

    /// Override the retry policy used for balance reads
    pub fn with_read_retry(mut self, policy: BackoffPolicy) -> Self {
        self.read_retry = policy;
        self
    }

    /// Get headers with API key if available
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            match HeaderValue::from_str(key) {
                Ok(value) => {
                    headers.insert("X-API-KEY", value);
                }
                Err(_) => warn!("API key is not a valid header value, sending unauthenticated"),
            }
        }
        headers
    }

    async fn error_for(response: Response) -> ApiError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        match status {
            StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited,
            StatusCode::BAD_REQUEST => ApiError::Rejected { reason: text },
            _ => sanitize_api_error(status.as_u16(), text),
        }
    }

    async fn fetch_accounts(&self) -> Result<Vec<AccountEntry>, ApiError> {
        let url = format!("{}/accounts", self.base_url);
        let response = self.client.get(&url).headers(self.headers()).send().await?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        Ok(response.json().await?)
    }
}

fn parse_status(status: &str) -> OrderStatus {
    match status {
        "received" => OrderStatus::Received,
        "open" => OrderStatus::Open,
        "active" => OrderStatus::Active,
        "done" => OrderStatus::Done,
        "canceled" | "cancelled" => OrderStatus::Canceled,
        _ => OrderStatus::Pending,
    }
}

#[async_trait]
impl OrderSubmitter for RestExchangeClient {
    async fn place_order(&self, order: &OrderRequest) -> Result<Option<LiveOrder>, ApiError> {
        let url = format!("{}/orders", self.base_url);

        let response = self
            .client
            .post(&url)
            .headers(self.headers())
            .json(&NewOrderBody::from(order))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let ack: OrderAck = response.json().await?;
        let id = match ack.id {
            Some(id) if ack.status != "rejected" => id,
            _ => {
                warn!(
                    "Order for {} not acknowledged: {}",
                    order.product_id,
                    ack.reject_reason.as_deref().unwrap_or("no order id")
                );
                return Ok(None);
            }
        };

        info!("✅ Order acknowledged: {} ({})", id, ack.status);
        Ok(Some(LiveOrder {
            id,
            product_id: ack.product_id.unwrap_or_else(|| order.product_id.clone()),
            side: order.side,
            price: ack.price.or(order.price),
            size: ack.size.or(order.size),
            funds: ack.funds.or(order.funds),
            status: parse_status(&ack.status),
            time: ack.created_at.unwrap_or_else(Utc::now),
        }))
    }
}

#[async_trait]
impl OrderCanceller for RestExchangeClient {
    async fn cancel_order(&self, order_id: &str) -> Result<String, ApiError> {
        let url = format!("{}/orders/{}", self.base_url, order_id);

        let response = self.client.delete(&url).headers(self.headers()).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound {
                order_id: order_id.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        // Exchanges answer with the id, a list of ids, or nothing at all
        let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
        let canceled = match &body {
            serde_json::Value::String(id) => id.clone(),
            serde_json::Value::Array(ids) => ids
                .first()
                .and_then(|v| v.as_str())
                .unwrap_or(order_id)
                .to_string(),
            _ => order_id.to_string(),
        };

        info!("✅ Cancelled order: {}", canceled);
        Ok(canceled)
    }
}

#[async_trait]
impl BalanceSource for RestExchangeClient {
    async fn load_balances(&self) -> Result<Balances, ApiError> {
        let accounts = retry_with_backoff(
            "load_balances",
            &self.read_retry,
            ApiError::is_transient,
            || self.fetch_accounts(),
        )
        .await?;

        let mut balances = Balances::new();
        for account in accounts {
            let profile = account
                .profile_id
                .unwrap_or_else(|| DEFAULT_PROFILE.to_string());
            debug!("Balance {}: {} available ({})", account.currency, account.available, profile);
            balances.entry(profile).or_default().insert(
                account.currency,
                Balance {
                    balance: account.balance,
                    available: account.available,
                    hold: account.hold,
                },
            );
        }
        Ok(balances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> RestExchangeClient {
        RestExchangeClient::new(&server.uri(), Some("test-key".to_string()))
            .unwrap()
            .with_read_retry(BackoffPolicy::new(2, 1))
    }

    #[tokio::test]
    async fn test_place_order_acknowledged() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .and(header("X-API-KEY", "test-key"))
            .and(body_partial_json(serde_json::json!({
                "product_id": "BTC-USD",
                "side": "buy",
                "type": "limit",
                "price": "1000",
                "size": "0.5"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "abc-123",
                "product_id": "BTC-USD",
                "price": "1000",
                "size": "0.5",
                "status": "pending"
            })))
            .mount(&server)
            .await;

        let order = OrderRequest::limit("BTC-USD", Side::Buy, dec!(1000)).with_size(dec!(0.5));
        let live = client(&server).place_order(&order).await.unwrap().unwrap();

        assert_eq!(live.id, "abc-123");
        assert_eq!(live.status, OrderStatus::Pending);
        assert_eq!(live.size, Some(dec!(0.5)));
    }

    #[tokio::test]
    async fn test_place_order_rejected_status_is_not_acknowledged() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "abc-123",
                "status": "rejected",
                "reject_reason": "post only"
            })))
            .mount(&server)
            .await;

        let order = OrderRequest::market("BTC-USD", Side::Buy).with_funds(dec!(10));
        let result = client(&server).place_order(&order).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_place_order_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let order = OrderRequest::market("BTC-USD", Side::Buy).with_funds(dec!(10));
        let err = client(&server).place_order(&order).await.unwrap_err();
        assert!(matches!(err, ApiError::RateLimited));
    }

    #[tokio::test]
    async fn test_cancel_order() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/orders/abc-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!(["abc-123"])))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/orders/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client(&server);
        assert_eq!(client.cancel_order("abc-123").await.unwrap(), "abc-123");
        assert!(matches!(
            client.cancel_order("gone").await,
            Err(ApiError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_balances_groups_by_profile() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/accounts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "currency": "USD",
                    "balance": "150",
                    "available": "100",
                    "hold": "50",
                    "profile_id": "p1"
                },
                {
                    "currency": "BTC",
                    "balance": "2",
                    "available": "2",
                    "hold": "0",
                    "profile_id": "p1"
                }
            ])))
            .mount(&server)
            .await;

        let balances = client(&server).load_balances().await.unwrap();
        let profile = balances.get("p1").unwrap();
        assert_eq!(profile["USD"].available, dec!(100));
        assert_eq!(profile["BTC"].balance, dec!(2));
    }

    #[tokio::test]
    async fn test_load_balances_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/accounts"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/accounts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "currency": "USD", "balance": "10", "available": "10", "hold": "0" }
            ])))
            .mount(&server)
            .await;

        let balances = client(&server).load_balances().await.unwrap();
        assert_eq!(balances[DEFAULT_PROFILE]["USD"].available, dec!(10));
    }
}

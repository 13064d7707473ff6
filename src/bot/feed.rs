//! Market feed messages consumed by the bot pipeline

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One message from the market data feed. Only `ticker` messages drive the
/// bot; everything else is passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Ticker reduced to what strategy hooks need
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub product_id: String,
    pub price: Decimal,
    pub time: DateTime<Utc>,
}

impl FeedMessage {
    pub fn ticker(product_id: &str, price: Decimal) -> Self {
        Self {
            kind: "ticker".to_string(),
            product_id: Some(product_id.to_string()),
            price: Some(price),
            time: Some(Utc::now()),
            extra: Map::new(),
        }
    }

    pub fn is_ticker(&self) -> bool {
        self.kind == "ticker"
    }

    pub fn as_ticker(&self) -> Option<Tick> {
        if !self.is_ticker() {
            return None;
        }
        Some(Tick {
            product_id: self.product_id.clone()?,
            price: self.price?,
            time: self.time.unwrap_or_else(Utc::now),
        })
    }
}

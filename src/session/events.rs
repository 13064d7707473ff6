//! Confirmation events streamed by the exchange for orders placed through a
//! trading session

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::api::Side;

/// Listener key for one family of session events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    OrderPlaced,
    TradeExecuted,
    TradeFinalized,
    StopActive,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::OrderPlaced,
        EventKind::TradeExecuted,
        EventKind::TradeFinalized,
        EventKind::StopActive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::OrderPlaced => "Trader.order-placed",
            EventKind::TradeExecuted => "Trader.trade-executed",
            EventKind::TradeFinalized => "Trader.trade-finalized",
            EventKind::StopActive => "Trader.stop-active",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an order reached its terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalizeReason {
    Filled,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    /// The order is resting on the book
    #[serde(rename = "myOrderPlaced")]
    OrderPlaced {
        order_id: String,
        side: Side,
        #[serde(default)]
        price: Option<Decimal>,
        #[serde(default)]
        size: Option<Decimal>,
        time: DateTime<Utc>,
    },
    /// Part or all of the order traded
    #[serde(rename = "tradeExecuted")]
    TradeExecuted {
        order_id: String,
        side: Side,
        price: Decimal,
        trade_size: Decimal,
        remaining_size: Decimal,
        time: DateTime<Utc>,
    },
    #[serde(rename = "tradeFinalized")]
    TradeFinalized {
        order_id: String,
        side: Side,
        reason: FinalizeReason,
        remaining_size: Decimal,
        time: DateTime<Utc>,
    },
    /// A stop order triggered and is now working
    #[serde(rename = "stopActive")]
    StopActive {
        order_id: String,
        side: Side,
        stop_price: Decimal,
        time: DateTime<Utc>,
    },
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::OrderPlaced { .. } => EventKind::OrderPlaced,
            SessionEvent::TradeExecuted { .. } => EventKind::TradeExecuted,
            SessionEvent::TradeFinalized { .. } => EventKind::TradeFinalized,
            SessionEvent::StopActive { .. } => EventKind::StopActive,
        }
    }

    pub fn order_id(&self) -> &str {
        match self {
            SessionEvent::OrderPlaced { order_id, .. }
            | SessionEvent::TradeExecuted { order_id, .. }
            | SessionEvent::TradeFinalized { order_id, .. }
            | SessionEvent::StopActive { order_id, .. } => order_id,
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        match self {
            SessionEvent::OrderPlaced { time, .. }
            | SessionEvent::TradeExecuted { time, .. }
            | SessionEvent::TradeFinalized { time, .. }
            | SessionEvent::StopActive { time, .. } => *time,
        }
    }

    pub fn finalize_reason(&self) -> Option<FinalizeReason> {
        match self {
            SessionEvent::TradeFinalized { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

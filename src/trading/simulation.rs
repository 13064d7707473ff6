//! Paper trading
//! In-process exchange that acknowledges, fills and cancels orders against
//! marked prices and streams the same session events a live venue would.

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::api::{
    ApiError, Balance, BalanceSource, Balances, LiveOrder, OrderCanceller, OrderRequest,
    OrderStatus, OrderSubmitter, OrderType, Side, StopKind, StopSpec,
};
use crate::session::{FinalizeReason, SessionEvent};
use crate::trading::sizing::{self, SIZE_DP};

/// Trading mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    /// Live trading with real orders
    Live,
    /// Paper trading against the in-process exchange
    #[default]
    Paper,
}

impl TradingMode {
    /// Check if live trading
    pub fn is_live(&self) -> bool {
        matches!(self, TradingMode::Live)
    }

    pub fn is_paper(&self) -> bool {
        matches!(self, TradingMode::Paper)
    }
}

impl FromStr for TradingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "live" => Ok(TradingMode::Live),
            "paper" | "simulation" => Ok(TradingMode::Paper),
            other => Err(format!("unknown trading mode '{}'", other)),
        }
    }
}

struct PaperOrder {
    live: LiveOrder,
    order_type: OrderType,
    size: Option<Decimal>,
    funds: Option<Decimal>,
    stop: Option<StopSpec>,
    triggered: bool,
    /// Amount held against the funding currency
    reserved: Decimal,
}

impl PaperOrder {
    fn funding(&self, base: &str, quote: &str) -> String {
        match self.live.side {
            Side::Buy => quote.to_string(),
            Side::Sell => base.to_string(),
        }
    }
}

#[derive(Default)]
struct Book {
    last_price: Option<Decimal>,
    orders: BTreeMap<String, PaperOrder>,
    balances: HashMap<String, Balance>,
}

impl Book {
    fn balance_mut(&mut self, currency: &str) -> &mut Balance {
        self.balances.entry(currency.to_string()).or_default()
    }

    fn reserve(&mut self, currency: &str, amount: Decimal) -> Result<(), ApiError> {
        let balance = self.balance_mut(currency);
        if balance.available < amount {
            return Err(ApiError::Rejected {
                reason: format!(
                    "insufficient {}: available {}, required {}",
                    currency, balance.available, amount
                ),
            });
        }
        balance.available -= amount;
        balance.hold += amount;
        Ok(())
    }

    fn release(&mut self, currency: &str, amount: Decimal) {
        let balance = self.balance_mut(currency);
        balance.hold -= amount;
        balance.available += amount;
    }
}

/// Paper exchange for one product
pub struct PaperExchange {
    product_id: String,
    base: String,
    quote: String,
    book: Mutex<Book>,
    tx: mpsc::UnboundedSender<SessionEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    drop_acks: AtomicUsize,
}

impl PaperExchange {
    pub fn new(product_id: &str) -> Result<Self, ApiError> {
        let (base, quote) = sizing::split_product(product_id).ok_or_else(|| ApiError::Rejected {
            reason: format!("product id '{}' is not of the form BASE-QUOTE", product_id),
        })?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            product_id: product_id.to_string(),
            base: base.to_string(),
            quote: quote.to_string(),
            book: Mutex::new(Book::default()),
            tx,
            rx: Mutex::new(Some(rx)),
            drop_acks: AtomicUsize::new(0),
        })
    }

    pub fn with_balance(self, currency: &str, amount: Decimal) -> Self {
        self.lock()
            .balances
            .insert(currency.to_string(), Balance::new(amount, Decimal::ZERO));
        self
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    /// Event stream for `TradingSession::pump`. Can be taken once.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Leave the next `count` placements unacknowledged
    pub fn drop_next_acks(&self, count: usize) {
        self.drop_acks.store(count, Ordering::SeqCst);
    }

    pub fn last_price(&self) -> Option<Decimal> {
        self.lock().last_price
    }

    pub fn open_orders(&self) -> Vec<LiveOrder> {
        self.lock().orders.values().map(|o| o.live.clone()).collect()
    }

    pub fn balance(&self, currency: &str) -> Balance {
        self.lock().balances.get(currency).copied().unwrap_or_default()
    }

    /// Mark the market at `price`: trigger stops, then fill whatever crosses
    pub fn mark_price(&self, price: Decimal) {
        let mut book = self.lock();
        book.last_price = Some(price);

        let ids: Vec<String> = book.orders.keys().cloned().collect();
        for id in ids {
            let Some(order) = book.orders.get_mut(&id) else {
                continue;
            };

            if let (Some(stop), false) = (order.stop.clone(), order.triggered) {
                let hit = match stop.kind {
                    StopKind::Loss => price <= stop.trigger_price,
                    StopKind::Entry => price >= stop.trigger_price,
                };
                if !hit {
                    continue;
                }
                order.triggered = true;
                order.live.status = OrderStatus::Active;
                info!("[PAPER] stop order {} active at {}", id, price);
                self.send(SessionEvent::StopActive {
                    order_id: id.clone(),
                    side: order.live.side,
                    stop_price: stop.trigger_price,
                    time: Utc::now(),
                });
            }

            let fill_price = match (order.order_type, order.live.side, order.live.price) {
                (OrderType::Market, _, _) => Some(price),
                (OrderType::Limit, Side::Buy, Some(limit)) if price <= limit => Some(limit),
                (OrderType::Limit, Side::Sell, Some(limit)) if price >= limit => Some(limit),
                _ => None,
            };
            if let Some(fill_price) = fill_price {
                self.fill(&mut book, &id, fill_price);
            }
        }
    }

    fn fill(&self, book: &mut Book, id: &str, price: Decimal) {
        let Some(order) = book.orders.remove(id) else {
            return;
        };
        let funding = order.funding(&self.base, &self.quote);
        book.release(&funding, order.reserved);

        let size = match (order.size, order.funds) {
            (Some(size), _) => size,
            (None, Some(funds)) if !price.is_zero() => {
                (funds / price).round_dp_with_strategy(SIZE_DP, RoundingStrategy::ToZero)
            }
            _ => Decimal::ZERO,
        };
        let cost = order.funds.filter(|_| order.size.is_none()).unwrap_or(size * price);

        match order.live.side {
            Side::Buy => {
                let quote = book.balance_mut(&self.quote);
                quote.balance -= cost;
                quote.available -= cost;
                let base = book.balance_mut(&self.base);
                base.balance += size;
                base.available += size;
            }
            Side::Sell => {
                let base = book.balance_mut(&self.base);
                base.balance -= size;
                base.available -= size;
                let quote = book.balance_mut(&self.quote);
                quote.balance += cost;
                quote.available += cost;
            }
        }

        info!("[PAPER] {} {} {} @ {}", order.live.side.as_str(), size, self.product_id, price);
        let now = Utc::now();
        self.send(SessionEvent::TradeExecuted {
            order_id: id.to_string(),
            side: order.live.side,
            price,
            trade_size: size,
            remaining_size: Decimal::ZERO,
            time: now,
        });
        self.send(SessionEvent::TradeFinalized {
            order_id: id.to_string(),
            side: order.live.side,
            reason: FinalizeReason::Filled,
            remaining_size: Decimal::ZERO,
            time: now,
        });
    }

    fn send(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            debug!("[PAPER] event stream closed, dropping event");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reservation(
        &self,
        order: &OrderRequest,
        mark: Option<Decimal>,
    ) -> Result<Decimal, ApiError> {
        if order.side == Side::Sell {
            return order.size.ok_or_else(|| ApiError::Rejected {
                reason: "sell orders need a size".to_string(),
            });
        }
        if let Some(funds) = order.funds {
            return Ok(funds);
        }
        let price = order
            .price
            .or(order.stop.as_ref().map(|s| s.trigger_price))
            .or(mark)
            .ok_or_else(|| ApiError::Rejected {
                reason: "no price to value the order at".to_string(),
            })?;
        Ok(order.size.unwrap_or_default() * price)
    }
}

#[async_trait]
impl OrderSubmitter for PaperExchange {
    async fn place_order(&self, order: &OrderRequest) -> Result<Option<LiveOrder>, ApiError> {
        if self
            .drop_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            debug!("[PAPER] dropping acknowledgment for {} order", order.side.as_str());
            return Ok(None);
        }
        if order.product_id != self.product_id {
            return Err(ApiError::Rejected {
                reason: format!("unknown product {}", order.product_id),
            });
        }
        if !order.has_amount() {
            return Err(ApiError::Rejected {
                reason: "size or funds required".to_string(),
            });
        }
        if order.order_type == OrderType::Limit && order.price.is_none() {
            return Err(ApiError::Rejected {
                reason: "limit orders need a price".to_string(),
            });
        }

        let mut book = self.lock();
        let needs_mark = order.order_type == OrderType::Market && order.stop.is_none();
        if needs_mark && book.last_price.is_none() {
            return Err(ApiError::Rejected {
                reason: "no market price yet".to_string(),
            });
        }

        let reserved = self.reservation(order, book.last_price)?;
        let funding = match order.side {
            Side::Buy => self.quote.clone(),
            Side::Sell => self.base.clone(),
        };
        book.reserve(&funding, reserved)?;

        let id = Uuid::new_v4().to_string();
        let live = LiveOrder {
            id: id.clone(),
            product_id: order.product_id.clone(),
            side: order.side,
            price: order.price,
            size: order.size,
            funds: order.funds,
            status: if order.stop.is_some() {
                OrderStatus::Pending
            } else {
                OrderStatus::Open
            },
            time: order.time,
        };
        book.orders.insert(
            id.clone(),
            PaperOrder {
                live: live.clone(),
                order_type: order.order_type,
                size: order.size,
                funds: order.funds,
                stop: order.stop.clone(),
                triggered: false,
                reserved,
            },
        );
        info!("[PAPER] accepted {} {:?} order {}", order.side.as_str(), order.order_type, id);

        if order.order_type == OrderType::Limit && order.stop.is_none() {
            self.send(SessionEvent::OrderPlaced {
                order_id: id.clone(),
                side: order.side,
                price: order.price,
                size: order.size,
                time: Utc::now(),
            });
        }

        // match immediately against the current mark
        if let Some(mark) = book.last_price {
            drop(book);
            self.mark_price(mark);
        }

        Ok(Some(live))
    }
}

#[async_trait]
impl OrderCanceller for PaperExchange {
    async fn cancel_order(&self, order_id: &str) -> Result<String, ApiError> {
        let mut book = self.lock();
        let order = book.orders.remove(order_id).ok_or_else(|| ApiError::NotFound {
            order_id: order_id.to_string(),
        })?;
        let funding = order.funding(&self.base, &self.quote);
        book.release(&funding, order.reserved);

        info!("[PAPER] canceled order {}", order_id);
        self.send(SessionEvent::TradeFinalized {
            order_id: order_id.to_string(),
            side: order.live.side,
            reason: FinalizeReason::Canceled,
            remaining_size: order.size.unwrap_or_default(),
            time: Utc::now(),
        });
        Ok(order_id.to_string())
    }
}

#[async_trait]
impl BalanceSource for PaperExchange {
    async fn load_balances(&self) -> Result<Balances, ApiError> {
        let mut all = Balances::new();
        all.insert("paper".to_string(), self.lock().balances.clone());
        Ok(all)
    }
}

//! Dip-buying strategy used by the paper runner
//!
//! Buys the product with a market order once the price falls `dip` below the
//! highest price seen since the last flat point, and sells everything once the
//! price climbs `take_profit` above the entry price.

use anyhow::Context;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

use tickbot::api::{OrderRequest, Side};
use tickbot::bot::{BotInfo, Continuation, Tick, TradingStrategy};
use tickbot::trading::{stats, LifecycleStats, Position, PositionFactory, State};

pub struct DipStrategy {
    factory: PositionFactory,
    stats: Arc<Mutex<LifecycleStats>>,
    label: String,
    dip: Decimal,
    take_profit: Decimal,
    high: Option<Decimal>,
    entry_price: Option<Decimal>,
    position: Option<Position>,
}

impl DipStrategy {
    pub fn new(factory: PositionFactory, stats: Arc<Mutex<LifecycleStats>>) -> Self {
        Self {
            factory,
            stats,
            label: "dip".to_string(),
            dip: dec!(0.01),
            take_profit: dec!(0.01),
            high: None,
            entry_price: None,
            position: None,
        }
    }

    pub fn with_thresholds(mut self, dip: Decimal, take_profit: Decimal) -> Self {
        self.dip = dip;
        self.take_profit = take_profit;
        self
    }

    fn state(&self) -> State {
        self.position.as_ref().map(Position::in_position).unwrap_or(State::Ready)
    }

    fn market(&self, side: Side) -> OrderRequest {
        OrderRequest::market(self.factory.session().product_id(), side)
    }

    async fn enter(&mut self, price: Decimal) -> anyhow::Result<()> {
        let position = self.factory.long();
        stats::track(position.subscribe(), self.stats.clone());

        let order = position
            .enter(&self.market(Side::Buy))
            .await
            .context("entry order failed")?;
        info!("{}: entered at ~{} with order {}", self.label, price, order.id);

        self.entry_price = Some(price);
        self.position = Some(position);
        Ok(())
    }

    async fn exit(&mut self, price: Decimal) -> anyhow::Result<()> {
        let Some(position) = &self.position else {
            return Ok(());
        };
        if position.exit_order().is_some() {
            return Ok(());
        }
        let order = position
            .exit(&self.market(Side::Sell))
            .await
            .context("exit order failed")?;
        info!("{}: exiting at ~{} with order {}", self.label, price, order.id);
        Ok(())
    }

    /// Forget a position that has settled back to ready
    fn settle(&mut self, price: Decimal) {
        if self.position.is_some() && self.state() == State::Ready {
            self.position = None;
            self.entry_price = None;
            self.high = Some(price);
        }
    }
}

#[async_trait]
impl TradingStrategy for DipStrategy {
    fn product_id(&self) -> &str {
        self.factory.session().product_id()
    }

    fn attach(&mut self, bot: BotInfo) {
        self.label = bot.name;
    }

    async fn on_init(&mut self, tick: &Tick, next: Continuation) -> anyhow::Result<()> {
        self.high = Some(tick.price);
        next.fire()?;
        Ok(())
    }

    async fn on_restart(&mut self, tick: &Tick, next: Continuation) -> anyhow::Result<()> {
        self.settle(tick.price);
        self.high = Some(tick.price);
        next.fire()?;
        Ok(())
    }

    async fn on_trade(&mut self, tick: &Tick, _next: Continuation) -> anyhow::Result<()> {
        self.settle(tick.price);

        match self.state() {
            State::Ready => {
                let high = self.high.map_or(tick.price, |high| high.max(tick.price));
                self.high = Some(high);
                if tick.price <= high * (Decimal::ONE - self.dip) {
                    self.enter(tick.price).await?;
                }
            }
            State::Active => {
                let target = self
                    .entry_price
                    .map(|entry| entry * (Decimal::ONE + self.take_profit));
                if target.is_some_and(|target| tick.price >= target) {
                    self.exit(tick.price).await?;
                }
            }
            State::Pending => {}
        }
        Ok(())
    }

    async fn on_exit(&mut self, tick: &Tick, next: Continuation) -> anyhow::Result<()> {
        self.settle(tick.price);

        match self.state() {
            State::Ready => {
                next.fire()?;
            }
            State::Pending => {
                if let Some(position) = &self.position {
                    if let Err(err) = position.cancel_pending_entry().await {
                        warn!("{}: could not cancel pending entry: {}", self.label, err);
                    }
                }
            }
            State::Active => self.exit(tick.price).await?,
        }
        Ok(())
    }

    fn trade_stats(&self) -> serde_json::Value {
        let stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_value(&*stats).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tickbot::bot::{Bot, BotState, FeedMessage};
    use tickbot::session::TradingSession;
    use tickbot::trading::{PaperExchange, PositionConfig};

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_dip_then_take_profit() {
        let exchange = PaperExchange::new("BTC-USD").unwrap().with_balance("USD", dec!(1000));
        let exchange = Arc::new(exchange);
        let session = TradingSession::new("BTC-USD", exchange.clone());
        let pump = session.pump(exchange.events().unwrap());
        let factory = PositionFactory::new(session, exchange.clone(), PositionConfig::default());
        let stats = Arc::new(Mutex::new(LifecycleStats::new()));
        let bot = Bot::new("dip-test", DipStrategy::new(factory, stats.clone()));

        for price in [dec!(100), dec!(100), dec!(98), dec!(99), dec!(100)] {
            exchange.mark_price(price);
            bot.process(&FeedMessage::ticker("BTC-USD", price)).await;
            settle().await;
        }

        assert_eq!(bot.state(), BotState::Trading);
        let recorded = stats.lock().unwrap().clone();
        assert_eq!(recorded.entries, 1);
        assert_eq!(recorded.exits, 1);
        assert!(exchange.balance("USD").balance > dec!(1000));
        assert_eq!(bot.trade_stats().await["entries"], 1);
        pump.abort();
    }

    #[tokio::test]
    async fn test_custom_thresholds_widen_entry_and_target() {
        let exchange = PaperExchange::new("BTC-USD").unwrap().with_balance("USD", dec!(1000));
        let exchange = Arc::new(exchange);
        let session = TradingSession::new("BTC-USD", exchange.clone());
        let pump = session.pump(exchange.events().unwrap());
        let factory = PositionFactory::new(session, exchange.clone(), PositionConfig::default());
        let stats = Arc::new(Mutex::new(LifecycleStats::new()));
        let strategy =
            DipStrategy::new(factory, stats.clone()).with_thresholds(dec!(0.05), dec!(0.02));
        let bot = Bot::new("dip-test", strategy);

        for price in [dec!(100), dec!(100), dec!(98)] {
            exchange.mark_price(price);
            bot.process(&FeedMessage::ticker("BTC-USD", price)).await;
            settle().await;
        }
        assert_eq!(stats.lock().unwrap().entries, 0);

        for price in [dec!(95), dec!(96)] {
            exchange.mark_price(price);
            bot.process(&FeedMessage::ticker("BTC-USD", price)).await;
            settle().await;
        }
        assert_eq!(stats.lock().unwrap().entries, 1);
        assert_eq!(stats.lock().unwrap().exits, 0);

        exchange.mark_price(dec!(97));
        bot.process(&FeedMessage::ticker("BTC-USD", dec!(97))).await;
        settle().await;
        assert_eq!(stats.lock().unwrap().exits, 1);
        pump.abort();
    }

    #[tokio::test]
    async fn test_exit_state_flattens_then_idles() {
        let exchange = PaperExchange::new("BTC-USD").unwrap().with_balance("USD", dec!(1000));
        let exchange = Arc::new(exchange);
        let session = TradingSession::new("BTC-USD", exchange.clone());
        let pump = session.pump(exchange.events().unwrap());
        let factory = PositionFactory::new(session, exchange.clone(), PositionConfig::default());
        let stats = Arc::new(Mutex::new(LifecycleStats::new()));
        let bot = Bot::new("dip-test", DipStrategy::new(factory, stats.clone()));

        for price in [dec!(100), dec!(100), dec!(97)] {
            exchange.mark_price(price);
            bot.process(&FeedMessage::ticker("BTC-USD", price)).await;
            settle().await;
        }
        assert_eq!(stats.lock().unwrap().entries, 1);

        bot.stop(None).unwrap();
        for price in [dec!(96), dec!(96)] {
            exchange.mark_price(price);
            bot.process(&FeedMessage::ticker("BTC-USD", price)).await;
            settle().await;
        }

        assert_eq!(bot.state(), BotState::Idle);
        assert_eq!(stats.lock().unwrap().exits, 1);
        assert_eq!(exchange.balance("BTC").available, Decimal::ZERO);
        pump.abort();
    }
}

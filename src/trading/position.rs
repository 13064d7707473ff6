//! Position lifecycle
//!
//! A position tracks one directional exposure on one product through
//! `Ready -> Pending -> Active -> Ready`. Orders go out through the retry
//! sender; fills and cancellations come back asynchronously as session events
//! and are routed to the position through a scope bound to the acknowledged
//! order id.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::api::{BalanceSource, LiveOrder, OrderRequest, OrderType};
use crate::session::{
    EventKind, FinalizeReason, OrderScope, ScopedHandler, SessionEvent, TradingSession,
};
use crate::trading::errors::TradingError;
use crate::trading::sizing;
use crate::utils::retry::{RetryOrderConfig, RetryOrderSender};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionType {
    Long,
    Short,
}

impl fmt::Display for PositionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionType::Long => f.write_str("long"),
            PositionType::Short => f.write_str("short"),
        }
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    Ready,
    Pending,
    Active,
}

/// Construction-time settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionConfig {
    /// Fraction of the available balance used when an order carries no amount
    pub avail_funds_perc: Decimal,
    /// Hold the entered/exited event until the order is finalized
    pub wait_for_funds_to_clear: bool,
    pub max_retries_on_order_fail: u32,
    /// Placement attempts per interval
    pub retry_limit: u32,
    pub retry_interval_ms: u64,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            avail_funds_perc: Decimal::ONE,
            wait_for_funds_to_clear: true,
            max_retries_on_order_fail: 1,
            retry_limit: 1,
            retry_interval_ms: 350,
        }
    }
}

impl PositionConfig {
    pub fn retry_config(&self) -> RetryOrderConfig {
        RetryOrderConfig {
            limit: self.retry_limit,
            interval_ms: self.retry_interval_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionEventKind {
    Entered,
    Exited,
    EntryCanceled,
    ExitCanceled,
}

/// Domain event names emitted by one position variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventNames {
    pub entry: &'static str,
    pub exit: &'static str,
    pub cancel_entry: &'static str,
    pub cancel_exit: &'static str,
}

impl EventNames {
    pub const LONG: EventNames = EventNames {
        entry: "Position.enter-long",
        exit: "Position.exit-long",
        cancel_entry: "Position.cancel-enter-long",
        cancel_exit: "Position.cancel-exit-long",
    };

    pub const SHORT: EventNames = EventNames {
        entry: "Position.enter-short",
        exit: "Position.exit-short",
        cancel_entry: "Position.cancel-enter-short",
        cancel_exit: "Position.cancel-exit-short",
    };

    pub fn for_type(position_type: PositionType) -> &'static EventNames {
        match position_type {
            PositionType::Long => &Self::LONG,
            PositionType::Short => &Self::SHORT,
        }
    }

    pub fn name(&self, kind: PositionEventKind) -> &'static str {
        match kind {
            PositionEventKind::Entered => self.entry,
            PositionEventKind::Exited => self.exit,
            PositionEventKind::EntryCanceled => self.cancel_entry,
            PositionEventKind::ExitCanceled => self.cancel_exit,
        }
    }
}

/// Lifecycle event delivered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct PositionEvent {
    pub name: &'static str,
    pub kind: PositionEventKind,
    pub position_type: PositionType,
    pub order_id: String,
    /// Execution that produced an entered/exited event, when one was seen
    pub trade: Option<SessionEvent>,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leg {
    Entry,
    Exit,
}

impl Leg {
    fn as_str(&self) -> &'static str {
        match self {
            Leg::Entry => "entry",
            Leg::Exit => "exit",
        }
    }

    fn completed(&self) -> PositionEventKind {
        match self {
            Leg::Entry => PositionEventKind::Entered,
            Leg::Exit => PositionEventKind::Exited,
        }
    }

    fn canceled(&self) -> PositionEventKind {
        match self {
            Leg::Entry => PositionEventKind::EntryCanceled,
            Leg::Exit => PositionEventKind::ExitCanceled,
        }
    }
}

/// Book-keeping for one order of the position
#[derive(Default)]
struct OrderLeg {
    order: Option<LiveOrder>,
    scope: Option<OrderScope>,
    deferred: Option<SessionEvent>,
    announced: bool,
    requested: bool,
}

impl OrderLeg {
    fn clear(&mut self) {
        if let Some(scope) = self.scope.take() {
            scope.close();
        }
        *self = OrderLeg::default();
    }
}

struct Lifecycle {
    state: State,
    entry: OrderLeg,
    exit: OrderLeg,
}

impl Lifecycle {
    fn leg_mut(&mut self, leg: Leg) -> &mut OrderLeg {
        match leg {
            Leg::Entry => &mut self.entry,
            Leg::Exit => &mut self.exit,
        }
    }
}

/// Rolls a leg back when its request ends without an acknowledged order,
/// whether it failed or the caller dropped the request future.
struct RequestGuard<'a> {
    position: &'a Position,
    leg: Leg,
    armed: bool,
}

impl<'a> RequestGuard<'a> {
    fn new(position: &'a Position, leg: Leg) -> Self {
        Self {
            position,
            leg,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut lifecycle = self.position.lock();
        match self.leg {
            Leg::Entry => {
                if lifecycle.state == State::Pending && lifecycle.entry.order.is_none() {
                    lifecycle.state = State::Ready;
                    lifecycle.entry.clear();
                    debug!("Position->entry request abandoned, back to Ready");
                }
            }
            Leg::Exit => {
                if lifecycle.exit.order.is_none() {
                    lifecycle.exit.clear();
                    debug!("Position->exit request abandoned");
                }
            }
        }
    }
}

struct Shared {
    position_type: PositionType,
    names: &'static EventNames,
    session: TradingSession,
    balances: Arc<dyn BalanceSource>,
    config: PositionConfig,
    sender: RetryOrderSender,
    lifecycle: Mutex<Lifecycle>,
    events: broadcast::Sender<PositionEvent>,
}

/// One directional exposure. Clones share the same lifecycle.
#[derive(Clone)]
pub struct Position {
    shared: Arc<Shared>,
}

impl Position {
    pub fn new(
        position_type: PositionType,
        session: TradingSession,
        balances: Arc<dyn BalanceSource>,
        config: PositionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let sender = RetryOrderSender::new(config.retry_config());
        Self {
            shared: Arc::new(Shared {
                position_type,
                names: EventNames::for_type(position_type),
                session,
                balances,
                config,
                sender,
                lifecycle: Mutex::new(Lifecycle {
                    state: State::Ready,
                    entry: OrderLeg::default(),
                    exit: OrderLeg::default(),
                }),
                events,
            }),
        }
    }

    pub fn long(
        session: TradingSession,
        balances: Arc<dyn BalanceSource>,
        config: PositionConfig,
    ) -> Self {
        Self::new(PositionType::Long, session, balances, config)
    }

    pub fn short(
        session: TradingSession,
        balances: Arc<dyn BalanceSource>,
        config: PositionConfig,
    ) -> Self {
        Self::new(PositionType::Short, session, balances, config)
    }

    pub fn position_type(&self) -> PositionType {
        self.shared.position_type
    }

    pub fn event_names(&self) -> &'static EventNames {
        self.shared.names
    }

    pub fn config(&self) -> &PositionConfig {
        &self.shared.config
    }

    pub fn in_position(&self) -> State {
        self.lock().state
    }

    pub fn entry_order(&self) -> Option<LiveOrder> {
        self.lock().entry.order.clone()
    }

    pub fn exit_order(&self) -> Option<LiveOrder> {
        self.lock().exit.order.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PositionEvent> {
        self.shared.events.subscribe()
    }

    /// Open the position. Only valid from `Ready`.
    ///
    /// The position is `Pending` before this first suspends. The caller's
    /// order is never modified; the copy sent downstream gets an amount from
    /// the available balance when it has none.
    pub async fn enter(&self, order: &OrderRequest) -> Result<LiveOrder, TradingError> {
        {
            let mut lifecycle = self.lock();
            if lifecycle.state != State::Ready {
                return Err(TradingError::invalid_state(format!(
                    "cannot enter a {} position while {:?}",
                    self.shared.position_type, lifecycle.state
                )));
            }
            lifecycle.state = State::Pending;
            lifecycle.entry.requested = true;
        }
        info!("Position->entering {} on {}", self.shared.position_type, order.product_id);
        let guard = RequestGuard::new(self, Leg::Entry);

        let mut msg = order.clone();
        let result = self
            .shared
            .sender
            .send_order(
                &mut msg,
                |attempt| self.place(Leg::Entry, attempt),
                self.shared.config.max_retries_on_order_fail,
            )
            .await;

        match &result {
            Ok(_) => guard.disarm(),
            Err(err) => {
                drop(guard);
                error!("Position->entry failed ({}): {}", err.category(), err);
            }
        }
        result
    }

    /// Close the position. Only valid while `Active` with no exit outstanding;
    /// the position stays `Active` until the exit order is finalized.
    pub async fn exit(&self, order: &OrderRequest) -> Result<LiveOrder, TradingError> {
        {
            let mut lifecycle = self.lock();
            if lifecycle.state != State::Active {
                return Err(TradingError::invalid_state(format!(
                    "cannot exit a {} position while {:?}",
                    self.shared.position_type, lifecycle.state
                )));
            }
            if lifecycle.exit.requested {
                return Err(TradingError::invalid_state("an exit order is already outstanding"));
            }
            lifecycle.exit.requested = true;
        }
        info!("Position->exiting {} on {}", self.shared.position_type, order.product_id);
        let guard = RequestGuard::new(self, Leg::Exit);

        let mut msg = order.clone();
        let result = self
            .shared
            .sender
            .send_order(
                &mut msg,
                |attempt| self.place(Leg::Exit, attempt),
                self.shared.config.max_retries_on_order_fail,
            )
            .await;

        match &result {
            Ok(_) => guard.disarm(),
            Err(err) => {
                drop(guard);
                error!("Position->exit failed ({}): {}", err.category(), err);
            }
        }
        result
    }

    /// Cancel an acknowledged entry that has not filled yet.
    ///
    /// Succeeds without doing anything while `Ready`. Fails while `Active`, and
    /// while the entry request has not been acknowledged yet.
    pub async fn cancel_pending_entry(&self) -> Result<(), TradingError> {
        debug!("Position->cancelling any pending entries");

        let order_id = {
            let lifecycle = self.lock();
            match lifecycle.state {
                State::Ready => return Ok(()),
                State::Active => {
                    return Err(TradingError::cancel_pending_entry(
                        "Position is currently active",
                        None,
                    ))
                }
                State::Pending => match &lifecycle.entry.order {
                    Some(order) => order.id.clone(),
                    None => {
                        return Err(TradingError::cancel_pending_entry(
                            "Previous order request in flight",
                            None,
                        ))
                    }
                },
            }
        };

        debug!("Position->canceling open order {}", order_id);
        let canceled_id = self
            .shared
            .session
            .cancel_order(&order_id)
            .await
            .map_err(|err| {
                error!("Position->unable to cancel order {}: {}", order_id, err);
                TradingError::cancel_pending_entry(
                    "Unable to cancel pending orders",
                    Some(json!({ "order_id": order_id, "cause": err.to_string() })),
                )
            })?;

        let state = {
            let mut lifecycle = self.lock();
            let still_pending = lifecycle.state == State::Pending
                && lifecycle.entry.order.as_ref().map(|o| o.id == order_id).unwrap_or(false);
            if still_pending {
                lifecycle.entry.clear();
                lifecycle.state = State::Ready;
                None
            } else {
                Some(lifecycle.state)
            }
        };

        match state {
            None => {
                info!("Position->entry order {} canceled", canceled_id);
                self.emit(PositionEventKind::EntryCanceled, &canceled_id, None);
                Ok(())
            }
            // A finalize for the same order got there first and already settled it
            Some(State::Ready) => Ok(()),
            Some(state) => Err(TradingError::cancel_pending_entry(
                "Entry filled before the cancellation completed",
                Some(json!({ "order_id": order_id, "state": format!("{:?}", state) })),
            )),
        }
    }

    /// Available (unreserved) balance of `currency` in the first profile
    pub async fn get_available_funds(&self, currency: &str) -> Result<Decimal, TradingError> {
        let balances = self
            .shared
            .balances
            .load_balances()
            .await
            .map_err(|err| TradingError::Balance {
                message: err.to_string(),
            })?;

        let available = balances
            .values()
            .next()
            .and_then(|profile| profile.get(currency))
            .map(|balance| balance.available)
            .ok_or_else(|| TradingError::Balance {
                message: format!("no balance for {}", currency),
            })?;

        debug!("Available Funds: {} {}", available.round_dp(8), currency);
        Ok(available)
    }

    async fn place(
        &self,
        leg: Leg,
        mut order: OrderRequest,
    ) -> Result<Option<LiveOrder>, TradingError> {
        if !order.has_amount() {
            debug!("Position->no size or funds, getting available funds");
            let currency = sizing::funding_currency(&order.product_id, order.side)?.to_string();
            let available = self.get_available_funds(&currency).await?;
            sizing::fill_amount(&mut order, available, self.shared.config.avail_funds_perc)?;
        }

        let label = format!("{}-{}", leg.as_str(), self.shared.position_type);
        let scope = self.shared.session.open_scope(&label);
        self.install_listeners(leg, &scope, &order);

        match self.shared.session.place_order(&order).await {
            Ok(Some(live)) => {
                {
                    let mut lifecycle = self.lock();
                    let slot = lifecycle.leg_mut(leg);
                    slot.order = Some(live.clone());
                    slot.scope = Some(scope.clone());
                    slot.deferred = None;
                    slot.announced = false;
                }
                debug!(
                    "Position->exchange responded to {} order request: {:?}",
                    leg.as_str(),
                    live
                );
                scope.bind(&live.id);
                Ok(Some(live))
            }
            Ok(None) => {
                scope.close();
                Err(TradingError::place_order_fail("Placing Order failed"))
            }
            Err(err) => {
                scope.close();
                Err(err.into())
            }
        }
    }

    fn install_listeners(&self, leg: Leg, scope: &OrderScope, order: &OrderRequest) {
        if order.order_type == OrderType::Limit {
            scope.listen(EventKind::OrderPlaced, self.handler(leg, Self::on_order_placed));
        }
        scope.listen(EventKind::TradeExecuted, self.handler(leg, Self::on_trade_executed));
        scope.listen(EventKind::TradeFinalized, self.handler(leg, Self::on_trade_finalized));
        if order.stop.is_some() {
            scope.listen(EventKind::StopActive, self.handler(leg, Self::on_stop_active));
        }
    }

    fn handler(
        &self,
        leg: Leg,
        f: fn(&Position, Leg, &OrderScope, &SessionEvent),
    ) -> ScopedHandler {
        let shared = Arc::downgrade(&self.shared);
        Arc::new(move |scope: &OrderScope, event: &SessionEvent| {
            if let Some(shared) = shared.upgrade() {
                f(&Position { shared }, leg, scope, event);
            }
        })
    }

    fn on_order_placed(&self, leg: Leg, scope: &OrderScope, event: &SessionEvent) {
        // on the book; the position stays where it is
        scope.release(EventKind::OrderPlaced);
        info!("Position->limit {} order {} placed", leg.as_str(), event.order_id());
    }

    fn on_stop_active(&self, leg: Leg, scope: &OrderScope, event: &SessionEvent) {
        scope.release(EventKind::StopActive);
        info!("Position->stop {} order {} active", leg.as_str(), event.order_id());
        debug!("Position->stop details: {:?}", event);
    }

    fn on_trade_executed(&self, leg: Leg, scope: &OrderScope, event: &SessionEvent) {
        scope.release(EventKind::TradeExecuted);
        info!("Position->{} order {} trade executed", leg.as_str(), event.order_id());

        let announce = {
            let mut lifecycle = self.lock();
            if leg == Leg::Entry {
                lifecycle.state = State::Active;
            }
            let slot = lifecycle.leg_mut(leg);
            if self.shared.config.wait_for_funds_to_clear {
                slot.deferred = Some(event.clone());
                false
            } else {
                !std::mem::replace(&mut slot.announced, true)
            }
        };

        if announce {
            self.emit(leg.completed(), event.order_id(), Some(event.clone()));
        }
    }

    fn on_trade_finalized(&self, leg: Leg, scope: &OrderScope, event: &SessionEvent) {
        scope.close();
        let order_id = event.order_id();
        let reason = event.finalize_reason().unwrap_or(FinalizeReason::Filled);

        let mut settled_entry = None;
        let emit = {
            let mut lifecycle = self.lock();
            match (leg, reason) {
                (Leg::Entry, FinalizeReason::Canceled) => {
                    lifecycle.entry.clear();
                    lifecycle.state = State::Ready;
                    Some((leg.canceled(), None))
                }
                (Leg::Exit, FinalizeReason::Canceled) => {
                    lifecycle.exit.clear();
                    Some((leg.canceled(), None))
                }
                (Leg::Entry, FinalizeReason::Filled) => {
                    let announced = std::mem::replace(&mut lifecycle.entry.announced, true);
                    let trade = lifecycle.entry.deferred.take();
                    lifecycle.entry.clear();
                    lifecycle.state = State::Active;
                    (!announced).then(|| (leg.completed(), trade))
                }
                (Leg::Exit, FinalizeReason::Filled) => {
                    // an entry still waiting on its own finalize is announced first
                    if !lifecycle.entry.announced {
                        let entry_id = lifecycle.entry.order.as_ref().map(|o| o.id.clone());
                        if let Some(entry_id) = entry_id {
                            settled_entry = Some((entry_id, lifecycle.entry.deferred.take()));
                        }
                    }
                    let announced = lifecycle.exit.announced;
                    let trade = lifecycle.exit.deferred.take();
                    lifecycle.exit.clear();
                    lifecycle.entry.clear();
                    lifecycle.state = State::Ready;
                    (!announced).then(|| (leg.completed(), trade))
                }
            }
        };

        info!(
            "Position->{} order {} finalized ({:?}), position {:?}",
            leg.as_str(),
            order_id,
            reason,
            self.in_position()
        );
        if let Some((entry_id, trade)) = settled_entry {
            self.emit(PositionEventKind::Entered, &entry_id, trade);
        }
        if let Some((kind, trade)) = emit {
            self.emit(kind, order_id, trade);
        }
    }

    fn emit(&self, kind: PositionEventKind, order_id: &str, trade: Option<SessionEvent>) {
        let name = self.shared.names.name(kind);
        info!("Position->emitting {} for order {}", name, order_id);
        let _ = self.shared.events.send(PositionEvent {
            name,
            kind,
            position_type: self.shared.position_type,
            order_id: order_id.to_string(),
            trade,
            time: Utc::now(),
        });
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.shared.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lifecycle = self.lock();
        f.debug_struct("Position")
            .field("type", &self.shared.position_type)
            .field("state", &lifecycle.state)
            .field("entry", &lifecycle.entry.order.as_ref().map(|o| &o.id))
            .field("exit", &lifecycle.exit.order.as_ref().map(|o| &o.id))
            .finish()
    }
}

/// Builds positions that share one session, balance source and config
#[derive(Clone)]
pub struct PositionFactory {
    session: TradingSession,
    balances: Arc<dyn BalanceSource>,
    config: PositionConfig,
}

impl PositionFactory {
    pub fn new(
        session: TradingSession,
        balances: Arc<dyn BalanceSource>,
        config: PositionConfig,
    ) -> Self {
        Self {
            session,
            balances,
            config,
        }
    }

    pub fn open(&self, position_type: PositionType) -> Position {
        Position::new(
            position_type,
            self.session.clone(),
            self.balances.clone(),
            self.config.clone(),
        )
    }

    pub fn long(&self) -> Position {
        self.open(PositionType::Long)
    }

    pub fn short(&self) -> Position {
        self.open(PositionType::Short)
    }

    pub fn session(&self) -> &TradingSession {
        &self.session
    }
}

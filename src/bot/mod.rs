//! Bot control state machine
//!
//! A bot consumes a feed of market messages, forwards every message
//! downstream, and hands tickers for its product to the strategy hook of the
//! current control state. Hook failures never escape: they are logged and
//! turned into a forced `redbutton`.

pub mod feed;
pub mod registry;
pub mod state;
pub mod strategy;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use feed::{FeedMessage, Tick};
pub use registry::{BotEntry, BotOptions, BotRegistry};
pub use state::{BotState, Transition};
pub use strategy::{BotInfo, Continuation, TradingStrategy};

const TRANSITION_CAPACITY: usize = 64;

/// Strategy shared between the bot and whoever built it
pub type SharedStrategy = Arc<tokio::sync::Mutex<dyn TradingStrategy>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BotError {
    #[error("Invalid transition '{transition}' from state '{from}'")]
    InvalidTransition { from: BotState, transition: Transition },
    #[error("Bot not found: {0}")]
    NotFound(String),
    #[error("Bot {0} is not idle")]
    NotIdle(String),
}

/// Observed state change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BotTransition {
    pub from: BotState,
    pub to: BotState,
    pub transition: Transition,
    pub time: DateTime<Utc>,
}

pub(crate) struct Core {
    id: String,
    name: String,
    state: Mutex<BotState>,
    transitions: broadcast::Sender<BotTransition>,
    escalation: Mutex<Option<CancellationToken>>,
}

impl Core {
    fn state(&self) -> BotState {
        *self.lock_state()
    }

    pub(crate) fn fire(&self, transition: Transition) -> Result<BotState, BotError> {
        self.fire_from(None, transition)
    }

    /// Apply `transition`, optionally only when the bot is in `expected`
    fn fire_from(
        &self,
        expected: Option<BotState>,
        transition: Transition,
    ) -> Result<BotState, BotError> {
        let (from, to) = {
            let mut state = self.lock_state();
            let from = *state;
            let to = match expected {
                Some(expected) if expected != from => None,
                _ => transition.target(from),
            }
            .ok_or(BotError::InvalidTransition { from, transition })?;
            *state = to;
            (from, to)
        };

        if from == BotState::Exit && to != BotState::Exit {
            self.disarm_escalation();
        }

        info!("Bot {} transitioned: ({}) -> ({})", self.name, from, to);
        let _ = self.transitions.send(BotTransition {
            from,
            to,
            transition,
            time: Utc::now(),
        });
        Ok(to)
    }

    fn arm_escalation(&self, token: CancellationToken) {
        let previous = self
            .escalation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    fn disarm_escalation(&self) {
        let token = self.escalation.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(token) = token {
            debug!("Bot {} stop escalation canceled", self.name);
            token.cancel();
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a running bot. Clones drive the same machine.
#[derive(Clone)]
pub struct Bot {
    core: Arc<Core>,
    strategy: SharedStrategy,
    product_id: String,
}

impl Bot {
    /// Build a bot around `strategy`; the bot starts out in `init`
    pub fn new<S: TradingStrategy + 'static>(name: &str, mut strategy: S) -> Self {
        let core = Self::core(name);
        strategy.attach(BotInfo {
            id: core.id.clone(),
            name: core.name.clone(),
        });
        let product_id = strategy.product_id().to_string();
        Self::assemble(core, Arc::new(tokio::sync::Mutex::new(strategy)), product_id)
    }

    /// Build a bot around a strategy owned elsewhere
    pub async fn with_shared(name: &str, strategy: SharedStrategy) -> Self {
        let core = Self::core(name);
        let product_id = {
            let mut guard = strategy.lock().await;
            guard.attach(BotInfo {
                id: core.id.clone(),
                name: core.name.clone(),
            });
            guard.product_id().to_string()
        };
        Self::assemble(core, strategy, product_id)
    }

    fn core(name: &str) -> Arc<Core> {
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Arc::new(Core {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            state: Mutex::new(BotState::Idle),
            transitions,
            escalation: Mutex::new(None),
        })
    }

    fn assemble(core: Arc<Core>, strategy: SharedStrategy, product_id: String) -> Self {
        let bot = Self {
            core,
            strategy,
            product_id,
        };
        if let Err(err) = bot.core.fire(Transition::Init) {
            error!("Bot {} could not initialize: {}", bot.core.name, err);
        }
        bot
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn state(&self) -> BotState {
        self.core.state()
    }

    pub fn transitions(&self) -> broadcast::Receiver<BotTransition> {
        self.core.transitions.subscribe()
    }

    pub fn strategy(&self) -> &SharedStrategy {
        &self.strategy
    }

    /// Leave `idle` through `restart`
    pub fn start(&self) -> Result<BotState, BotError> {
        self.core.fire_from(Some(BotState::Idle), Transition::Restart)
    }

    /// Leave `trading` for `exit`. With a timeout, the bot is forced into
    /// `error` if it is still in `exit` when the timeout elapses.
    pub fn stop(&self, timeout: Option<Duration>) -> Result<BotState, BotError> {
        let state = self.core.fire_from(Some(BotState::Trading), Transition::Stop)?;

        if let Some(timeout) = timeout {
            let token = CancellationToken::new();
            self.core.arm_escalation(token.clone());

            let core = Arc::downgrade(&self.core);
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        if let Some(core) = core.upgrade() {
                            if core.fire_from(Some(BotState::Exit), Transition::Redbutton).is_ok() {
                                warn!(
                                    "Bot {} did not exit within {:?}, forced to error",
                                    core.name, timeout
                                );
                            }
                        }
                    }
                }
            });
        }
        Ok(state)
    }

    pub fn reset(&self) -> BotState {
        self.force(Transition::Reset)
    }

    pub fn red_button(&self) -> BotState {
        self.force(Transition::Redbutton)
    }

    fn force(&self, transition: Transition) -> BotState {
        match self.core.fire(transition) {
            Ok(state) => state,
            Err(err) => {
                error!("Bot {}: {}", self.core.name, err);
                self.state()
            }
        }
    }

    pub async fn trade_stats(&self) -> serde_json::Value {
        self.strategy.lock().await.trade_stats()
    }

    /// Handle one feed message. Non-ticker messages and tickers for other
    /// products are ignored.
    pub async fn process(&self, msg: &FeedMessage) {
        let Some(tick) = msg.as_ticker() else {
            return;
        };
        if tick.product_id != self.product_id {
            return;
        }

        let state = self.state();
        let next = match state {
            BotState::Idle => return,
            BotState::Error => {
                self.reset();
                return;
            }
            BotState::Init | BotState::Restart => Transition::Start,
            BotState::Trading => Transition::Stop,
            BotState::Exit => Transition::Idle,
        };
        let next = Continuation::new(&self.core, next);

        let outcome = AssertUnwindSafe(async {
            let mut strategy = self.strategy.lock().await;
            match state {
                BotState::Init => strategy.on_init(&tick, next).await,
                BotState::Restart => strategy.on_restart(&tick, next).await,
                BotState::Trading => strategy.on_trade(&tick, next).await,
                BotState::Exit => strategy.on_exit(&tick, next).await,
                BotState::Idle | BotState::Error => Ok(()),
            }
        })
        .catch_unwind()
        .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("{:#}", err)),
            Err(panic) => Some(panic_message(panic.as_ref())),
        };
        if let Some(message) = failure {
            error!("Bot->{}: {}", hook_label(state), message);
            self.red_button();
        }
    }

    /// Consume `input` until it closes. Every message is forwarded to
    /// `output` before it is processed.
    pub async fn run(
        &self,
        mut input: mpsc::Receiver<FeedMessage>,
        mut output: Option<mpsc::Sender<FeedMessage>>,
    ) {
        while let Some(msg) = input.recv().await {
            if let Some(tx) = &output {
                if tx.send(msg.clone()).await.is_err() {
                    debug!("Bot {} downstream closed, no longer forwarding", self.core.name);
                    output = None;
                }
            }
            self.process(&msg).await;
        }
        debug!("Bot {} feed closed", self.core.name);
    }
}

impl std::fmt::Debug for Bot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bot")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .field("state", &self.state())
            .finish()
    }
}

fn hook_label(state: BotState) -> &'static str {
    match state {
        BotState::Init => "Init",
        BotState::Restart => "Restart",
        BotState::Trading => "Trading",
        BotState::Exit => "Exit",
        BotState::Idle => "Idle",
        BotState::Error => "Error",
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic with unknown payload".to_string()
    }
}

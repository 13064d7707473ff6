//! Strategy hooks driven by the bot

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Weak};

use super::feed::Tick;
use super::state::{BotState, Transition};
use super::{BotError, Core};

/// Identity handed to a strategy when it is attached to a bot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotInfo {
    pub id: String,
    pub name: String,
}

/// Requests the bot's next transition from inside (or after) a hook.
/// Holds the bot weakly, so a strategy may keep it around.
#[derive(Clone)]
pub struct Continuation {
    core: Weak<Core>,
    transition: Transition,
}

impl Continuation {
    pub(crate) fn new(core: &Arc<Core>, transition: Transition) -> Self {
        Self {
            core: Arc::downgrade(core),
            transition,
        }
    }

    pub fn transition(&self) -> Transition {
        self.transition
    }

    /// Fire the transition, returning the bot's new state
    pub fn fire(&self) -> Result<BotState, BotError> {
        let core = self
            .core
            .upgrade()
            .ok_or_else(|| BotError::NotFound("bot dropped".to_string()))?;
        core.fire(self.transition)
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Continuation")
            .field("transition", &self.transition)
            .finish()
    }
}

/// Decision logic plugged into a bot. One hook per active control state;
/// `next` moves the bot on (`start` from init/restart, `stop` from trading,
/// `idle` from exit). A returned error or a panic sends the bot to `error`.
#[async_trait]
pub trait TradingStrategy: Send {
    /// Product whose tickers drive this strategy
    fn product_id(&self) -> &str;

    fn attach(&mut self, _bot: BotInfo) {}

    async fn on_init(&mut self, tick: &Tick, next: Continuation) -> anyhow::Result<()>;

    async fn on_restart(&mut self, tick: &Tick, next: Continuation) -> anyhow::Result<()>;

    async fn on_trade(&mut self, tick: &Tick, next: Continuation) -> anyhow::Result<()>;

    async fn on_exit(&mut self, tick: &Tick, next: Continuation) -> anyhow::Result<()>;

    fn trade_stats(&self) -> Value {
        Value::Object(Default::default())
    }
}

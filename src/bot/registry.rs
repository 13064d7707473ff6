//! In-process bot registry

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

use super::{Bot, BotError, BotState, TradingStrategy};

/// Summary row for one bot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotEntry {
    pub id: String,
    pub name: String,
    pub state: BotState,
}

impl From<&Bot> for BotEntry {
    fn from(bot: &Bot) -> Self {
        Self {
            id: bot.id().to_string(),
            name: bot.name().to_string(),
            state: bot.state(),
        }
    }
}

/// Control requests for `BotRegistry::update`. Each one is applied only when
/// it is valid for the bot's current state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotOptions {
    pub start: bool,
    pub stop: bool,
    pub reset: bool,
}

#[derive(Default)]
pub struct BotRegistry {
    bots: RwLock<HashMap<String, Bot>>,
}

impl BotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and register a bot, returning its id
    pub async fn create<S: TradingStrategy + 'static>(&self, name: &str, strategy: S) -> String {
        self.insert(Bot::new(name, strategy)).await
    }

    pub async fn insert(&self, bot: Bot) -> String {
        let id = bot.id().to_string();
        info!("Registered bot {} ({})", bot.name(), id);
        self.bots.write().await.insert(id.clone(), bot);
        id
    }

    pub async fn get(&self, id: &str) -> Option<BotEntry> {
        self.bots.read().await.get(id).map(BotEntry::from)
    }

    pub async fn bot(&self, id: &str) -> Option<Bot> {
        self.bots.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<BotEntry> {
        let mut entries: Vec<BotEntry> =
            self.bots.read().await.values().map(BotEntry::from).collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        entries
    }

    pub async fn update(&self, id: &str, options: BotOptions) -> Result<BotEntry, BotError> {
        let bot = self.bot(id).await.ok_or_else(|| BotError::NotFound(id.to_string()))?;

        if options.start && bot.state() == BotState::Idle {
            bot.start()?;
        }
        if options.stop && bot.state() == BotState::Trading {
            bot.stop(None)?;
        }
        if options.reset {
            bot.reset();
        }
        Ok(BotEntry::from(&bot))
    }

    /// Remove an idle bot, returning the remaining bots
    pub async fn remove(&self, id: &str) -> Result<Vec<BotEntry>, BotError> {
        {
            let mut bots = self.bots.write().await;
            let bot = bots.get(id).ok_or_else(|| BotError::NotFound(id.to_string()))?;
            if bot.state() != BotState::Idle {
                return Err(BotError::NotIdle(id.to_string()));
            }
            bots.remove(id);
        }
        info!("Removed bot {}", id);
        Ok(self.list().await)
    }

    pub async fn trade_stats(&self, id: &str) -> Result<serde_json::Value, BotError> {
        let bot = self.bot(id).await.ok_or_else(|| BotError::NotFound(id.to_string()))?;
        Ok(bot.trade_stats().await)
    }

    pub async fn len(&self) -> usize {
        self.bots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bots.read().await.is_empty()
    }
}

//! Tickbot - tick-driven trading bot in Rust
//!
//! Features:
//! - Position lifecycle engine driven by asynchronous exchange confirmations
//! - Rate-limited order submission with bounded retries
//! - Bot control state machine around pluggable strategies
//! - Paper exchange for offline runs

pub mod api;
pub mod bot;
pub mod config;
pub mod session;
pub mod trading;
pub mod utils;

// Re-export commonly used types
pub use api::{ApiError, LiveOrder, OrderRequest, OrderType, Side};
pub use bot::{
    Bot, BotError, BotRegistry, BotState, FeedMessage, Tick, Transition, TradingStrategy,
};
pub use config::Config;
pub use session::{OrderScope, SessionEvent, TradingSession};
pub use trading::{
    LifecycleStats, PaperExchange, Position, PositionConfig, PositionEvent, PositionFactory,
    PositionType, State, TradingError, TradingMode,
};
pub use utils::{rate_limiter, retry};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TickbotError {
    #[error("API error: {0}")]
    Api(#[from] api::ApiError),
    #[error("Trading error: {0}")]
    Trading(#[from] trading::TradingError),
    #[error("Bot error: {0}")]
    Bot(#[from] bot::BotError),
}

/// Bot version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

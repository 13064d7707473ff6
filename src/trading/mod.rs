//! Trading module
//! Position lifecycle, order sizing, paper exchange and lifecycle statistics

pub mod errors;
pub mod position;
pub mod simulation;
pub mod sizing;
pub mod stats;

pub use errors::TradingError;
pub use position::{
    EventNames, Position, PositionConfig, PositionEvent, PositionEventKind, PositionFactory,
    PositionType, State,
};
pub use simulation::{PaperExchange, TradingMode};
pub use stats::LifecycleStats;

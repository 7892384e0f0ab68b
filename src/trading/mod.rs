//! Trading logic: strategy rules, position sizing, and the engine that executes them.

mod config;
mod engine;
mod position_sizer;
mod strategy;

pub use config::StrategyConfig;
pub use engine::{EngineStats, PassSummary, PositionAction, StrategyEngine, TradeError};
pub use position_sizer::PositionSizer;
pub use strategy::{Candidate, Decision, ExitReason, Strategy};

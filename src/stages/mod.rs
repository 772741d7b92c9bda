//! The four pipeline stages, in data-flow order.
//!
//! ```text
//! Fetch ─NewCandle→ Indicators ─IndicatorsCalculated→ Strategy ─Entry/ExitSignal→ Execution
//!                                        └──────────────(position management)──────→ Execution
//! ```

pub mod execution;
pub mod fetch;
pub mod indicators;
pub mod strategy;

pub use execution::{EntryOutcome, ExecutionConfig, ExecutionStage};
pub use fetch::{FetchConfig, FetchOutcome, FetchStage};
pub use indicators::{IndicatorConfig, IndicatorStage};
pub use strategy::{ConditionReport, StrategyStage};

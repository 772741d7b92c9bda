//! Domain models shared across every stage of the pipeline.

pub mod bar;
pub mod position;
pub mod risk;
pub mod strategy;

pub use bar::{Bar, EnrichedRow, MarketSnapshot, Timeframe};
pub use position::{ChildOrder, Position, PositionTag, TradeGroup, TrailingStop};
pub use risk::{
    PartialTarget, PositionSizing, RiskConfig, StopLossRule, SymbolSpec, TakeProfitRule,
    TargetDistance,
};
pub use strategy::{
    Condition, ConditionGroup, Direction, GroupKind, GroupMode, Operand, Operator, SignalValue,
    StrategyDefinition,
};

//! # risk
//!
//! Order planning ([`sizing`]) and the pre-trade authorization gate ([`guard`]).

pub mod guard;
pub mod sizing;

pub use guard::{Exposure, GuardDecision, GuardStatus, LimitBreach, TradingGuard, TradingLimits};
pub use sizing::{plan_order, MarketContext, OrderPlan, PlannedLeg, SizingError};

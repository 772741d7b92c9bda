//! # models::position
//!
//! Orders and positions as seen by the engine.
//!
//! ## Why separate from the strategy?
//! `StrategyDefinition` = the rule set (what *should* happen)
//! `Position`           = what is actually open at the broker
//! `TradeGroup`         = the engine's bookkeeping for one entry, which may be
//!                        split into several child positions (partial targets)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::strategy::Direction;

// ─── PositionTag ──────────────────────────────────────────────────────────────

/// Which path opened the position. Both share the same lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionTag {
    Automated,
    Manual,
}

impl PositionTag {
    /// EA magic number used to tell the two paths apart at the terminal.
    pub fn magic(self) -> u64 {
        match self {
            PositionTag::Automated => 420001,
            PositionTag::Manual    => 420002,
        }
    }
}

// ─── Position ─────────────────────────────────────────────────────────────────

/// A position as reported by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticket:      u64,
    pub symbol:      String,
    pub direction:   Direction,
    pub volume:      f64,
    pub entry_price: f64,
    pub stop_loss:   Option<f64>,
    pub take_profit: Option<f64>,
    pub tag:         PositionTag,
    pub comment:     String,
    pub opened_at:   DateTime<Utc>,
    #[serde(default)]
    pub closed_at:   Option<DateTime<Utc>>,
    /// Realised profit once closed.
    #[serde(default)]
    pub profit:      Option<f64>,
}

impl Position {
    /// Price-unit P/L at `price` (positive = in favour).
    #[inline]
    pub fn unrealised_points(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.direction.sign()
    }
}

// ─── Trade Group ──────────────────────────────────────────────────────────────

/// One child order of a trade group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildOrder {
    pub ticket:                 u64,
    pub volume:                 f64,
    pub take_profit:            Option<f64>,
    /// Move the group's stop to entry when this child's target fills.
    pub move_stop_to_breakeven: bool,
    pub closed:                 bool,
}

/// Trailing configuration carried by a live group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailingStop {
    pub distance:   f64,
    pub activation: f64,
}

/// Engine-side bookkeeping for one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeGroup {
    pub group_id:           Uuid,
    pub strategy:           String,
    pub symbol:             String,
    pub direction:          Direction,
    pub entry_price:        f64,
    /// Current stop for the whole group (children share one stop).
    pub stop_loss:          f64,
    pub tag:                PositionTag,
    pub children:           Vec<ChildOrder>,
    pub trailing:           Option<TrailingStop>,
    /// Breakeven is applied at most once per group.
    pub breakeven_applied:  bool,
    pub opened_at:          DateTime<Utc>,
}

impl TradeGroup {
    pub fn open_children(&self) -> impl Iterator<Item = &ChildOrder> {
        self.children.iter().filter(|c| !c.closed)
    }

    pub fn is_closed(&self) -> bool {
        self.children.iter().all(|c| c.closed)
    }

    pub fn open_volume(&self) -> f64 {
        self.open_children().map(|c| c.volume).sum()
    }

    /// `true` if `candidate` is a tighter stop than the current one.
    pub fn is_tighter(&self, candidate: f64) -> bool {
        match self.direction {
            Direction::Long  => candidate > self.stop_loss,
            Direction::Short => candidate < self.stop_loss,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(direction: Direction, stop: f64) -> TradeGroup {
        TradeGroup {
            group_id:          Uuid::new_v4(),
            strategy:          "s".into(),
            symbol:            "XAUUSD".into(),
            direction,
            entry_price:       2000.0,
            stop_loss:         stop,
            tag:               PositionTag::Automated,
            children:          vec![
                ChildOrder { ticket: 1, volume: 0.5, take_profit: Some(2015.0), move_stop_to_breakeven: true, closed: true },
                ChildOrder { ticket: 2, volume: 0.5, take_profit: Some(2030.0), move_stop_to_breakeven: false, closed: false },
            ],
            trailing:          None,
            breakeven_applied: false,
            opened_at:         Utc::now(),
        }
    }

    #[test]
    fn test_is_tighter_respects_direction() {
        let long = group(Direction::Long, 1990.0);
        assert!(long.is_tighter(1995.0));
        assert!(!long.is_tighter(1985.0));

        let short = group(Direction::Short, 2010.0);
        assert!(short.is_tighter(2005.0));
        assert!(!short.is_tighter(2012.0));
    }

    #[test]
    fn test_open_volume_ignores_closed_children() {
        let g = group(Direction::Long, 1990.0);
        assert_eq!(g.open_volume(), 0.5);
        assert!(!g.is_closed());
    }
}

//! # risk::sizing
//!
//! Turns a [`RiskConfig`] plus market context into a concrete [`OrderPlan`]:
//! total volume, stop price and one leg per take-profit target.
//!
//! ```text
//! stop distance   monetary → amount / (lots × value_per_point)   (fixed lots only)
//!                 atr      → multiple × ATR
//!                 trailing → distance
//! volume          fixed    → lots
//!                 percent  → equity × pct/100 / (distance × value_per_point)
//! legs            fixed / risk-reward → one leg, full volume
//!                 partial  → one leg per target, volume by percentage,
//!                            last leg takes the rounding remainder
//! ```

use serde::Serialize;
use thiserror::Error;

use crate::models::{
    Direction, PositionSizing, RiskConfig, StopLossRule, SymbolSpec, TakeProfitRule, TrailingStop,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SizingError {
    #[error("ATR({period}) on timeframe {timeframe} not available yet")]
    MissingAtr { timeframe: String, period: usize },

    #[error("computed volume {raw:.4} is below the minimum lot {min_lot}")]
    BelowMinimumLot { raw: f64, min_lot: f64 },

    #[error("invalid {what}: {value}")]
    InvalidInput { what: &'static str, value: f64 },

    #[error("target distance {target} is not beyond stop distance {stop}")]
    TargetInsideStop { target: f64, stop: f64 },
}

/// One child order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedLeg {
    pub volume:                 f64,
    pub take_profit:            Option<f64>,
    pub move_stop_to_breakeven: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderPlan {
    pub direction:     Direction,
    pub entry_price:   f64,
    pub volume:        f64,
    pub stop_distance: f64,
    pub stop_loss:     f64,
    pub legs:          Vec<PlannedLeg>,
    pub trailing:      Option<TrailingStop>,
}

/// Market context the plan depends on.
#[derive(Debug, Clone, Copy)]
pub struct MarketContext {
    pub entry_price: f64,
    pub equity:      f64,
    /// Current ATR for the stop rule's timeframe/period, if computed.
    pub atr:         Option<f64>,
}

pub fn plan_order(cfg: &RiskConfig, direction: Direction, ctx: MarketContext) -> Result<OrderPlan, SizingError> {
    if !ctx.entry_price.is_finite() || ctx.entry_price <= 0.0 {
        return Err(SizingError::InvalidInput { what: "entry price", value: ctx.entry_price });
    }
    let spec = &cfg.symbol_spec;

    let (stop_distance, volume) = match &cfg.stop_loss {
        StopLossRule::Monetary { amount } => {
            let PositionSizing::Fixed { lots } = cfg.sizing else {
                return Err(SizingError::InvalidInput { what: "monetary stop with percent sizing", value: *amount });
            };
            let lots = round(spec, lots)?;
            (amount / (lots * spec.value_per_point), lots)
        }
        StopLossRule::Atr { multiple, period, timeframe } => {
            let atr = ctx.atr.ok_or_else(|| SizingError::MissingAtr {
                timeframe: timeframe.clone(),
                period:    *period,
            })?;
            let distance = multiple * atr;
            (distance, volume_for(spec, &cfg.sizing, ctx.equity, distance)?)
        }
        StopLossRule::Trailing { distance, .. } => {
            (*distance, volume_for(spec, &cfg.sizing, ctx.equity, *distance)?)
        }
    };

    if !stop_distance.is_finite() || stop_distance <= 0.0 {
        return Err(SizingError::InvalidInput { what: "stop distance", value: stop_distance });
    }

    for target in target_distances(&cfg.take_profit, stop_distance) {
        if target <= stop_distance {
            return Err(SizingError::TargetInsideStop { target, stop: stop_distance });
        }
    }

    let sign = direction.sign();
    let entry = ctx.entry_price;
    let price_at = |distance: f64| entry + sign * distance;

    let legs = match &cfg.take_profit {
        TakeProfitRule::Fixed { .. } | TakeProfitRule::RiskReward { .. } => vec![PlannedLeg {
            volume,
            take_profit: target_distances(&cfg.take_profit, stop_distance).first().map(|d| price_at(*d)),
            move_stop_to_breakeven: false,
        }],
        TakeProfitRule::Partial { targets } => {
            let mut legs = Vec::with_capacity(targets.len());
            let mut allocated = 0.0;
            for (i, target) in targets.iter().enumerate() {
                let raw = if i + 1 == targets.len() {
                    volume - allocated
                } else {
                    volume * target.volume_percent / 100.0
                };
                let leg_volume = round(spec, raw)?;
                allocated += leg_volume;
                legs.push(PlannedLeg {
                    volume:                 leg_volume,
                    take_profit:            Some(price_at(target.distance.resolve(stop_distance))),
                    move_stop_to_breakeven: target.move_stop_to_breakeven,
                });
            }
            legs
        }
    };

    let trailing = match cfg.stop_loss {
        StopLossRule::Trailing { distance, activation } => Some(TrailingStop { distance, activation }),
        _ => None,
    };

    Ok(OrderPlan {
        direction,
        entry_price: entry,
        volume: legs.iter().map(|l| l.volume).sum(),
        stop_distance,
        stop_loss: entry - sign * stop_distance,
        legs,
        trailing,
    })
}

/// Distance of every target from entry, nearest first.
fn target_distances(rule: &TakeProfitRule, stop_distance: f64) -> Vec<f64> {
    match rule {
        TakeProfitRule::Fixed { distance } => vec![*distance],
        TakeProfitRule::RiskReward { ratio } => vec![ratio * stop_distance],
        TakeProfitRule::Partial { targets } => targets.iter().map(|t| t.distance.resolve(stop_distance)).collect(),
    }
}

fn volume_for(spec: &SymbolSpec, sizing: &PositionSizing, equity: f64, distance: f64) -> Result<f64, SizingError> {
    match sizing {
        PositionSizing::Fixed { lots } => round(spec, *lots),
        PositionSizing::PercentEquity { percent } => {
            if !equity.is_finite() || equity <= 0.0 {
                return Err(SizingError::InvalidInput { what: "equity", value: equity });
            }
            let risk_money = equity * percent / 100.0;
            round(spec, risk_money / (distance * spec.value_per_point))
        }
    }
}

fn round(spec: &SymbolSpec, raw: f64) -> Result<f64, SizingError> {
    spec.round_lots(raw)
        .ok_or(SizingError::BelowMinimumLot { raw, min_lot: spec.min_lot })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PartialTarget, TargetDistance};

    fn cfg(sizing: PositionSizing, stop_loss: StopLossRule, take_profit: TakeProfitRule) -> RiskConfig {
        RiskConfig { sizing, stop_loss, take_profit, symbol_spec: SymbolSpec::default() }
    }

    fn ctx(atr: Option<f64>) -> MarketContext {
        MarketContext { entry_price: 2000.0, equity: 10_000.0, atr }
    }

    #[test]
    fn test_one_percent_of_ten_thousand_over_ten_points() {
        let c = cfg(
            PositionSizing::PercentEquity { percent: 1.0 },
            StopLossRule::Trailing { distance: 10.0, activation: 5.0 },
            TakeProfitRule::RiskReward { ratio: 2.0 },
        );
        let plan = plan_order(&c, Direction::Long, ctx(None)).unwrap();
        assert_eq!(plan.volume, (10_000.0 * 0.01) / 10.0);
        assert_eq!(plan.stop_loss, 1990.0);
        assert_eq!(plan.legs[0].take_profit, Some(2020.0));
        assert_eq!(plan.trailing, Some(TrailingStop { distance: 10.0, activation: 5.0 }));
    }

    #[test]
    fn test_atr_stop_for_short() {
        let c = cfg(
            PositionSizing::Fixed { lots: 0.5 },
            StopLossRule::Atr { multiple: 2.0, period: 14, timeframe: "5".into() },
            TakeProfitRule::Fixed { distance: 30.0 },
        );
        let plan = plan_order(&c, Direction::Short, ctx(Some(4.0))).unwrap();
        assert_eq!(plan.stop_distance, 8.0);
        assert_eq!(plan.stop_loss, 2008.0);
        assert_eq!(plan.legs[0].take_profit, Some(1970.0));

        assert!(matches!(
            plan_order(&c, Direction::Short, ctx(None)),
            Err(SizingError::MissingAtr { period: 14, .. })
        ));
    }

    #[test]
    fn test_monetary_stop_caps_loss() {
        let c = cfg(
            PositionSizing::Fixed { lots: 2.0 },
            StopLossRule::Monetary { amount: 50.0 },
            TakeProfitRule::RiskReward { ratio: 3.0 },
        );
        let plan = plan_order(&c, Direction::Long, ctx(None)).unwrap();
        assert_eq!(plan.stop_distance, 25.0);
        assert_eq!(plan.stop_loss, 1975.0);
        assert_eq!(plan.legs[0].take_profit, Some(2075.0));
    }

    #[test]
    fn test_partial_targets_split_volume() {
        let c = cfg(
            PositionSizing::PercentEquity { percent: 1.0 },
            StopLossRule::Trailing { distance: 10.0, activation: 5.0 },
            TakeProfitRule::Partial {
                targets: vec![
                    PartialTarget { distance: TargetDistance::RiskMultiple(1.5), volume_percent: 50.0, move_stop_to_breakeven: true },
                    PartialTarget { distance: TargetDistance::RiskMultiple(3.0), volume_percent: 50.0, move_stop_to_breakeven: false },
                ],
            },
        );
        let plan = plan_order(&c, Direction::Long, ctx(None)).unwrap();
        assert_eq!(plan.legs.len(), 2);
        assert_eq!(plan.legs[0].volume, 5.0);
        assert_eq!(plan.legs[1].volume, 5.0);
        assert_eq!(plan.legs[0].take_profit, Some(2015.0));
        assert!(plan.legs[0].move_stop_to_breakeven);
        assert_eq!(plan.legs[1].take_profit, Some(2030.0));
    }

    #[test]
    fn test_fixed_target_inside_atr_stop_is_refused() {
        let c = cfg(
            PositionSizing::Fixed { lots: 1.0 },
            StopLossRule::Atr { multiple: 2.0, period: 14, timeframe: "5".into() },
            TakeProfitRule::Fixed { distance: 10.0 },
        );
        // 2 × ATR 4 = 8: the target is beyond
        assert!(plan_order(&c, Direction::Long, ctx(Some(4.0))).is_ok());
        // 2 × ATR 6 = 12: the target now sits inside the stop
        assert_eq!(
            plan_order(&c, Direction::Long, ctx(Some(6.0))),
            Err(SizingError::TargetInsideStop { target: 10.0, stop: 12.0 })
        );
    }

    #[test]
    fn test_fixed_target_inside_monetary_stop_is_refused() {
        let c = cfg(
            PositionSizing::Fixed { lots: 1.0 },
            StopLossRule::Monetary { amount: 50.0 },
            TakeProfitRule::Fixed { distance: 10.0 },
        );
        assert_eq!(
            plan_order(&c, Direction::Long, ctx(None)),
            Err(SizingError::TargetInsideStop { target: 10.0, stop: 50.0 })
        );
    }

    #[test]
    fn test_tiny_equity_is_below_min_lot() {
        let c = cfg(
            PositionSizing::PercentEquity { percent: 1.0 },
            StopLossRule::Trailing { distance: 10.0, activation: 5.0 },
            TakeProfitRule::RiskReward { ratio: 2.0 },
        );
        let small = MarketContext { equity: 5.0, ..ctx(None) };
        assert!(matches!(plan_order(&c, Direction::Long, small), Err(SizingError::BelowMinimumLot { .. })));
    }
}

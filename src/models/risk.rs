//! # models::risk
//!
//! Per (symbol, strategy) risk parameters: how big, where the stop goes, where
//! the target(s) go.  Validated once when the trading plan is loaded; an
//! invalid config fails stage construction.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ─── Position Sizing ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PositionSizing {
    /// Always trade `lots`.
    Fixed { lots: f64 },
    /// Risk `percent` of equity on the stop distance:
    /// `volume = equity * percent/100 / (stop_distance * value_per_point)`.
    PercentEquity { percent: f64 },
}

// ─── Stop Loss ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopLossRule {
    /// Cap the loss at `amount` account currency for the sized volume.
    Monetary { amount: f64 },
    /// `multiple × ATR(period)` taken from the given timeframe.
    Atr {
        multiple:  f64,
        #[serde(default = "default_atr_period")]
        period:    usize,
        timeframe: String,
    },
    /// Initial offset `distance`; retightened once price moves `activation`
    /// in favour (only while automation is enabled).
    Trailing { distance: f64, activation: f64 },
}

fn default_atr_period() -> usize {
    14
}

// ─── Take Profit ──────────────────────────────────────────────────────────────

/// Distance of a target from entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetDistance {
    /// Absolute price units.
    Points(f64),
    /// Multiple of the stop-loss distance.
    RiskMultiple(f64),
}

impl TargetDistance {
    /// Resolve to a price distance given the stop distance.
    #[inline]
    pub fn resolve(self, stop_distance: f64) -> f64 {
        match self {
            TargetDistance::Points(p)       => p,
            TargetDistance::RiskMultiple(m) => m * stop_distance,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialTarget {
    pub distance:               TargetDistance,
    /// Share of the total volume closed at this target (all targets sum to 100).
    pub volume_percent:         f64,
    /// When this target fills, move the remaining position's stop to entry.
    #[serde(default)]
    pub move_stop_to_breakeven: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TakeProfitRule {
    Fixed { distance: f64 },
    RiskReward { ratio: f64 },
    /// Ordered nearest → farthest.
    Partial { targets: Vec<PartialTarget> },
}

// ─── Symbol Specification ─────────────────────────────────────────────────────

/// Contract properties needed to turn money into lots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolSpec {
    /// Account-currency value of a 1.0 price move for 1 lot.
    #[serde(default = "one")]
    pub value_per_point: f64,
    #[serde(default = "default_min_lot")]
    pub min_lot:         f64,
    #[serde(default = "default_max_lot")]
    pub max_lot:         f64,
    #[serde(default = "default_min_lot")]
    pub lot_step:        f64,
}

fn one() -> f64 {
    1.0
}
fn default_min_lot() -> f64 {
    0.01
}
fn default_max_lot() -> f64 {
    100.0
}

impl Default for SymbolSpec {
    fn default() -> Self {
        Self {
            value_per_point: 1.0,
            min_lot:         0.01,
            max_lot:         100.0,
            lot_step:        0.01,
        }
    }
}

impl SymbolSpec {
    /// Round down to the lot step and clamp to `[min_lot, max_lot]`.
    ///
    /// Returns `None` when the raw volume is below the minimum lot — the trade
    /// would carry more risk than configured.
    pub fn round_lots(&self, raw: f64) -> Option<f64> {
        if !raw.is_finite() || raw <= 0.0 {
            return None;
        }
        // small epsilon so 10.0 / 0.01 does not floor to 999.999…
        let steps = (raw / self.lot_step + 1e-9).floor();
        let lots = steps * self.lot_step;
        let lots = (lots * 1e8).round() / 1e8;
        if lots < self.min_lot {
            return None;
        }
        Some(lots.min(self.max_lot))
    }
}

// ─── Risk Config ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    pub sizing:      PositionSizing,
    pub stop_loss:   StopLossRule,
    pub take_profit: TakeProfitRule,
    #[serde(default)]
    pub symbol_spec: SymbolSpec,
}

impl RiskConfig {
    /// Invariants:
    /// * partial-target percentages sum to 100
    /// * every target lies strictly beyond the stop distance (where the stop
    ///   distance is known up front: monetary and trailing stops; ATR stops
    ///   are checked when the order is planned)
    /// * percentage sizing cannot be combined with a monetary stop (circular)
    pub fn validate(&self, key: &str) -> Result<(), ConfigError> {
        let fail = |reason: String| ConfigError::Risk { key: key.to_string(), reason };

        match &self.sizing {
            PositionSizing::Fixed { lots } if *lots <= 0.0 || !lots.is_finite() => {
                return Err(fail(format!("fixed lots must be positive, got {lots}")));
            }
            PositionSizing::PercentEquity { percent } if *percent <= 0.0 || *percent > 100.0 => {
                return Err(fail(format!("percent must be in (0, 100], got {percent}")));
            }
            _ => {}
        }

        let static_stop = match &self.stop_loss {
            StopLossRule::Monetary { amount } => {
                if *amount <= 0.0 {
                    return Err(fail("monetary stop amount must be positive".into()));
                }
                match self.sizing {
                    PositionSizing::PercentEquity { .. } => {
                        return Err(fail(
                            "percentage sizing needs a price-based stop; use fixed lots with a monetary stop".into(),
                        ));
                    }
                    PositionSizing::Fixed { lots } => self
                        .symbol_spec
                        .round_lots(lots)
                        .filter(|_| self.symbol_spec.value_per_point > 0.0)
                        .map(|lots| amount / (lots * self.symbol_spec.value_per_point)),
                }
            }
            StopLossRule::Atr { multiple, period, timeframe } => {
                if *multiple <= 0.0 || *period == 0 || timeframe.is_empty() {
                    return Err(fail("ATR stop needs positive multiple, period and a timeframe".into()));
                }
                None
            }
            StopLossRule::Trailing { distance, activation } => {
                if *distance <= 0.0 || *activation < 0.0 {
                    return Err(fail("trailing stop needs positive distance and non-negative activation".into()));
                }
                Some(*distance)
            }
        };

        let check_target = |distance: TargetDistance| -> Result<(), ConfigError> {
            match distance {
                TargetDistance::RiskMultiple(m) if m <= 1.0 => Err(fail(format!(
                    "target at {m}R is not beyond the stop-loss distance"
                ))),
                TargetDistance::Points(p) if p <= 0.0 => {
                    Err(fail(format!("target distance must be positive, got {p}")))
                }
                TargetDistance::Points(p) => match static_stop {
                    Some(stop) if p <= stop => Err(fail(format!(
                        "target distance {p} is not beyond stop distance {stop}"
                    ))),
                    _ => Ok(()),
                },
                TargetDistance::RiskMultiple(_) => Ok(()),
            }
        };

        match &self.take_profit {
            TakeProfitRule::Fixed { distance } => check_target(TargetDistance::Points(*distance))?,
            TakeProfitRule::RiskReward { ratio } => check_target(TargetDistance::RiskMultiple(*ratio))?,
            TakeProfitRule::Partial { targets } => {
                if targets.is_empty() {
                    return Err(fail("partial take-profit needs at least one target".into()));
                }
                let total: f64 = targets.iter().map(|t| t.volume_percent).sum();
                if (total - 100.0).abs() > 1e-6 {
                    return Err(fail(format!("partial target volumes sum to {total}, expected 100")));
                }
                for t in targets {
                    if t.volume_percent <= 0.0 {
                        return Err(fail("partial target volume must be positive".into()));
                    }
                    check_target(t.distance)?;
                }
            }
        }

        let spec = &self.symbol_spec;
        if spec.value_per_point <= 0.0 || spec.lot_step <= 0.0 || spec.min_lot <= 0.0 || spec.max_lot < spec.min_lot {
            return Err(fail("symbol spec must have positive value_per_point, lot_step, min_lot <= max_lot".into()));
        }
        Ok(())
    }
}

//! # risk::guard — trading authorization
//!
//! The last gate before an order reaches the broker.
//!
//! ## Checks (in order)
//! 1. **Daily loss**        — realised loss today below the budget
//! 2. **Failure cooldown**  — pause after N consecutive broker failures
//! 3. **Trades per day**    — cap on submitted entries
//! 4. **Open positions**    — account-wide cap, counting every leg of the new order
//! 5. **Symbol positions**  — per-symbol cap, same
//! 6. **Symbol volume**     — open lots per symbol, including the new order
//!
//! A failed check is not an error: it comes back as a [`LimitBreach`] that
//! the Execution stage publishes.  Counters reset at the UTC day boundary.

use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{env_f64, env_u32, env_u64};
use crate::sync::lock;

// ─── Limits ───────────────────────────────────────────────────────────────────

/// `0` disables a limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingLimits {
    /// Realised loss (account currency) that stops new entries for the day.
    pub max_daily_loss:              f64,
    pub max_open_positions:          u32,
    pub max_positions_per_symbol:    u32,
    pub max_volume_per_symbol:       f64,
    pub max_trades_per_day:          u32,
    /// Consecutive broker failures that trigger the cooldown.
    pub max_consecutive_failures:    u32,
    pub cooldown_secs_after_failure: u64,
}

impl Default for TradingLimits {
    fn default() -> Self {
        Self {
            max_daily_loss:              0.0,
            max_open_positions:          5,
            max_positions_per_symbol:    3,
            max_volume_per_symbol:       0.0,
            max_trades_per_day:          10,
            max_consecutive_failures:    3,
            cooldown_secs_after_failure: 300,
        }
    }
}

impl TradingLimits {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_daily_loss:              env_f64("RISK_MAX_DAILY_LOSS", d.max_daily_loss),
            max_open_positions:          env_u32("RISK_MAX_OPEN_POSITIONS", d.max_open_positions),
            max_positions_per_symbol:    env_u32("RISK_MAX_POSITIONS_PER_SYMBOL", d.max_positions_per_symbol),
            max_volume_per_symbol:       env_f64("RISK_MAX_VOLUME_PER_SYMBOL", d.max_volume_per_symbol),
            max_trades_per_day:          env_u32("RISK_MAX_TRADES_PER_DAY", d.max_trades_per_day),
            max_consecutive_failures:    env_u32("RISK_MAX_CONSECUTIVE_FAILS", d.max_consecutive_failures),
            cooldown_secs_after_failure: env_u64("RISK_COOLDOWN_SECS", d.cooldown_secs_after_failure),
        }
    }
}

// ─── Decision ─────────────────────────────────────────────────────────────────

/// Current open exposure, read from the broker just before the check.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Exposure {
    pub open_positions:   u32,
    pub symbol_positions: u32,
    pub symbol_volume:    f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitBreach {
    pub limit:     &'static str,
    pub current:   f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuardDecision {
    Authorized,
    Blocked(LimitBreach),
}

// ─── Status ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct GuardStatus {
    pub trades_today:         u32,
    pub realised_pnl_today:   f64,
    pub consecutive_failures: u32,
    pub last_trade_at:        Option<DateTime<Utc>>,
    pub in_cooldown:          bool,
    pub cooldown_ends_at:     Option<DateTime<Utc>>,
    pub limits:               TradingLimits,
}

// ─── Guard ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct GuardInner {
    trades_today:         u32,
    realised_pnl_today:   f64,
    consecutive_failures: u32,
    last_failure_at:      Option<DateTime<Utc>>,
    last_trade_at:        Option<DateTime<Utc>>,
    daily_reset_date:     NaiveDate,
}

impl GuardInner {
    fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today > self.daily_reset_date {
            self.trades_today = 0;
            self.realised_pnl_today = 0.0;
            self.consecutive_failures = 0;
            self.last_failure_at = None;
            self.daily_reset_date = today;
            info!("📅 guard: daily counters reset");
        }
    }
}

#[derive(Debug)]
pub struct TradingGuard {
    limits: TradingLimits,
    inner:  Mutex<GuardInner>,
}

impl TradingGuard {
    pub fn new(limits: TradingLimits) -> Self {
        Self {
            limits,
            inner: Mutex::new(GuardInner {
                trades_today:         0,
                realised_pnl_today:   0.0,
                consecutive_failures: 0,
                last_failure_at:      None,
                last_trade_at:        None,
                daily_reset_date:     Utc::now().date_naive(),
            }),
        }
    }

    pub fn limits(&self) -> &TradingLimits {
        &self.limits
    }

    /// Run every check for one prospective order of `volume` lots split into
    /// `legs` positions.
    pub fn check(&self, exposure: Exposure, volume: f64, legs: u32) -> GuardDecision {
        self.check_at(Utc::now(), exposure, volume, legs)
    }

    pub fn check_at(&self, now: DateTime<Utc>, exposure: Exposure, volume: f64, legs: u32) -> GuardDecision {
        let mut inner = lock(&self.inner);
        inner.roll_day(now);
        let l = &self.limits;

        let blocked = |limit: &'static str, current: f64, threshold: f64| {
            warn!(limit, current, threshold, "⛔ guard: trading blocked");
            GuardDecision::Blocked(LimitBreach { limit, current, threshold })
        };

        let loss_today = (-inner.realised_pnl_today).max(0.0);
        if l.max_daily_loss > 0.0 && loss_today >= l.max_daily_loss {
            return blocked("daily_loss", loss_today, l.max_daily_loss);
        }

        if l.max_consecutive_failures > 0 && inner.consecutive_failures >= l.max_consecutive_failures {
            if let Some(failed_at) = inner.last_failure_at {
                let cooldown = chrono::Duration::seconds(l.cooldown_secs_after_failure as i64);
                if now.signed_duration_since(failed_at) < cooldown {
                    return blocked(
                        "consecutive_failures",
                        inner.consecutive_failures as f64,
                        l.max_consecutive_failures as f64,
                    );
                }
            }
        }

        if l.max_trades_per_day > 0 && inner.trades_today >= l.max_trades_per_day {
            return blocked("max_trades_per_day", inner.trades_today as f64, l.max_trades_per_day as f64);
        }

        if l.max_open_positions > 0 && exposure.open_positions + legs > l.max_open_positions {
            return blocked("max_open_positions", exposure.open_positions as f64, l.max_open_positions as f64);
        }

        if l.max_positions_per_symbol > 0 && exposure.symbol_positions + legs > l.max_positions_per_symbol {
            return blocked(
                "max_positions_per_symbol",
                exposure.symbol_positions as f64,
                l.max_positions_per_symbol as f64,
            );
        }

        let prospective = exposure.symbol_volume + volume;
        if l.max_volume_per_symbol > 0.0 && prospective > l.max_volume_per_symbol + 1e-9 {
            return blocked("max_volume_per_symbol", prospective, l.max_volume_per_symbol);
        }

        GuardDecision::Authorized
    }

    /// An entry reached the broker and was accepted.
    pub fn record_trade(&self) {
        let mut inner = lock(&self.inner);
        inner.roll_day(Utc::now());
        inner.trades_today += 1;
        inner.last_trade_at = Some(Utc::now());
        let prev = inner.consecutive_failures;
        inner.consecutive_failures = 0;
        if prev > 0 {
            info!("guard: consecutive_failures reset (was {prev})");
        }
        info!(trades_today = inner.trades_today, max = self.limits.max_trades_per_day, "✅ guard: trade recorded");
    }

    pub fn record_failure(&self) {
        let mut inner = lock(&self.inner);
        inner.roll_day(Utc::now());
        inner.consecutive_failures += 1;
        inner.last_failure_at = Some(Utc::now());
        warn!(
            consecutive = inner.consecutive_failures,
            max         = self.limits.max_consecutive_failures,
            "⚠️ guard: broker failure recorded"
        );
    }

    /// Realised P/L of a closed position.
    pub fn record_realised(&self, profit: f64) {
        let mut inner = lock(&self.inner);
        inner.roll_day(Utc::now());
        inner.realised_pnl_today += profit;
    }

    pub fn status(&self) -> GuardStatus {
        let inner = lock(&self.inner);
        let cooldown_ends = inner
            .last_failure_at
            .filter(|_| {
                self.limits.max_consecutive_failures > 0
                    && inner.consecutive_failures >= self.limits.max_consecutive_failures
            })
            .map(|t| t + chrono::Duration::seconds(self.limits.cooldown_secs_after_failure as i64));
        let in_cooldown = cooldown_ends.is_some_and(|end| Utc::now() < end);

        GuardStatus {
            trades_today:         inner.trades_today,
            realised_pnl_today:   inner.realised_pnl_today,
            consecutive_failures: inner.consecutive_failures,
            last_trade_at:        inner.last_trade_at,
            in_cooldown,
            cooldown_ends_at:     if in_cooldown { cooldown_ends } else { None },
            limits:               self.limits.clone(),
        }
    }
}

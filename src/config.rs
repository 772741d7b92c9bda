//! # config
//!
//! Two sources, both read once at startup:
//!
//! | Source                       | Holds                                                    |
//! |------------------------------|----------------------------------------------------------|
//! | environment (`.env` allowed) | process wiring: symbol, intervals, paths, bridge URL ... |
//! | `TRADING_PLAN_PATH` (JSON)   | strategies, indicator sets, risk configs, trading limits |
//!
//! ## Environment Variables
//!
//! | Variable                     | Default                  |
//! |------------------------------|--------------------------|
//! | `SYMBOL`                     | `XAUUSD`                 |
//! | `TIMEFRAMES`                 | `1,5`                    |
//! | `FETCH_BAR_COUNT`            | `100`                    |
//! | `FETCH_INTERVAL_SECS`        | `60`                     |
//! | `HEALTH_INTERVAL_SECS`       | `30`                     |
//! | `AUTO_RESTART`               | `true`                   |
//! | `MAX_RESTART_ATTEMPTS`       | `3`                      |
//! | `MAX_ERROR_COUNT`            | `10`                     |
//! | `EVENT_HISTORY_CAPACITY`     | `1000`                   |
//! | `RECENT_ROWS_CAPACITY`       | `100`                    |
//! | `WARM_UP_BARS`               | `0` (off)                |
//! | `AUTOMATION_STATE_PATH`      | `automation_state.json`  |
//! | `AUTOMATION_DEFAULT_ENABLED` | unset                    |
//! | `MT5_BASE_URL`               | `mock` (paper broker)    |
//! | `MT5_TIMEOUT_SECS`           | `10`                     |
//! | `PAPER_BALANCE`              | `10000`                  |
//! | `BIND_ADDR`                  | `0.0.0.0:3000`           |
//! | `REQUEST_TIMEOUT_MS`         | `2000`                   |
//! | `API_KEY`                    | unset (dev mode)         |
//! | `TRADING_PLAN_PATH`          | unset (no strategies)    |
//! | `RISK_MAX_DAILY_LOSS`        | `0` (off)                |
//! | `RISK_MAX_OPEN_POSITIONS`    | `5`                      |
//! | `RISK_MAX_POSITIONS_PER_SYMBOL` | `3`                   |
//! | `RISK_MAX_VOLUME_PER_SYMBOL` | `0` (off)                |
//! | `RISK_MAX_TRADES_PER_DAY`    | `10`                     |
//! | `RISK_MAX_CONSECUTIVE_FAILS` | `3`                      |
//! | `RISK_COOLDOWN_SECS`         | `300`                    |
//!
//! The `RISK_*` limits apply when the plan has no `limits` section.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::indicators::regime::RegimeConfig;
use crate::indicators::IndicatorSpec;
use crate::models::{RiskConfig, StopLossRule, StrategyDefinition, Timeframe};
use crate::risk::TradingLimits;
use crate::service::orchestrator::OrchestratorConfig;
use crate::stages::execution::risk_key;
use crate::stages::{ExecutionConfig, FetchConfig, IndicatorConfig};

/// `MT5_BASE_URL` value that selects the in-memory paper broker.
pub const PAPER_BROKER_URL: &str = "mock";

// ─── Env helpers ──────────────────────────────────────────────────────────────

pub(crate) fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
pub(crate) fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
pub(crate) fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
pub(crate) fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// `true/false`, `1/0`, `yes/no`, `on/off`. Anything else is `None`.
pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().as_deref().and_then(parse_bool)
}

/// `"1, 5,H1"` → `[1, 5, H1]`; blanks dropped, duplicates removed, order kept.
pub fn parse_timeframes(raw: &str) -> Vec<Timeframe> {
    let mut out: Vec<Timeframe> = Vec::new();
    for tf in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let tf = Timeframe::from(tf);
        if !out.contains(&tf) {
            out.push(tf);
        }
    }
    out
}

// ─── Engine config ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub symbol:               String,
    pub timeframes:           Vec<Timeframe>,
    pub bar_count:            usize,
    pub fetch_interval:       Duration,
    pub health_interval:      Duration,
    pub auto_restart:         bool,
    pub max_restart_attempts: u32,
    pub max_errors:           u64,
    pub history_capacity:     usize,
    pub rows_capacity:        usize,
    /// Historical bars replayed through the indicators on start (0 = off).
    pub warm_up_bars:         usize,
    pub automation_path:      PathBuf,
    /// Used only when nothing has been persisted yet.
    pub automation_default:   Option<bool>,
    pub mt5_base_url:         String,
    pub mt5_timeout:          Duration,
    pub paper_balance:        f64,
    pub bind_addr:            SocketAddr,
    pub request_timeout:      Duration,
    pub api_key:              Option<String>,
    pub plan_path:            Option<PathBuf>,
    /// Fallback for plans without a `limits` section.
    pub limits:               TradingLimits,
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr: SocketAddr = env_string("BIND_ADDR", "0.0.0.0:3000")
            .parse()
            .context("BIND_ADDR must be host:port")?;

        let automation_default = match std::env::var("AUTOMATION_DEFAULT_ENABLED") {
            Ok(raw) if !raw.trim().is_empty() => Some(
                parse_bool(&raw)
                    .with_context(|| format!("AUTOMATION_DEFAULT_ENABLED must be a boolean, got '{raw}'"))?,
            ),
            _ => None,
        };

        let cfg = Self {
            symbol:               env_string("SYMBOL", "XAUUSD"),
            timeframes:           parse_timeframes(&env_string("TIMEFRAMES", "1,5")),
            bar_count:            env_u64("FETCH_BAR_COUNT", 100) as usize,
            fetch_interval:       Duration::from_secs(env_u64("FETCH_INTERVAL_SECS", 60)),
            health_interval:      Duration::from_secs(env_u64("HEALTH_INTERVAL_SECS", 30)),
            auto_restart:         env_bool("AUTO_RESTART").unwrap_or(true),
            max_restart_attempts: env_u32("MAX_RESTART_ATTEMPTS", 3),
            max_errors:           env_u64("MAX_ERROR_COUNT", 10),
            history_capacity:     env_u64("EVENT_HISTORY_CAPACITY", 1000) as usize,
            rows_capacity:        env_u64("RECENT_ROWS_CAPACITY", 100) as usize,
            warm_up_bars:         env_u64("WARM_UP_BARS", 0) as usize,
            automation_path:      PathBuf::from(env_string("AUTOMATION_STATE_PATH", "automation_state.json")),
            automation_default,
            mt5_base_url:         env_string("MT5_BASE_URL", PAPER_BROKER_URL),
            mt5_timeout:          Duration::from_secs(env_u64("MT5_TIMEOUT_SECS", 10)),
            paper_balance:        env_f64("PAPER_BALANCE", 10_000.0),
            bind_addr,
            request_timeout:      Duration::from_millis(env_u64("REQUEST_TIMEOUT_MS", 2000)),
            api_key:              std::env::var("API_KEY").ok().filter(|k| !k.is_empty()),
            plan_path:            std::env::var("TRADING_PLAN_PATH").ok().filter(|p| !p.is_empty()).map(PathBuf::from),
            limits:               TradingLimits::from_env(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Documented defaults, no environment access.
    pub fn with_defaults(symbol: impl Into<String>, timeframes: Vec<Timeframe>) -> Self {
        Self {
            symbol:               symbol.into(),
            timeframes,
            bar_count:            100,
            fetch_interval:       Duration::from_secs(60),
            health_interval:      Duration::from_secs(30),
            auto_restart:         true,
            max_restart_attempts: 3,
            max_errors:           10,
            history_capacity:     1000,
            rows_capacity:        100,
            warm_up_bars:         0,
            automation_path:      PathBuf::from("automation_state.json"),
            automation_default:   None,
            mt5_base_url:         PAPER_BROKER_URL.into(),
            mt5_timeout:          Duration::from_secs(10),
            paper_balance:        10_000.0,
            bind_addr:            SocketAddr::from(([0, 0, 0, 0], 3000)),
            request_timeout:      Duration::from_millis(2000),
            api_key:              None,
            plan_path:            None,
            limits:               TradingLimits::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol.trim().is_empty() {
            return Err(ConfigError::EmptySymbol);
        }
        if self.timeframes.is_empty() {
            return Err(ConfigError::NoTimeframes);
        }
        if self.fetch_interval.is_zero() || self.health_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field:  "interval".into(),
                reason: "fetch and health intervals must be positive".into(),
            });
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid { field: "history_capacity".into(), reason: "must be > 0".into() });
        }
        Ok(())
    }

    pub fn uses_paper_broker(&self) -> bool {
        self.mt5_base_url.eq_ignore_ascii_case(PAPER_BROKER_URL)
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            symbol:     self.symbol.clone(),
            timeframes: self.timeframes.clone(),
            bar_count:  self.bar_count,
        }
    }

    /// Every fetched timeframe is processed; the plan's set is used where
    /// given, [`default_indicators`] elsewhere.
    pub fn indicator_config(&self, plan: &TradingPlan) -> IndicatorConfig {
        let timeframes = self
            .timeframes
            .iter()
            .map(|tf| {
                let specs = plan.indicators.get(tf).cloned().unwrap_or_else(default_indicators);
                (tf.clone(), specs)
            })
            .collect();
        IndicatorConfig {
            symbol:        self.symbol.clone(),
            timeframes,
            regime:        plan.regime.clone(),
            rows_capacity: self.rows_capacity,
        }
    }

    /// Plan limits win over the `RISK_*` environment.
    pub fn execution_config(&self, plan: &TradingPlan) -> ExecutionConfig {
        ExecutionConfig {
            risk:   plan.risk.clone(),
            limits: plan.limits.clone().unwrap_or_else(|| self.limits.clone()),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            health_interval:      self.health_interval,
            auto_restart:         self.auto_restart,
            max_restart_attempts: self.max_restart_attempts,
            max_iterations:       None,
        }
    }
}

/// Indicator set for a timeframe the plan does not mention.
pub fn default_indicators() -> Vec<IndicatorSpec> {
    vec![
        IndicatorSpec::Ema { period: 20 },
        IndicatorSpec::Ema { period: 50 },
        IndicatorSpec::Rsi { period: 14 },
        IndicatorSpec::Atr { period: 14 },
    ]
}

// ─── Trading plan ─────────────────────────────────────────────────────────────

/// The operator-authored trading plan.
///
/// ```json
/// {
///   "strategies": [{ "name": "ema_trend", "symbol": "XAUUSD", "entry_long": { ... } }],
///   "indicators": { "5": [{ "type": "ema", "period": 20 }, { "type": "atr", "period": 14 }] },
///   "risk": { "XAUUSD/ema_trend": { "sizing": { ... }, "stop_loss": { ... }, "take_profit": { ... } } },
///   "limits": { "max_open_positions": 3 }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingPlan {
    pub strategies: Vec<StrategyDefinition>,
    pub indicators: BTreeMap<Timeframe, Vec<IndicatorSpec>>,
    pub regime:     RegimeConfig,
    /// Keyed `"SYMBOL/strategy"`.
    pub risk:       HashMap<String, RiskConfig>,
    /// `None` falls back to [`EngineConfig::limits`].
    pub limits:     Option<TradingLimits>,
}

impl TradingPlan {
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).context("trading plan is not valid JSON for the expected schema")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read trading plan {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("in {}", path.display()))
    }

    /// Cross-checks the plan against the engine it will run in.
    ///
    /// * every strategy is well formed and trades `engine.symbol`
    /// * every strategy has a valid risk config under `"SYMBOL/name"`
    /// * every ATR stop points at a fetched timeframe that computes that ATR
    /// * plan indicator timeframes are all fetched
    pub fn validate(&self, engine: &EngineConfig) -> Result<(), ConfigError> {
        self.regime.validate()?;
        for (tf, specs) in &self.indicators {
            if !engine.timeframes.contains(tf) {
                return Err(ConfigError::Invalid {
                    field:  format!("indicators.{tf}"),
                    reason: "timeframe is not in TIMEFRAMES".into(),
                });
            }
            for spec in specs {
                spec.validate()?;
            }
        }

        let indicators = engine.indicator_config(self);
        for strategy in &self.strategies {
            strategy.validate()?;
            if strategy.symbol != engine.symbol {
                return Err(ConfigError::Strategy {
                    strategy: strategy.name.clone(),
                    reason:   format!("symbol {} is not traded by this engine ({})", strategy.symbol, engine.symbol),
                });
            }
            let key = risk_key(&strategy.symbol, &strategy.name);
            let risk = self.risk.get(&key).ok_or_else(|| ConfigError::Risk {
                key:    key.clone(),
                reason: "missing risk config for strategy".into(),
            })?;
            risk.validate(&key)?;

            if let StopLossRule::Atr { period, timeframe, .. } = &risk.stop_loss {
                let computed = indicators
                    .timeframes
                    .get(&Timeframe::from(timeframe.as_str()))
                    .is_some_and(|specs| specs.contains(&IndicatorSpec::Atr { period: *period }));
                if !computed {
                    return Err(ConfigError::Risk {
                        key,
                        reason: format!("ATR({period}) is not computed on timeframe {timeframe}"),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"{
        "strategies": [{
            "name": "ema_trend",
            "symbol": "XAUUSD",
            "entry_long": {
                "mode": "ALL",
                "conditions": [
                    { "timeframe": "5", "signal": "ema_20", "operator": "crosses_above", "operand": { "signal": "ema_50" } }
                ]
            }
        }],
        "indicators": {
            "5": [{ "type": "ema", "period": 20 }, { "type": "ema", "period": 50 }, { "type": "atr", "period": 14 }]
        },
        "risk": {
            "XAUUSD/ema_trend": {
                "sizing":      { "type": "percent_equity", "percent": 1.0 },
                "stop_loss":   { "type": "atr", "multiple": 2.0, "timeframe": "5" },
                "take_profit": { "type": "risk_reward", "ratio": 2.0 }
            }
        },
        "limits": { "max_open_positions": 2 }
    }"#;

    fn engine() -> EngineConfig {
        EngineConfig::with_defaults("XAUUSD", parse_timeframes("1,5"))
    }

    #[test]
    fn test_parse_timeframes_trims_and_dedups() {
        let tfs = parse_timeframes(" 1, 5 ,,5,H1 ");
        assert_eq!(tfs, vec![Timeframe::from("1"), Timeframe::from("5"), Timeframe::from("H1")]);
        assert!(parse_timeframes(" , ").is_empty());
    }

    #[test]
    fn test_parse_bool_variants() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" off "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_env_helpers_fall_back_on_garbage() {
        std::env::set_var("AUTOPILOT_TEST_U32_GARBAGE", "abc");
        assert_eq!(env_u32("AUTOPILOT_TEST_U32_GARBAGE", 7), 7);
        std::env::set_var("AUTOPILOT_TEST_F64", " 2.5 ");
        assert_eq!(env_f64("AUTOPILOT_TEST_F64", 0.0), 2.5);
        assert_eq!(env_string("AUTOPILOT_TEST_UNSET_STRING", "dflt"), "dflt");
    }

    #[test]
    fn test_plan_parses_and_validates() {
        let plan = TradingPlan::from_json(PLAN).unwrap();
        assert_eq!(plan.strategies.len(), 1);
        let limits = plan.limits.clone().unwrap();
        assert_eq!(limits.max_open_positions, 2);
        assert_eq!(limits.max_trades_per_day, TradingLimits::default().max_trades_per_day);
        plan.validate(&engine()).unwrap();

        let indicators = engine().indicator_config(&plan);
        assert_eq!(indicators.timeframes[&Timeframe::from("1")], default_indicators());
        assert_eq!(indicators.timeframes[&Timeframe::from("5")].len(), 3);
    }

    #[test]
    fn test_missing_risk_config_is_rejected() {
        let mut plan = TradingPlan::from_json(PLAN).unwrap();
        plan.risk.clear();
        let err = plan.validate(&engine()).unwrap_err();
        assert!(matches!(err, ConfigError::Risk { ref key, .. } if key == "XAUUSD/ema_trend"));
    }

    #[test]
    fn test_atr_stop_needs_matching_indicator() {
        let mut plan = TradingPlan::from_json(PLAN).unwrap();
        plan.indicators.insert(Timeframe::from("5"), vec![IndicatorSpec::Ema { period: 20 }]);
        assert!(matches!(plan.validate(&engine()), Err(ConfigError::Risk { .. })));
    }

    #[test]
    fn test_foreign_symbol_and_unfetched_timeframe_rejected() {
        let mut plan = TradingPlan::from_json(PLAN).unwrap();
        plan.strategies[0].symbol = "EURUSD".into();
        assert!(matches!(plan.validate(&engine()), Err(ConfigError::Strategy { .. })));

        let mut plan = TradingPlan::from_json(PLAN).unwrap();
        plan.indicators.insert(Timeframe::from("H4"), vec![]);
        assert!(matches!(plan.validate(&engine()), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = TradingPlan::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("plan.json"));
    }

    #[test]
    fn test_env_limits_apply_without_plan_limits() {
        std::env::set_var("RISK_MAX_OPEN_POSITIONS", "7");
        std::env::set_var("RISK_COOLDOWN_SECS", "45");
        let engine = EngineConfig { limits: TradingLimits::from_env(), ..engine() };
        assert_eq!(engine.limits.max_open_positions, 7);
        assert_eq!(engine.limits.cooldown_secs_after_failure, 45);

        let bare = TradingPlan::default();
        assert_eq!(engine.execution_config(&bare).limits.max_open_positions, 7);

        let plan = TradingPlan::from_json(PLAN).unwrap();
        assert_eq!(engine.execution_config(&plan).limits.max_open_positions, 2);
    }

    #[test]
    fn test_empty_plan_is_valid() {
        TradingPlan::default().validate(&engine()).unwrap();
    }
}

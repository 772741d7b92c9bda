//! # indicators::regime
//!
//! Discrete market-state classification from recent closes.
//!
//! ```text
//! efficiency ratio  ER  = |close[n] - close[0]| / Σ |close[i] - close[i-1]|
//! volatility        σ   = stdev of simple returns over the window
//! baseline          σ̄   = slow EMA of σ
//!
//! σ / σ̄ ≥ volatility_ratio   → VOLATILE
//! ER ≥ trend_threshold        → TRENDING_UP / TRENDING_DOWN (sign of net move)
//! otherwise                   → RANGING
//! fewer than lookback+1 bars  → UNKNOWN
//! ```

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    TrendingUp,
    TrendingDown,
    Ranging,
    Volatile,
    /// Warming up.
    #[default]
    Unknown,
}

impl Regime {
    /// Wire label, also the text value conditions compare against.
    pub fn as_str(self) -> &'static str {
        match self {
            Regime::TrendingUp   => "TRENDING_UP",
            Regime::TrendingDown => "TRENDING_DOWN",
            Regime::Ranging      => "RANGING",
            Regime::Volatile     => "VOLATILE",
            Regime::Unknown      => "UNKNOWN",
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeConfig {
    /// Bars in the efficiency / volatility window.
    #[serde(default = "default_lookback")]
    pub lookback:         usize,
    /// ER at or above which the market is trending.
    #[serde(default = "default_trend_threshold")]
    pub trend_threshold:  f64,
    /// σ/σ̄ at or above which the market is volatile.
    #[serde(default = "default_volatility_ratio")]
    pub volatility_ratio: f64,
}

fn default_lookback() -> usize {
    20
}
fn default_trend_threshold() -> f64 {
    0.3
}
fn default_volatility_ratio() -> f64 {
    2.0
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            lookback:         default_lookback(),
            trend_threshold:  default_trend_threshold(),
            volatility_ratio: default_volatility_ratio(),
        }
    }
}

impl RegimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lookback < 2 {
            return Err(ConfigError::Invalid { field: "regime.lookback".into(), reason: "must be >= 2".into() });
        }
        if !(0.0..=1.0).contains(&self.trend_threshold) || self.trend_threshold == 0.0 {
            return Err(ConfigError::Invalid {
                field:  "regime.trend_threshold".into(),
                reason: "must be in (0, 1]".into(),
            });
        }
        if self.volatility_ratio <= 1.0 {
            return Err(ConfigError::Invalid {
                field:  "regime.volatility_ratio".into(),
                reason: "must be > 1".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RegimeReading {
    pub regime:           Regime,
    /// 0..=1
    pub confidence:       f64,
    /// Label differs from the previous established label. The first label
    /// after warm-up is not a transition.
    pub changed:          bool,
    pub previous:         Option<Regime>,
    pub efficiency_ratio: f64,
    pub volatility:       f64,
}

/// Per-timeframe classifier state.
#[derive(Debug, Clone)]
pub struct RegimeClassifier {
    config:   RegimeConfig,
    closes:   VecDeque<f64>,
    baseline: Option<f64>,
    alpha:    f64,
    last:     Option<Regime>,
}

impl RegimeClassifier {
    pub fn new(config: RegimeConfig) -> Self {
        // baseline spans roughly four windows
        let alpha = 2.0 / (config.lookback as f64 * 4.0 + 1.0);
        Self {
            closes: VecDeque::with_capacity(config.lookback + 2),
            baseline: None,
            alpha,
            last: None,
            config,
        }
    }

    pub fn current(&self) -> Option<Regime> {
        self.last
    }

    pub fn update(&mut self, close: f64) -> RegimeReading {
        self.closes.push_back(close);
        if self.closes.len() > self.config.lookback + 1 {
            self.closes.pop_front();
        }

        if self.closes.len() <= self.config.lookback {
            return RegimeReading {
                regime:           Regime::Unknown,
                confidence:       0.0,
                changed:          false,
                previous:         self.last,
                efficiency_ratio: 0.0,
                volatility:       0.0,
            };
        }

        let er = self.efficiency_ratio();
        let vol = self.return_volatility();
        let baseline = match self.baseline {
            Some(b) => b,
            None => vol,
        };
        let ratio = if baseline > 0.0 { vol / baseline } else { 1.0 };
        self.baseline = Some(baseline + self.alpha * (vol - baseline));

        let (regime, confidence) = if ratio >= self.config.volatility_ratio {
            (Regime::Volatile, (ratio / (2.0 * self.config.volatility_ratio)).clamp(0.5, 1.0))
        } else if er >= self.config.trend_threshold {
            let first = self.closes.front().copied().unwrap_or(close);
            let label = if close >= first { Regime::TrendingUp } else { Regime::TrendingDown };
            (label, er.clamp(0.0, 1.0))
        } else {
            (Regime::Ranging, (1.0 - er / self.config.trend_threshold).clamp(0.0, 1.0))
        };

        let previous = self.last.replace(regime);
        RegimeReading {
            regime,
            confidence,
            changed: previous.is_some_and(|p| p != regime),
            previous,
            efficiency_ratio: er,
            volatility: vol,
        }
    }

    fn efficiency_ratio(&self) -> f64 {
        let (Some(first), Some(last)) = (self.closes.front(), self.closes.back()) else {
            return 0.0;
        };
        let path: f64 = self
            .closes
            .iter()
            .zip(self.closes.iter().skip(1))
            .map(|(a, b)| (b - a).abs())
            .sum();
        if path == 0.0 {
            0.0
        } else {
            (last - first).abs() / path
        }
    }

    fn return_volatility(&self) -> f64 {
        let returns: Vec<f64> = self
            .closes
            .iter()
            .zip(self.closes.iter().skip(1))
            .filter(|(a, _)| **a != 0.0)
            .map(|(a, b)| (b - a) / a)
            .collect();
        if returns.len() < 2 {
            return 0.0;
        }
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        (returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier(lookback: usize) -> RegimeClassifier {
        RegimeClassifier::new(RegimeConfig { lookback, ..RegimeConfig::default() })
    }

    #[test]
    fn test_unknown_until_window_full() {
        let mut c = classifier(5);
        for i in 0..5 {
            assert_eq!(c.update(100.0 + i as f64).regime, Regime::Unknown);
        }
        assert_ne!(c.update(105.0).regime, Regime::Unknown);
    }

    #[test]
    fn test_straight_line_is_trending() {
        let mut c = classifier(5);
        let mut last = None;
        for i in 0..10 {
            last = Some(c.update(100.0 + i as f64));
        }
        let r = last.unwrap();
        assert_eq!(r.regime, Regime::TrendingUp);
        assert!((r.confidence - 1.0).abs() < 1e-9);

        let mut c = classifier(5);
        for i in 0..10 {
            last = Some(c.update(100.0 - i as f64));
        }
        assert_eq!(last.unwrap().regime, Regime::TrendingDown);
    }

    #[test]
    fn test_oscillation_is_ranging() {
        let mut c = classifier(6);
        let mut last = None;
        for i in 0..12 {
            last = Some(c.update(if i % 2 == 0 { 100.0 } else { 101.0 }));
        }
        assert_eq!(last.unwrap().regime, Regime::Ranging);
    }

    #[test]
    fn test_volatility_spike() {
        let mut c = classifier(5);
        for i in 0..40 {
            c.update(100.0 + if i % 2 == 0 { 0.1 } else { 0.0 });
        }
        let spike = [110.0, 95.0, 112.0, 90.0, 115.0];
        let readings: Vec<_> = spike.iter().map(|&p| c.update(p)).collect();
        assert!(readings.iter().any(|r| r.regime == Regime::Volatile));
    }

    #[test]
    fn test_first_label_is_not_a_transition() {
        let mut c = classifier(3);
        let readings: Vec<_> = (0..4).map(|i| c.update(100.0 + i as f64)).collect();
        assert_eq!(readings[3].regime, Regime::TrendingUp);
        assert!(!readings[3].changed);

        let reversal: Vec<_> = (0..4).map(|i| c.update(103.0 - i as f64)).collect();
        let first_change = reversal.iter().find(|r| r.changed).unwrap();
        assert_eq!(first_change.previous, Some(Regime::TrendingUp));
    }

    #[test]
    fn test_label_serialises_screaming() {
        assert_eq!(serde_json::to_string(&Regime::TrendingUp).unwrap(), "\"TRENDING_UP\"");
        assert_eq!(Regime::Volatile.to_string(), "VOLATILE");
    }
}

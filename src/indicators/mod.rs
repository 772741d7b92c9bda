//! # indicators
//!
//! Streaming technical indicators: one `update(bar)` per closed bar, O(period)
//! worst case, no re-scan of history.
//!
//! | Spec                 | Outputs                                          |
//! |----------------------|--------------------------------------------------|
//! | `sma { period }`     | `sma_{period}`                                   |
//! | `ema { period }`     | `ema_{period}`                                   |
//! | `rsi { period }`     | `rsi_{period}` (Wilder smoothing)                |
//! | `atr { period }`     | `atr_{period}` (Wilder smoothing)                |
//! | `bollinger { .. }`   | `bb_upper_{p}`, `bb_middle_{p}`, `bb_lower_{p}`  |
//! | `macd { .. }`        | `macd`, `macd_signal`, `macd_hist`               |
//!
//! An output is absent until its warm-up is complete; conditions that
//! reference it simply evaluate false in the meantime.

pub mod regime;

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::models::Bar;

// ─── Specs ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndicatorSpec {
    Sma { period: usize },
    Ema { period: usize },
    Rsi { period: usize },
    Atr { period: usize },
    Bollinger {
        period:  usize,
        #[serde(default = "default_std_dev")]
        std_dev: f64,
    },
    Macd {
        #[serde(default = "default_macd_fast")]
        fast:   usize,
        #[serde(default = "default_macd_slow")]
        slow:   usize,
        #[serde(default = "default_macd_signal")]
        signal: usize,
    },
}

fn default_std_dev() -> f64 {
    2.0
}
fn default_macd_fast() -> usize {
    12
}
fn default_macd_slow() -> usize {
    26
}
fn default_macd_signal() -> usize {
    9
}

impl IndicatorSpec {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bad = |reason: &str| ConfigError::Invalid {
            field:  format!("indicator {self:?}"),
            reason: reason.to_string(),
        };
        match *self {
            IndicatorSpec::Sma { period }
            | IndicatorSpec::Ema { period }
            | IndicatorSpec::Rsi { period }
            | IndicatorSpec::Atr { period } if period == 0 => Err(bad("period must be positive")),
            IndicatorSpec::Bollinger { period, std_dev } if period < 2 || std_dev <= 0.0 => {
                Err(bad("bollinger needs period >= 2 and positive std_dev"))
            }
            IndicatorSpec::Macd { fast, slow, signal } if fast == 0 || signal == 0 || fast >= slow => {
                Err(bad("macd needs 0 < fast < slow and signal > 0"))
            }
            _ => Ok(()),
        }
    }

    /// Output names this spec can produce.
    pub fn outputs(&self) -> Vec<String> {
        match self {
            IndicatorSpec::Sma { period } => vec![format!("sma_{period}")],
            IndicatorSpec::Ema { period } => vec![format!("ema_{period}")],
            IndicatorSpec::Rsi { period } => vec![format!("rsi_{period}")],
            IndicatorSpec::Atr { period } => vec![format!("atr_{period}")],
            IndicatorSpec::Bollinger { period, .. } => vec![
                format!("bb_upper_{period}"),
                format!("bb_middle_{period}"),
                format!("bb_lower_{period}"),
            ],
            IndicatorSpec::Macd { .. } => vec!["macd".into(), "macd_signal".into(), "macd_hist".into()],
        }
    }
}

/// Default set used when the trading plan does not list indicators for a timeframe.
pub fn default_specs() -> Vec<IndicatorSpec> {
    vec![
        IndicatorSpec::Sma { period: 20 },
        IndicatorSpec::Ema { period: 20 },
        IndicatorSpec::Ema { period: 50 },
        IndicatorSpec::Rsi { period: 14 },
        IndicatorSpec::Atr { period: 14 },
        IndicatorSpec::Bollinger { period: 20, std_dev: 2.0 },
        IndicatorSpec::Macd { fast: 12, slow: 26, signal: 9 },
    ]
}

// ─── Streaming primitives ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Sma {
    period: usize,
    window: VecDeque<f64>,
    sum:    f64,
}

impl Sma {
    fn new(period: usize) -> Self {
        Self { period, window: VecDeque::with_capacity(period + 1), sum: 0.0 }
    }

    fn update(&mut self, x: f64) -> Option<f64> {
        self.window.push_back(x);
        self.sum += x;
        if self.window.len() > self.period {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
            }
        }
        (self.window.len() == self.period).then(|| self.sum / self.period as f64)
    }
}

/// EMA seeded with the SMA of the first `period` values.
#[derive(Debug, Clone)]
struct Ema {
    period: usize,
    alpha:  f64,
    seed:   Sma,
    value:  Option<f64>,
}

impl Ema {
    fn new(period: usize) -> Self {
        Self {
            period,
            alpha: 2.0 / (period as f64 + 1.0),
            seed:  Sma::new(period),
            value: None,
        }
    }

    fn update(&mut self, x: f64) -> Option<f64> {
        self.value = match self.value {
            Some(prev) => Some(prev + self.alpha * (x - prev)),
            None => self.seed.update(x),
        };
        self.value
    }
}

/// Wilder's running average: simple mean for the first `period` samples, then
/// `(prev * (n - 1) + x) / n`.
#[derive(Debug, Clone)]
struct Wilder {
    period: usize,
    count:  usize,
    sum:    f64,
    value:  Option<f64>,
}

impl Wilder {
    fn new(period: usize) -> Self {
        Self { period, count: 0, sum: 0.0, value: None }
    }

    fn update(&mut self, x: f64) -> Option<f64> {
        let n = self.period as f64;
        self.value = match self.value {
            Some(prev) => Some((prev * (n - 1.0) + x) / n),
            None => {
                self.count += 1;
                self.sum += x;
                (self.count == self.period).then(|| self.sum / n)
            }
        };
        self.value
    }
}

#[derive(Debug, Clone)]
struct Rsi {
    prev: Option<f64>,
    gain: Wilder,
    loss: Wilder,
}

impl Rsi {
    fn update(&mut self, close: f64) -> Option<f64> {
        let prev = self.prev.replace(close)?;
        let change = close - prev;
        let gain = self.gain.update(change.max(0.0));
        let loss = self.loss.update((-change).max(0.0));
        let (gain, loss) = (gain?, loss?);
        if loss == 0.0 {
            return Some(if gain == 0.0 { 50.0 } else { 100.0 });
        }
        Some(100.0 - 100.0 / (1.0 + gain / loss))
    }
}

#[derive(Debug, Clone)]
struct Atr {
    prev_close: Option<f64>,
    avg:        Wilder,
}

impl Atr {
    fn update(&mut self, bar: &Bar) -> Option<f64> {
        let tr = match self.prev_close {
            Some(pc) => (bar.high - bar.low)
                .max((bar.high - pc).abs())
                .max((bar.low - pc).abs()),
            None => bar.high - bar.low,
        };
        self.prev_close = Some(bar.close);
        self.avg.update(tr)
    }
}

#[derive(Debug, Clone)]
struct Bollinger {
    period:  usize,
    std_dev: f64,
    window:  VecDeque<f64>,
}

impl Bollinger {
    fn update(&mut self, x: f64) -> Option<(f64, f64, f64)> {
        self.window.push_back(x);
        if self.window.len() > self.period {
            self.window.pop_front();
        }
        if self.window.len() < self.period {
            return None;
        }
        let n = self.period as f64;
        let mean = self.window.iter().sum::<f64>() / n;
        let var = self.window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let band = self.std_dev * var.sqrt();
        Some((mean + band, mean, mean - band))
    }
}

#[derive(Debug, Clone)]
struct Macd {
    fast:   Ema,
    slow:   Ema,
    signal: Ema,
}

impl Macd {
    fn update(&mut self, x: f64) -> (Option<f64>, Option<f64>) {
        let fast = self.fast.update(x);
        let slow = self.slow.update(x);
        let (Some(f), Some(s)) = (fast, slow) else {
            return (None, None);
        };
        let line = f - s;
        (Some(line), self.signal.update(line))
    }
}

#[derive(Debug, Clone)]
enum Indicator {
    Sma(Sma),
    Ema(Ema),
    Rsi(Rsi),
    Atr(Atr),
    Bollinger(Bollinger),
    Macd(Macd),
}

impl Indicator {
    fn from_spec(spec: &IndicatorSpec) -> Self {
        match *spec {
            IndicatorSpec::Sma { period } => Indicator::Sma(Sma::new(period)),
            IndicatorSpec::Ema { period } => Indicator::Ema(Ema::new(period)),
            IndicatorSpec::Rsi { period } => Indicator::Rsi(Rsi {
                prev: None,
                gain: Wilder::new(period),
                loss: Wilder::new(period),
            }),
            IndicatorSpec::Atr { period } => Indicator::Atr(Atr { prev_close: None, avg: Wilder::new(period) }),
            IndicatorSpec::Bollinger { period, std_dev } => Indicator::Bollinger(Bollinger {
                period,
                std_dev,
                window: VecDeque::with_capacity(period + 1),
            }),
            IndicatorSpec::Macd { fast, slow, signal } => Indicator::Macd(Macd {
                fast:   Ema::new(fast),
                slow:   Ema::new(slow),
                signal: Ema::new(signal),
            }),
        }
    }
}

// ─── Indicator Set ────────────────────────────────────────────────────────────

/// Every configured indicator for one timeframe.
#[derive(Debug, Clone)]
pub struct IndicatorSet {
    specs: Vec<IndicatorSpec>,
    state: Vec<Indicator>,
}

impl IndicatorSet {
    pub fn new(specs: &[IndicatorSpec]) -> Self {
        Self {
            specs: specs.to_vec(),
            state: specs.iter().map(Indicator::from_spec).collect(),
        }
    }

    pub fn specs(&self) -> &[IndicatorSpec] {
        &self.specs
    }

    /// Feed one bar; returns every output that is past warm-up.
    pub fn update(&mut self, bar: &Bar) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        for (spec, ind) in self.specs.iter().zip(self.state.iter_mut()) {
            match (spec, ind) {
                (IndicatorSpec::Sma { period }, Indicator::Sma(s)) => {
                    if let Some(v) = s.update(bar.close) {
                        out.insert(format!("sma_{period}"), v);
                    }
                }
                (IndicatorSpec::Ema { period }, Indicator::Ema(e)) => {
                    if let Some(v) = e.update(bar.close) {
                        out.insert(format!("ema_{period}"), v);
                    }
                }
                (IndicatorSpec::Rsi { period }, Indicator::Rsi(r)) => {
                    if let Some(v) = r.update(bar.close) {
                        out.insert(format!("rsi_{period}"), v);
                    }
                }
                (IndicatorSpec::Atr { period }, Indicator::Atr(a)) => {
                    if let Some(v) = a.update(bar) {
                        out.insert(format!("atr_{period}"), v);
                    }
                }
                (IndicatorSpec::Bollinger { period, .. }, Indicator::Bollinger(b)) => {
                    if let Some((upper, middle, lower)) = b.update(bar.close) {
                        out.insert(format!("bb_upper_{period}"), upper);
                        out.insert(format!("bb_middle_{period}"), middle);
                        out.insert(format!("bb_lower_{period}"), lower);
                    }
                }
                (IndicatorSpec::Macd { .. }, Indicator::Macd(m)) => {
                    let (line, signal) = m.update(bar.close);
                    if let Some(line) = line {
                        out.insert("macd".into(), line);
                    }
                    if let (Some(line), Some(signal)) = (line, signal) {
                        out.insert("macd_signal".into(), signal);
                        out.insert("macd_hist".into(), line - signal);
                    }
                }
                _ => {}
            }
        }
        out
    }
}

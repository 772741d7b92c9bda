//! # models::bar
//!
//! Market data primitives: [`Timeframe`], [`Bar`] (one OHLCV sample) and
//! [`EnrichedRow`] (a bar plus computed indicator values and a regime label).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::indicators::regime::Regime;

// ─── Timeframe ────────────────────────────────────────────────────────────────

/// Broker timeframe identifier, e.g. `"1"`, `"5"`, `"H1"`.
///
/// Kept opaque: the engine only needs it as a key, the broker adapter is the
/// one that interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timeframe(pub String);

impl Timeframe {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Timeframe {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Timeframe {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ─── Bar ──────────────────────────────────────────────────────────────────────

/// One OHLCV sample for a (symbol, timeframe) pair.
///
/// Immutable once published into an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol:    String,
    pub timeframe: Timeframe,
    /// Bar open time — the identity used for new-candle detection.
    pub open_time: DateTime<Utc>,
    pub open:      f64,
    pub high:      f64,
    pub low:       f64,
    pub close:     f64,
    #[serde(default)]
    pub volume:    f64,
}

impl Bar {
    /// `true` when every price field is a finite number and the range is sane.
    pub fn is_well_formed(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        prices.iter().all(|p| p.is_finite())
            && self.volume.is_finite()
            && self.high >= self.low
    }

    /// Typical price `(h + l + c) / 3`.
    #[inline]
    pub fn typical(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

// ─── Enriched Row ─────────────────────────────────────────────────────────────

/// A bar augmented with indicator values and the regime label at that bar.
///
/// Owned by the Indicator/Regime stage; read-only downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRow {
    pub bar:               Bar,
    /// Indicator outputs keyed by signal name (`rsi_14`, `atr_14`, ...).
    /// A missing key means "not ready yet" (warm-up).
    pub indicators:        BTreeMap<String, f64>,
    pub regime:            Regime,
    pub regime_confidence: f64,
}

impl EnrichedRow {
    /// Numeric value of a named signal: bar fields first, then indicators.
    pub fn numeric(&self, name: &str) -> Option<f64> {
        match name {
            "open"   => Some(self.bar.open),
            "high"   => Some(self.bar.high),
            "low"    => Some(self.bar.low),
            "close"  => Some(self.bar.close),
            "volume" => Some(self.bar.volume),
            "regime_confidence" => Some(self.regime_confidence),
            other    => self.indicators.get(other).copied(),
        }
    }
}

// ─── Market Snapshot ──────────────────────────────────────────────────────────

/// Recent enriched rows per timeframe, oldest first.
///
/// A copy of the Indicator stage's bounded buffers taken at publish time; the
/// Strategy stage reads it and nothing mutates it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub rows:   BTreeMap<Timeframe, Vec<EnrichedRow>>,
}

impl MarketSnapshot {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self { symbol: symbol.into(), rows: BTreeMap::new() }
    }

    pub fn latest(&self, timeframe: &Timeframe) -> Option<&EnrichedRow> {
        self.rows.get(timeframe).and_then(|rows| rows.last())
    }

    /// The row before the latest one.
    pub fn previous(&self, timeframe: &Timeframe) -> Option<&EnrichedRow> {
        self.rows
            .get(timeframe)
            .and_then(|rows| rows.len().checked_sub(2).map(|i| &rows[i]))
    }
}

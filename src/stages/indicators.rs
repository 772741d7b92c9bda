//! # stages::indicators — Indicator/Regime Stage
//!
//! Subscribes to `NewCandle`.  Per timeframe it owns one streaming
//! [`IndicatorSet`], one [`RegimeClassifier`] and a bounded buffer of recent
//! [`EnrichedRow`]s.
//!
//! ```text
//! NewCandle(tf, bar)
//!   ├─ regime  = classifier[tf].update(close)
//!   ├─ values  = indicators[tf].update(bar)
//!   ├─ rows[tf].push(row)               (oldest evicted at capacity)
//!   ├─ IndicatorsCalculated(row, snapshot of every tf)
//!   └─ RegimeChanged                    (label differs from previous label)
//! ```
//!
//! A failure for one bar is published as `IndicatorCalculationError`; the
//! stage keeps running and other timeframes are unaffected.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::bus::SharedBus;
use crate::error::{ConfigError, EngineError, Result};
use crate::events::{Event, EventKind, EventPayload};
use crate::indicators::regime::{RegimeClassifier, RegimeConfig, RegimeReading};
use crate::indicators::{IndicatorSet, IndicatorSpec};
use crate::models::{Bar, EnrichedRow, MarketSnapshot, Timeframe};
use crate::service::{HealthTracker, Service, ServiceHealth, Subscriptions};
use crate::sync::lock;

pub const SERVICE_NAME: &str = "indicators";
pub const DEFAULT_ROWS_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorConfig {
    pub symbol:        String,
    /// Indicator specs per timeframe. Every key is a processed timeframe.
    pub timeframes:    BTreeMap<Timeframe, Vec<IndicatorSpec>>,
    pub regime:        RegimeConfig,
    pub rows_capacity: usize,
}

impl IndicatorConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.symbol.trim().is_empty() {
            return Err(ConfigError::EmptySymbol);
        }
        if self.timeframes.is_empty() {
            return Err(ConfigError::NoTimeframes);
        }
        for spec in self.timeframes.values().flatten() {
            spec.validate()?;
        }
        self.regime.validate()?;
        if self.rows_capacity < 2 {
            return Err(ConfigError::Invalid {
                field:  "rows_capacity".into(),
                reason: "must hold at least two rows (crossings need a previous row)".into(),
            });
        }
        Ok(())
    }
}

struct TimeframeState {
    indicators: IndicatorSet,
    regime:     RegimeClassifier,
    rows:       VecDeque<EnrichedRow>,
    seen:       usize,
}

/// Historical bars fed through the indicators on start, without publishing.
/// Live rows stay unpublished until a timeframe has seen `bars` bars.
struct WarmUp {
    broker: Arc<dyn Broker>,
    bars:   usize,
}

struct Inner {
    config:      IndicatorConfig,
    bus:         SharedBus,
    health:      HealthTracker,
    subs:        Subscriptions,
    warm_up:     Option<WarmUp>,
    state:       Mutex<HashMap<Timeframe, TimeframeState>>,
    calculated:  AtomicU64,
    transitions: AtomicU64,
    failures:    AtomicU64,
    held:        AtomicU64,
}

#[derive(Clone)]
pub struct IndicatorStage {
    inner: Arc<Inner>,
}

/// Outcome of processing one bar.
enum Processed {
    Row { row: EnrichedRow, reading: RegimeReading, snapshot: Arc<MarketSnapshot>, warming: bool },
    Duplicate,
}

impl IndicatorStage {
    pub fn new(config: IndicatorConfig, bus: SharedBus, max_errors: u64) -> Result<Self> {
        Self::build(config, bus, max_errors, None)
    }

    /// As [`new`](Self::new), but prime each timeframe with `bars` historical
    /// bars from `broker` on every start.
    pub fn with_warm_up(
        config: IndicatorConfig,
        bus: SharedBus,
        max_errors: u64,
        broker: Arc<dyn Broker>,
        bars: usize,
    ) -> Result<Self> {
        Self::build(config, bus, max_errors, Some(WarmUp { broker, bars }))
    }

    fn build(config: IndicatorConfig, bus: SharedBus, max_errors: u64, warm_up: Option<WarmUp>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                bus,
                health:      HealthTracker::new(SERVICE_NAME, max_errors),
                subs:        Subscriptions::default(),
                warm_up,
                state:       Mutex::new(HashMap::new()),
                calculated:  AtomicU64::new(0),
                transitions: AtomicU64::new(0),
                failures:    AtomicU64::new(0),
                held:        AtomicU64::new(0),
            }),
        })
    }

    /// Recent rows for `timeframe`, oldest first.
    pub fn recent_rows(&self, timeframe: &Timeframe) -> Vec<EnrichedRow> {
        lock(&self.inner.state)
            .get(timeframe)
            .map(|s| s.rows.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> MarketSnapshot {
        self.inner.snapshot_locked(&lock(&self.inner.state))
    }
}

impl Inner {
    fn fresh_state(&self) -> HashMap<Timeframe, TimeframeState> {
        self.config
            .timeframes
            .iter()
            .map(|(tf, specs)| {
                (
                    tf.clone(),
                    TimeframeState {
                        indicators: IndicatorSet::new(specs),
                        regime:     RegimeClassifier::new(self.config.regime.clone()),
                        rows:       VecDeque::with_capacity(self.config.rows_capacity),
                        seen:       0,
                    },
                )
            })
            .collect()
    }

    fn snapshot_locked(&self, state: &HashMap<Timeframe, TimeframeState>) -> MarketSnapshot {
        let mut snap = MarketSnapshot::new(self.config.symbol.clone());
        for (tf, s) in state {
            snap.rows.insert(tf.clone(), s.rows.iter().cloned().collect());
        }
        snap
    }

    /// Feed one bar into its timeframe's state.
    fn process(&self, bar: &Bar) -> Result<Processed> {
        if !bar.is_well_formed() {
            return Err(EngineError::Calculation(format!(
                "malformed bar at {} (o={} h={} l={} c={})",
                bar.open_time, bar.open, bar.high, bar.low, bar.close
            )));
        }

        let mut state = lock(&self.state);
        let tf_state = state.get_mut(&bar.timeframe).ok_or_else(|| {
            EngineError::Calculation(format!("timeframe '{}' is not configured", bar.timeframe))
        })?;

        if let Some(last) = tf_state.rows.back() {
            if bar.open_time == last.bar.open_time {
                return Ok(Processed::Duplicate);
            }
            if bar.open_time < last.bar.open_time {
                return Err(EngineError::Calculation(format!(
                    "out-of-order bar {} (last {})",
                    bar.open_time, last.bar.open_time
                )));
            }
        }

        let reading = tf_state.regime.update(bar.close);
        let indicators = tf_state.indicators.update(bar);
        let row = EnrichedRow {
            bar: bar.clone(),
            indicators,
            regime: reading.regime,
            regime_confidence: reading.confidence,
        };

        if tf_state.rows.len() >= self.config.rows_capacity {
            tf_state.rows.pop_front();
        }
        tf_state.rows.push_back(row.clone());
        tf_state.seen += 1;
        let warming = self.warm_up.as_ref().is_some_and(|w| tf_state.seen < w.bars);

        let snapshot = Arc::new(self.snapshot_locked(&state));
        Ok(Processed::Row { row, reading, snapshot, warming })
    }

    fn on_new_candle(&self, event: &Event) -> anyhow::Result<()> {
        let EventPayload::NewCandle { symbol, timeframe, bar } = &event.payload else {
            return Ok(());
        };
        if *symbol != self.config.symbol {
            return Ok(());
        }
        self.health.record_received();

        match self.process(bar) {
            Ok(Processed::Row { warming: true, .. }) => {
                self.held.fetch_add(1, Ordering::Relaxed);
                debug!(symbol = %symbol, timeframe = %timeframe, open_time = %bar.open_time, "indicators warming up");
            }
            Ok(Processed::Row { row, reading, snapshot, .. }) => {
                self.calculated.fetch_add(1, Ordering::Relaxed);
                self.publish(EventPayload::IndicatorsCalculated {
                    symbol:    symbol.clone(),
                    timeframe: timeframe.clone(),
                    row,
                    snapshot,
                });

                if reading.changed {
                    if let Some(previous) = reading.previous {
                        self.transitions.fetch_add(1, Ordering::Relaxed);
                        info!(
                            symbol     = %symbol,
                            timeframe  = %timeframe,
                            from       = %previous,
                            to         = %reading.regime,
                            confidence = reading.confidence,
                            "🔀 regime changed"
                        );
                        self.publish(EventPayload::RegimeChanged {
                            symbol:     symbol.clone(),
                            timeframe:  timeframe.clone(),
                            previous,
                            current:    reading.regime,
                            confidence: reading.confidence,
                        });
                    }
                }
            }
            Ok(Processed::Duplicate) => {
                debug!(symbol = %symbol, timeframe = %timeframe, open_time = %bar.open_time, "bar already processed");
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.health.record_error(e.to_string());
                warn!(symbol = %symbol, timeframe = %timeframe, error = %e, "⚠️ indicator calculation failed");
                self.publish(EventPayload::IndicatorCalculationError {
                    symbol:    symbol.clone(),
                    timeframe: timeframe.clone(),
                    error:     e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Prime every timeframe from history, leaving the newest bar for the
    /// first `NewCandle`.
    fn warm_up(&self) {
        let Some(w) = &self.warm_up else {
            return;
        };
        for tf in self.config.timeframes.keys() {
            let bars = match w.broker.get_bars(&self.config.symbol, tf, w.bars + 1) {
                Ok(bars) => bars,
                Err(e) => {
                    warn!(timeframe = %tf, error = %e, "indicator warm-up skipped");
                    continue;
                }
            };
            let history = &bars[..bars.len().saturating_sub(1)];
            let primed = history.iter().filter(|b| self.process(b).is_ok()).count();
            debug!(timeframe = %tf, primed, "indicator warm-up complete");
        }
    }

    fn publish(&self, payload: EventPayload) {
        self.health.record_published();
        self.bus.publish(Event::new(payload));
    }
}

impl Service for IndicatorStage {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    fn start(&self) -> Result<()> {
        if self.inner.health.is_running() {
            return Ok(());
        }
        *lock(&self.inner.state) = self.inner.fresh_state();
        self.inner.warm_up();

        let inner = Arc::clone(&self.inner);
        let id = self
            .inner
            .bus
            .subscribe(EventKind::NewCandle, "indicators::on_new_candle", move |e| inner.on_new_candle(e));
        self.inner.subs.push(id);
        self.inner.health.mark_running();
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.inner.subs.clear(&self.inner.bus);
        self.inner.health.mark_stopped();
        lock(&self.inner.state).clear();
        Ok(())
    }

    fn health_check(&self) -> ServiceHealth {
        self.inner.health.snapshot()
    }

    fn metrics(&self) -> serde_json::Value {
        let state = lock(&self.inner.state);
        let rows: BTreeMap<String, usize> = state.iter().map(|(tf, s)| (tf.to_string(), s.rows.len())).collect();
        let regimes: BTreeMap<String, String> = state
            .iter()
            .map(|(tf, s)| (tf.to_string(), s.regime.current().unwrap_or_default().to_string()))
            .collect();
        serde_json::json!({
            "symbol":      self.inner.config.symbol,
            "calculated":  self.inner.calculated.load(Ordering::Relaxed),
            "transitions": self.inner.transitions.load(Ordering::Relaxed),
            "failures":    self.inner.failures.load(Ordering::Relaxed),
            "held":        self.inner.held.load(Ordering::Relaxed),
            "rows":        rows,
            "regimes":     regimes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::bus::EventBus;
    use crate::indicators::regime::Regime;
    use chrono::{TimeZone, Utc};

    fn bar(tf: &str, minute: u32, close: f64) -> Bar {
        Bar {
            symbol:    "XAUUSD".into(),
            timeframe: Timeframe::from(tf),
            open_time: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(minute as i64),
            open:      close,
            high:      close + 0.5,
            low:       close - 0.5,
            close,
            volume:    1.0,
        }
    }

    fn candle(b: Bar) -> Event {
        Event::new(EventPayload::NewCandle { symbol: b.symbol.clone(), timeframe: b.timeframe.clone(), bar: b })
    }

    fn config(capacity: usize) -> IndicatorConfig {
        let mut timeframes = BTreeMap::new();
        timeframes.insert(Timeframe::from("1"), vec![IndicatorSpec::Sma { period: 3 }]);
        timeframes.insert(Timeframe::from("5"), vec![IndicatorSpec::Atr { period: 2 }]);
        IndicatorConfig {
            symbol: "XAUUSD".into(),
            timeframes,
            regime: RegimeConfig { lookback: 3, ..RegimeConfig::default() },
            rows_capacity: capacity,
        }
    }

    fn running(capacity: usize) -> (SharedBus, IndicatorStage) {
        let bus: SharedBus = Arc::new(EventBus::default());
        let stage = IndicatorStage::new(config(capacity), Arc::clone(&bus), 10).unwrap();
        stage.start().unwrap();
        (bus, stage)
    }

    #[test]
    fn test_rejects_invalid_config() {
        let bus: SharedBus = Arc::new(EventBus::default());
        let mut cfg = config(10);
        cfg.timeframes.clear();
        assert!(matches!(IndicatorStage::new(cfg, Arc::clone(&bus), 10), Err(EngineError::Config(_))));

        let mut cfg = config(10);
        cfg.timeframes.insert(Timeframe::from("15"), vec![IndicatorSpec::Rsi { period: 0 }]);
        assert!(IndicatorStage::new(cfg, bus, 10).is_err());
    }

    #[test]
    fn test_publishes_enriched_row_with_snapshot() {
        let (bus, stage) = running(10);
        for (i, c) in [10.0, 11.0, 12.0].into_iter().enumerate() {
            bus.publish(candle(bar("1", i as u32, c)));
        }

        let events = bus.history(Some(EventKind::IndicatorsCalculated));
        assert_eq!(events.len(), 3);
        match &events[2].payload {
            EventPayload::IndicatorsCalculated { row, snapshot, .. } => {
                assert_eq!(row.numeric("sma_3"), Some(11.0));
                assert_eq!(snapshot.rows[&Timeframe::from("1")].len(), 3);
                assert!(snapshot.rows[&Timeframe::from("5")].is_empty());
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(stage.recent_rows(&Timeframe::from("1")).len(), 3);
    }

    #[test]
    fn test_buffer_is_bounded_oldest_first() {
        let (bus, stage) = running(3);
        for i in 0..5 {
            bus.publish(candle(bar("1", i, 100.0 + i as f64)));
        }
        let closes: Vec<f64> = stage.recent_rows(&Timeframe::from("1")).iter().map(|r| r.bar.close).collect();
        assert_eq!(closes, vec![102.0, 103.0, 104.0]);
    }

    #[test]
    fn test_regime_change_published_on_transition_only() {
        let (bus, _stage) = running(50);
        let mut minute = 0;
        for i in 0..6 {
            bus.publish(candle(bar("1", minute, 100.0 + i as f64)));
            minute += 1;
        }
        assert!(bus.history(Some(EventKind::RegimeChanged)).is_empty());

        for i in 0..6 {
            bus.publish(candle(bar("1", minute, 105.0 - 2.0 * i as f64)));
            minute += 1;
        }
        let changes = bus.history(Some(EventKind::RegimeChanged));
        assert!(!changes.is_empty());
        match &changes[0].payload {
            EventPayload::RegimeChanged { previous, current, .. } => {
                assert_eq!(*previous, Regime::TrendingUp);
                assert_ne!(*current, Regime::TrendingUp);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_errors_are_isolated_per_bar() {
        let (bus, stage) = running(10);
        bus.publish(candle(bar("15", 0, 10.0)));

        let mut broken = bar("1", 0, 10.0);
        broken.high = f64::NAN;
        bus.publish(candle(broken));

        bus.publish(candle(bar("1", 1, 10.0)));
        assert_eq!(bus.history(Some(EventKind::IndicatorCalculationError)).len(), 2);
        assert_eq!(bus.history(Some(EventKind::IndicatorsCalculated)).len(), 1);
        assert!(stage.health_check().status == crate::service::ServiceStatus::Running);
    }

    #[test]
    fn test_duplicate_candle_is_ignored() {
        let (bus, _stage) = running(10);
        bus.publish(candle(bar("1", 0, 10.0)));
        bus.publish(candle(bar("1", 0, 10.0)));
        assert_eq!(bus.history(Some(EventKind::IndicatorsCalculated)).len(), 1);
        assert!(bus.history(Some(EventKind::IndicatorCalculationError)).is_empty());
    }

    #[test]
    fn test_warm_up_primes_history_but_leaves_latest_bar() {
        let broker = Arc::new(PaperBroker::new(1000.0));
        for i in 0..4 {
            broker.push_bar(bar("1", i, 10.0 + i as f64));
        }
        let bus: SharedBus = Arc::new(EventBus::default());
        let stage = IndicatorStage::with_warm_up(config(10), Arc::clone(&bus), 10, broker, 3).unwrap();
        stage.start().unwrap();

        assert_eq!(stage.recent_rows(&Timeframe::from("1")).len(), 3);
        assert!(bus.history(Some(EventKind::IndicatorsCalculated)).is_empty());

        bus.publish(candle(bar("1", 3, 13.0)));
        let events = bus.history(Some(EventKind::IndicatorsCalculated));
        assert_eq!(events.len(), 1);
        match &events[0].payload {
            EventPayload::IndicatorsCalculated { row, .. } => assert_eq!(row.numeric("sma_3"), Some(12.0)),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_short_history_holds_rows_until_warm() {
        let broker = Arc::new(PaperBroker::new(1000.0));
        broker.push_bar(bar("1", 0, 10.0));
        broker.push_bar(bar("1", 1, 11.0));
        let bus: SharedBus = Arc::new(EventBus::default());
        let stage = IndicatorStage::with_warm_up(config(10), Arc::clone(&bus), 10, broker, 5).unwrap();
        stage.start().unwrap();
        assert_eq!(stage.recent_rows(&Timeframe::from("1")).len(), 1);

        for i in 1..4 {
            bus.publish(candle(bar("1", i, 10.0 + i as f64)));
        }
        assert!(bus.history(Some(EventKind::IndicatorsCalculated)).is_empty());
        assert_eq!(stage.recent_rows(&Timeframe::from("1")).len(), 4);

        bus.publish(candle(bar("1", 4, 14.0)));
        bus.publish(candle(bar("1", 5, 15.0)));
        let events = bus.history(Some(EventKind::IndicatorsCalculated));
        assert_eq!(events.len(), 2);
        match &events[0].payload {
            EventPayload::IndicatorsCalculated { row, .. } => {
                assert_eq!(row.bar.close, 14.0);
                assert_eq!(row.numeric("sma_3"), Some(13.0));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(stage.metrics()["held"], 3);
    }

    #[test]
    fn test_stop_unsubscribes_and_clears() {
        let (bus, stage) = running(10);
        bus.publish(candle(bar("1", 0, 10.0)));
        stage.stop().unwrap();
        assert!(stage.recent_rows(&Timeframe::from("1")).is_empty());
        bus.publish(candle(bar("1", 1, 10.0)));
        assert_eq!(bus.history(Some(EventKind::IndicatorsCalculated)).len(), 1);
    }
}

//! # stages::fetch — Data Fetch Stage
//!
//! Pulls the most recent bars for every configured timeframe and turns them
//! into `DataFetched` / `NewCandle` events.
//!
//! ```text
//! fetch_one(tf)
//!   ├─ not RUNNING                 → Err(NotRunning)
//!   ├─ broker error / empty result → DataFetchError, Err
//!   ├─ DataFetched                 (always)
//!   └─ latest.open_time ≠ last[tf] → NewCandle, last[tf] = open_time
//! ```
//!
//! The last-known-bar map is owned here exclusively.  `start()` inserts an
//! (unset) entry for every configured timeframe before the stage is marked
//! RUNNING; `stop()` clears it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::bus::SharedBus;
use crate::error::{BrokerError, ConfigError, EngineError, Result};
use crate::events::{Event, EventPayload};
use crate::models::Timeframe;
use crate::service::{HealthTracker, Service, ServiceHealth};
use crate::sync::lock;

pub const SERVICE_NAME: &str = "fetch";

#[derive(Debug, Clone, PartialEq)]
pub struct FetchConfig {
    pub symbol:     String,
    pub timeframes: Vec<Timeframe>,
    /// Bars requested per call.
    pub bar_count:  usize,
}

impl FetchConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.symbol.trim().is_empty() {
            return Err(ConfigError::EmptySymbol);
        }
        if self.timeframes.is_empty() {
            return Err(ConfigError::NoTimeframes);
        }
        if self.bar_count == 0 {
            return Err(ConfigError::Invalid { field: "bar_count".into(), reason: "must be positive".into() });
        }
        Ok(())
    }
}

/// Result of one successful fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOutcome {
    pub bar_count:  usize,
    pub new_candle: bool,
}

struct Inner {
    config:      FetchConfig,
    broker:      Arc<dyn Broker>,
    bus:         SharedBus,
    health:      HealthTracker,
    last_bar:    Mutex<HashMap<Timeframe, Option<DateTime<Utc>>>>,
    fetches:     AtomicU64,
    failures:    AtomicU64,
    new_candles: AtomicU64,
}

#[derive(Clone)]
pub struct FetchStage {
    inner: Arc<Inner>,
}

impl FetchStage {
    pub fn new(config: FetchConfig, broker: Arc<dyn Broker>, bus: SharedBus, max_errors: u64) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                broker,
                bus,
                health:      HealthTracker::new(SERVICE_NAME, max_errors),
                last_bar:    Mutex::new(HashMap::new()),
                fetches:     AtomicU64::new(0),
                failures:    AtomicU64::new(0),
                new_candles: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.inner.config
    }

    /// Open time of the last bar seen for `timeframe` (`None` = unset or unknown).
    pub fn last_bar_time(&self, timeframe: &Timeframe) -> Option<DateTime<Utc>> {
        lock(&self.inner.last_bar).get(timeframe).copied().flatten()
    }

    /// Timeframes that currently have an entry in the last-known-bar map.
    pub fn tracked_timeframes(&self) -> Vec<Timeframe> {
        let mut tfs: Vec<Timeframe> = lock(&self.inner.last_bar).keys().cloned().collect();
        tfs.sort();
        tfs
    }

    /// Fetch every configured timeframe; returns how many succeeded.
    pub fn fetch_all(&self) -> Result<usize> {
        if !self.inner.health.is_running() {
            return Err(EngineError::NotRunning { service: SERVICE_NAME.into() });
        }
        let mut ok = 0;
        for tf in &self.inner.config.timeframes {
            match self.fetch_one(tf) {
                Ok(_) => ok += 1,
                Err(e) => debug!(timeframe = %tf, error = %e, "fetch: timeframe skipped this cycle"),
            }
        }
        Ok(ok)
    }

    pub fn fetch_one(&self, timeframe: &Timeframe) -> Result<FetchOutcome> {
        let inner = &self.inner;
        if !inner.health.is_running() {
            return Err(EngineError::NotRunning { service: SERVICE_NAME.into() });
        }
        let last_seen = lock(&inner.last_bar).get(timeframe).copied().ok_or_else(|| {
            EngineError::StateNotInitialised { service: SERVICE_NAME.into(), key: timeframe.to_string() }
        })?;

        let symbol = &inner.config.symbol;
        inner.fetches.fetch_add(1, Ordering::Relaxed);
        let bars = inner
            .broker
            .get_bars(symbol, timeframe, inner.config.bar_count)
            .and_then(|bars| {
                if bars.is_empty() {
                    Err(BrokerError::NoData { symbol: symbol.clone(), timeframe: timeframe.to_string() })
                } else {
                    Ok(bars)
                }
            });

        let bars = match bars {
            Ok(bars) => bars,
            Err(e) => {
                inner.failures.fetch_add(1, Ordering::Relaxed);
                inner.health.record_error(e.to_string());
                warn!(symbol = %symbol, timeframe = %timeframe, error = %e, "⚠️ fetch failed");
                inner.publish(EventPayload::DataFetchError {
                    symbol:    symbol.clone(),
                    timeframe: timeframe.clone(),
                    error:     e.to_string(),
                });
                return Err(e.into());
            }
        };

        let bar_count = bars.len();
        let Some(latest) = bars.last().cloned() else {
            return Err(EngineError::Calculation("empty bar series".into()));
        };

        inner.publish(EventPayload::DataFetched {
            symbol:    symbol.clone(),
            timeframe: timeframe.clone(),
            bar_count,
            latest:    latest.clone(),
        });

        let new_candle = last_seen != Some(latest.open_time);
        if new_candle {
            lock(&inner.last_bar).insert(timeframe.clone(), Some(latest.open_time));
            inner.new_candles.fetch_add(1, Ordering::Relaxed);
            debug!(symbol = %symbol, timeframe = %timeframe, open_time = %latest.open_time, "🕯️ new candle");
            inner.publish(EventPayload::NewCandle {
                symbol:    symbol.clone(),
                timeframe: timeframe.clone(),
                bar:       latest,
            });
        }

        Ok(FetchOutcome { bar_count, new_candle })
    }

    /// Periodic fetch until `shutdown` flips.  Broker calls run on the
    /// blocking pool.
    pub async fn run_loop(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(symbol = %self.inner.config.symbol, ?interval, "⏱️ fetch loop started");
        loop {
            if self.inner.health.is_running() {
                let stage = self.clone();
                match tokio::task::spawn_blocking(move || stage.fetch_all()).await {
                    Ok(Ok(n)) => debug!(succeeded = n, "fetch cycle complete"),
                    Ok(Err(e)) => debug!(error = %e, "fetch cycle skipped"),
                    Err(e) => warn!(error = %e, "fetch cycle task failed"),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("fetch loop stopping");
                        return;
                    }
                }
            }
        }
    }
}

impl Inner {
    fn publish(&self, payload: EventPayload) {
        self.health.record_published();
        self.bus.publish(Event::new(payload));
    }
}

impl Service for FetchStage {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    fn start(&self) -> Result<()> {
        {
            let mut map = lock(&self.inner.last_bar);
            map.clear();
            for tf in &self.inner.config.timeframes {
                map.insert(tf.clone(), None);
            }
        }
        self.inner.health.mark_running();
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.inner.health.mark_stopped();
        lock(&self.inner.last_bar).clear();
        Ok(())
    }

    fn health_check(&self) -> ServiceHealth {
        self.inner.health.snapshot()
    }

    fn metrics(&self) -> serde_json::Value {
        serde_json::json!({
            "symbol":      self.inner.config.symbol,
            "timeframes":  self.inner.config.timeframes,
            "fetches":     self.inner.fetches.load(Ordering::Relaxed),
            "failures":    self.inner.failures.load(Ordering::Relaxed),
            "new_candles": self.inner.new_candles.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::bus::EventBus;
    use crate::events::EventKind;
    use crate::models::Bar;
    use chrono::TimeZone;

    fn bar(tf: &str, minute: u32, close: f64) -> Bar {
        Bar {
            symbol:    "XAUUSD".into(),
            timeframe: Timeframe::from(tf),
            open_time: Utc.with_ymd_and_hms(2024, 3, 1, 10, minute, 0).unwrap(),
            open:      close,
            high:      close + 1.0,
            low:       close - 1.0,
            close,
            volume:    10.0,
        }
    }

    fn stage(broker: &Arc<PaperBroker>) -> (SharedBus, FetchStage) {
        let bus: SharedBus = Arc::new(EventBus::default());
        let cfg = FetchConfig {
            symbol:     "XAUUSD".into(),
            timeframes: vec![Timeframe::from("1"), Timeframe::from("5")],
            bar_count:  100,
        };
        let broker: Arc<dyn Broker> = broker.clone();
        let s = FetchStage::new(cfg, broker, Arc::clone(&bus), 10).unwrap();
        (bus, s)
    }

    #[test]
    fn test_construction_requires_symbol_and_timeframes() {
        let bus: SharedBus = Arc::new(EventBus::default());
        let broker: Arc<dyn Broker> = Arc::new(PaperBroker::new(1000.0));
        let empty_symbol = FetchConfig { symbol: " ".into(), timeframes: vec!["1".into()], bar_count: 10 };
        assert!(matches!(
            FetchStage::new(empty_symbol, Arc::clone(&broker), Arc::clone(&bus), 10),
            Err(EngineError::Config(ConfigError::EmptySymbol))
        ));
        let no_tf = FetchConfig { symbol: "XAUUSD".into(), timeframes: vec![], bar_count: 10 };
        assert!(matches!(
            FetchStage::new(no_tf, broker, bus, 10),
            Err(EngineError::Config(ConfigError::NoTimeframes))
        ));
    }

    #[test]
    fn test_start_covers_every_timeframe_and_stop_clears() {
        let (_, s) = stage(&Arc::new(PaperBroker::new(1000.0)));
        assert!(matches!(s.fetch_all(), Err(EngineError::NotRunning { .. })));

        s.start().unwrap();
        assert_eq!(s.tracked_timeframes(), vec![Timeframe::from("1"), Timeframe::from("5")]);

        s.stop().unwrap();
        assert!(s.tracked_timeframes().is_empty());
        s.start().unwrap();
        assert_eq!(s.tracked_timeframes().len(), 2);
    }

    #[test]
    fn test_new_candle_only_when_open_time_changes() {
        let broker = Arc::new(PaperBroker::new(1000.0));
        let (bus, s) = stage(&broker);
        s.start().unwrap();
        let tf = Timeframe::from("1");

        broker.push_bar(bar("1", 0, 2000.0));
        let out = s.fetch_one(&tf).unwrap();
        assert!(out.new_candle);
        assert_eq!(bus.history(Some(EventKind::DataFetched)).len(), 1);
        assert_eq!(bus.history(Some(EventKind::NewCandle)).len(), 1);
        assert_eq!(s.last_bar_time(&tf), Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()));

        let out = s.fetch_one(&tf).unwrap();
        assert!(!out.new_candle);
        assert_eq!(bus.history(Some(EventKind::DataFetched)).len(), 2);
        assert_eq!(bus.history(Some(EventKind::NewCandle)).len(), 1);

        broker.push_bar(bar("1", 1, 2001.0));
        assert!(s.fetch_one(&tf).unwrap().new_candle);
        assert_eq!(bus.history(Some(EventKind::NewCandle)).len(), 2);
    }

    #[test]
    fn test_failures_are_published_and_do_not_abort_other_timeframes() {
        let broker = Arc::new(PaperBroker::new(1000.0));
        let (bus, s) = stage(&broker);
        s.start().unwrap();

        // "1" has data, "5" is empty
        broker.push_bar(bar("1", 0, 2000.0));
        assert_eq!(s.fetch_all().unwrap(), 1);
        assert_eq!(bus.history(Some(EventKind::DataFetchError)).len(), 1);

        broker.fail_bars(Some(BrokerError::Unreachable("down".into())));
        assert_eq!(s.fetch_all().unwrap(), 0);
        assert_eq!(bus.history(Some(EventKind::DataFetchError)).len(), 3);
        assert_eq!(s.health_check().errors_since_start, 3);
    }

    #[test]
    fn test_restart_forgets_last_bar() {
        let broker = Arc::new(PaperBroker::new(1000.0));
        let (bus, s) = stage(&broker);
        s.start().unwrap();
        broker.push_bar(bar("1", 0, 2000.0));
        s.fetch_one(&Timeframe::from("1")).unwrap();

        s.stop().unwrap();
        s.start().unwrap();
        assert!(s.fetch_one(&Timeframe::from("1")).unwrap().new_candle);
        assert_eq!(bus.history(Some(EventKind::NewCandle)).len(), 2);
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_signal() {
        let broker = Arc::new(PaperBroker::new(1000.0));
        let (bus, s) = stage(&broker);
        s.start().unwrap();
        broker.push_bar(bar("1", 0, 2000.0));

        let (tx, rx) = watch::channel(false);
        let looper = s.clone();
        let handle = tokio::spawn(async move { looper.run_loop(Duration::from_secs(3600), rx).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(bus.history(Some(EventKind::NewCandle)).len(), 1);
    }
}

//! # stages::strategy — Strategy Evaluation Stage
//!
//! Subscribes to `IndicatorsCalculated`.  Every configured strategy for the
//! event's symbol that references the event's timeframe is evaluated with
//! [`conditions::evaluate_strategy`](crate::conditions::evaluate_strategy).
//!
//! | Group fires   | Automation ON  | Automation OFF                      |
//! |---------------|----------------|-------------------------------------|
//! | entry long/short | `EntrySignal` | suppressed, `warn!`, counted      |
//! | exit long/short  | `ExitSignal`  | `ExitSignal` (never suppressed)   |
//!
//! Evaluation runs regardless of the gate, so [`StrategyStage::query_conditions`]
//! always reports what the live path last computed.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::automation::AutomationGate;
use crate::bus::request::respond;
use crate::bus::SharedBus;
use crate::conditions::{evaluate_strategy, BlockingCondition, StrategyEvaluation};
use crate::error::{EngineError, Result};
use crate::events::{Command, CommandResponse, Event, EventKind, EventPayload};
use crate::models::{GroupKind, MarketSnapshot, StrategyDefinition, Timeframe};
use crate::service::{HealthTracker, Service, ServiceHealth, Subscriptions};
use crate::sync::lock;

pub const SERVICE_NAME: &str = "strategy";

/// Answer to "why did / didn't it fire".
#[derive(Debug, Clone, Serialize)]
pub struct ConditionReport {
    pub strategy:            String,
    pub symbol:              String,
    pub automation_enabled:  bool,
    /// `None` until the strategy has been evaluated once.
    pub evaluation:          Option<StrategyEvaluation>,
    pub blocking:            Vec<BlockingCondition>,
    pub would_trigger_entry: bool,
    pub would_trigger_exit:  bool,
}

struct Configured {
    definition: StrategyDefinition,
    timeframes: BTreeSet<Timeframe>,
}

struct Inner {
    strategies:  Vec<Configured>,
    bus:         SharedBus,
    health:      HealthTracker,
    subs:        Subscriptions,
    gate:        AutomationGate,
    /// Latest evaluation per (strategy, symbol).
    evaluations: Mutex<HashMap<(String, String), StrategyEvaluation>>,
    evaluated:   AtomicU64,
    entries:     AtomicU64,
    exits:       AtomicU64,
    suppressed:  AtomicU64,
    failures:    AtomicU64,
}

#[derive(Clone)]
pub struct StrategyStage {
    inner: Arc<Inner>,
}

impl StrategyStage {
    /// `automation` seeds the local gate; a gate bound to the manager is
    /// re-read on every start.
    pub fn new(
        strategies: Vec<StrategyDefinition>,
        bus: SharedBus,
        automation: impl Into<AutomationGate>,
        max_errors: u64,
    ) -> Result<Self> {
        let mut names = BTreeSet::new();
        let mut configured = Vec::with_capacity(strategies.len());
        for definition in strategies {
            definition.validate()?;
            if !names.insert((definition.name.clone(), definition.symbol.clone())) {
                return Err(crate::error::ConfigError::Strategy {
                    strategy: definition.name.clone(),
                    reason:   format!("defined twice for {}", definition.symbol),
                }
                .into());
            }
            let timeframes = definition
                .groups()
                .flat_map(|(_, g)| g.conditions.iter().map(|c| c.timeframe.clone()))
                .collect();
            configured.push(Configured { definition, timeframes });
        }

        Ok(Self {
            inner: Arc::new(Inner {
                strategies:  configured,
                bus,
                health:      HealthTracker::new(SERVICE_NAME, max_errors),
                subs:        Subscriptions::default(),
                gate:        automation.into(),
                evaluations: Mutex::new(HashMap::new()),
                evaluated:   AtomicU64::new(0),
                entries:     AtomicU64::new(0),
                exits:       AtomicU64::new(0),
                suppressed:  AtomicU64::new(0),
                failures:    AtomicU64::new(0),
            }),
        })
    }

    pub fn automation_enabled(&self) -> bool {
        self.inner.gate.is_enabled()
    }

    pub fn strategies(&self) -> Vec<&StrategyDefinition> {
        self.inner.strategies.iter().map(|c| &c.definition).collect()
    }

    /// Structured per-condition results of the last live evaluation.
    pub fn query_conditions(&self, strategy: &str, symbol: &str) -> Result<ConditionReport> {
        self.inner.query_conditions(strategy, symbol)
    }
}

impl Inner {
    fn query_conditions(&self, strategy: &str, symbol: &str) -> Result<ConditionReport> {
        if !self.strategies.iter().any(|c| c.definition.name == strategy && c.definition.symbol == symbol) {
            return Err(EngineError::NotFound(format!("strategy '{strategy}' for {symbol}")));
        }
        let evaluation = lock(&self.evaluations).get(&(strategy.to_string(), symbol.to_string())).cloned();

        Ok(ConditionReport {
            strategy:            strategy.to_string(),
            symbol:              symbol.to_string(),
            automation_enabled:  self.gate.is_enabled(),
            blocking:            evaluation.as_ref().map(|e| e.blocking_conditions()).unwrap_or_default(),
            would_trigger_entry: evaluation.as_ref().is_some_and(|e| e.would_trigger_entry()),
            would_trigger_exit:  evaluation.as_ref().is_some_and(|e| e.would_trigger_exit()),
            evaluation,
        })
    }

    fn on_indicators(&self, event: &Event) -> anyhow::Result<()> {
        let EventPayload::IndicatorsCalculated { symbol, timeframe, row, snapshot } = &event.payload else {
            return Ok(());
        };
        self.health.record_received();

        for strategy in &self.strategies {
            let def = &strategy.definition;
            if def.symbol != *symbol {
                continue;
            }
            if !strategy.timeframes.is_empty() && !strategy.timeframes.contains(timeframe) {
                continue;
            }
            self.evaluate(def, snapshot, row.bar.close);
        }
        Ok(())
    }

    /// Evaluate one strategy and publish whatever fired.
    fn evaluate(&self, def: &StrategyDefinition, snapshot: &Arc<MarketSnapshot>, price: f64) {
        let evaluation = match evaluate_strategy(def, snapshot) {
            Ok(e) => e,
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.health.record_error(e.to_string());
                warn!(strategy = %def.name, symbol = %def.symbol, error = %e, "⚠️ strategy evaluation failed");
                self.publish(EventPayload::StrategyEvaluationError {
                    strategy: def.name.clone(),
                    symbol:   def.symbol.clone(),
                    error:    e.to_string(),
                });
                return;
            }
        };
        self.evaluated.fetch_add(1, Ordering::Relaxed);

        let fired: Vec<GroupKind> = GroupKind::ALL.into_iter().filter(|k| evaluation.triggered(*k)).collect();
        lock(&self.evaluations).insert((def.name.clone(), def.symbol.clone()), evaluation);

        for kind in fired {
            let direction = kind.direction();
            if kind.is_entry() {
                if !self.gate.is_enabled() {
                    self.suppressed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        strategy  = %def.name,
                        symbol    = %def.symbol,
                        %direction,
                        "🚫 entry signal suppressed — automation disabled"
                    );
                    continue;
                }
                self.entries.fetch_add(1, Ordering::Relaxed);
                info!(strategy = %def.name, symbol = %def.symbol, %direction, price, "📈 entry signal");
                self.publish(EventPayload::EntrySignal {
                    strategy: def.name.clone(),
                    symbol:   def.symbol.clone(),
                    direction,
                    price,
                    market:   Some(Arc::clone(snapshot)),
                });
            } else {
                self.exits.fetch_add(1, Ordering::Relaxed);
                info!(strategy = %def.name, symbol = %def.symbol, %direction, "📉 exit signal");
                self.publish(EventPayload::ExitSignal {
                    strategy:  def.name.clone(),
                    symbol:    def.symbol.clone(),
                    direction,
                    reason:    format!("{kind:?} conditions met"),
                });
            }
        }
    }

    fn on_command(&self, event: &Event) -> anyhow::Result<()> {
        let EventPayload::Command(Command::QueryConditions { strategy, symbol }) = &event.payload else {
            return Ok(());
        };
        self.health.record_received();
        let response = match self.query_conditions(strategy, symbol) {
            Ok(report) => CommandResponse::ok(serde_json::to_value(&report)?),
            Err(e @ EngineError::NotFound(_)) => CommandResponse::not_found(e.to_string()),
            Err(e) => CommandResponse::failed(e.to_string()),
        };
        respond(&self.bus, event, response);
        Ok(())
    }

    fn publish(&self, payload: EventPayload) {
        self.health.record_published();
        self.bus.publish(Event::new(payload));
    }
}

impl Service for StrategyStage {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    fn start(&self) -> Result<()> {
        if self.inner.health.is_running() {
            return Ok(());
        }
        let inner = &self.inner;
        inner.gate.resync();

        let i = Arc::clone(inner);
        inner.subs.push(inner.bus.subscribe(
            EventKind::AutomationStateChanged,
            "strategy::on_automation",
            move |e| {
                i.gate.apply(e);
                debug!(enabled = i.gate.is_enabled(), "strategy: automation gate updated");
                Ok(())
            },
        ));
        let i = Arc::clone(inner);
        inner.subs.push(inner.bus.subscribe(EventKind::IndicatorsCalculated, "strategy::on_indicators", move |e| {
            i.on_indicators(e)
        }));
        let i = Arc::clone(inner);
        inner
            .subs
            .push(inner.bus.subscribe(EventKind::Command, "strategy::on_command", move |e| i.on_command(e)));

        inner.health.mark_running();
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.inner.subs.clear(&self.inner.bus);
        self.inner.health.mark_stopped();
        lock(&self.inner.evaluations).clear();
        Ok(())
    }

    fn health_check(&self) -> ServiceHealth {
        self.inner.health.snapshot()
    }

    fn metrics(&self) -> serde_json::Value {
        serde_json::json!({
            "strategies":         self.inner.strategies.len(),
            "automation_enabled": self.inner.gate.is_enabled(),
            "evaluated":          self.inner.evaluated.load(Ordering::Relaxed),
            "entry_signals":      self.inner.entries.load(Ordering::Relaxed),
            "exit_signals":       self.inner.exits.load(Ordering::Relaxed),
            "suppressed_entries": self.inner.suppressed.load(Ordering::Relaxed),
            "failures":           self.inner.failures.load(Ordering::Relaxed),
        })
    }
}

//! # stages::execution — Execution Stage
//!
//! Turns signals into broker orders and manages what it opened.
//!
//! ```text
//! EntrySignal
//!   ├─ automation OFF            → OrderRejected("automation disabled"), no broker call
//!   ├─ quote                     → ask for longs, bid for shorts (signal close if none)
//!   ├─ risk config (symbol/strategy) → OrderPlan (volume, stop, one leg per target)
//!   ├─ TradingGuard::check       → every leg counted; Blocked: RiskLimitBreached + TradingBlocked
//!   ├─ TradingAuthorized
//!   └─ place one order per leg   → OrderPlaced / OrderRejected
//!
//! ExitSignal                     → close every open (symbol, direction) position,
//!                                  PositionClosed (runs with automation OFF too)
//!
//! IndicatorsCalculated           → management scan for the symbol
//!   ├─ automation OFF            → skipped, info! — stops/targets untouched
//!   ├─ child gone at broker      → mark closed; breakeven once if flagged (retried until it sticks)
//!   └─ trailing                  → retighten, never loosen
//! ```
//!
//! Entries are serialised: the exposure read, the guard check and the order
//! legs of one entry never interleave with another's.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::automation::AutomationGate;
use crate::broker::{Broker, OrderRequest};
use crate::bus::SharedBus;
use crate::error::{EngineError, Result};
use crate::events::{Event, EventKind, EventPayload};
use crate::models::{
    ChildOrder, Direction, EnrichedRow, MarketSnapshot, PositionTag, RiskConfig, StopLossRule, Timeframe,
    TradeGroup,
};
use crate::risk::{plan_order, Exposure, GuardDecision, GuardStatus, LimitBreach, MarketContext, TradingGuard, TradingLimits};
use crate::service::{HealthTracker, Service, ServiceHealth, Subscriptions};
use crate::sync::lock;

pub const SERVICE_NAME: &str = "execution";

/// Key of a risk config in the trading plan: `"XAUUSD/rsi_revert"`.
pub fn risk_key(symbol: &str, strategy: &str) -> String {
    format!("{symbol}/{strategy}")
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionConfig {
    /// Keyed by [`risk_key`].
    pub risk:   HashMap<String, RiskConfig>,
    pub limits: TradingLimits,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EntryOutcome {
    Placed { group_id: Uuid, tickets: Vec<u64>, volume: f64 },
    Rejected { reason: String },
    Blocked { breach: LimitBreach },
}

struct Entry<'a> {
    strategy:  &'a str,
    symbol:    &'a str,
    direction: Direction,
    price:     f64,
    market:    Option<&'a MarketSnapshot>,
    tag:       PositionTag,
}

struct Inner {
    config:      ExecutionConfig,
    guard:       TradingGuard,
    broker:      Arc<dyn Broker>,
    bus:         SharedBus,
    health:      HealthTracker,
    subs:        Subscriptions,
    gate:        AutomationGate,
    groups:      Mutex<HashMap<Uuid, TradeGroup>>,
    entry_lock:  Mutex<()>,
    /// Latest enriched row per (symbol, timeframe).
    market:      Mutex<HashMap<(String, Timeframe), EnrichedRow>>,
    placed:      AtomicU64,
    rejected:    AtomicU64,
    blocked:     AtomicU64,
    closed:      AtomicU64,
    modified:    AtomicU64,
    scans:       AtomicU64,
    skipped:     AtomicU64,
}

#[derive(Clone)]
pub struct ExecutionStage {
    inner: Arc<Inner>,
}

impl ExecutionStage {
    pub fn new(
        config: ExecutionConfig,
        broker: Arc<dyn Broker>,
        bus: SharedBus,
        automation: impl Into<AutomationGate>,
        max_errors: u64,
    ) -> Result<Self> {
        for (key, cfg) in &config.risk {
            cfg.validate(key)?;
        }
        Ok(Self {
            inner: Arc::new(Inner {
                guard:    TradingGuard::new(config.limits.clone()),
                config,
                broker,
                bus,
                health:   HealthTracker::new(SERVICE_NAME, max_errors),
                subs:     Subscriptions::default(),
                gate:     automation.into(),
                groups:   Mutex::new(HashMap::new()),
                entry_lock: Mutex::new(()),
                market:   Mutex::new(HashMap::new()),
                placed:   AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                blocked:  AtomicU64::new(0),
                closed:   AtomicU64::new(0),
                modified: AtomicU64::new(0),
                scans:    AtomicU64::new(0),
                skipped:  AtomicU64::new(0),
            }),
        })
    }

    pub fn automation_enabled(&self) -> bool {
        self.inner.gate.is_enabled()
    }

    /// Operator-initiated entry.  Same sizing, authorization and lifecycle as
    /// the automated path, but not subject to the automation gate.
    ///
    /// Stops and targets are measured from the broker quote; `price` (default:
    /// the latest cached close for `symbol`) is used only without one.
    pub fn submit_manual(
        &self,
        strategy: &str,
        symbol: &str,
        direction: Direction,
        price: Option<f64>,
    ) -> Result<EntryOutcome> {
        if !self.inner.health.is_running() {
            return Err(EngineError::NotRunning { service: SERVICE_NAME.into() });
        }
        let price = price
            .or_else(|| self.inner.last_close(symbol))
            .or_else(|| self.inner.broker.quote(symbol).ok().map(|q| q.entry_price(direction)))
            .ok_or_else(|| EngineError::NotFound(format!("no reference price for {symbol}")))?;

        info!(strategy, symbol, %direction, price, "🖐️ manual order requested");
        Ok(self.inner.enter(Entry { strategy, symbol, direction, price, market: None, tag: PositionTag::Manual }))
    }

    /// Trade groups still tracked (at least one child open).
    pub fn groups(&self) -> Vec<TradeGroup> {
        let mut groups: Vec<TradeGroup> = lock(&self.inner.groups).values().cloned().collect();
        groups.sort_by_key(|g| g.opened_at);
        groups
    }

    pub fn guard_status(&self) -> GuardStatus {
        self.inner.guard.status()
    }
}

impl Inner {
    // ─── Entries ──────────────────────────────────────────────────────────────

    fn on_entry(&self, event: &Event) -> anyhow::Result<()> {
        let EventPayload::EntrySignal { strategy, symbol, direction, price, market } = &event.payload else {
            return Ok(());
        };
        self.health.record_received();

        let entry = Entry {
            strategy,
            symbol,
            direction: *direction,
            price:     *price,
            market:    market.as_deref(),
            tag:       PositionTag::Automated,
        };
        if !self.gate.is_enabled() {
            self.reject(&entry, "automation disabled".into());
            return Ok(());
        }
        self.enter(entry);
        Ok(())
    }

    fn enter(&self, e: Entry<'_>) -> EntryOutcome {
        let _serial = lock(&self.entry_lock);
        let key = risk_key(e.symbol, e.strategy);
        let Some(cfg) = self.config.risk.get(&key) else {
            return self.reject(&e, format!("no risk config for {key}"));
        };

        let equity = match self.broker.account_summary() {
            Ok(account) => account.equity,
            Err(err) => return self.reject(&e, format!("account query failed: {err}")),
        };
        let entry_price = self.entry_price(&e);
        let ctx = MarketContext { entry_price, equity, atr: self.atr_for(cfg, e.symbol, e.market) };
        let plan = match plan_order(cfg, e.direction, ctx) {
            Ok(plan) => plan,
            Err(err) => return self.reject(&e, format!("sizing failed: {err}")),
        };

        let exposure = match self.broker.open_positions(None) {
            Ok(open) => Exposure {
                open_positions:   open.len() as u32,
                symbol_positions: open.iter().filter(|p| p.symbol == e.symbol).count() as u32,
                symbol_volume:    open.iter().filter(|p| p.symbol == e.symbol).map(|p| p.volume).sum(),
            },
            Err(err) => return self.reject(&e, format!("position query failed: {err}")),
        };

        let legs = plan.legs.len() as u32;
        if let GuardDecision::Blocked(breach) = self.guard.check(exposure, plan.volume, legs) {
            self.blocked.fetch_add(1, Ordering::Relaxed);
            self.publish(EventPayload::RiskLimitBreached {
                limit:     breach.limit.to_string(),
                current:   breach.current,
                threshold: breach.threshold,
                symbol:    e.symbol.to_string(),
            });
            self.publish(EventPayload::TradingBlocked {
                strategy:  e.strategy.to_string(),
                symbol:    e.symbol.to_string(),
                limit:     breach.limit.to_string(),
                current:   breach.current,
                threshold: breach.threshold,
            });
            return EntryOutcome::Blocked { breach };
        }
        self.publish(EventPayload::TradingAuthorized {
            strategy: e.strategy.to_string(),
            symbol:   e.symbol.to_string(),
        });

        let group_id = Uuid::new_v4();
        let mut children = Vec::with_capacity(plan.legs.len());
        let mut fill_price = None;
        let mut failure = None;

        for (i, leg) in plan.legs.iter().enumerate() {
            let order = OrderRequest {
                symbol:      e.symbol.to_string(),
                direction:   e.direction,
                volume:      leg.volume,
                price:       plan.entry_price,
                stop_loss:   plan.stop_loss,
                take_profit: leg.take_profit,
                comment:     format!("{}#{}", e.strategy, i + 1),
                tag:         e.tag,
            };
            match self.broker.place_order(&order) {
                Ok(ticket) => {
                    fill_price.get_or_insert(ticket.fill_price);
                    self.placed.fetch_add(1, Ordering::Relaxed);
                    info!(
                        ticket    = ticket.ticket,
                        strategy  = e.strategy,
                        symbol    = e.symbol,
                        direction = %e.direction,
                        volume    = leg.volume,
                        fill      = ticket.fill_price,
                        sl        = plan.stop_loss,
                        tp        = ?leg.take_profit,
                        "🚀 order placed"
                    );
                    children.push(ChildOrder {
                        ticket:                 ticket.ticket,
                        volume:                 leg.volume,
                        take_profit:            leg.take_profit,
                        move_stop_to_breakeven: leg.move_stop_to_breakeven,
                        closed:                 false,
                    });
                    self.publish(EventPayload::OrderPlaced {
                        ticket:      ticket.ticket,
                        strategy:    e.strategy.to_string(),
                        symbol:      e.symbol.to_string(),
                        direction:   e.direction,
                        volume:      leg.volume,
                        entry_price: ticket.fill_price,
                        stop_loss:   plan.stop_loss,
                        take_profit: leg.take_profit,
                        tag:         e.tag,
                        group_id,
                    });
                }
                Err(err) => {
                    self.guard.record_failure();
                    failure = Some(format!("leg {} of {} failed: {err}", i + 1, plan.legs.len()));
                    break;
                }
            }
        }

        if children.is_empty() {
            return self.reject(&e, failure.unwrap_or_else(|| "no order legs".into()));
        }
        if let Some(reason) = failure {
            // placed legs carry their own stop and stay tracked
            self.reject(&e, reason);
        }
        self.guard.record_trade();

        let tickets: Vec<u64> = children.iter().map(|c| c.ticket).collect();
        let volume = children.iter().map(|c| c.volume).sum();
        lock(&self.groups).insert(
            group_id,
            TradeGroup {
                group_id,
                strategy:          e.strategy.to_string(),
                symbol:            e.symbol.to_string(),
                direction:         e.direction,
                entry_price:       fill_price.unwrap_or(plan.entry_price),
                stop_loss:         plan.stop_loss,
                tag:               e.tag,
                children,
                trailing:          plan.trailing,
                breakeven_applied: false,
                opened_at:         Utc::now(),
            },
        );
        EntryOutcome::Placed { group_id, tickets, volume }
    }

    fn reject(&self, e: &Entry<'_>, reason: String) -> EntryOutcome {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(strategy = e.strategy, symbol = e.symbol, direction = %e.direction, reason = %reason, "❌ order rejected");
        self.publish(EventPayload::OrderRejected {
            strategy:  e.strategy.to_string(),
            symbol:    e.symbol.to_string(),
            direction: e.direction,
            reason:    reason.clone(),
        });
        EntryOutcome::Rejected { reason }
    }

    /// Ask for longs, bid for shorts; the signal's price without a quote.
    fn entry_price(&self, e: &Entry<'_>) -> f64 {
        match self.broker.quote(e.symbol) {
            Ok(quote) => quote.entry_price(e.direction),
            Err(err) => {
                debug!(symbol = e.symbol, error = %err, fallback = e.price, "no quote, using signal price");
                e.price
            }
        }
    }

    /// ATR for an ATR stop: the signal's own rows first, then the cache.
    fn atr_for(&self, cfg: &RiskConfig, symbol: &str, market: Option<&MarketSnapshot>) -> Option<f64> {
        let StopLossRule::Atr { period, timeframe, .. } = &cfg.stop_loss else {
            return None;
        };
        let name = format!("atr_{period}");
        let tf = Timeframe::from(timeframe.as_str());
        market
            .and_then(|m| m.latest(&tf))
            .and_then(|row| row.numeric(&name))
            .or_else(|| lock(&self.market).get(&(symbol.to_string(), tf.clone())).and_then(|row| row.numeric(&name)))
    }

    fn last_close(&self, symbol: &str) -> Option<f64> {
        lock(&self.market)
            .iter()
            .filter(|((s, _), _)| s == symbol)
            .max_by_key(|(_, row)| row.bar.open_time)
            .map(|(_, row)| row.bar.close)
    }

    // ─── Exits ────────────────────────────────────────────────────────────────

    fn on_exit(&self, event: &Event) -> anyhow::Result<()> {
        let EventPayload::ExitSignal { strategy, symbol, direction, reason } = &event.payload else {
            return Ok(());
        };
        self.health.record_received();

        let positions = match self.broker.open_positions(Some(symbol)) {
            Ok(p) => p,
            Err(e) => {
                self.health.record_error(e.to_string());
                error!(strategy = %strategy, symbol = %symbol, error = %e, "exit: position query failed");
                return Ok(());
            }
        };

        let matching: Vec<_> = positions.into_iter().filter(|p| p.direction == *direction).collect();
        if matching.is_empty() {
            debug!(strategy = %strategy, symbol = %symbol, %direction, "exit: nothing open");
            return Ok(());
        }

        for position in matching {
            match self.broker.close_position(position.ticket, None) {
                Ok(result) => {
                    self.closed.fetch_add(1, Ordering::Relaxed);
                    self.guard.record_realised(result.profit);
                    self.mark_closed(result.ticket);
                    info!(
                        ticket = result.ticket,
                        symbol = %symbol,
                        profit = result.profit,
                        price  = result.close_price,
                        "🏁 position closed"
                    );
                    self.publish(EventPayload::PositionClosed {
                        ticket:      result.ticket,
                        symbol:      symbol.clone(),
                        direction:   position.direction,
                        volume:      result.volume,
                        close_price: result.close_price,
                        profit:      result.profit,
                        reason:      reason.clone(),
                    });
                }
                Err(e) => {
                    self.health.record_error(e.to_string());
                    error!(ticket = position.ticket, error = %e, "❌ exit: close failed");
                }
            }
        }
        Ok(())
    }

    fn mark_closed(&self, ticket: u64) {
        let mut groups = lock(&self.groups);
        for child in groups.values_mut().flat_map(|g| g.children.iter_mut()) {
            if child.ticket == ticket {
                child.closed = true;
            }
        }
        groups.retain(|_, g| !g.is_closed());
    }

    // ─── Position management ──────────────────────────────────────────────────

    fn on_indicators(&self, event: &Event) -> anyhow::Result<()> {
        let EventPayload::IndicatorsCalculated { symbol, timeframe, row, .. } = &event.payload else {
            return Ok(());
        };
        lock(&self.market).insert((symbol.clone(), timeframe.clone()), row.clone());

        if !self.gate.is_enabled() {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            info!(symbol = %symbol, "position management skipped — automation disabled");
            return Ok(());
        }
        self.manage(symbol, row.bar.close);
        Ok(())
    }

    fn manage(&self, symbol: &str, price: f64) {
        if !lock(&self.groups).values().any(|g| g.symbol == symbol) {
            return;
        }
        self.scans.fetch_add(1, Ordering::Relaxed);

        let open: HashSet<u64> = match self.broker.open_positions(Some(symbol)) {
            Ok(positions) => positions.iter().map(|p| p.ticket).collect(),
            Err(e) => {
                self.health.record_error(e.to_string());
                warn!(symbol, error = %e, "management scan: position query failed");
                return;
            }
        };

        let mut events = Vec::new();
        {
            let mut groups = lock(&self.groups);
            for g in groups.values_mut().filter(|g| g.symbol == symbol) {
                for child in g.children.iter_mut().filter(|c| !c.closed) {
                    if !open.contains(&child.ticket) {
                        child.closed = true;
                        info!(ticket = child.ticket, group = %g.group_id, "position closed at broker");
                    }
                }
                if g.is_closed() {
                    continue;
                }

                let breakeven_due = g.children.iter().any(|c| c.closed && c.move_stop_to_breakeven);
                if breakeven_due && !g.breakeven_applied {
                    let entry = g.entry_price;
                    g.breakeven_applied = !g.is_tighter(entry) || self.move_stop(g, entry, "breakeven", &mut events);
                }

                if let Some(trail) = g.trailing {
                    let sign = g.direction.sign();
                    if (price - g.entry_price) * sign >= trail.activation {
                        let candidate = price - sign * trail.distance;
                        if g.is_tighter(candidate) {
                            self.move_stop(g, candidate, "trailing", &mut events);
                        }
                    }
                }
            }
            groups.retain(|_, g| !g.is_closed());
        }

        for payload in events {
            self.publish(payload);
        }
    }

    /// Move the stop of every open child of `g`. `true` once the broker took it.
    fn move_stop(&self, g: &mut TradeGroup, new_stop: f64, reason: &str, events: &mut Vec<EventPayload>) -> bool {
        let previous = g.stop_loss;
        let mut moved = false;
        for child in g.children.iter().filter(|c| !c.closed) {
            match self.broker.modify_position(child.ticket, Some(new_stop), None) {
                Ok(()) => {
                    moved = true;
                    self.modified.fetch_add(1, Ordering::Relaxed);
                    events.push(EventPayload::PositionModified {
                        ticket:        child.ticket,
                        symbol:        g.symbol.clone(),
                        previous_stop: previous,
                        new_stop,
                        reason:        reason.to_string(),
                    });
                }
                Err(e) => {
                    self.health.record_error(e.to_string());
                    warn!(ticket = child.ticket, error = %e, "stop modification failed");
                }
            }
        }
        if moved {
            info!(group = %g.group_id, previous, new_stop, reason, "🛡️ stop moved");
            g.stop_loss = new_stop;
        }
        moved
    }

    fn publish(&self, payload: EventPayload) {
        self.health.record_published();
        self.bus.publish(Event::new(payload));
    }
}

impl Service for ExecutionStage {
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
            "execution::on_automation",
            move |e| {
                i.gate.apply(e);
                info!(enabled = i.gate.is_enabled(), "execution: automation gate updated");
                Ok(())
            },
        ));
        let i = Arc::clone(inner);
        inner.subs.push(inner.bus.subscribe(EventKind::EntrySignal, "execution::on_entry", move |e| i.on_entry(e)));
        let i = Arc::clone(inner);
        inner.subs.push(inner.bus.subscribe(EventKind::ExitSignal, "execution::on_exit", move |e| i.on_exit(e)));
        let i = Arc::clone(inner);
        inner.subs.push(inner.bus.subscribe(EventKind::IndicatorsCalculated, "execution::on_indicators", move |e| {
            i.on_indicators(e)
        }));

        inner.health.mark_running();
        Ok(())
    }

    /// Tracked groups survive a restart: the positions are still open at the broker.
    fn stop(&self) -> Result<()> {
        self.inner.subs.clear(&self.inner.bus);
        self.inner.health.mark_stopped();
        lock(&self.inner.market).clear();
        Ok(())
    }

    fn health_check(&self) -> ServiceHealth {
        self.inner.health.snapshot()
    }

    fn metrics(&self) -> serde_json::Value {
        let inner = &self.inner;
        serde_json::json!({
            "automation_enabled": inner.gate.is_enabled(),
            "orders_placed":      inner.placed.load(Ordering::Relaxed),
            "orders_rejected":    inner.rejected.load(Ordering::Relaxed),
            "trades_blocked":     inner.blocked.load(Ordering::Relaxed),
            "positions_closed":   inner.closed.load(Ordering::Relaxed),
            "stops_modified":     inner.modified.load(Ordering::Relaxed),
            "management_scans":   inner.scans.load(Ordering::Relaxed),
            "management_skipped": inner.skipped.load(Ordering::Relaxed),
            "open_groups":        lock(&inner.groups).len(),
            "guard":              inner.guard.status(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::bus::EventBus;
    use crate::indicators::regime::Regime;
    use crate::models::{Bar, PartialTarget, PositionSizing, SymbolSpec, TakeProfitRule, TargetDistance};
    use std::collections::BTreeMap;

    const SYMBOL: &str = "XAUUSD";

    fn risk(stop_loss: StopLossRule, take_profit: TakeProfitRule) -> RiskConfig {
        RiskConfig {
            sizing: PositionSizing::Fixed { lots: 1.0 },
            stop_loss,
            take_profit,
            symbol_spec: SymbolSpec::default(),
        }
    }

    fn simple() -> RiskConfig {
        risk(StopLossRule::Monetary { amount: 10.0 }, TakeProfitRule::RiskReward { ratio: 2.0 })
    }

    fn harness(cfg: RiskConfig, limits: TradingLimits) -> (SharedBus, Arc<PaperBroker>, ExecutionStage) {
        harness_on(PaperBroker::new(10_000.0), cfg, limits)
    }

    fn harness_on(paper: PaperBroker, cfg: RiskConfig, limits: TradingLimits) -> (SharedBus, Arc<PaperBroker>, ExecutionStage) {
        let bus: SharedBus = Arc::new(EventBus::default());
        let paper = Arc::new(paper);
        paper.set_price(SYMBOL, 2000.0);
        let broker: Arc<dyn Broker> = paper.clone();
        let config = ExecutionConfig {
            risk: HashMap::from([(risk_key(SYMBOL, "trend"), cfg)]),
            limits,
        };
        let stage = ExecutionStage::new(config, broker, Arc::clone(&bus), true, 10).unwrap();
        stage.start().unwrap();
        (bus, paper, stage)
    }

    fn entry(direction: Direction) -> Event {
        Event::new(EventPayload::EntrySignal {
            strategy: "trend".into(),
            symbol:   SYMBOL.into(),
            direction,
            price:    2000.0,
            market:   None,
        })
    }

    fn exit(direction: Direction) -> Event {
        Event::new(EventPayload::ExitSignal {
            strategy:  "trend".into(),
            symbol:    SYMBOL.into(),
            direction,
            reason:    "ExitLong conditions met".into(),
        })
    }

    fn tick(paper: &PaperBroker, bus: &EventBus, minute: i64, price: f64) {
        paper.set_price(SYMBOL, price);
        let bar = Bar {
            symbol:    SYMBOL.into(),
            timeframe: Timeframe::from("1"),
            open_time: Utc::now() + chrono::Duration::minutes(minute),
            open:      price,
            high:      price,
            low:       price,
            close:     price,
            volume:    1.0,
        };
        let row = EnrichedRow { bar, indicators: BTreeMap::new(), regime: Regime::Unknown, regime_confidence: 0.0 };
        bus.publish(Event::new(EventPayload::IndicatorsCalculated {
            symbol:    SYMBOL.into(),
            timeframe: Timeframe::from("1"),
            row,
            snapshot:  Arc::new(MarketSnapshot::new(SYMBOL)),
        }));
    }

    fn automation(bus: &EventBus, enabled: bool) {
        bus.publish(Event::new(EventPayload::AutomationStateChanged {
            previous:   !enabled,
            enabled,
            reason:     "test".into(),
            actor:      "test".into(),
            changed_at: Utc::now(),
        }));
    }

    fn reasons(bus: &EventBus) -> Vec<String> {
        bus.history(Some(EventKind::OrderRejected))
            .into_iter()
            .filter_map(|e| match e.payload {
                EventPayload::OrderRejected { reason, .. } => Some(reason),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_entry_places_protected_order() {
        let (bus, paper, stage) = harness(simple(), TradingLimits::default());
        bus.publish(entry(Direction::Long));

        assert_eq!(bus.history(Some(EventKind::TradingAuthorized)).len(), 1);
        let placed = bus.history(Some(EventKind::OrderPlaced));
        assert_eq!(placed.len(), 1);
        let EventPayload::OrderPlaced { ticket, stop_loss, take_profit, tag, .. } = &placed[0].payload else {
            panic!("unexpected payload");
        };
        assert_eq!(*stop_loss, 1990.0);
        assert_eq!(*take_profit, Some(2020.0));
        assert_eq!(*tag, PositionTag::Automated);

        let pos = paper.position(*ticket).unwrap();
        assert_eq!(pos.stop_loss, Some(1990.0));
        assert_eq!(stage.groups().len(), 1);
        assert_eq!(stage.guard_status().trades_today, 1);
    }

    #[test]
    fn test_disabled_automation_rejects_without_broker_call() {
        let (bus, paper, _stage) = harness(simple(), TradingLimits::default());
        automation(&bus, false);
        bus.publish(entry(Direction::Long));

        assert_eq!(reasons(&bus), vec!["automation disabled".to_string()]);
        assert!(paper.open_positions(None).unwrap().is_empty());
        assert!(bus.history(Some(EventKind::TradingAuthorized)).is_empty());
    }

    #[test]
    fn test_guard_blocks_and_publishes_breach() {
        let limits = TradingLimits { max_positions_per_symbol: 1, ..TradingLimits::default() };
        let (bus, paper, _stage) = harness(simple(), limits);
        bus.publish(entry(Direction::Long));
        bus.publish(entry(Direction::Long));

        assert_eq!(paper.open_positions(None).unwrap().len(), 1);
        let blocked = bus.history(Some(EventKind::TradingBlocked));
        assert_eq!(blocked.len(), 1);
        match &bus.history(Some(EventKind::RiskLimitBreached))[0].payload {
            EventPayload::RiskLimitBreached { limit, current, threshold, .. } => {
                assert_eq!(limit, "max_positions_per_symbol");
                assert_eq!(*current, 1.0);
                assert_eq!(*threshold, 1.0);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_broker_rejection_is_non_fatal() {
        let (bus, paper, stage) = harness(simple(), TradingLimits::default());
        paper.reject_next_orders(1);
        bus.publish(entry(Direction::Long));

        assert_eq!(reasons(&bus).len(), 1);
        assert!(reasons(&bus)[0].contains("retcode=10006"));
        assert_eq!(stage.guard_status().consecutive_failures, 1);
        assert_eq!(stage.health_check().status, crate::service::ServiceStatus::Running);

        bus.publish(entry(Direction::Long));
        assert_eq!(bus.history(Some(EventKind::OrderPlaced)).len(), 1);
    }

    #[test]
    fn test_missing_risk_config_rejects() {
        let (bus, _paper, _stage) = harness(simple(), TradingLimits::default());
        bus.publish(Event::new(EventPayload::EntrySignal {
            strategy:  "unknown".into(),
            symbol:    SYMBOL.into(),
            direction: Direction::Short,
            price:     2000.0,
            market:    None,
        }));
        assert_eq!(reasons(&bus), vec!["no risk config for XAUUSD/unknown".to_string()]);
    }

    #[test]
    fn test_exit_closes_matching_positions_even_when_disabled() {
        let (bus, paper, stage) = harness(simple(), TradingLimits::default());
        bus.publish(entry(Direction::Long));
        bus.publish(entry(Direction::Short));
        automation(&bus, false);

        paper.set_price(SYMBOL, 2005.0);
        bus.publish(exit(Direction::Long));

        let closed = bus.history(Some(EventKind::PositionClosed));
        assert_eq!(closed.len(), 1);
        match &closed[0].payload {
            EventPayload::PositionClosed { direction, profit, .. } => {
                assert_eq!(*direction, Direction::Long);
                assert_eq!(*profit, 5.0);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        let open = paper.open_positions(None).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].direction, Direction::Short);
        assert_eq!(stage.groups().len(), 1);
        assert_eq!(stage.guard_status().realised_pnl_today, 5.0);
    }

    #[test]
    fn test_partial_target_moves_stop_to_breakeven_once() {
        let cfg = risk(
            StopLossRule::Monetary { amount: 10.0 },
            TakeProfitRule::Partial {
                targets: vec![
                    PartialTarget { distance: TargetDistance::RiskMultiple(1.5), volume_percent: 50.0, move_stop_to_breakeven: true },
                    PartialTarget { distance: TargetDistance::RiskMultiple(3.0), volume_percent: 50.0, move_stop_to_breakeven: false },
                ],
            },
        );
        let (bus, paper, stage) = harness(cfg, TradingLimits::default());
        bus.publish(entry(Direction::Long));

        let tickets: Vec<u64> = stage.groups()[0].children.iter().map(|c| c.ticket).collect();
        assert_eq!(tickets.len(), 2);
        assert_eq!(paper.position(tickets[0]).unwrap().take_profit, Some(2015.0));

        tick(&paper, &bus, 1, 2016.0);
        tick(&paper, &bus, 2, 2017.0);
        tick(&paper, &bus, 3, 2012.0);

        assert!(paper.position(tickets[0]).is_none());
        assert_eq!(paper.position(tickets[1]).unwrap().stop_loss, Some(2000.0));
        assert_eq!(paper.modify_calls().len(), 1);
        assert_eq!(bus.history(Some(EventKind::PositionModified)).len(), 1);
        assert!(stage.groups()[0].breakeven_applied);
    }

    fn two_targets() -> RiskConfig {
        risk(
            StopLossRule::Monetary { amount: 10.0 },
            TakeProfitRule::Partial {
                targets: vec![
                    PartialTarget { distance: TargetDistance::RiskMultiple(1.5), volume_percent: 50.0, move_stop_to_breakeven: true },
                    PartialTarget { distance: TargetDistance::RiskMultiple(3.0), volume_percent: 50.0, move_stop_to_breakeven: false },
                ],
            },
        )
    }

    #[test]
    fn test_breakeven_retried_after_failed_modify() {
        let (bus, paper, stage) = harness(two_targets(), TradingLimits::default());
        bus.publish(entry(Direction::Long));
        let runner = stage.groups()[0].children[1].ticket;

        paper.fail_next_modifies(1);
        tick(&paper, &bus, 1, 2016.0);
        assert_eq!(paper.position(runner).unwrap().stop_loss, Some(1990.0));
        assert!(!stage.groups()[0].breakeven_applied);

        tick(&paper, &bus, 2, 2017.0);
        assert_eq!(paper.position(runner).unwrap().stop_loss, Some(2000.0));
        assert!(stage.groups()[0].breakeven_applied);
        assert_eq!(paper.modify_calls().len(), 2);
        assert_eq!(bus.history(Some(EventKind::PositionModified)).len(), 1);
    }

    #[test]
    fn test_every_leg_counts_against_open_position_limit() {
        let limits = TradingLimits { max_open_positions: 1, ..TradingLimits::default() };
        let (bus, paper, _stage) = harness(two_targets(), limits);
        bus.publish(entry(Direction::Long));

        assert!(paper.open_positions(None).unwrap().is_empty());
        assert!(bus.history(Some(EventKind::OrderPlaced)).is_empty());
        match &bus.history(Some(EventKind::TradingBlocked))[0].payload {
            EventPayload::TradingBlocked { limit, threshold, .. } => {
                assert_eq!(limit, "max_open_positions");
                assert_eq!(*threshold, 1.0);
            }
            other => panic!("unexpected payload {other:?}"),
        }

        let limits = TradingLimits { max_open_positions: 2, ..TradingLimits::default() };
        let (bus, paper, _stage) = harness(two_targets(), limits);
        bus.publish(entry(Direction::Long));
        bus.publish(entry(Direction::Long));
        assert_eq!(paper.open_positions(None).unwrap().len(), 2);
        assert_eq!(bus.history(Some(EventKind::TradingBlocked)).len(), 1);
    }

    #[test]
    fn test_target_inside_atr_stop_is_rejected_at_entry() {
        let cfg = risk(
            StopLossRule::Atr { multiple: 2.0, period: 14, timeframe: "1".into() },
            TakeProfitRule::Fixed { distance: 10.0 },
        );
        let (bus, paper, _stage) = harness(cfg, TradingLimits::default());
        let row = EnrichedRow {
            bar: Bar {
                symbol:    SYMBOL.into(),
                timeframe: Timeframe::from("1"),
                open_time: Utc::now(),
                open:      2000.0,
                high:      2010.0,
                low:       1990.0,
                close:     2000.0,
                volume:    1.0,
            },
            indicators:        BTreeMap::from([("atr_14".to_string(), 6.0)]),
            regime:            Regime::Ranging,
            regime_confidence: 0.5,
        };
        let mut snap = MarketSnapshot::new(SYMBOL);
        snap.rows.insert(Timeframe::from("1"), vec![row]);
        bus.publish(Event::new(EventPayload::EntrySignal {
            strategy:  "trend".into(),
            symbol:    SYMBOL.into(),
            direction: Direction::Long,
            price:     2000.0,
            market:    Some(Arc::new(snap)),
        }));

        assert!(paper.open_positions(None).unwrap().is_empty());
        let reasons = reasons(&bus);
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("not beyond stop distance 12"), "{}", reasons[0]);
    }

    #[test]
    fn test_levels_measured_from_quote_side() {
        let (bus, paper, _stage) = harness_on(PaperBroker::new(10_000.0).with_spread(0.5), simple(), TradingLimits::default());
        // stale signal close; the quote is bid 2000 / ask 2000.5
        let stale = |direction| {
            Event::new(EventPayload::EntrySignal {
                strategy: "trend".into(),
                symbol:   SYMBOL.into(),
                direction,
                price:    1990.0,
                market:   None,
            })
        };
        bus.publish(stale(Direction::Long));
        bus.publish(stale(Direction::Short));

        let open = paper.open_positions(None).unwrap();
        let long = open.iter().find(|p| p.direction == Direction::Long).unwrap();
        assert_eq!(long.entry_price, 2000.5);
        assert_eq!(long.stop_loss, Some(1990.5));
        assert_eq!(long.take_profit, Some(2020.5));
        let short = open.iter().find(|p| p.direction == Direction::Short).unwrap();
        assert_eq!(short.entry_price, 2000.0);
        assert_eq!(short.stop_loss, Some(2010.0));
        assert_eq!(short.take_profit, Some(1980.0));
    }

    #[test]
    fn test_signal_price_used_without_quote() {
        let bus: SharedBus = Arc::new(EventBus::default());
        let paper = Arc::new(PaperBroker::new(10_000.0));
        let broker: Arc<dyn Broker> = paper.clone();
        let config = ExecutionConfig {
            risk:   HashMap::from([(risk_key(SYMBOL, "trend"), simple())]),
            limits: TradingLimits::default(),
        };
        let stage = ExecutionStage::new(config, broker, Arc::clone(&bus), true, 10).unwrap();
        stage.start().unwrap();

        bus.publish(entry(Direction::Long));
        let open = paper.open_positions(None).unwrap();
        assert_eq!(open[0].stop_loss, Some(1990.0));
    }

    #[test]
    fn test_concurrent_entries_respect_limit() {
        let limits = TradingLimits { max_open_positions: 1, ..TradingLimits::default() };
        let (_bus, paper, stage) = harness(simple(), limits);
        let barrier = std::sync::Barrier::new(2);

        let outcomes: Vec<EntryOutcome> = std::thread::scope(|s| {
            let handles: Vec<_> = [Direction::Long, Direction::Short]
                .into_iter()
                .map(|direction| {
                    let stage = stage.clone();
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        stage.submit_manual("trend", SYMBOL, direction, Some(2000.0)).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let placed = outcomes.iter().filter(|o| matches!(o, EntryOutcome::Placed { .. })).count();
        let blocked = outcomes.iter().filter(|o| matches!(o, EntryOutcome::Blocked { .. })).count();
        assert_eq!((placed, blocked), (1, 1));
        assert_eq!(paper.open_positions(None).unwrap().len(), 1);
    }

    #[test]
    fn test_trailing_stop_only_tightens() {
        let cfg = risk(
            StopLossRule::Trailing { distance: 5.0, activation: 3.0 },
            TakeProfitRule::RiskReward { ratio: 4.0 },
        );
        let (bus, paper, _stage) = harness(cfg, TradingLimits::default());
        bus.publish(entry(Direction::Long));

        tick(&paper, &bus, 1, 2002.0); // below activation
        tick(&paper, &bus, 2, 2004.0); // → 1999
        tick(&paper, &bus, 3, 2002.5); // 1997.5 would loosen
        tick(&paper, &bus, 4, 2008.0); // → 2003

        let stops: Vec<Option<f64>> = paper.modify_calls().iter().map(|c| c.stop_loss).collect();
        assert_eq!(stops, vec![Some(1999.0), Some(2003.0)]);
    }

    #[test]
    fn test_disabled_automation_never_touches_protective_orders() {
        let cfg = risk(
            StopLossRule::Trailing { distance: 5.0, activation: 3.0 },
            TakeProfitRule::RiskReward { ratio: 4.0 },
        );
        let (bus, paper, stage) = harness(cfg, TradingLimits::default());
        bus.publish(entry(Direction::Long));
        let ticket = stage.groups()[0].children[0].ticket;

        automation(&bus, false);
        tick(&paper, &bus, 1, 2010.0);
        tick(&paper, &bus, 2, 2012.0);
        assert!(paper.modify_calls().is_empty());
        assert_eq!(paper.position(ticket).unwrap().stop_loss, Some(1995.0));
        assert_eq!(paper.position(ticket).unwrap().take_profit, Some(2020.0));
        assert_eq!(stage.metrics()["management_skipped"], 2);

        automation(&bus, true);
        assert_eq!(paper.position(ticket).unwrap().stop_loss, Some(1995.0));
        tick(&paper, &bus, 3, 2012.0);
        assert_eq!(paper.position(ticket).unwrap().stop_loss, Some(2007.0));
    }

    #[test]
    fn test_manual_orders_bypass_gate() {
        let (bus, paper, stage) = harness(simple(), TradingLimits::default());
        automation(&bus, false);

        let outcome = stage.submit_manual("trend", SYMBOL, Direction::Short, Some(2000.0)).unwrap();
        let EntryOutcome::Placed { tickets, volume, .. } = outcome else {
            panic!("expected placement, got {outcome:?}");
        };
        assert_eq!(volume, 1.0);
        let pos = paper.position(tickets[0]).unwrap();
        assert_eq!(pos.tag, PositionTag::Manual);
        assert_eq!(pos.stop_loss, Some(2010.0));

        stage.stop().unwrap();
        assert!(matches!(
            stage.submit_manual("trend", SYMBOL, Direction::Short, None),
            Err(EngineError::NotRunning { .. })
        ));
    }

    #[test]
    fn test_atr_stop_reads_signal_snapshot() {
        let cfg = risk(
            StopLossRule::Atr { multiple: 2.0, period: 14, timeframe: "5".into() },
            TakeProfitRule::RiskReward { ratio: 2.0 },
        );
        let (bus, paper, _stage) = harness(cfg, TradingLimits::default());

        let bar = Bar {
            symbol:    SYMBOL.into(),
            timeframe: Timeframe::from("5"),
            open_time: Utc::now(),
            open:      2000.0,
            high:      2001.0,
            low:       1999.0,
            close:     2000.0,
            volume:    1.0,
        };
        let row = EnrichedRow {
            bar,
            indicators:        BTreeMap::from([("atr_14".to_string(), 3.0)]),
            regime:            Regime::Ranging,
            regime_confidence: 0.5,
        };
        let mut snap = MarketSnapshot::new(SYMBOL);
        snap.rows.insert(Timeframe::from("5"), vec![row]);

        bus.publish(Event::new(EventPayload::EntrySignal {
            strategy:  "trend".into(),
            symbol:    SYMBOL.into(),
            direction: Direction::Short,
            price:     2000.0,
            market:    Some(Arc::new(snap)),
        }));

        let open = paper.open_positions(None).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].stop_loss, Some(2006.0));
        assert_eq!(open[0].take_profit, Some(1988.0));
    }
}

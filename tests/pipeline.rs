//! End-to-end: paper broker → Fetch → Indicators → Strategy → Execution.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use autopilot::automation::MemoryStateStore;
use autopilot::broker::{Broker, PaperBroker};
use autopilot::bus::EventBus;
use autopilot::config::{parse_timeframes, EngineConfig, TradingPlan};
use autopilot::error::BrokerError;
use autopilot::events::{Command, Event, EventKind, EventPayload};
use autopilot::models::{
    Bar, Condition, ConditionGroup, Direction, Operand, Operator, PositionSizing, RiskConfig, SignalValue,
    StopLossRule, StrategyDefinition, SymbolSpec, TakeProfitRule, Timeframe,
};
use autopilot::pipeline::Pipeline;
use autopilot::risk::TradingLimits;

const SYMBOL: &str = "XAUUSD";

fn engine() -> EngineConfig {
    EngineConfig {
        bar_count:       50,
        request_timeout: Duration::from_millis(500),
        ..EngineConfig::with_defaults(SYMBOL, parse_timeframes("1"))
    }
}

/// Long above 2000, exit long below 1995; 1 lot, $10 stop, 2R target.
fn plan() -> TradingPlan {
    let literal = |v: f64| Operand::Literal(SignalValue::Number(v));
    let mut strategy = StrategyDefinition::new("breakout", SYMBOL);
    strategy.entry_long = Some(ConditionGroup::all(vec![Condition::new("close", Operator::Gt, literal(2000.0), "1")]));
    strategy.exit_long = Some(ConditionGroup::all(vec![Condition::new("close", Operator::Lt, literal(1995.0), "1")]));

    let risk = RiskConfig {
        sizing:      PositionSizing::Fixed { lots: 1.0 },
        stop_loss:   StopLossRule::Monetary { amount: 10.0 },
        take_profit: TakeProfitRule::RiskReward { ratio: 2.0 },
        symbol_spec: SymbolSpec::default(),
    };
    TradingPlan {
        strategies: vec![strategy],
        risk: HashMap::from([(format!("{SYMBOL}/breakout"), risk)]),
        limits: Some(TradingLimits { max_positions_per_symbol: 1, ..TradingLimits::default() }),
        ..TradingPlan::default()
    }
}

struct Harness {
    paper:    Arc<PaperBroker>,
    pipeline: Pipeline,
    minute:   i64,
}

impl Harness {
    fn new() -> Self {
        let paper = Arc::new(PaperBroker::new(10_000.0));
        let broker: Arc<dyn Broker> = paper.clone();
        let store = Arc::new(MemoryStateStore::new(None));
        let pipeline = Pipeline::build_with_store(&engine(), &plan(), broker, store).unwrap();
        pipeline.orchestrator.start_all().unwrap();
        Self { paper, pipeline, minute: 0 }
    }

    /// Close a one-minute bar at `close` and run one fetch cycle.
    fn bar(&mut self, close: f64) {
        let open_time = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap() + chrono::Duration::minutes(self.minute);
        self.minute += 1;
        self.paper.push_bar(Bar {
            symbol:    SYMBOL.into(),
            timeframe: Timeframe::from("1"),
            open_time,
            open:      close,
            high:      close + 0.5,
            low:       close - 0.5,
            close,
            volume:    100.0,
        });
        self.pipeline.fetch.fetch_one(&Timeframe::from("1")).unwrap();
    }

    fn count(&self, kind: EventKind) -> usize {
        self.pipeline.bus.history(Some(kind)).len()
    }
}

#[test]
fn entry_flows_from_candle_to_protected_order() {
    let mut h = Harness::new();
    h.bar(1999.0);
    assert_eq!(h.count(EventKind::IndicatorsCalculated), 1);
    assert_eq!(h.count(EventKind::EntrySignal), 0);

    h.bar(2001.0);
    assert_eq!(h.count(EventKind::EntrySignal), 1);
    assert_eq!(h.count(EventKind::OrderPlaced), 1);

    let open = h.paper.open_positions(Some(SYMBOL)).unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].direction, Direction::Long);
    assert_eq!(open[0].stop_loss, Some(1991.0));
    assert_eq!(open[0].take_profit, Some(2021.0));

    // still above 2000: a second entry is blocked by the per-symbol limit
    h.bar(2003.0);
    assert_eq!(h.count(EventKind::OrderPlaced), 1);
    assert_eq!(h.count(EventKind::TradingBlocked), 1);
    assert!(h.pipeline.orchestrator.snapshot().healthy);
}

#[test]
fn disabled_automation_suppresses_entries_but_not_exits() {
    let mut h = Harness::new();
    h.bar(2001.0);
    assert_eq!(h.count(EventKind::OrderPlaced), 1);

    h.pipeline.automation.disable("maintenance", "test").unwrap();
    let modifies_before = h.paper.modify_calls().len();

    h.bar(2004.0);
    assert_eq!(h.count(EventKind::OrderPlaced), 1);
    assert_eq!(h.count(EventKind::EntrySignal), 1, "entries are suppressed at the strategy");

    h.bar(1994.0);
    assert_eq!(h.count(EventKind::ExitSignal), 1);
    assert_eq!(h.count(EventKind::PositionClosed), 1);
    assert!(h.paper.open_positions(None).unwrap().is_empty());
    assert_eq!(h.paper.modify_calls().len(), modifies_before);
}

#[test]
fn fetch_failures_are_published_and_survivable() {
    let mut h = Harness::new();
    h.paper.fail_bars(Some(BrokerError::Unreachable("bridge down".into())));
    assert!(h.pipeline.fetch.fetch_one(&Timeframe::from("1")).is_err());
    assert_eq!(h.count(EventKind::DataFetchError), 1);

    h.paper.fail_bars(None);
    h.bar(2001.0);
    assert_eq!(h.count(EventKind::OrderPlaced), 1);
}

#[tokio::test]
async fn operator_commands_round_trip_over_the_bus() {
    let h = tokio::task::spawn_blocking(|| {
        let mut h = Harness::new();
        h.bar(1999.0);
        h
    })
    .await
    .unwrap();

    let requests = Arc::clone(&h.pipeline.requests);
    let resp = requests.request(Command::QueryAutomation, Duration::from_millis(500)).await.unwrap();
    assert!(resp.ok);
    assert_eq!(resp.body["enabled"], true);

    let resp = requests
        .request(
            Command::QueryConditions { strategy: "breakout".into(), symbol: SYMBOL.into() },
            Duration::from_millis(500),
        )
        .await
        .unwrap();
    assert!(resp.ok);
    assert_eq!(resp.body["would_trigger_entry"], false);

    let resp = requests
        .request(
            Command::QueryConditions { strategy: "nope".into(), symbol: SYMBOL.into() },
            Duration::from_millis(500),
        )
        .await
        .unwrap();
    assert!(resp.is_not_found());

    let resp = requests
        .request(Command::DisableAutomation { reason: "test".into(), actor: "ops".into() }, Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(resp.body["enabled"], false);
    assert!(!h.pipeline.strategy.automation_enabled());
    assert!(!h.pipeline.execution.automation_enabled());

    tokio::task::spawn_blocking(move || {
        h.pipeline.orchestrator.stop_all();
        drop(h);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn stopped_responder_times_out() {
    let h = tokio::task::spawn_blocking(Harness::new).await.unwrap();
    let pipeline = &h.pipeline;
    autopilot::service::Service::stop(&pipeline.strategy).unwrap();

    let err = pipeline
        .requests
        .request(
            Command::QueryConditions { strategy: "breakout".into(), symbol: SYMBOL.into() },
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, autopilot::EngineError::RequestTimeout(_)));
    assert_eq!(pipeline.requests.pending_count(), 0);
}

// ─── Bus delivery property ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Behaviour {
    Succeed,
    Fail,
    Panic,
}

fn behaviour() -> impl Strategy<Value = Behaviour> {
    prop_oneof![Just(Behaviour::Succeed), Just(Behaviour::Fail), Just(Behaviour::Panic)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every subscriber sees every event once, in registration order, no
    /// matter how its neighbours fail.
    #[test]
    fn every_handler_runs_once_in_order(behaviours in prop::collection::vec(behaviour(), 1..8), events in 1usize..4) {
        let bus = EventBus::default();
        let calls: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

        for (idx, b) in behaviours.iter().copied().enumerate() {
            let calls = Arc::clone(&calls);
            bus.subscribe(EventKind::CriticalError, &format!("h{idx}"), move |_| {
                calls.lock().unwrap().push(idx);
                match b {
                    Behaviour::Succeed => Ok(()),
                    Behaviour::Fail => Err(anyhow::anyhow!("handler {idx} failed")),
                    Behaviour::Panic => panic!("handler {idx} panicked"),
                }
            });
        }

        for _ in 0..events {
            bus.publish(Event::new(EventPayload::CriticalError { source: "prop".into(), message: "x".into() }));
        }

        let expected: Vec<usize> = (0..events).flat_map(|_| 0..behaviours.len()).collect();
        prop_assert_eq!(calls.lock().unwrap().clone(), expected);
        prop_assert_eq!(bus.history(Some(EventKind::CriticalError)).len(), events);
    }
}

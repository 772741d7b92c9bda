//! # events
//!
//! Defines [`Event`] — the immutable record every stage publishes on the bus —
//! and the fixed set of payload variants ([`EventPayload`]).
//!
//! Routing is by [`EventKind`], the fieldless discriminant of the payload, so
//! subscribers register for exactly one variant.  Events are cheap to clone:
//! the only large payload (the recent-rows snapshot) sits behind an `Arc`.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::indicators::regime::Regime;
use crate::models::bar::{Bar, EnrichedRow, MarketSnapshot, Timeframe};
use crate::models::position::PositionTag;
use crate::models::strategy::Direction;

// ─── Envelope ─────────────────────────────────────────────────────────────────

/// Timestamped, uniquely identified bus record.
///
/// Equality is by `id`; ordering is by `timestamp` (ties broken by `id`).
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id:             Uuid,
    pub timestamp:      DateTime<Utc>,
    /// Set on request/response pairs so a reply can be matched to its request.
    pub correlation_id: Option<Uuid>,
    pub payload:        EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id:             Uuid::new_v4(),
            timestamp:      Utc::now(),
            correlation_id: None,
            payload,
        }
    }

    pub fn correlated(payload: EventPayload, correlation_id: Uuid) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            ..Self::new(payload)
        }
    }

    #[inline]
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Serialise for the operator stream.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"kind":"SERIALIZATION_ERROR"}"#.to_string())
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.id.cmp(&other.id))
    }
}

// ─── Kind ─────────────────────────────────────────────────────────────────────

/// Routing key — one per payload variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    DataFetched,
    DataFetchError,
    NewCandle,
    IndicatorsCalculated,
    IndicatorCalculationError,
    RegimeChanged,
    EntrySignal,
    ExitSignal,
    StrategyEvaluationError,
    OrderPlaced,
    OrderRejected,
    PositionModified,
    PositionClosed,
    RiskLimitBreached,
    TradingBlocked,
    TradingAuthorized,
    AutomationStateChanged,
    CriticalError,
    Command,
    CommandResponse,
}

impl EventKind {
    pub const ALL: [EventKind; 20] = [
        EventKind::DataFetched,
        EventKind::DataFetchError,
        EventKind::NewCandle,
        EventKind::IndicatorsCalculated,
        EventKind::IndicatorCalculationError,
        EventKind::RegimeChanged,
        EventKind::EntrySignal,
        EventKind::ExitSignal,
        EventKind::StrategyEvaluationError,
        EventKind::OrderPlaced,
        EventKind::OrderRejected,
        EventKind::PositionModified,
        EventKind::PositionClosed,
        EventKind::RiskLimitBreached,
        EventKind::TradingBlocked,
        EventKind::TradingAuthorized,
        EventKind::AutomationStateChanged,
        EventKind::CriticalError,
        EventKind::Command,
        EventKind::CommandResponse,
    ];

    /// Parse the wire name (`NEW_CANDLE`) used by the operator API.
    pub fn parse(name: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(name.to_ascii_uppercase())).ok()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

// ─── Payloads ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    /// A fetch for one timeframe completed (published on every successful fetch).
    DataFetched {
        symbol:    String,
        timeframe: Timeframe,
        bar_count: usize,
        latest:    Bar,
    },

    /// A fetch for one timeframe failed (adapter error or empty result).
    DataFetchError {
        symbol:    String,
        timeframe: Timeframe,
        error:     String,
    },

    /// The latest bar's open time differs from the last one seen.
    NewCandle {
        symbol:    String,
        timeframe: Timeframe,
        bar:       Bar,
    },

    IndicatorsCalculated {
        symbol:    String,
        timeframe: Timeframe,
        row:       EnrichedRow,
        snapshot:  Arc<MarketSnapshot>,
    },

    IndicatorCalculationError {
        symbol:    String,
        timeframe: Timeframe,
        error:     String,
    },

    RegimeChanged {
        symbol:     String,
        timeframe:  Timeframe,
        previous:   Regime,
        current:    Regime,
        confidence: f64,
    },

    EntrySignal {
        strategy:  String,
        symbol:    String,
        direction: Direction,
        /// Reference price (latest close on the triggering timeframe).
        price:     f64,
        /// Rows the signal was evaluated on (sizing reads ATR from here).
        #[serde(skip)]
        market:    Option<Arc<MarketSnapshot>>,
    },

    /// Exits are never suppressed by the automation gate.
    ExitSignal {
        strategy:  String,
        symbol:    String,
        direction: Direction,
        reason:    String,
    },

    StrategyEvaluationError {
        strategy: String,
        symbol:   String,
        error:    String,
    },

    OrderPlaced {
        ticket:      u64,
        strategy:    String,
        symbol:      String,
        direction:   Direction,
        volume:      f64,
        entry_price: f64,
        stop_loss:   f64,
        take_profit: Option<f64>,
        tag:         PositionTag,
        group_id:    Uuid,
    },

    OrderRejected {
        strategy:  String,
        symbol:    String,
        direction: Direction,
        reason:    String,
    },

    /// Automated position management moved a stop (breakeven / trailing).
    PositionModified {
        ticket:        u64,
        symbol:        String,
        previous_stop: f64,
        new_stop:      f64,
        reason:        String,
    },

    PositionClosed {
        ticket:      u64,
        symbol:      String,
        direction:   Direction,
        volume:      f64,
        close_price: f64,
        profit:      f64,
        reason:      String,
    },

    RiskLimitBreached {
        limit:     String,
        current:   f64,
        threshold: f64,
        symbol:    String,
    },

    TradingBlocked {
        strategy:  String,
        symbol:    String,
        limit:     String,
        current:   f64,
        threshold: f64,
    },

    TradingAuthorized {
        strategy: String,
        symbol:   String,
    },

    AutomationStateChanged {
        previous:   bool,
        enabled:    bool,
        reason:     String,
        actor:      String,
        changed_at: DateTime<Utc>,
    },

    /// Something the operator must look at (e.g. state could not be persisted).
    CriticalError {
        source:  String,
        message: String,
    },

    Command(Command),

    CommandResponse(CommandResponse),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::DataFetched { .. }               => EventKind::DataFetched,
            EventPayload::DataFetchError { .. }            => EventKind::DataFetchError,
            EventPayload::NewCandle { .. }                 => EventKind::NewCandle,
            EventPayload::IndicatorsCalculated { .. }      => EventKind::IndicatorsCalculated,
            EventPayload::IndicatorCalculationError { .. } => EventKind::IndicatorCalculationError,
            EventPayload::RegimeChanged { .. }             => EventKind::RegimeChanged,
            EventPayload::EntrySignal { .. }               => EventKind::EntrySignal,
            EventPayload::ExitSignal { .. }                => EventKind::ExitSignal,
            EventPayload::StrategyEvaluationError { .. }   => EventKind::StrategyEvaluationError,
            EventPayload::OrderPlaced { .. }               => EventKind::OrderPlaced,
            EventPayload::OrderRejected { .. }             => EventKind::OrderRejected,
            EventPayload::PositionModified { .. }          => EventKind::PositionModified,
            EventPayload::PositionClosed { .. }            => EventKind::PositionClosed,
            EventPayload::RiskLimitBreached { .. }         => EventKind::RiskLimitBreached,
            EventPayload::TradingBlocked { .. }            => EventKind::TradingBlocked,
            EventPayload::TradingAuthorized { .. }         => EventKind::TradingAuthorized,
            EventPayload::AutomationStateChanged { .. }    => EventKind::AutomationStateChanged,
            EventPayload::CriticalError { .. }             => EventKind::CriticalError,
            EventPayload::Command(_)                       => EventKind::Command,
            EventPayload::CommandResponse(_)               => EventKind::CommandResponse,
        }
    }
}

// ─── Commands ─────────────────────────────────────────────────────────────────

/// Operator requests carried over the bus (see `bus::request`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    EnableAutomation { reason: String, actor: String },
    DisableAutomation { reason: String, actor: String },
    QueryAutomation,
    QueryConditions { strategy: String, symbol: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub ok:    bool,
    pub body:  serde_json::Value,
    pub error: Option<String>,
}

impl CommandResponse {
    pub fn ok(body: serde_json::Value) -> Self {
        Self { ok: true, body, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok:    false,
            body:  serde_json::Value::Null,
            error: Some(error.into()),
        }
    }

    /// A failure caused by an unknown name (strategy, ticket ...).
    pub fn not_found(error: impl Into<String>) -> Self {
        Self {
            body: serde_json::json!({ "code": NOT_FOUND_CODE }),
            ..Self::failed(error)
        }
    }

    pub fn is_not_found(&self) -> bool {
        !self.ok && self.body.get("code").and_then(|c| c.as_str()) == Some(NOT_FOUND_CODE)
    }
}

const NOT_FOUND_CODE: &str = "NOT_FOUND";

//! # models::strategy
//!
//! Declarative strategy definitions: a [`StrategyDefinition`] owns up to four
//! [`ConditionGroup`]s (entry-long, entry-short, exit-long, exit-short), each a
//! list of [`Condition`]s combined with `ALL` / `ANY`.
//!
//! The right-hand side of a condition is an [`Operand`]: either a literal or a
//! reference to another signal resolved from the same snapshot.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::models::bar::Timeframe;

// ─── Direction ────────────────────────────────────────────────────────────────

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// `+1.0` for long, `-1.0` for short. Multiplies a price delta into P/L sign.
    #[inline]
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long  => 1.0,
            Direction::Short => -1.0,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long  => f.write_str("LONG"),
            Direction::Short => f.write_str("SHORT"),
        }
    }
}

// ─── Values & Operands ────────────────────────────────────────────────────────

/// A resolved signal value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Number(f64),
    Text(String),
}

impl SignalValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            SignalValue::Number(_) => "number",
            SignalValue::Text(_)   => "text",
        }
    }
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalValue::Number(n) => write!(f, "{n}"),
            SignalValue::Text(s)   => f.write_str(s),
        }
    }
}

/// Right-hand side of a condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Literal(SignalValue),
    /// Name of another signal, resolved against the same enriched row.
    Signal(String),
}

// ─── Operators ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    /// Left was `<=` right on the previous row and is `>` right on the latest.
    #[serde(rename = "crosses_above")]
    CrossesAbove,
    /// Left was `>=` right on the previous row and is `<` right on the latest.
    #[serde(rename = "crosses_below")]
    CrossesBelow,
}

impl Operator {
    /// Crossing operators need the previous row as well as the latest.
    #[inline]
    pub fn needs_history(self) -> bool {
        matches!(self, Operator::CrossesAbove | Operator::CrossesBelow)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::CrossesAbove => "crosses_above",
            Operator::CrossesBelow => "crosses_below",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

// ─── Condition ────────────────────────────────────────────────────────────────

/// `signal <operator> operand`, evaluated on the condition's own timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub signal:    String,
    pub operator:  Operator,
    pub operand:   Operand,
    pub timeframe: Timeframe,
}

impl Condition {
    pub fn new(
        signal: impl Into<String>,
        operator: Operator,
        operand: Operand,
        timeframe: impl Into<Timeframe>,
    ) -> Self {
        Self {
            signal: signal.into(),
            operator,
            operand,
            timeframe: timeframe.into(),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rhs = match &self.operand {
            Operand::Literal(v) => v.to_string(),
            Operand::Signal(s)  => s.clone(),
        };
        write!(f, "[{}] {} {} {}", self.timeframe, self.signal, self.operator, rhs)
    }
}

// ─── Groups ───────────────────────────────────────────────────────────────────

/// How a group's condition outcomes are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupMode {
    /// Logical AND.
    All,
    /// Logical OR.
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub mode:       GroupMode,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ConditionGroup {
    pub fn all(conditions: Vec<Condition>) -> Self {
        Self { mode: GroupMode::All, conditions }
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Self { mode: GroupMode::Any, conditions }
    }
}

/// Which of the four slots a group occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupKind {
    EntryLong,
    EntryShort,
    ExitLong,
    ExitShort,
}

impl GroupKind {
    pub const ALL: [GroupKind; 4] = [
        GroupKind::EntryLong,
        GroupKind::EntryShort,
        GroupKind::ExitLong,
        GroupKind::ExitShort,
    ];

    #[inline]
    pub fn is_entry(self) -> bool {
        matches!(self, GroupKind::EntryLong | GroupKind::EntryShort)
    }

    #[inline]
    pub fn direction(self) -> Direction {
        match self {
            GroupKind::EntryLong | GroupKind::ExitLong   => Direction::Long,
            GroupKind::EntryShort | GroupKind::ExitShort => Direction::Short,
        }
    }
}

// ─── Strategy ─────────────────────────────────────────────────────────────────

/// A named rule set for one symbol. Absent groups never trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDefinition {
    pub name:        String,
    pub symbol:      String,
    #[serde(default)]
    pub entry_long:  Option<ConditionGroup>,
    #[serde(default)]
    pub entry_short: Option<ConditionGroup>,
    #[serde(default)]
    pub exit_long:   Option<ConditionGroup>,
    #[serde(default)]
    pub exit_short:  Option<ConditionGroup>,
}

impl StrategyDefinition {
    pub fn new(name: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            name:        name.into(),
            symbol:      symbol.into(),
            entry_long:  None,
            entry_short: None,
            exit_long:   None,
            exit_short:  None,
        }
    }

    pub fn group(&self, kind: GroupKind) -> Option<&ConditionGroup> {
        match kind {
            GroupKind::EntryLong  => self.entry_long.as_ref(),
            GroupKind::EntryShort => self.entry_short.as_ref(),
            GroupKind::ExitLong   => self.exit_long.as_ref(),
            GroupKind::ExitShort  => self.exit_short.as_ref(),
        }
    }

    /// Present groups in evaluation order.
    pub fn groups(&self) -> impl Iterator<Item = (GroupKind, &ConditionGroup)> {
        GroupKind::ALL
            .into_iter()
            .filter_map(move |kind| self.group(kind).map(|g| (kind, g)))
    }

    /// Structural checks — run once when the plan is loaded.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |reason: &str| ConfigError::Strategy {
            strategy: self.name.clone(),
            reason:   reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(fail("name must not be empty"));
        }
        if self.symbol.trim().is_empty() {
            return Err(fail("symbol must not be empty"));
        }
        for (_, group) in self.groups() {
            for cond in &group.conditions {
                if cond.signal.trim().is_empty() {
                    return Err(fail("condition with empty signal name"));
                }
                if cond.timeframe.as_str().is_empty() {
                    return Err(fail("condition with empty timeframe"));
                }
            }
        }
        Ok(())
    }
}

//! # conditions — strategy condition engine
//!
//! Pure evaluation of [`StrategyDefinition`] condition trees against a
//! [`MarketSnapshot`].  No bus, no state: the Strategy stage calls it on the
//! live path and the operator query reads back exactly what it produced.
//!
//! ```text
//! condition  : resolve left on its own timeframe, resolve right (literal or
//!              signal on the same row), apply operator → ConditionResult
//! group      : ALL = every outcome true, ANY = at least one; empty → false
//! strategy   : every present group, in entry-long, entry-short, exit-long,
//!              exit-short order
//! ```
//!
//! Missing data (unknown timeframe, signal still warming up, no previous row
//! for a crossing) is not an error: the condition is `false` and the result
//! carries a note.  Comparing incompatible types is an error.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::EvaluationError;
use crate::models::{
    Condition, ConditionGroup, EnrichedRow, GroupKind, GroupMode, MarketSnapshot, Operand, Operator,
    SignalValue, StrategyDefinition,
};

// ─── Results ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionResult {
    pub condition: Condition,
    pub outcome:   bool,
    /// Resolved left value on the latest row.
    pub left:      Option<SignalValue>,
    /// Resolved right value on the latest row.
    pub right:     Option<SignalValue>,
    /// Why the condition could not be evaluated, if it could not.
    pub detail:    Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupEvaluation {
    pub kind:    GroupKind,
    pub mode:    GroupMode,
    pub outcome: bool,
    pub results: Vec<ConditionResult>,
}

/// A condition holding back an `ALL` group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockingCondition {
    pub kind:   GroupKind,
    pub result: ConditionResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyEvaluation {
    pub strategy:     String,
    pub symbol:       String,
    pub evaluated_at: DateTime<Utc>,
    pub groups:       Vec<GroupEvaluation>,
}

impl StrategyEvaluation {
    pub fn group(&self, kind: GroupKind) -> Option<&GroupEvaluation> {
        self.groups.iter().find(|g| g.kind == kind)
    }

    /// Outcome of one slot; an absent group never triggers.
    pub fn triggered(&self, kind: GroupKind) -> bool {
        self.group(kind).is_some_and(|g| g.outcome)
    }

    pub fn would_trigger_entry(&self) -> bool {
        self.triggered(GroupKind::EntryLong) || self.triggered(GroupKind::EntryShort)
    }

    pub fn would_trigger_exit(&self) -> bool {
        self.triggered(GroupKind::ExitLong) || self.triggered(GroupKind::ExitShort)
    }

    /// Conditions with a `false` outcome inside `ALL` groups.
    pub fn blocking_conditions(&self) -> Vec<BlockingCondition> {
        self.groups
            .iter()
            .filter(|g| g.mode == GroupMode::All)
            .flat_map(|g| {
                g.results
                    .iter()
                    .filter(|r| !r.outcome)
                    .map(move |r| BlockingCondition { kind: g.kind, result: r.clone() })
            })
            .collect()
    }
}

// ─── Resolution ───────────────────────────────────────────────────────────────

/// Value of `name` on `row`: `regime` is text, everything else numeric.
pub fn resolve(name: &str, row: &EnrichedRow) -> Option<SignalValue> {
    if name == "regime" {
        return Some(SignalValue::Text(row.regime.as_str().to_string()));
    }
    row.numeric(name).map(SignalValue::Number)
}

fn resolve_operand(operand: &Operand, row: &EnrichedRow) -> Option<SignalValue> {
    match operand {
        Operand::Literal(v) => Some(v.clone()),
        Operand::Signal(name) => resolve(name, row),
    }
}

fn operand_name(operand: &Operand) -> String {
    match operand {
        Operand::Literal(v) => v.to_string(),
        Operand::Signal(name) => name.clone(),
    }
}

// ─── Comparison ───────────────────────────────────────────────────────────────

fn mismatch(cond: &Condition, left: &SignalValue, right: &SignalValue) -> EvaluationError {
    EvaluationError::TypeMismatch {
        signal:   cond.signal.clone(),
        operator: cond.operator.symbol().to_string(),
        left:     left.type_name().to_string(),
        right:    right.type_name().to_string(),
    }
}

fn compare(cond: &Condition, left: &SignalValue, right: &SignalValue) -> Result<bool, EvaluationError> {
    match (left, right) {
        (SignalValue::Number(a), SignalValue::Number(b)) => Ok(match cond.operator {
            Operator::Gt => a > b,
            Operator::Ge => a >= b,
            Operator::Lt => a < b,
            Operator::Le => a <= b,
            Operator::Eq => a == b,
            Operator::Ne => a != b,
            // crossings are handled with two rows
            Operator::CrossesAbove | Operator::CrossesBelow => return Err(mismatch(cond, left, right)),
        }),
        (SignalValue::Text(a), SignalValue::Text(b)) => match cond.operator {
            Operator::Eq => Ok(a == b),
            Operator::Ne => Ok(a != b),
            _ => Err(mismatch(cond, left, right)),
        },
        _ => Err(mismatch(cond, left, right)),
    }
}

fn numbers(cond: &Condition, left: &SignalValue, right: &SignalValue) -> Result<(f64, f64), EvaluationError> {
    match (left, right) {
        (SignalValue::Number(a), SignalValue::Number(b)) => Ok((*a, *b)),
        _ => Err(mismatch(cond, left, right)),
    }
}

// ─── Evaluation ───────────────────────────────────────────────────────────────

pub fn evaluate_condition(cond: &Condition, snapshot: &MarketSnapshot) -> Result<ConditionResult, EvaluationError> {
    let unresolved = |left: Option<SignalValue>, right: Option<SignalValue>, detail: String| ConditionResult {
        condition: cond.clone(),
        outcome:   false,
        left,
        right,
        detail:    Some(detail),
    };

    let Some(latest) = snapshot.latest(&cond.timeframe) else {
        return Ok(unresolved(None, None, format!("no data for timeframe {}", cond.timeframe)));
    };

    let left = resolve(&cond.signal, latest);
    let right = resolve_operand(&cond.operand, latest);
    let (Some(l), Some(r)) = (left.clone(), right.clone()) else {
        let missing = if left.is_none() { cond.signal.clone() } else { operand_name(&cond.operand) };
        return Ok(unresolved(left, right, format!("signal '{missing}' not available")));
    };

    let outcome = if cond.operator.needs_history() {
        let (now_l, now_r) = numbers(cond, &l, &r)?;
        let prev = snapshot.previous(&cond.timeframe).and_then(|row| {
            Some((resolve(&cond.signal, row)?, resolve_operand(&cond.operand, row)?))
        });
        let Some((pl, pr)) = prev else {
            return Ok(unresolved(Some(l), Some(r), "insufficient history for crossing".into()));
        };
        let (prev_l, prev_r) = numbers(cond, &pl, &pr)?;
        match cond.operator {
            Operator::CrossesAbove => prev_l <= prev_r && now_l > now_r,
            _ => prev_l >= prev_r && now_l < now_r,
        }
    } else {
        compare(cond, &l, &r)?
    };

    Ok(ConditionResult {
        condition: cond.clone(),
        outcome,
        left: Some(l),
        right: Some(r),
        detail: None,
    })
}

pub fn evaluate_group(
    kind: GroupKind,
    group: &ConditionGroup,
    snapshot: &MarketSnapshot,
) -> Result<GroupEvaluation, EvaluationError> {
    let results = group
        .conditions
        .iter()
        .map(|c| evaluate_condition(c, snapshot))
        .collect::<Result<Vec<_>, _>>()?;

    let outcome = !results.is_empty()
        && match group.mode {
            GroupMode::All => results.iter().all(|r| r.outcome),
            GroupMode::Any => results.iter().any(|r| r.outcome),
        };

    Ok(GroupEvaluation { kind, mode: group.mode, outcome, results })
}

pub fn evaluate_strategy(
    strategy: &StrategyDefinition,
    snapshot: &MarketSnapshot,
) -> Result<StrategyEvaluation, EvaluationError> {
    let groups = strategy
        .groups()
        .map(|(kind, group)| evaluate_group(kind, group, snapshot))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(StrategyEvaluation {
        strategy:     strategy.name.clone(),
        symbol:       strategy.symbol.clone(),
        evaluated_at: Utc::now(),
        groups,
    })
}

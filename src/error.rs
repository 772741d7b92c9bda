//! # error
//!
//! Centralised error types for the engine.
//!
//! Every fallible core operation returns `Result<_, EngineError>`.  The
//! collaborator-facing errors ([`BrokerError`], [`StoreError`]) convert into it
//! with `?` so stage code stays linear.  Risk-limit failures are *not* errors —
//! they are published as `TradingBlocked` / `RiskLimitBreached` events.

use std::time::Duration;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Construction-time validation failure. The stage never reaches RUNNING.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A data-producing call was made on a stage that is not RUNNING.
    #[error("Service '{service}' is not running")]
    NotRunning { service: String },

    /// Per-key stage state was queried while absent. `start()` must populate
    /// every configured key, so this indicates a construction bug.
    #[error("State for '{key}' not initialised in service '{service}'")]
    StateNotInitialised { service: String, key: String },

    /// Market-data / broker collaborator failure.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Automation state could not be persisted; the in-memory change was rolled back.
    #[error("Critical persistence failure: {0}")]
    Persistence(#[from] StoreError),

    /// Indicator / regime calculation failure for one unit of work.
    #[error("Calculation error: {0}")]
    Calculation(String),

    /// Condition evaluation failure for one strategy.
    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    /// Lookup of an unknown strategy, ticket or group.
    #[error("Not found: {0}")]
    NotFound(String),

    /// No correlated response arrived in time.
    #[error("Request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// Orchestrator gave up restarting a stage.
    #[error("Service '{service}' failed to restart after {attempts} attempts")]
    RestartExhausted { service: String, attempts: u32 },

    /// Catch-all for unexpected failures.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

// ─── Validation ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("symbol must not be empty")]
    EmptySymbol,

    #[error("timeframe list must not be empty")]
    NoTimeframes,

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("risk config '{key}': {reason}")]
    Risk { key: String, reason: String },

    #[error("strategy '{strategy}': {reason}")]
    Strategy { strategy: String, reason: String },
}

// ─── Broker / Market Data ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BrokerError {
    /// Transport failure — the adapter could not reach the terminal.
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// The terminal answered but refused the request.
    #[error("rejected: retcode={retcode} comment={comment}")]
    Rejected { retcode: u32, comment: String },

    /// A data request came back empty.
    #[error("no data returned for {symbol}/{timeframe}")]
    NoData { symbol: String, timeframe: String },

    #[error("position {0} not found")]
    PositionNotFound(u64),

    /// Malformed response payload.
    #[error("protocol error: {0}")]
    Protocol(String),
}

// ─── Automation State Store ───────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt state file: {0}")]
    Corrupt(#[from] serde_json::Error),
}

// ─── Condition Engine ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    /// Operator cannot be applied to the resolved value types.
    #[error("operator '{operator}' cannot compare {left} with {right} (signal '{signal}')")]
    TypeMismatch {
        signal:   String,
        operator: String,
        left:     String,
        right:    String,
    },
}

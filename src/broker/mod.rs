//! # broker — market-data / order collaborator
//!
//! The engine only talks to the terminal through [`Broker`].  Every call is a
//! synchronous, possibly slow, recoverable operation: a failure is reported as
//! a [`BrokerError`] and never takes a stage down.
//!
//! | Adapter        | Use                                                     |
//! |----------------|---------------------------------------------------------|
//! | [`PaperBroker`] | in-memory fills; `MT5_BASE_URL=mock` and all tests      |
//! | [`Mt5Bridge`]   | HTTP bridge to an MT5 Expert Advisor                    |

pub mod mt5;
pub mod paper;

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::models::{Bar, Direction, Position, PositionTag, Timeframe};

pub use mt5::Mt5Bridge;
pub use paper::PaperBroker;

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

// ─── Requests / Results ───────────────────────────────────────────────────────

/// One market order with protective levels attached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    pub symbol:      String,
    pub direction:   Direction,
    pub volume:      f64,
    /// Reference price used for sizing; the broker fills at market.
    pub price:       f64,
    pub stop_loss:   f64,
    pub take_profit: Option<f64>,
    pub comment:     String,
    pub tag:         PositionTag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderTicket {
    pub ticket:     u64,
    pub fill_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseResult {
    pub ticket:      u64,
    pub close_price: f64,
    pub profit:      f64,
    pub volume:      f64,
}

/// Current top of book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
}

impl Quote {
    /// Price a market order in `direction` fills at: ask to buy, bid to sell.
    #[inline]
    pub fn entry_price(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Long  => self.ask,
            Direction::Short => self.bid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub balance: f64,
    pub equity:  f64,
    pub margin:  f64,
}

// ─── Contract ─────────────────────────────────────────────────────────────────

pub trait Broker: Send + Sync {
    /// Most recent `count` bars, oldest first.
    fn get_bars(&self, symbol: &str, timeframe: &Timeframe, count: usize) -> BrokerResult<Vec<Bar>>;

    /// Current bid/ask for `symbol`.
    fn quote(&self, symbol: &str) -> BrokerResult<Quote>;

    fn place_order(&self, order: &OrderRequest) -> BrokerResult<OrderTicket>;

    /// Close `volume` lots of `ticket` at market (`None` = everything).
    fn close_position(&self, ticket: u64, volume: Option<f64>) -> BrokerResult<CloseResult>;

    /// Replace the protective levels. `None` leaves a level unchanged.
    fn modify_position(&self, ticket: u64, stop_loss: Option<f64>, take_profit: Option<f64>) -> BrokerResult<()>;

    fn account_summary(&self) -> BrokerResult<AccountSummary>;

    /// Positions still open at the terminal, optionally for one symbol.
    fn open_positions(&self, symbol: Option<&str>) -> BrokerResult<Vec<Position>>;
}

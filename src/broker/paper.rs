//! # broker::paper
//!
//! In-memory broker: bars are pushed in by the caller, orders fill at the last
//! known price, protective levels are honoured on every price update.
//!
//! Selected with `MT5_BASE_URL=mock` and used by every pipeline test.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::Utc;
use tracing::{debug, info};

use crate::broker::{AccountSummary, Broker, BrokerResult, CloseResult, OrderRequest, OrderTicket, Quote};
use crate::error::BrokerError;
use crate::models::{Bar, Direction, Position, Timeframe};
use crate::sync::lock;

const FIRST_TICKET: u64 = 100_001;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModifyCall {
    pub ticket:      u64,
    pub stop_loss:   Option<f64>,
    pub take_profit: Option<f64>,
}

#[derive(Debug)]
struct PaperState {
    bars:         HashMap<(String, Timeframe), Vec<Bar>>,
    prices:       HashMap<String, f64>,
    open:         BTreeMap<u64, Position>,
    closed:       Vec<Position>,
    next_ticket:  u64,
    balance:      f64,
    reject_next:  u32,
    fail_modify:  u32,
    bars_error:   Option<BrokerError>,
    modify_calls: Vec<ModifyCall>,
}

pub struct PaperBroker {
    state:           Mutex<PaperState>,
    value_per_point: f64,
    /// Ask minus bid. The last price is the bid.
    spread:          f64,
}

impl PaperBroker {
    pub fn new(balance: f64) -> Self {
        Self {
            state: Mutex::new(PaperState {
                bars:         HashMap::new(),
                prices:       HashMap::new(),
                open:         BTreeMap::new(),
                closed:       Vec::new(),
                next_ticket:  FIRST_TICKET,
                balance,
                reject_next:  0,
                fail_modify:  0,
                bars_error:   None,
                modify_calls: Vec::new(),
            }),
            value_per_point: 1.0,
            spread:          0.0,
        }
    }

    pub fn with_spread(mut self, spread: f64) -> Self {
        self.spread = spread;
        self
    }

    pub fn with_value_per_point(mut self, value_per_point: f64) -> Self {
        self.value_per_point = value_per_point;
        self
    }

    // ─── Feed ─────────────────────────────────────────────────────────────────

    /// Append a bar to its series; its close becomes the symbol's price.
    /// Returns positions closed by their stop or target at that price.
    pub fn push_bar(&self, bar: Bar) -> Vec<CloseResult> {
        let symbol = bar.symbol.clone();
        let close = bar.close;
        lock(&self.state)
            .bars
            .entry((bar.symbol.clone(), bar.timeframe.clone()))
            .or_default()
            .push(bar);
        self.set_price(&symbol, close)
    }

    /// Replace the whole series for (symbol, timeframe).
    pub fn set_bars(&self, symbol: &str, timeframe: &Timeframe, bars: Vec<Bar>) {
        lock(&self.state).bars.insert((symbol.to_string(), timeframe.clone()), bars);
    }

    /// Move the market. Positions whose stop or target is crossed are closed
    /// at that level, the way a broker-side protective order would fill.
    pub fn set_price(&self, symbol: &str, price: f64) -> Vec<CloseResult> {
        let mut st = lock(&self.state);
        st.prices.insert(symbol.to_string(), price);

        let hits: Vec<(u64, f64, &'static str)> = st
            .open
            .values()
            .filter(|p| p.symbol == symbol)
            .filter_map(|p| protective_fill(p, price).map(|(level, why)| (p.ticket, level, why)))
            .collect();

        hits.into_iter()
            .filter_map(|(ticket, level, why)| {
                let result = close_locked(&mut st, ticket, None, level, self.value_per_point).ok()?;
                info!(ticket, level, reason = why, "📄 paper: protective order filled");
                Some(result)
            })
            .collect()
    }

    // ─── Fault injection ──────────────────────────────────────────────────────

    /// Reject the next `n` order submissions.
    pub fn reject_next_orders(&self, n: u32) {
        lock(&self.state).reject_next = n;
    }

    /// Fail the next `n` stop/target modifications (the call is still logged).
    pub fn fail_next_modifies(&self, n: u32) {
        lock(&self.state).fail_modify = n;
    }

    /// Make every `get_bars` call fail with `error` (`None` to heal).
    pub fn fail_bars(&self, error: Option<BrokerError>) {
        lock(&self.state).bars_error = error;
    }

    // ─── Inspection ───────────────────────────────────────────────────────────

    pub fn position(&self, ticket: u64) -> Option<Position> {
        lock(&self.state).open.get(&ticket).cloned()
    }

    pub fn closed_positions(&self) -> Vec<Position> {
        lock(&self.state).closed.clone()
    }

    pub fn modify_calls(&self) -> Vec<ModifyCall> {
        lock(&self.state).modify_calls.clone()
    }

    pub fn price(&self, symbol: &str) -> Option<f64> {
        lock(&self.state).prices.get(symbol).copied()
    }
}

/// Level + reason if `price` crosses the position's stop or target.
fn protective_fill(p: &Position, price: f64) -> Option<(f64, &'static str)> {
    let (stop_hit, target_hit) = match p.direction {
        Direction::Long => (
            p.stop_loss.filter(|sl| price <= *sl),
            p.take_profit.filter(|tp| price >= *tp),
        ),
        Direction::Short => (
            p.stop_loss.filter(|sl| price >= *sl),
            p.take_profit.filter(|tp| price <= *tp),
        ),
    };
    stop_hit
        .map(|sl| (sl, "stop_loss"))
        .or_else(|| target_hit.map(|tp| (tp, "take_profit")))
}

fn close_locked(
    st: &mut PaperState,
    ticket: u64,
    volume: Option<f64>,
    price: f64,
    value_per_point: f64,
) -> BrokerResult<CloseResult> {
    let pos = st.open.get_mut(&ticket).ok_or(BrokerError::PositionNotFound(ticket))?;
    let volume = volume.map(|v| v.min(pos.volume)).unwrap_or(pos.volume);
    let profit = pos.unrealised_points(price) * volume * value_per_point;
    st.balance += profit;

    if volume + 1e-9 < pos.volume {
        pos.volume -= volume;
    } else if let Some(mut done) = st.open.remove(&ticket) {
        done.closed_at = Some(Utc::now());
        done.profit = Some(profit);
        st.closed.push(done);
    }

    Ok(CloseResult { ticket, close_price: price, profit, volume })
}

impl Broker for PaperBroker {
    fn get_bars(&self, symbol: &str, timeframe: &Timeframe, count: usize) -> BrokerResult<Vec<Bar>> {
        let st = lock(&self.state);
        if let Some(err) = &st.bars_error {
            return Err(err.clone());
        }
        let series = st
            .bars
            .get(&(symbol.to_string(), timeframe.clone()))
            .map(Vec::as_slice)
            .unwrap_or_default();
        let start = series.len().saturating_sub(count);
        Ok(series[start..].to_vec())
    }

    fn quote(&self, symbol: &str) -> BrokerResult<Quote> {
        let bid = lock(&self.state)
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::NoData { symbol: symbol.to_string(), timeframe: "tick".into() })?;
        Ok(Quote { bid, ask: bid + self.spread })
    }

    fn place_order(&self, order: &OrderRequest) -> BrokerResult<OrderTicket> {
        let mut st = lock(&self.state);
        if st.reject_next > 0 {
            st.reject_next -= 1;
            return Err(BrokerError::Rejected {
                retcode: 10006,
                comment: "paper: request rejected".into(),
            });
        }

        let fill_price = match st.prices.get(&order.symbol).copied() {
            Some(bid) => Quote { bid, ask: bid + self.spread }.entry_price(order.direction),
            None => order.price,
        };
        let ticket = st.next_ticket;
        st.next_ticket += 1;
        st.open.insert(
            ticket,
            Position {
                ticket,
                symbol:      order.symbol.clone(),
                direction:   order.direction,
                volume:      order.volume,
                entry_price: fill_price,
                stop_loss:   Some(order.stop_loss),
                take_profit: order.take_profit,
                tag:         order.tag,
                comment:     order.comment.clone(),
                opened_at:   Utc::now(),
                closed_at:   None,
                profit:      None,
            },
        );
        debug!(ticket, symbol = %order.symbol, volume = order.volume, fill_price, "📄 paper: order filled");
        Ok(OrderTicket { ticket, fill_price })
    }

    fn close_position(&self, ticket: u64, volume: Option<f64>) -> BrokerResult<CloseResult> {
        let mut st = lock(&self.state);
        let symbol = st
            .open
            .get(&ticket)
            .map(|p| p.symbol.clone())
            .ok_or(BrokerError::PositionNotFound(ticket))?;
        let price = match st.prices.get(&symbol).copied() {
            Some(p) => p,
            None => st.open.get(&ticket).map(|p| p.entry_price).unwrap_or_default(),
        };
        close_locked(&mut st, ticket, volume, price, self.value_per_point)
    }

    fn modify_position(&self, ticket: u64, stop_loss: Option<f64>, take_profit: Option<f64>) -> BrokerResult<()> {
        let mut st = lock(&self.state);
        st.modify_calls.push(ModifyCall { ticket, stop_loss, take_profit });
        if st.fail_modify > 0 {
            st.fail_modify -= 1;
            return Err(BrokerError::Rejected { retcode: 10016, comment: "paper: invalid stops".into() });
        }
        let pos = st.open.get_mut(&ticket).ok_or(BrokerError::PositionNotFound(ticket))?;
        if stop_loss.is_some() {
            pos.stop_loss = stop_loss;
        }
        if take_profit.is_some() {
            pos.take_profit = take_profit;
        }
        Ok(())
    }

    fn account_summary(&self) -> BrokerResult<AccountSummary> {
        let st = lock(&self.state);
        let unrealised: f64 = st
            .open
            .values()
            .map(|p| {
                let price = st.prices.get(&p.symbol).copied().unwrap_or(p.entry_price);
                p.unrealised_points(price) * p.volume * self.value_per_point
            })
            .sum();
        Ok(AccountSummary {
            balance: st.balance,
            equity:  st.balance + unrealised,
            margin:  0.0,
        })
    }

    fn open_positions(&self, symbol: Option<&str>) -> BrokerResult<Vec<Position>> {
        Ok(lock(&self.state)
            .open
            .values()
            .filter(|p| symbol.map_or(true, |s| p.symbol == s))
            .cloned()
            .collect())
    }
}

//! # broker::mt5
//!
//! HTTP bridge to an MT5 Expert Advisor.
//!
//! ## EA API Contract
//! | Method | Path                 | Body / Query                                   |
//! |--------|----------------------|------------------------------------------------|
//! | GET    | `/api/market/bars`   | `symbol`, `timeframe`, `count`                 |
//! | GET    | `/api/market/tick`   | `symbol`                                       |
//! | POST   | `/order/send`        | [`Mt5OrderRequest`]                            |
//! | POST   | `/position/close`    | `{ ticket, volume? }`                          |
//! | POST   | `/position/modify`   | `{ ticket, sl?, tp? }`                         |
//! | GET    | `/account/summary`   |                                                |
//! | GET    | `/positions`         | `symbol?`                                      |
//!
//! Trade endpoints answer `{ "retcode": 10009, "order": 123456, "comment": ".." }`;
//! retcode 10009 (`TRADE_RETCODE_DONE`) is the only success.
//!
//! Calls are blocking: the adapter is driven from inside synchronous bus
//! delivery, which the daemon runs on blocking worker threads.

use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::broker::{AccountSummary, Broker, BrokerResult, CloseResult, OrderRequest, OrderTicket, Quote};
use crate::error::BrokerError;
use crate::models::{Bar, Direction, Position, PositionTag, Timeframe};

pub const RETCODE_DONE: u32 = 10009;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

// ─── Wire Types ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct Mt5OrderRequest {
    pub symbol:  String,
    pub action:  &'static str, // "BUY" | "SELL"
    pub volume:  f64,
    pub price:   f64,
    pub sl:      f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tp:      Option<f64>,
    pub comment: String,
    pub magic:   u64,
}

impl From<&OrderRequest> for Mt5OrderRequest {
    fn from(order: &OrderRequest) -> Self {
        Self {
            symbol:  order.symbol.clone(),
            action:  match order.direction {
                Direction::Long  => "BUY",
                Direction::Short => "SELL",
            },
            volume:  order.volume,
            price:   order.price,
            sl:      order.stop_loss,
            tp:      order.take_profit,
            comment: order.comment.clone(),
            magic:   order.tag.magic(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Mt5TradeResponse {
    pub retcode: u32,
    pub order:   Option<u64>,
    #[serde(default)]
    pub price:   Option<f64>,
    #[serde(default)]
    pub profit:  Option<f64>,
    #[serde(default)]
    pub volume:  Option<f64>,
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Mt5Bar {
    /// Open time, unix seconds.
    time:        i64,
    open:        f64,
    high:        f64,
    low:         f64,
    close:       f64,
    #[serde(default)]
    tick_volume: f64,
}

/// Last `MqlTick` for a symbol.
#[derive(Debug, Deserialize)]
struct Mt5Tick {
    bid: f64,
    ask: f64,
}

#[derive(Debug, Deserialize)]
struct Mt5BarsResponse {
    bars: Vec<Mt5Bar>,
}

#[derive(Debug, Deserialize)]
struct Mt5Position {
    ticket:     u64,
    symbol:     String,
    #[serde(rename = "type")]
    side:       String,
    volume:     f64,
    price_open: f64,
    #[serde(default)]
    sl:         f64,
    #[serde(default)]
    tp:         f64,
    #[serde(default)]
    magic:      u64,
    #[serde(default)]
    comment:    String,
    time:       i64,
}

#[derive(Debug, Deserialize)]
struct Mt5PositionsResponse {
    positions: Vec<Mt5Position>,
}

// ─── Bridge ───────────────────────────────────────────────────────────────────

pub struct Mt5Bridge {
    base_url:      String,
    timeout:       Duration,
    order_retries: u32,
    /// Built on first use, from a blocking thread.
    client:        OnceLock<Client>,
}

impl Mt5Bridge {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url:      base_url.into().trim_end_matches('/').to_string(),
            timeout:       DEFAULT_TIMEOUT,
            order_retries: 2,
            client:        OnceLock::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Extra attempts after a transport failure on order submission.
    /// Terminal rejections are never retried.
    pub fn with_order_retries(mut self, retries: u32) -> Self {
        self.order_retries = retries;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn client(&self) -> BrokerResult<&Client> {
        if let Some(c) = self.client.get() {
            return Ok(c);
        }
        let built = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| BrokerError::Unreachable(format!("http client: {e}")))?;
        Ok(self.client.get_or_init(|| built))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> BrokerResult<T> {
        let response = self
            .client()?
            .get(self.url(path))
            .query(query)
            .send()
            .map_err(|e| {
                error!(error = %e, path, "MT5 unreachable");
                BrokerError::Unreachable(e.to_string())
            })?;
        decode(response)
    }

    fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> BrokerResult<T> {
        let response = self
            .client()?
            .post(self.url(path))
            .json(body)
            .send()
            .map_err(|e| {
                error!(error = %e, path, "MT5 unreachable");
                BrokerError::Unreachable(e.to_string())
            })?;
        decode(response)
    }

    fn trade<B: Serialize>(&self, path: &str, body: &B) -> BrokerResult<Mt5TradeResponse> {
        let resp: Mt5TradeResponse = self.post(path, body)?;
        if resp.retcode != RETCODE_DONE {
            let comment = resp.comment.unwrap_or_else(|| "unknown".into());
            warn!(retcode = resp.retcode, %comment, path, "MT5 rejected request");
            return Err(BrokerError::Rejected { retcode: resp.retcode, comment });
        }
        Ok(resp)
    }
}

fn decode<T: DeserializeOwned>(response: reqwest::blocking::Response) -> BrokerResult<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        error!(http_status = %status, body = %body, "MT5 returned HTTP error");
        return Err(BrokerError::Unreachable(format!("MT5 HTTP {status}: {body}")));
    }
    response.json().map_err(|e| {
        error!(error = %e, "MT5 response parse failed");
        BrokerError::Protocol(e.to_string())
    })
}

fn from_unix(secs: i64) -> BrokerResult<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| BrokerError::Protocol(format!("invalid timestamp {secs}")))
}

impl Broker for Mt5Bridge {
    fn get_bars(&self, symbol: &str, timeframe: &Timeframe, count: usize) -> BrokerResult<Vec<Bar>> {
        let resp: Mt5BarsResponse = self.get(
            "/api/market/bars",
            &[
                ("symbol", symbol.to_string()),
                ("timeframe", timeframe.to_string()),
                ("count", count.to_string()),
            ],
        )?;

        resp.bars
            .into_iter()
            .map(|b| {
                Ok(Bar {
                    symbol:    symbol.to_string(),
                    timeframe: timeframe.clone(),
                    open_time: from_unix(b.time)?,
                    open:      b.open,
                    high:      b.high,
                    low:       b.low,
                    close:     b.close,
                    volume:    b.tick_volume,
                })
            })
            .collect()
    }

    fn quote(&self, symbol: &str) -> BrokerResult<Quote> {
        let tick: Mt5Tick = self.get("/api/market/tick", &[("symbol", symbol.to_string())])?;
        if tick.bid <= 0.0 || tick.ask <= 0.0 {
            return Err(BrokerError::NoData { symbol: symbol.to_string(), timeframe: "tick".into() });
        }
        Ok(Quote { bid: tick.bid, ask: tick.ask })
    }

    fn place_order(&self, order: &OrderRequest) -> BrokerResult<OrderTicket> {
        let wire = Mt5OrderRequest::from(order);
        info!(
            symbol = %wire.symbol,
            action = %wire.action,
            volume = wire.volume,
            price  = wire.price,
            sl     = wire.sl,
            tp     = ?wire.tp,
            "🚀 [MT5] sending order"
        );

        let mut attempt = 0;
        loop {
            match self.trade("/order/send", &wire) {
                Ok(resp) => {
                    let ticket = resp
                        .order
                        .ok_or_else(|| BrokerError::Protocol("retcode DONE without ticket".into()))?;
                    info!(ticket, "✅ [MT5] order accepted");
                    return Ok(OrderTicket { ticket, fill_price: resp.price.unwrap_or(wire.price) });
                }
                Err(BrokerError::Unreachable(e)) if attempt < self.order_retries => {
                    attempt += 1;
                    warn!(attempt, max = self.order_retries, error = %e, "MT5 order send failed — retrying");
                    thread::sleep(RETRY_BACKOFF * attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn close_position(&self, ticket: u64, volume: Option<f64>) -> BrokerResult<CloseResult> {
        let resp = self.trade(
            "/position/close",
            &serde_json::json!({ "ticket": ticket, "volume": volume }),
        )?;
        Ok(CloseResult {
            ticket,
            close_price: resp.price.unwrap_or_default(),
            profit:      resp.profit.unwrap_or_default(),
            volume:      resp.volume.or(volume).unwrap_or_default(),
        })
    }

    fn modify_position(&self, ticket: u64, stop_loss: Option<f64>, take_profit: Option<f64>) -> BrokerResult<()> {
        self.trade(
            "/position/modify",
            &serde_json::json!({ "ticket": ticket, "sl": stop_loss, "tp": take_profit }),
        )?;
        Ok(())
    }

    fn account_summary(&self) -> BrokerResult<AccountSummary> {
        self.get("/account/summary", &[])
    }

    fn open_positions(&self, symbol: Option<&str>) -> BrokerResult<Vec<Position>> {
        let query: Vec<(&str, String)> = symbol.map(|s| ("symbol", s.to_string())).into_iter().collect();
        let resp: Mt5PositionsResponse = self.get("/positions", &query)?;

        resp.positions
            .into_iter()
            .map(|p| {
                let direction = match p.side.as_str() {
                    "BUY" => Direction::Long,
                    "SELL" => Direction::Short,
                    other => return Err(BrokerError::Protocol(format!("unknown position type '{other}'"))),
                };
                Ok(Position {
                    ticket:      p.ticket,
                    symbol:      p.symbol,
                    direction,
                    volume:      p.volume,
                    entry_price: p.price_open,
                    stop_loss:   (p.sl > 0.0).then_some(p.sl),
                    take_profit: (p.tp > 0.0).then_some(p.tp),
                    tag:         if p.magic == PositionTag::Manual.magic() {
                        PositionTag::Manual
                    } else {
                        PositionTag::Automated
                    },
                    comment:     p.comment,
                    opened_at:   from_unix(p.time)?,
                    closed_at:   None,
                    profit:      None,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_wire_format() {
        let order = OrderRequest {
            symbol:      "XAUUSD".into(),
            direction:   Direction::Short,
            volume:      0.5,
            price:       2000.0,
            stop_loss:   2010.0,
            take_profit: None,
            comment:     "trend".into(),
            tag:         PositionTag::Manual,
        };
        let json = serde_json::to_value(Mt5OrderRequest::from(&order)).unwrap();
        assert_eq!(json["action"], "SELL");
        assert_eq!(json["magic"], 420002);
        assert!(json.get("tp").is_none());
    }

    #[test]
    fn test_trade_response_parses() {
        let resp: Mt5TradeResponse =
            serde_json::from_str(r#"{ "retcode": 10009, "order": 123456, "comment": "Request completed" }"#).unwrap();
        assert_eq!(resp.retcode, RETCODE_DONE);
        assert_eq!(resp.order, Some(123456));
    }

    #[test]
    fn test_tick_parses() {
        let tick: Mt5Tick = serde_json::from_str(r#"{ "symbol": "XAUUSD", "bid": 2000.1, "ask": 2000.4, "time": 1 }"#).unwrap();
        assert_eq!(tick.bid, 2000.1);
        assert_eq!(tick.ask, 2000.4);
    }

    #[test]
    fn test_unreachable_bridge_is_a_broker_error() {
        // port 9 (discard) is closed on test hosts
        let bridge = Mt5Bridge::new("http://127.0.0.1:9/").with_timeout(Duration::from_millis(200));
        assert_eq!(bridge.base_url(), "http://127.0.0.1:9");
        let err = bridge.account_summary().unwrap_err();
        assert!(matches!(err, BrokerError::Unreachable(_)));
    }
}

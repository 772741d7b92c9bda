//! # api::routes

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::api::error::AppError;
use crate::api::SharedApiState;
use crate::events::{Command, CommandResponse, EventKind};
use crate::models::Direction;

const DEFAULT_EVENT_LIMIT: usize = 100;

/// Run a command through the bus and unwrap the response.
async fn send(state: &SharedApiState, command: Command) -> Result<serde_json::Value, AppError> {
    let response: CommandResponse = state.requests.request(command, state.request_timeout).await?;
    if response.ok {
        Ok(response.body)
    } else if response.is_not_found() {
        Err(AppError::NotFound(response.error.unwrap_or_default()))
    } else {
        Err(AppError::CommandFailed(response.error.unwrap_or_else(|| "command refused".into())))
    }
}

// ─── Health & history ─────────────────────────────────────────────────────────

/// GET /api/health — 200 when every stage is healthy, 503 otherwise.
pub async fn health(State(state): State<SharedApiState>) -> impl IntoResponse {
    let snapshot = state.orchestrator.snapshot();
    let status = if snapshot.healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(json!({ "ok": snapshot.healthy, "engine": snapshot })))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub kind:  Option<String>,
    pub limit: Option<usize>,
}

/// GET /api/events?kind=NEW_CANDLE&limit=50 — newest last.
pub async fn events(
    State(state): State<SharedApiState>,
    Query(q): Query<EventsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let kind = match q.kind.as_deref() {
        Some(name) => Some(EventKind::parse(name).ok_or_else(|| AppError::BadRequest(format!("unknown event kind '{name}'")))?),
        None => None,
    };
    let history = state.bus.history(kind);
    let limit = q.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    let tail = &history[history.len().saturating_sub(limit)..];

    Ok(Json(json!({
        "ok":     true,
        "count":  tail.len(),
        "events": tail,
    })))
}

// ─── Automation ───────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ToggleBody {
    pub reason: Option<String>,
    pub actor:  Option<String>,
}

impl ToggleBody {
    fn into_parts(self, default_reason: &str) -> (String, String) {
        (
            self.reason.unwrap_or_else(|| default_reason.to_string()),
            self.actor.unwrap_or_else(|| "api".to_string()),
        )
    }
}

/// GET /api/automation
pub async fn automation_status(State(state): State<SharedApiState>) -> Result<impl IntoResponse, AppError> {
    let body = send(&state, Command::QueryAutomation).await?;
    Ok(Json(json!({ "ok": true, "automation": body })))
}

/// POST /api/automation/enable
pub async fn enable_automation(
    State(state): State<SharedApiState>,
    body: Option<Json<ToggleBody>>,
) -> Result<impl IntoResponse, AppError> {
    let (reason, actor) = body.map(|Json(b)| b).unwrap_or_default().into_parts("Enabled via API");
    info!(%actor, %reason, "▶️ automation enable requested");
    let body = send(&state, Command::EnableAutomation { reason, actor }).await?;
    Ok(Json(json!({ "ok": true, "automation": body })))
}

/// POST /api/automation/disable
pub async fn disable_automation(
    State(state): State<SharedApiState>,
    body: Option<Json<ToggleBody>>,
) -> Result<impl IntoResponse, AppError> {
    let (reason, actor) = body.map(|Json(b)| b).unwrap_or_default().into_parts("Disabled via API");
    info!(%actor, %reason, "⏸️ automation disable requested");
    let body = send(&state, Command::DisableAutomation { reason, actor }).await?;
    Ok(Json(json!({ "ok": true, "automation": body })))
}

// ─── Strategies ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ConditionsQuery {
    pub symbol: Option<String>,
}

/// GET /api/strategies/:name/conditions — latest structured evaluation.
pub async fn strategy_conditions(
    State(state): State<SharedApiState>,
    Path(name): Path<String>,
    Query(q): Query<ConditionsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let symbol = q.symbol.unwrap_or_else(|| state.symbol.clone());
    let body = send(&state, Command::QueryConditions { strategy: name, symbol }).await?;
    Ok(Json(json!({ "ok": true, "conditions": body })))
}

// ─── Positions & manual orders ────────────────────────────────────────────────

/// GET /api/positions — trade groups tracked by the engine.
pub async fn positions(State(state): State<SharedApiState>) -> impl IntoResponse {
    let groups = state.execution.groups();
    Json(json!({
        "ok":     true,
        "count":  groups.len(),
        "groups": groups,
        "guard":  state.execution.guard_status(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ManualOrderBody {
    /// Risk config to size with (`SYMBOL/strategy`).
    pub strategy:  String,
    pub direction: Direction,
    pub price:     Option<f64>,
}

/// POST /api/orders — manual entry; bypasses the automation gate.
pub async fn manual_order(
    State(state): State<SharedApiState>,
    Json(body): Json<ManualOrderBody>,
) -> Result<impl IntoResponse, AppError> {
    let execution = state.execution.clone();
    let symbol = state.symbol.clone();
    // Broker calls are blocking.
    let outcome = tokio::task::spawn_blocking(move || {
        execution.submit_manual(&body.strategy, &symbol, body.direction, body.price)
    })
    .await
    .map_err(|e| AppError::Internal(anyhow::anyhow!("manual order task failed: {e}")))??;

    let placed = matches!(outcome, crate::stages::EntryOutcome::Placed { .. });
    Ok(Json(json!({ "ok": placed, "order": outcome })))
}

// ─── Live stream ──────────────────────────────────────────────────────────────

/// GET /ws/events — every bus event as a JSON text frame.
pub async fn ws_events(ws: WebSocketUpgrade, State(state): State<SharedApiState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedApiState) {
    let mut rx = state.stream.subscribe();
    let (mut sender, mut receiver) = socket.split();
    info!("🔌 event stream client connected");

    let hello = json!({ "kind": "SNAPSHOT", "engine": state.orchestrator.snapshot() }).to_string();
    if sender.send(Message::Text(hello)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => match result {
                Ok(frame) => {
                    if sender.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => debug!("event stream client lagged, skipped {n} events"),
                Err(RecvError::Closed) => break,
            },
            result = receiver.next() => match result {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(Message::Ping(data))) => {
                    let _ = sender.send(Message::Pong(data)).await;
                }
                _ => {}
            },
        }
    }

    info!("🔌 event stream client disconnected");
}

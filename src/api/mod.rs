//! # api — Operator façade
//!
//! A thin HTTP/WebSocket skin over the bus.  Nothing here holds engine state:
//! commands go through the [`RequestBroker`] (correlated request/response with
//! a timeout), reads come from bus history and stage snapshots.
//!
//! | Method   | Path                                  | Backed by                             |
//! |----------|---------------------------------------|---------------------------------------|
//! | GET      | `/api/health`                         | orchestrator snapshot (no auth)       |
//! | GET      | `/api/events?kind=&limit=`            | bus history                           |
//! | GET      | `/api/automation`                     | `QueryAutomation` command             |
//! | POST     | `/api/automation/enable`              | `EnableAutomation` command            |
//! | POST     | `/api/automation/disable`             | `DisableAutomation` command           |
//! | GET      | `/api/strategies/:name/conditions`    | `QueryConditions` command             |
//! | GET      | `/api/positions`                      | execution trade groups + guard status |
//! | POST     | `/api/orders`                         | manual order path                     |
//! | GET (WS) | `/ws/events`                          | every bus event as a JSON text frame  |

pub mod auth;
pub mod error;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::sync::broadcast;

use crate::bus::request::RequestBroker;
use crate::bus::{SharedBus, SubscriptionId};
use crate::pipeline::Pipeline;
use crate::service::orchestrator::Orchestrator;
use crate::stages::ExecutionStage;

/// Buffered frames per WebSocket client before it starts lagging.
const STREAM_CAPACITY: usize = 256;

pub struct ApiState {
    pub bus:             SharedBus,
    pub requests:        Arc<RequestBroker>,
    pub orchestrator:    Arc<Orchestrator>,
    pub execution:       ExecutionStage,
    pub symbol:          String,
    pub request_timeout: Duration,
    pub api_key:         Option<String>,
    pub stream:          broadcast::Sender<String>,
    bridge:              Vec<SubscriptionId>,
}

pub type SharedApiState = Arc<ApiState>;

impl ApiState {
    /// Taps every bus event into the WebSocket broadcast channel.
    pub fn new(
        pipeline: &Pipeline,
        symbol: impl Into<String>,
        request_timeout: Duration,
        api_key: Option<String>,
    ) -> SharedApiState {
        let (stream, _) = broadcast::channel(STREAM_CAPACITY);
        let tx = stream.clone();
        let bridge = pipeline.bus.subscribe_all("api::ws_bridge", move |event| {
            // No receivers is fine: nobody is watching.
            let _ = tx.send(event.to_json());
            Ok(())
        });

        Arc::new(Self {
            bus: Arc::clone(&pipeline.bus),
            requests: Arc::clone(&pipeline.requests),
            orchestrator: Arc::clone(&pipeline.orchestrator),
            execution: pipeline.execution.clone(),
            symbol: symbol.into(),
            request_timeout,
            api_key,
            stream,
            bridge,
        })
    }
}

impl Drop for ApiState {
    fn drop(&mut self) {
        for id in self.bridge.drain(..) {
            self.bus.unsubscribe(id);
        }
    }
}

pub fn router(state: SharedApiState) -> Router {
    Router::new()
        .route("/api/health",                      get(routes::health))
        .route("/api/events",                      get(routes::events))
        .route("/api/automation",                  get(routes::automation_status))
        .route("/api/automation/enable",           post(routes::enable_automation))
        .route("/api/automation/disable",          post(routes::disable_automation))
        .route("/api/strategies/:name/conditions", get(routes::strategy_conditions))
        .route("/api/positions",                   get(routes::positions))
        .route("/api/orders",                      post(routes::manual_order))
        .route("/ws/events",                       get(routes::ws_events))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), auth::require_api_key))
        .with_state(state)
}

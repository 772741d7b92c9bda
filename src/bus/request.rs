//! # bus::request
//!
//! Request/response on top of the fire-and-forget bus.
//!
//! ```text
//! request(cmd)
//!   1. pending[cid] = oneshot sender
//!   2. publish Command(cmd) with correlation_id = cid   (off the async thread)
//!   3. responder handles it and publishes CommandResponse with the same cid
//!   4. our CommandResponse handler removes pending[cid] and completes the oneshot
//!   5. await with a bounded timeout → RequestTimeout (service unavailable)
//! ```
//!
//! The waiting happens on the caller's task; the bus delivery path itself never
//! blocks on a pending request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{EventBus, SharedBus, SubscriptionId};
use crate::error::{EngineError, Result};
use crate::events::{Command, CommandResponse, Event, EventKind, EventPayload};
use crate::sync::lock;

type Pending = Arc<Mutex<HashMap<Uuid, oneshot::Sender<CommandResponse>>>>;

pub struct RequestBroker {
    bus:          SharedBus,
    pending:      Pending,
    subscription: SubscriptionId,
}

impl RequestBroker {
    pub fn new(bus: SharedBus) -> Self {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        let map = Arc::clone(&pending);
        let subscription = bus.subscribe(EventKind::CommandResponse, "request_broker::on_response", move |event| {
            let (Some(cid), EventPayload::CommandResponse(resp)) = (event.correlation_id, &event.payload) else {
                return Ok(());
            };
            if let Some(tx) = lock(&map).remove(&cid) {
                // Receiver gone = caller already timed out.
                let _ = tx.send(resp.clone());
            }
            Ok(())
        });

        Self { bus, pending, subscription }
    }

    /// Publish `command` and wait for its correlated response.
    pub async fn request(&self, command: Command, timeout: Duration) -> Result<CommandResponse> {
        let cid = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(cid, tx);

        debug!(correlation_id = %cid, ?command, "request: publishing command");

        // Handlers do blocking I/O (state file, broker).
        let bus = Arc::clone(&self.bus);
        let event = Event::correlated(EventPayload::Command(command), cid);
        tokio::task::spawn_blocking(move || bus.publish(event))
            .await
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("publish task failed: {e}")))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            _ => {
                lock(&self.pending).remove(&cid);
                warn!(correlation_id = %cid, ?timeout, "request: no response — service unavailable");
                Err(EngineError::RequestTimeout(timeout))
            }
        }
    }

    /// Number of requests still waiting (diagnostics).
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

impl Drop for RequestBroker {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.subscription);
    }
}

/// Publish `response` correlated to `request`.
///
/// Used by responders (Automation Manager, Strategy stage).
pub fn respond(bus: &EventBus, request: &Event, response: CommandResponse) {
    let cid = request.correlation_id.unwrap_or(request.id);
    bus.publish(Event::correlated(EventPayload::CommandResponse(response), cid));
}

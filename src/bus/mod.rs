//! # bus — in-process Event Bus
//!
//! Typed publish/subscribe router keyed by [`EventKind`].
//!
//! ```text
//! publish(e)
//!   ├─ record e in the replay history (ring buffer, oldest evicted)
//!   └─ for each handler registered to e.kind(), in registration order:
//!        ├─ Ok      → delivered += 1
//!        ├─ Err     → logged (event id + handler name), handler_errors += 1
//!        └─ panic   → caught, treated exactly like Err
//! ```
//!
//! Delivery is synchronous: the publisher's call stack includes every
//! handler.  Handlers must be non-blocking or hand long work off internally.
//! The subscriber table lock is **not** held while handlers run, so a handler
//! may publish, subscribe or unsubscribe re-entrantly.

pub mod history;
pub mod request;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tracing::{debug, error};

use crate::events::{Event, EventKind};
use crate::sync::{lock, read, write};

pub use history::{EventHistory, DEFAULT_HISTORY_CAPACITY};
pub use request::RequestBroker;

/// What a handler returns. Errors are isolated and counted, never propagated.
pub type HandlerResult = anyhow::Result<()>;

type Handler = Arc<dyn Fn(&Event) -> HandlerResult + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
struct Subscription {
    id:      SubscriptionId,
    /// Handler identity for logs, e.g. `"strategy::on_indicators"`.
    name:    Arc<str>,
    handler: Handler,
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BusMetrics {
    pub events_published:     u64,
    pub events_delivered:     u64,
    pub handler_errors:       u64,
    pub active_subscriptions: usize,
    pub history_len:          usize,
}

pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<Subscription>>>,
    history:     Mutex<EventHistory>,
    next_id:     AtomicU64,
    published:   AtomicU64,
    delivered:   AtomicU64,
    errors:      AtomicU64,
}

impl EventBus {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            history:     Mutex::new(EventHistory::new(history_capacity)),
            next_id:     AtomicU64::new(1),
            published:   AtomicU64::new(0),
            delivered:   AtomicU64::new(0),
            errors:      AtomicU64::new(0),
        }
    }

    /// Register `handler` for exactly one event kind.
    pub fn subscribe<F>(&self, kind: EventKind, name: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let sub = Subscription {
            id,
            name: Arc::from(name),
            handler: Arc::new(handler),
        };
        write(&self.subscribers).entry(kind).or_default().push(sub);
        debug!(?kind, handler = name, subscription = id.0, "bus: subscribed");
        id
    }

    /// Register one shared handler for every kind (operator stream taps).
    pub fn subscribe_all<F>(&self, name: &str, handler: F) -> Vec<SubscriptionId>
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        EventKind::ALL
            .iter()
            .map(|&kind| {
                let h = Arc::clone(&handler);
                self.subscribe(kind, name, move |e| h(e))
            })
            .collect()
    }

    /// Returns `false` if the id was unknown (already removed).
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = write(&self.subscribers);
        for list in subs.values_mut() {
            if let Some(pos) = list.iter().position(|s| s.id == id) {
                list.remove(pos);
                debug!(subscription = id.0, "bus: unsubscribed");
                return true;
            }
        }
        false
    }

    /// Deliver `event` to every handler of its kind, in registration order.
    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        self.published.fetch_add(1, Ordering::Relaxed);
        lock(&self.history).push(event.clone());

        // Snapshot the list so handlers can touch the table re-entrantly.
        let handlers: Vec<Subscription> = read(&self.subscribers)
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        for sub in &handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| (sub.handler)(&event)));
            self.delivered.fetch_add(1, Ordering::Relaxed);

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        event_id = %event.id,
                        ?kind,
                        handler  = %sub.name,
                        error    = %err,
                        "❌ bus: handler failed"
                    );
                }
                Err(panic) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    error!(
                        event_id = %event.id,
                        ?kind,
                        handler  = %sub.name,
                        panic    = %msg,
                        "💥 bus: handler panicked"
                    );
                }
            }
        }
    }

    /// Recorded events, oldest first, optionally filtered to one kind.
    pub fn history(&self, kind: Option<EventKind>) -> Vec<Event> {
        lock(&self.history).snapshot(kind)
    }

    /// Most recent recorded event of `kind`.
    pub fn latest(&self, kind: EventKind) -> Option<Event> {
        lock(&self.history).latest(kind)
    }

    pub fn metrics(&self) -> BusMetrics {
        let active = read(&self.subscribers).values().map(Vec::len).sum();
        BusMetrics {
            events_published:     self.published.load(Ordering::Relaxed),
            events_delivered:     self.delivered.load(Ordering::Relaxed),
            handler_errors:       self.errors.load(Ordering::Relaxed),
            active_subscriptions: active,
            history_len:          lock(&self.history).len(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

/// Convenience alias used by every stage.
pub type SharedBus = Arc<EventBus>;

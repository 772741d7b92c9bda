//! # automation — Automation State Manager
//!
//! Owns the single global gate that suppresses new automated entries and
//! automated position management.
//!
//! ```text
//! enable / disable(reason, actor)
//!   ├─ lock                                   (serialises concurrent callers)
//!   ├─ persist new record ── fail ──► memory untouched, CriticalError, Err
//!   ├─ swap in-memory state
//!   ├─ publish AutomationStateChanged         (only when the value changed)
//!   └─ unlock                                 (after every subscriber ran)
//! ```
//!
//! Consumers cache the flag from `AutomationStateChanged` and re-read the
//! manager only when they start; nothing reads it on the hot path.  Subscribers to that event must not call back
//! into `enable`/`disable` (the lock is held while it is delivered).

pub mod store;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::bus::request::respond;
use crate::bus::SharedBus;
use crate::error::Result;
use crate::events::{Command, CommandResponse, Event, EventKind, EventPayload};
use crate::service::{HealthTracker, Service, ServiceHealth, Subscriptions};
use crate::sync::lock;

pub use store::{AutomationState, FileStateStore, MemoryStateStore, StateStore};

pub const SERVICE_NAME: &str = "automation";

struct Inner {
    bus:      SharedBus,
    store:    Arc<dyn StateStore>,
    state:    Mutex<AutomationState>,
    health:   HealthTracker,
    subs:     Subscriptions,
    persists: AtomicU64,
    changes:  AtomicU64,
}

#[derive(Clone)]
pub struct AutomationManager {
    inner: Arc<Inner>,
}

impl AutomationManager {
    /// Load the persisted state once.
    ///
    /// Resolution order: stored record → `env_default` → enabled.  A corrupt
    /// or unreadable store falls back to the default and logs an error.
    pub fn load(
        bus: SharedBus,
        store: Arc<dyn StateStore>,
        env_default: Option<bool>,
        max_errors: u64,
    ) -> Self {
        let fallback = env_default.unwrap_or(true);
        let state = match store.load() {
            Ok(Some(state)) => {
                info!(enabled = state.enabled, updated_by = %state.updated_by, "🔐 automation state restored");
                state
            }
            Ok(None) => {
                info!(enabled = fallback, "no persisted automation state — using default");
                AutomationState::initial(fallback, "default")
            }
            Err(e) => {
                error!(error = %e, enabled = fallback, "❌ automation state unreadable — falling back to default");
                AutomationState::initial(fallback, "default")
            }
        };

        Self {
            inner: Arc::new(Inner {
                bus,
                store,
                state:    Mutex::new(state),
                health:   HealthTracker::new(SERVICE_NAME, max_errors),
                subs:     Subscriptions::default(),
                persists: AtomicU64::new(0),
                changes:  AtomicU64::new(0),
            }),
        }
    }

    pub fn enable(&self, reason: &str, actor: &str) -> Result<AutomationState> {
        self.inner.set(true, reason, actor)
    }

    pub fn disable(&self, reason: &str, actor: &str) -> Result<AutomationState> {
        self.inner.set(false, reason, actor)
    }

    pub fn query(&self) -> AutomationState {
        lock(&self.inner.state).clone()
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        lock(&self.inner.state).enabled
    }
}

impl Inner {
    fn set(&self, enabled: bool, reason: &str, actor: &str) -> Result<AutomationState> {
        let mut state = lock(&self.state);
        let previous = state.enabled;
        let next = AutomationState {
            enabled,
            last_updated: Utc::now(),
            updated_by:   actor.to_string(),
            reason:       reason.to_string(),
        };

        if let Err(e) = self.store.save(&next) {
            let message = format!("automation state not persisted, change rolled back: {e}");
            error!(enabled, actor, reason, error = %e, "💀 {message}");
            self.health.record_error(message.clone());
            self.bus.publish(Event::new(EventPayload::CriticalError {
                source: SERVICE_NAME.into(),
                message,
            }));
            return Err(e.into());
        }
        self.persists.fetch_add(1, Ordering::Relaxed);
        *state = next.clone();

        if previous == enabled {
            debug!(enabled, actor, "automation state confirmed (unchanged)");
            return Ok(next);
        }

        if enabled {
            info!(actor, reason, "🟢 automation ENABLED");
        } else {
            warn!(actor, reason, "🔴 automation DISABLED — new entries and position management paused");
        }
        self.changes.fetch_add(1, Ordering::Relaxed);
        self.health.record_published();
        self.bus.publish(Event::new(EventPayload::AutomationStateChanged {
            previous,
            enabled,
            reason:     next.reason.clone(),
            actor:      next.updated_by.clone(),
            changed_at: next.last_updated,
        }));
        Ok(next)
    }

    fn on_command(&self, event: &Event) -> anyhow::Result<()> {
        let EventPayload::Command(command) = &event.payload else {
            return Ok(());
        };

        let outcome = match command {
            Command::EnableAutomation { reason, actor } => self.set(true, reason, actor),
            Command::DisableAutomation { reason, actor } => self.set(false, reason, actor),
            Command::QueryAutomation => Ok(lock(&self.state).clone()),
            Command::QueryConditions { .. } => return Ok(()),
        };
        self.health.record_received();

        let response = match outcome {
            Ok(state) => CommandResponse::ok(serde_json::to_value(&state)?),
            Err(e) => CommandResponse::failed(e.to_string()),
        };
        respond(&self.bus, event, response);
        Ok(())
    }
}

impl Service for AutomationManager {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    fn start(&self) -> Result<()> {
        if !self.inner.health.mark_running() {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let id = self
            .inner
            .bus
            .subscribe(EventKind::Command, "automation::on_command", move |e| inner.on_command(e));
        self.inner.subs.push(id);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.inner.subs.clear(&self.inner.bus);
        self.inner.health.mark_stopped();
        Ok(())
    }

    fn health_check(&self) -> ServiceHealth {
        self.inner.health.snapshot()
    }

    fn metrics(&self) -> serde_json::Value {
        let state = self.query();
        serde_json::json!({
            "enabled":      state.enabled,
            "last_updated": state.last_updated,
            "updated_by":   state.updated_by,
            "persists":     self.inner.persists.load(Ordering::Relaxed),
            "changes":      self.inner.changes.load(Ordering::Relaxed),
        })
    }
}

// ─── Consumer-side cache ──────────────────────────────────────────────────────

/// The locally cached gate held by Strategy and Execution.
///
/// Seeded at construction, re-seeded from the bound manager on every start,
/// updated through `AutomationStateChanged` while running.
pub struct AutomationGate {
    enabled: std::sync::atomic::AtomicBool,
    source:  Option<AutomationManager>,
}

impl AutomationGate {
    /// A standalone gate; `resync` keeps whatever value it holds.
    pub fn new(initial: bool) -> Self {
        Self { enabled: std::sync::atomic::AtomicBool::new(initial), source: None }
    }

    pub fn bound(manager: &AutomationManager) -> Self {
        Self {
            enabled: std::sync::atomic::AtomicBool::new(manager.is_enabled()),
            source:  Some(manager.clone()),
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Apply an `AutomationStateChanged` event; other payloads are ignored.
    pub fn apply(&self, event: &Event) {
        if let EventPayload::AutomationStateChanged { enabled, .. } = event.payload {
            self.set(enabled);
        }
    }

    /// Catch up with the manager's current state.  Must not be called from an
    /// `AutomationStateChanged` subscriber.
    pub fn resync(&self) {
        if let Some(manager) = &self.source {
            self.set(manager.is_enabled());
        }
    }
}

impl From<bool> for AutomationGate {
    fn from(initial: bool) -> Self {
        Self::new(initial)
    }
}

impl From<&AutomationManager> for AutomationGate {
    fn from(manager: &AutomationManager) -> Self {
        Self::bound(manager)
    }
}

impl std::fmt::Debug for AutomationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutomationGate")
            .field("enabled", &self.is_enabled())
            .field("bound", &self.source.is_some())
            .finish()
    }
}

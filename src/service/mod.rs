//! # service — stage lifecycle contract
//!
//! Every pipeline stage implements [`Service`]:
//!
//! | Call           | Effect                                                            |
//! |----------------|-------------------------------------------------------------------|
//! | `start()`      | INITIALIZING/STOPPED → RUNNING, rebuild per-stage state, subscribe |
//! | `stop()`       | → STOPPED, clear per-stage state, unsubscribe                     |
//! | `health_check` | snapshot of status, last error, uptime, counters                  |
//! | `metrics`      | stage-specific counters as JSON                                   |
//!
//! [`HealthTracker`] is the shared bookkeeping each stage embeds.  It is
//! created on construction, mutated only by the owning stage, read by the
//! orchestrator.

pub mod orchestrator;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::bus::{EventBus, SubscriptionId};
use crate::error::Result;
use crate::sync::lock;

pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorSnapshot};

// ─── Contract ─────────────────────────────────────────────────────────────────

pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Idempotent from STOPPED / INITIALIZING; a no-op when already RUNNING.
    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    fn health_check(&self) -> ServiceHealth;

    fn metrics(&self) -> serde_json::Value;
}

// ─── Health ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    Initializing,
    Running,
    Stopped,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceHealth {
    pub name:             String,
    pub status:           ServiceStatus,
    /// RUNNING and fewer errors since the last start than the threshold.
    pub healthy:          bool,
    pub last_error:       Option<String>,
    pub uptime_secs:      i64,
    pub events_published: u64,
    pub events_received:  u64,
    pub errors:           u64,
    pub errors_since_start: u64,
}

#[derive(Debug)]
struct HealthState {
    status:     ServiceStatus,
    last_error: Option<String>,
    started_at: Option<DateTime<Utc>>,
}

/// Status + counters for one stage.
#[derive(Debug)]
pub struct HealthTracker {
    name:               String,
    max_errors:         u64,
    state:              Mutex<HealthState>,
    published:          AtomicU64,
    received:           AtomicU64,
    errors:             AtomicU64,
    errors_since_start: AtomicU64,
}

impl HealthTracker {
    /// `max_errors` — errors since start at which the stage reports unhealthy.
    pub fn new(name: &str, max_errors: u64) -> Self {
        Self {
            name:               name.to_string(),
            max_errors:         max_errors.max(1),
            state:              Mutex::new(HealthState {
                status:     ServiceStatus::Initializing,
                last_error: None,
                started_at: None,
            }),
            published:          AtomicU64::new(0),
            received:           AtomicU64::new(0),
            errors:             AtomicU64::new(0),
            errors_since_start: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ServiceStatus {
        lock(&self.state).status
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.status() == ServiceStatus::Running
    }

    /// Transition to RUNNING. Returns `false` if already running.
    pub fn mark_running(&self) -> bool {
        let mut st = lock(&self.state);
        if st.status == ServiceStatus::Running {
            return false;
        }
        info!(service = %self.name, from = ?st.status, "▶️  service running");
        st.status = ServiceStatus::Running;
        st.started_at = Some(Utc::now());
        st.last_error = None;
        self.errors_since_start.store(0, Ordering::Relaxed);
        true
    }

    pub fn mark_stopped(&self) {
        let mut st = lock(&self.state);
        if st.status != ServiceStatus::Stopped {
            info!(service = %self.name, from = ?st.status, "⏹️  service stopped");
        }
        st.status = ServiceStatus::Stopped;
        st.started_at = None;
    }

    /// Fatal-for-this-stage failure; the orchestrator will restart it.
    pub fn mark_error(&self, message: impl Into<String>) {
        let message = message.into();
        let mut st = lock(&self.state);
        error!(service = %self.name, error = %message, "service entered ERROR");
        st.status = ServiceStatus::Error;
        st.last_error = Some(message);
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.errors_since_start.fetch_add(1, Ordering::Relaxed);
    }

    /// A recoverable per-unit error (already logged / published by the caller).
    pub fn record_error(&self, message: impl Into<String>) {
        lock(&self.state).last_error = Some(message.into());
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.errors_since_start.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServiceHealth {
        let st = lock(&self.state);
        let errors_since_start = self.errors_since_start.load(Ordering::Relaxed);
        let uptime_secs = st
            .started_at
            .map(|t| (Utc::now() - t).num_seconds())
            .unwrap_or(0);

        ServiceHealth {
            name:             self.name.clone(),
            status:           st.status,
            healthy:          st.status == ServiceStatus::Running && errors_since_start < self.max_errors,
            last_error:       st.last_error.clone(),
            uptime_secs,
            events_published: self.published.load(Ordering::Relaxed),
            events_received:  self.received.load(Ordering::Relaxed),
            errors:           self.errors.load(Ordering::Relaxed),
            errors_since_start,
        }
    }
}

// ─── Subscriptions ────────────────────────────────────────────────────────────

/// The bus subscriptions a stage owns while RUNNING.
#[derive(Debug, Default)]
pub struct Subscriptions {
    ids: Mutex<Vec<SubscriptionId>>,
}

impl Subscriptions {
    pub fn push(&self, id: SubscriptionId) {
        lock(&self.ids).push(id);
    }

    pub fn len(&self) -> usize {
        lock(&self.ids).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every subscription from `bus`.
    pub fn clear(&self, bus: &EventBus) {
        for id in lock(&self.ids).drain(..) {
            bus.unsubscribe(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let h = HealthTracker::new("fetch", 3);
        assert_eq!(h.status(), ServiceStatus::Initializing);
        assert!(!h.snapshot().healthy);

        assert!(h.mark_running());
        assert!(!h.mark_running());
        assert!(h.snapshot().healthy);

        h.mark_stopped();
        assert_eq!(h.status(), ServiceStatus::Stopped);
        assert!(!h.snapshot().healthy);
    }

    #[test]
    fn test_error_budget_drives_health_and_resets_on_start() {
        let h = HealthTracker::new("fetch", 2);
        h.mark_running();
        h.record_error("one");
        assert!(h.snapshot().healthy);
        h.record_error("two");
        let snap = h.snapshot();
        assert!(!snap.healthy);
        assert_eq!(snap.last_error.as_deref(), Some("two"));

        h.mark_stopped();
        h.mark_running();
        let snap = h.snapshot();
        assert!(snap.healthy);
        assert_eq!(snap.errors, 2);
        assert_eq!(snap.errors_since_start, 0);
    }
}

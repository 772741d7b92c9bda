//! # service::orchestrator
//!
//! Owns the dependency-ordered stage list and keeps it alive.
//!
//! ```text
//! start_all:  Automation → Fetch → Indicators → Strategy → Execution
//! stop_all:   reverse
//!
//! run(shutdown):
//!   loop
//!     ├─ sleep(interval)  ─┐  whichever first
//!     ├─ shutdown signal  ─┘  → stop_all, return
//!     └─ for each stage: health_check
//!          └─ unhealthy + auto_restart → stop() then start() (that stage only)
//!               └─ consecutive failed restarts ≥ max → fatal: stop_all, Err
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::bus::{BusMetrics, SharedBus};
use crate::error::{EngineError, Result};
use crate::events::{Event, EventPayload};
use crate::service::{Service, ServiceHealth};
use crate::sync::lock;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub health_interval:      Duration,
    pub auto_restart:         bool,
    /// Consecutive failed restarts of one stage before giving up.
    pub max_restart_attempts: u32,
    /// Stop the loop after this many health passes (deterministic tests).
    pub max_iterations:       Option<u64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health_interval:      Duration::from_secs(30),
            auto_restart:         true,
            max_restart_attempts: 3,
            max_iterations:       None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RestartStats {
    pub restarts:             u32,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceReport {
    pub health:   ServiceHealth,
    pub metrics:  serde_json::Value,
    pub restarts: RestartStats,
}

/// Aggregated view for operators.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorSnapshot {
    pub healthy:    bool,
    pub iterations: u64,
    pub services:   Vec<ServiceReport>,
    pub bus:        BusMetrics,
}

pub struct Orchestrator {
    bus:        SharedBus,
    /// Start order. Stop order is the reverse.
    services:   Vec<Arc<dyn Service>>,
    config:     OrchestratorConfig,
    restarts:   Mutex<HashMap<String, RestartStats>>,
    iterations: AtomicU64,
}

impl Orchestrator {
    pub fn new(bus: SharedBus, services: Vec<Arc<dyn Service>>, config: OrchestratorConfig) -> Self {
        Self {
            bus,
            services,
            config,
            restarts:   Mutex::new(HashMap::new()),
            iterations: AtomicU64::new(0),
        }
    }

    pub fn services(&self) -> &[Arc<dyn Service>] {
        &self.services
    }

    /// Start every stage in dependency order. On failure, already-started
    /// stages are stopped in reverse and the error is returned.
    pub fn start_all(&self) -> Result<()> {
        for (idx, svc) in self.services.iter().enumerate() {
            info!(service = svc.name(), "🚀 starting service");
            if let Err(e) = svc.start() {
                error!(service = svc.name(), error = %e, "service failed to start — rolling back");
                for started in self.services[..idx].iter().rev() {
                    if let Err(stop_err) = started.stop() {
                        warn!(service = started.name(), error = %stop_err, "stop during rollback failed");
                    }
                }
                return Err(e);
            }
        }
        info!(count = self.services.len(), "✅ all services running");
        Ok(())
    }

    /// Stop every stage in reverse order. Errors are logged, never abort the sweep.
    pub fn stop_all(&self) {
        for svc in self.services.iter().rev() {
            info!(service = svc.name(), "stopping service");
            if let Err(e) = svc.stop() {
                warn!(service = svc.name(), error = %e, "service stop failed");
            }
        }
        info!("🛑 all services stopped");
    }

    /// Health/restart loop. Returns after shutdown (Ok), after
    /// `max_iterations` passes (Ok), or on a fatal restart failure (Err).
    /// Every exit path stops all stages.
    ///
    /// Health passes and shutdown run on the blocking pool: a restart may
    /// call into the broker.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            interval     = ?self.config.health_interval,
            auto_restart = self.config.auto_restart,
            "🩺 orchestrator health loop started"
        );

        loop {
            if let Some(max) = self.config.max_iterations {
                if self.iterations.load(Ordering::Relaxed) >= max {
                    info!(iterations = max, "orchestrator reached max iterations");
                    break;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.health_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown signal received");
                        break;
                    }
                    continue;
                }
            }

            self.iterations.fetch_add(1, Ordering::Relaxed);
            let me = Arc::clone(&self);
            let pass = tokio::task::spawn_blocking(move || me.check_once())
                .await
                .map_err(|e| EngineError::Internal(anyhow::anyhow!("health pass task failed: {e}")))
                .and_then(|r| r);
            if let Err(e) = pass {
                error!(error = %e, "💀 orchestrator fatal error — shutting down all services");
                let me = Arc::clone(&self);
                let message = e.to_string();
                let _ = tokio::task::spawn_blocking(move || {
                    me.bus.publish(Event::new(EventPayload::CriticalError {
                        source: "orchestrator".into(),
                        message,
                    }));
                    me.stop_all();
                })
                .await;
                return Err(e);
            }
        }

        let me = Arc::clone(&self);
        let _ = tokio::task::spawn_blocking(move || me.stop_all()).await;
        Ok(())
    }

    /// One health pass. Restarts unhealthy stages when enabled.
    pub fn check_once(&self) -> Result<()> {
        for svc in &self.services {
            let health = svc.health_check();
            if health.healthy {
                continue;
            }

            warn!(
                service    = svc.name(),
                status     = ?health.status,
                errors     = health.errors_since_start,
                last_error = ?health.last_error,
                "⚠️ service unhealthy"
            );

            if !self.config.auto_restart {
                continue;
            }

            self.restart(svc.as_ref())?;
        }
        Ok(())
    }

    fn restart(&self, svc: &dyn Service) -> Result<()> {
        let name = svc.name().to_string();
        info!(service = %name, "🔄 restarting service");

        if let Err(e) = svc.stop() {
            warn!(service = %name, error = %e, "stop before restart failed");
        }

        let outcome = svc.start();
        let mut restarts = lock(&self.restarts);
        let stats = restarts.entry(name.clone()).or_default();

        match outcome {
            Ok(()) => {
                stats.restarts += 1;
                stats.consecutive_failures = 0;
                info!(service = %name, restarts = stats.restarts, "✅ service restarted");
                Ok(())
            }
            Err(e) => {
                stats.consecutive_failures += 1;
                error!(
                    service  = %name,
                    attempt  = stats.consecutive_failures,
                    max      = self.config.max_restart_attempts,
                    error    = %e,
                    "restart failed"
                );
                if stats.consecutive_failures >= self.config.max_restart_attempts {
                    return Err(EngineError::RestartExhausted {
                        service:  name,
                        attempts: stats.consecutive_failures,
                    });
                }
                Ok(())
            }
        }
    }

    pub fn snapshot(&self) -> OrchestratorSnapshot {
        let restarts = lock(&self.restarts).clone();
        let services: Vec<ServiceReport> = self
            .services
            .iter()
            .map(|svc| ServiceReport {
                health:   svc.health_check(),
                metrics:  svc.metrics(),
                restarts: restarts.get(svc.name()).copied().unwrap_or_default(),
            })
            .collect();

        OrchestratorSnapshot {
            healthy:    services.iter().all(|s| s.health.healthy),
            iterations: self.iterations.load(Ordering::Relaxed),
            services,
            bus:        self.bus.metrics(),
        }
    }
}

//! # autopilot — trading engine daemon
//!
//! ```text
//!  ┌──────────────┐  getBars / orders   ┌────────────────────────────────────┐
//!  │  MT5 bridge  │ ◀─────────────────▶ │ Pipeline                           │
//!  │  (or paper)  │                     │ ├─ fetch loop        ⏱️             │
//!  └──────────────┘                     │ ├─ stages on the bus               │
//!                                       │ └─ orchestrator      🩺             │
//!  ┌──────────────┐  /api/* · /ws/events└────────────────────────────────────┘
//!  │  Operator    │ ◀──────────────────────────────────┘
//!  └──────────────┘
//! ```
//!
//! Environment variables are listed in `autopilot::config`.

use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use autopilot::api::{self, ApiState};
use autopilot::config::{EngineConfig, TradingPlan};
use autopilot::pipeline::Pipeline;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Load .env ──────────────────────────────────────────────────────────
    dotenvy::dotenv().ok();

    // ── 2. Structured logging ─────────────────────────────────────────────────
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("autopilot=debug".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    info!(r#"

  ╔═══════════════════════════════════════════════════════╗
  ║              AUTOPILOT — Trading Engine               ║
  ║   Fetch · Indicators · Strategy · Execution · Bus     ║
  ╚═══════════════════════════════════════════════════════╝"#);

    // ── 3. Configuration ──────────────────────────────────────────────────────
    let cfg = EngineConfig::from_env().context("invalid engine configuration")?;
    let plan = match &cfg.plan_path {
        Some(path) => TradingPlan::load(path)?,
        None => {
            warn!("TRADING_PLAN_PATH not set — running without strategies");
            TradingPlan::default()
        }
    };

    // ── 4. Build & start (blocking: broker client, state file) ────────────────
    let build_cfg = cfg.clone();
    let pipeline = tokio::task::spawn_blocking(move || -> anyhow::Result<Pipeline> {
        let broker = Pipeline::broker_for(&build_cfg);
        let pipeline = Pipeline::build(&build_cfg, &plan, broker)?;
        pipeline.orchestrator.start_all()?;
        Ok(pipeline)
    })
    .await
    .context("startup task failed")??;

    // ── 5. Background loops ───────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let fetch = pipeline.fetch.clone();
    let fetch_interval = cfg.fetch_interval;
    let fetch_shutdown = shutdown_rx.clone();
    let fetch_task = tokio::spawn(async move { fetch.run_loop(fetch_interval, fetch_shutdown).await });

    let orchestrator = std::sync::Arc::clone(&pipeline.orchestrator);
    let mut orchestrator_task = tokio::spawn(orchestrator.run(shutdown_rx.clone()));

    // ── 6. Operator façade ────────────────────────────────────────────────────
    let state = ApiState::new(&pipeline, cfg.symbol.clone(), cfg.request_timeout, cfg.api_key.clone());
    if cfg.api_key.is_none() {
        warn!("API_KEY not set — operator API is open (dev mode)");
    }
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = api::router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors),
    );

    let listener = tokio::net::TcpListener::bind(cfg.bind_addr)
        .await
        .with_context(|| format!("cannot bind {}", cfg.bind_addr))?;
    info!(addr = %cfg.bind_addr, symbol = %cfg.symbol, "🚀 Autopilot running");

    // ── 7. Serve until ctrl-c or a fatal orchestrator error ───────────────────
    let mut serve_shutdown = shutdown_tx.subscribe();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = serve_shutdown.changed().await;
    });
    let server_task = tokio::spawn(async move { server.await });

    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 ctrl-c received — shutting down");
            None
        }
        result = &mut orchestrator_task => Some(result),
    };

    let _ = shutdown_tx.send(true);
    let outcome = match finished {
        Some(result) => orchestrator_outcome(result),
        None => orchestrator_outcome(orchestrator_task.await),
    };
    if let Err(e) = fetch_task.await {
        warn!(error = %e, "fetch loop task ended abnormally");
    }
    match tokio::time::timeout(Duration::from_secs(5), server_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(error = %e, "HTTP server error"),
        Ok(Err(e)) => warn!(error = %e, "HTTP server task failed"),
        Err(_) => warn!("HTTP server did not stop within 5s"),
    }

    // Stops every stage (idempotent after the orchestrator's own shutdown)
    // and drops the broker client off the async runtime.
    tokio::task::spawn_blocking(move || {
        pipeline.orchestrator.stop_all();
        drop(pipeline);
    })
    .await
    .context("shutdown task failed")?;

    info!("👋 Autopilot stopped");
    outcome
}

fn orchestrator_outcome(result: Result<autopilot::Result<()>, tokio::task::JoinError>) -> anyhow::Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = %e, "💀 orchestrator stopped the engine");
            Err(e.into())
        }
        Err(e) => Err(anyhow::anyhow!("orchestrator task failed: {e}")),
    }
}

//! # autopilot
//!
//! Always-on automated trading engine for one symbol.
//!
//! ```text
//!             ┌──────────────────────────── EventBus ─────────────────────────────┐
//!  Broker ──▶ │ Fetch ─▶ Indicators/Regime ─▶ Strategy ─▶ Execution ─▶ Broker     │
//!             │            ▲ AutomationStateChanged ─┴──────────┘                 │
//!             │   AutomationManager (persisted gate)     Orchestrator (health)    │
//!             └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Stages never call each other: every hand-off is an [`events::Event`] on
//! the [`bus::EventBus`].  The daemon in `main.rs` builds a
//! [`pipeline::Pipeline`], runs the fetch loop and the orchestrator, and
//! exposes the [`api`] façade.

pub mod api;
pub mod automation;
pub mod broker;
pub mod bus;
pub mod conditions;
pub mod config;
pub mod error;
pub mod events;
pub mod indicators;
pub mod models;
pub mod pipeline;
pub mod risk;
pub mod service;
pub mod stages;

pub(crate) mod sync;

pub use error::{EngineError, Result};

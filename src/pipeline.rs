//! # pipeline
//!
//! Wires one engine instance together.
//!
//! ```text
//! EventBus(history)
//!   └─ AutomationManager   (loads the persisted gate first; stages seed from it)
//!       └─ Fetch → Indicators → Strategy → Execution
//!           └─ Orchestrator (start/stop order = the list above)
//! ```
//!
//! Building touches the broker adapter, which may own a blocking HTTP client:
//! from async code, build and drop a [`Pipeline`] inside `spawn_blocking`.

use std::sync::Arc;

use tracing::info;

use crate::automation::{AutomationManager, FileStateStore, StateStore};
use crate::broker::{Broker, Mt5Bridge, PaperBroker};
use crate::bus::request::RequestBroker;
use crate::bus::{EventBus, SharedBus};
use crate::config::{EngineConfig, TradingPlan};
use crate::error::Result;
use crate::service::orchestrator::Orchestrator;
use crate::service::Service;
use crate::stages::{ExecutionStage, FetchStage, IndicatorStage, StrategyStage};

pub struct Pipeline {
    pub bus:          SharedBus,
    pub broker:       Arc<dyn Broker>,
    pub automation:   AutomationManager,
    pub fetch:        FetchStage,
    pub indicators:   IndicatorStage,
    pub strategy:     StrategyStage,
    pub execution:    ExecutionStage,
    pub orchestrator: Arc<Orchestrator>,
    pub requests:     Arc<RequestBroker>,
}

impl Pipeline {
    /// Broker adapter selected by `MT5_BASE_URL`.
    pub fn broker_for(cfg: &EngineConfig) -> Arc<dyn Broker> {
        if cfg.uses_paper_broker() {
            info!(balance = cfg.paper_balance, "📄 using paper broker");
            Arc::new(PaperBroker::new(cfg.paper_balance))
        } else {
            info!(url = %cfg.mt5_base_url, "🔌 using MT5 bridge");
            Arc::new(Mt5Bridge::new(cfg.mt5_base_url.clone()).with_timeout(cfg.mt5_timeout))
        }
    }

    /// Build with the file-backed automation store at `cfg.automation_path`.
    pub fn build(cfg: &EngineConfig, plan: &TradingPlan, broker: Arc<dyn Broker>) -> Result<Self> {
        let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(cfg.automation_path.clone()));
        Self::build_with_store(cfg, plan, broker, store)
    }

    pub fn build_with_store(
        cfg: &EngineConfig,
        plan: &TradingPlan,
        broker: Arc<dyn Broker>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        cfg.validate()?;
        plan.validate(cfg)?;

        let bus: SharedBus = Arc::new(EventBus::new(cfg.history_capacity));
        let automation = AutomationManager::load(Arc::clone(&bus), store, cfg.automation_default, cfg.max_errors);
        let enabled = automation.is_enabled();

        let fetch = FetchStage::new(cfg.fetch_config(), Arc::clone(&broker), Arc::clone(&bus), cfg.max_errors)?;
        let indicators = if cfg.warm_up_bars > 0 {
            IndicatorStage::with_warm_up(
                cfg.indicator_config(plan),
                Arc::clone(&bus),
                cfg.max_errors,
                Arc::clone(&broker),
                cfg.warm_up_bars,
            )?
        } else {
            IndicatorStage::new(cfg.indicator_config(plan), Arc::clone(&bus), cfg.max_errors)?
        };
        let strategy = StrategyStage::new(plan.strategies.clone(), Arc::clone(&bus), &automation, cfg.max_errors)?;
        let execution = ExecutionStage::new(
            cfg.execution_config(plan),
            Arc::clone(&broker),
            Arc::clone(&bus),
            &automation,
            cfg.max_errors,
        )?;

        let services: Vec<Arc<dyn Service>> = vec![
            Arc::new(automation.clone()),
            Arc::new(fetch.clone()),
            Arc::new(indicators.clone()),
            Arc::new(strategy.clone()),
            Arc::new(execution.clone()),
        ];
        let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&bus), services, cfg.orchestrator_config()));
        let requests = Arc::new(RequestBroker::new(Arc::clone(&bus)));

        info!(
            symbol     = %cfg.symbol,
            timeframes = ?cfg.timeframes,
            strategies = plan.strategies.len(),
            automation = enabled,
            "🧩 pipeline built"
        );

        Ok(Self { bus, broker, automation, fetch, indicators, strategy, execution, orchestrator, requests })
    }
}

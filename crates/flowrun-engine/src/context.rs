//! Services the execution core depends on, constructed once at startup

use flowrun_callback::{CallbackCoordinator, CallbackNotifier, LocalNotifier};
use flowrun_core::{EngineConfig, Result};
use flowrun_expr::Evaluator;
use flowrun_metrics::MetricsCollector;
use flowrun_state_store::{MemoryStore, StateStore};
use flowrun_timer::{TimerFire, TimerService};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::action::ActionRegistry;

#[derive(Clone)]
pub struct EngineContext {
    pub config: EngineConfig,
    pub store: Arc<dyn StateStore>,
    pub metrics: Arc<MetricsCollector>,
    pub timers: Arc<TimerService>,
    pub callbacks: Arc<CallbackCoordinator>,
    pub actions: Arc<ActionRegistry>,
    pub evaluator: Evaluator,
}

impl EngineContext {
    /// Wire the services over `store` and `notifier`. The receiver carries
    /// timer fires and must be handed to the engine's dispatcher.
    pub fn build(
        config: EngineConfig,
        store: Arc<dyn StateStore>,
        notifier: Arc<dyn CallbackNotifier>,
        actions: ActionRegistry,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TimerFire>)> {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        let metrics = MetricsCollector::new(config.metrics_samples)
            .map_err(|e| flowrun_core::Error::internal(format!("metrics registry: {}", e)))?;
        let context = Self {
            timers: Arc::new(TimerService::new(
                store.clone(),
                config.namespace.clone(),
                fire_tx,
            )),
            callbacks: Arc::new(CallbackCoordinator::new(store.clone(), notifier, &config)),
            evaluator: Evaluator::new(config.expr_max_len),
            metrics: Arc::new(metrics),
            actions: Arc::new(actions),
            store,
            config,
        };
        Ok((context, fire_rx))
    }

    /// Single-process context: memory store, local notifier, built-in actions
    pub fn in_memory(config: EngineConfig) -> Result<(Self, mpsc::UnboundedReceiver<TimerFire>)> {
        Self::build(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(LocalNotifier::new()),
            ActionRegistry::with_builtins(),
        )
    }
}

#![allow(dead_code)]

use flowrun_core::{EngineConfig, FlowRun, RunStatus};
use flowrun_engine::{ActionError, EngineContext, FlowEngine, FnAction};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const TENANT: &str = "acme";

/// In-memory engine with its timer dispatcher running
pub fn engine() -> FlowEngine {
    let (ctx, fires) = EngineContext::in_memory(EngineConfig::default()).unwrap();
    let engine = FlowEngine::new(ctx);
    engine.spawn_timer_dispatcher(fires);
    engine
}

pub async fn register_action<F>(engine: &FlowEngine, name: &str, handler: F)
where
    F: Fn(Value, &Value) -> Result<Value, ActionError> + Send + Sync + 'static,
{
    engine
        .context()
        .actions
        .register(Arc::new(FnAction::new(name, "test action", handler)))
        .await;
}

/// Poll the stored snapshot until the run reaches `status`
pub async fn wait_for_status(engine: &FlowEngine, run_id: &str, status: RunStatus) -> FlowRun {
    for _ in 0..400 {
        let run = engine.get_run(TENANT, run_id).await.unwrap();
        if run.status == status {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    panic!("run {} never reached {:?}", run_id, status);
}

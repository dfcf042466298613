mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{engine, register_action, wait_for_status, TENANT};
use flowrun_callback::{callback_key, LocalNotifier};
use flowrun_core::{
    Edge, EngineConfig, EventConfig, ExecutionMode, FlowDefinition, FlowRun, NodeDefinition,
    NodeStatus, RunStatus, TimerConfig, TimerKind, WaitKind,
};
use flowrun_engine::{ActionRegistry, EngineContext, FlowEngine};
use flowrun_state_store::StateStore;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

fn callback_flow(timeout_secs: Option<u64>) -> FlowDefinition {
    FlowDefinition::new("vendor", "Vendor approval")
        .with_node(NodeDefinition::http_callback("wait", timeout_secs))
        .with_node(NodeDefinition::new("done", "passthrough"))
        .with_edge(Edge::new("wait", "done"))
}

fn callback_id(run: &FlowRun, node_id: &str) -> String {
    match run.node(node_id).and_then(|s| s.waiting_for.clone()) {
        Some(WaitKind::Callback { callback_id }) => callback_id,
        other => panic!("node {} is not waiting on a callback: {:?}", node_id, other),
    }
}

fn timer(kind: TimerKind) -> TimerConfig {
    TimerConfig {
        kind,
        cron: None,
        interval: None,
        timeout: None,
        end_date: None,
    }
}

#[tokio::test]
async fn test_callback_resumes_run() {
    let engine = engine();
    engine.register_flow(callback_flow(None)).unwrap();

    let run = engine.start_run(TENANT, "vendor", json!({})).await.unwrap();
    assert_eq!(run.status, RunStatus::Waiting);
    let id = callback_id(&run, "wait");
    let url = run.context["wait_callback_url"].as_str().unwrap().to_string();
    assert!(url.ends_with(&format!("callbackId={}", id)), "{}", url);
    assert!(engine.context().callbacks.is_pending(&id).await.unwrap());

    assert!(engine
        .handle_callback(&id, json!({"approved": true}))
        .await
        .unwrap());
    let run = wait_for_status(&engine, &run.run_id, RunStatus::Completed).await;
    assert_eq!(run.context["wait"], json!({"approved": true}));
    assert_eq!(run.node("done").unwrap().status, NodeStatus::Completed);
    assert_eq!(run.triggers, 1);
    assert_eq!(run.steps.len(), 2);

    assert!(!engine.handle_callback(&id, json!({})).await.unwrap());
}

#[tokio::test]
async fn test_callback_node_action_receives_url() {
    let engine = engine();
    let seen = Arc::new(Mutex::new(Value::Null));
    let sink = seen.clone();
    register_action(&engine, "notify_vendor", move |input, _| {
        *sink.lock().unwrap() = input;
        Ok(json!({"sent": true}))
    })
    .await;
    let mut wait = NodeDefinition::http_callback("wait", None);
    wait.action = Some("notify_vendor".into());
    engine
        .register_flow(FlowDefinition::new("vendor", "Vendor").with_node(wait))
        .unwrap();

    let run = engine.start_run(TENANT, "vendor", json!({})).await.unwrap();
    let id = callback_id(&run, "wait");
    let input = seen.lock().unwrap().clone();
    assert_eq!(input["callbackId"], json!(id));
    assert_eq!(input["callbackUrl"], run.context["wait_callback_url"]);
}

#[tokio::test]
async fn test_failing_callback_action_cancels_callback() {
    let engine = engine();
    register_action(&engine, "notify_vendor", |_, _| {
        Err(flowrun_engine::ActionError::failed("vendor unreachable"))
    })
    .await;
    let mut wait = NodeDefinition::http_callback("wait", None);
    wait.action = Some("notify_vendor".into());
    engine
        .register_flow(FlowDefinition::new("vendor", "Vendor").with_node(wait))
        .unwrap();

    let run = engine.start_run(TENANT, "vendor", json!({})).await.unwrap();
    assert_eq!(run.status, RunStatus::Error);
    let url = run.context["wait_callback_url"].as_str().unwrap();
    let id = url.rsplit("callbackId=").next().unwrap();
    assert!(!engine.context().callbacks.is_pending(id).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_callback_timeout_fails_run() {
    let engine = engine();
    engine.register_flow(callback_flow(Some(10))).unwrap();

    let run = engine.start_run(TENANT, "vendor", json!({})).await.unwrap();
    let id = callback_id(&run, "wait");

    let run = wait_for_status(&engine, &run.run_id, RunStatus::Error).await;
    let error = run.node("wait").unwrap().error.clone().unwrap();
    assert!(error.contains("Timeout"), "{}", error);
    assert_eq!(run.node("done").unwrap().status, NodeStatus::Pending);

    let ctx = engine.context();
    assert!(ctx
        .store
        .get(&ctx.config.namespace, &callback_key(&id))
        .await
        .unwrap()
        .is_none());
    assert!(!engine.handle_callback(&id, json!({})).await.unwrap());
}

#[tokio::test]
async fn test_callback_without_local_waiter_resumes_from_store() {
    let first = engine();
    first.register_flow(callback_flow(None)).unwrap();
    let run = first.start_run(TENANT, "vendor", json!({})).await.unwrap();
    let id = callback_id(&run, "wait");

    // Second replica: same store, its own notifier, flow never registered
    let shared = first.context();
    let (ctx, _fires) = EngineContext::build(
        EngineConfig::default(),
        shared.store.clone(),
        Arc::new(LocalNotifier::new()),
        ActionRegistry::with_builtins(),
    )
    .unwrap();
    let second = FlowEngine::new(ctx);

    assert!(second
        .handle_callback(&id, json!({"approved": false}))
        .await
        .unwrap());
    let run = second.get_run(TENANT, &run.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.context["wait"], json!({"approved": false}));
    assert_eq!(run.node("done").unwrap().status, NodeStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_timer_resumes_node() {
    let engine = engine();
    let mut config = timer(TimerKind::Timeout);
    config.timeout = Some(5);
    engine
        .register_flow(
            FlowDefinition::new("delay", "Delay")
                .with_node(NodeDefinition::timer("delay", config).with_input(json!({"reason": "cool-off"})))
                .with_node(NodeDefinition::new("after", "log"))
                .with_edge(Edge::new("delay", "after")),
        )
        .unwrap();

    let run = engine.start_run(TENANT, "delay", json!({})).await.unwrap();
    assert_eq!(run.status, RunStatus::Waiting);
    assert!(engine.context().timers.is_active(&run.run_id, "delay"));

    let run = wait_for_status(&engine, &run.run_id, RunStatus::Completed).await;
    assert_eq!(run.triggers, 1);
    assert!(run.context["delay_result"]["firedAt"].is_string());
    assert_eq!(run.context["delay_result"]["data"], json!({"reason": "cool-off"}));
    assert_eq!(run.node("after").unwrap().status, NodeStatus::Completed);
    assert!(!engine.context().timers.is_active(&run.run_id, "delay"));
}

#[tokio::test(start_paused = true)]
async fn test_interval_timer_ticks_until_end_date() {
    let engine = engine();
    let mut config = timer(TimerKind::Interval);
    config.interval = Some(10);
    config.end_date = Some(Utc::now() + ChronoDuration::seconds(25));
    engine
        .register_flow(
            FlowDefinition::new("poll", "Poll")
                .with_node(NodeDefinition::timer("every", config))
                .with_node(NodeDefinition::new("check", "passthrough"))
                .with_edge(Edge::new("every", "check")),
        )
        .unwrap();

    let run = engine.start_run(TENANT, "poll", json!({})).await.unwrap();
    assert_eq!(run.status, RunStatus::Waiting);

    let run = wait_for_status(&engine, &run.run_id, RunStatus::Completed).await;
    assert_eq!(run.triggers, 2);
    assert_eq!(run.node("every").unwrap().status, NodeStatus::Completed);
    assert_eq!(engine.context().metrics.node_durations("check").len(), 2);
    assert_eq!(run.context["every"]["tick"], json!(2));
}

#[tokio::test]
async fn test_recurring_timer_past_end_date_completes() {
    let engine = engine();
    let mut config = timer(TimerKind::Interval);
    config.interval = Some(60);
    config.end_date = Some(Utc::now() - ChronoDuration::seconds(1));
    engine
        .register_flow(
            FlowDefinition::new("stale", "Stale")
                .with_node(NodeDefinition::timer("every", config))
                .with_node(NodeDefinition::new("check", "log"))
                .with_edge(Edge::new("every", "check")),
        )
        .unwrap();

    let run = engine.start_run(TENANT, "stale", json!({})).await.unwrap();
    let run = wait_for_status(&engine, &run.run_id, RunStatus::Completed).await;
    assert_eq!(run.triggers, 0);
    assert_eq!(run.node("check").unwrap().status, NodeStatus::Pending);
}

#[tokio::test]
async fn test_cancel_run_releases_waits() {
    let engine = engine();
    let mut config = timer(TimerKind::Timeout);
    config.timeout = Some(3600);
    engine
        .register_flow(
            FlowDefinition::new("parallel", "Parallel")
                .with_node(NodeDefinition::timer("delay", config))
                .with_node(NodeDefinition::http_callback("wait", None)),
        )
        .unwrap();

    let run = engine.start_run(TENANT, "parallel", json!({})).await.unwrap();
    assert_eq!(run.status, RunStatus::Waiting);
    assert_eq!(run.waiting_nodes(), vec!["delay", "wait"]);
    let id = callback_id(&run, "wait");

    let cancelled = engine.cancel_run(TENANT, &run.run_id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Error);
    assert!(cancelled.waiting_nodes().is_empty());
    assert!(!engine.context().timers.is_active(&run.run_id, "delay"));
    assert!(!engine.context().callbacks.is_pending(&id).await.unwrap());
    assert_eq!(engine.context().metrics.active_flow_runs(), 0);

    let again = engine.cancel_run(TENANT, &run.run_id).await.unwrap();
    assert_eq!(again.status, RunStatus::Error);
    assert_eq!(again.ended_at, cancelled.ended_at);
    assert!(!engine.handle_callback(&id, json!({})).await.unwrap());
}

/// Suspend a run on a fresh runtime, then shut that runtime down so none
/// of its waiter tasks survive. Returns the store and the run id.
fn suspend_and_stop(flow: FlowDefinition) -> (Arc<dyn StateStore>, FlowRun) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let suspended = runtime.block_on(async {
        let first = engine();
        first.register_flow(flow).unwrap();
        let run = first.start_run(TENANT, "restart", json!({})).await.unwrap();
        assert_eq!(run.status, RunStatus::Waiting);
        (first.context().store.clone(), run)
    });
    drop(runtime);
    suspended
}

fn restarted(store: Arc<dyn StateStore>, flow: FlowDefinition) -> FlowEngine {
    let (ctx, fires) = EngineContext::build(
        EngineConfig::default(),
        store,
        Arc::new(LocalNotifier::new()),
        ActionRegistry::with_builtins(),
    )
    .unwrap();
    let engine = FlowEngine::new(ctx);
    engine.spawn_timer_dispatcher(fires);
    engine.register_flow(flow).unwrap();
    engine
}

fn restart_callback_flow(timeout_secs: u64) -> FlowDefinition {
    FlowDefinition::new("restart", "Restart")
        .with_node(NodeDefinition::http_callback("wait", Some(timeout_secs)))
        .with_node(NodeDefinition::new("done", "passthrough"))
        .with_edge(Edge::new("wait", "done"))
}

fn restart_event_flow(timeout_secs: u64) -> FlowDefinition {
    let mut wait = NodeDefinition::with_mode("wait", ExecutionMode::Event);
    wait.event = Some(EventConfig {
        name: "shipment_arrived".into(),
        timeout_secs: Some(timeout_secs),
    });
    FlowDefinition::new("restart", "Restart")
        .with_node(wait)
        .with_node(NodeDefinition::new("done", "passthrough"))
        .with_edge(Edge::new("wait", "done"))
}

fn block_on<F: std::future::Future>(work: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(work)
}

#[test]
fn test_restored_callback_still_times_out() {
    let (store, run) = suspend_and_stop(restart_callback_flow(2));
    let deadline = run.node("wait").unwrap().deadline.unwrap();
    assert!(deadline > Utc::now());

    block_on(async {
        let engine = restarted(store, restart_callback_flow(2));
        assert_eq!(engine.restore_waits().await.unwrap(), 1);

        let run = wait_for_status(&engine, &run.run_id, RunStatus::Error).await;
        let error = run.node("wait").unwrap().error.clone().unwrap();
        assert!(error.contains("Timeout"), "{}", error);
        assert_eq!(run.node("done").unwrap().status, NodeStatus::Pending);
        assert_eq!(engine.restore_waits().await.unwrap(), 0);
    });
}

#[test]
fn test_restored_callback_can_still_be_delivered() {
    let (store, run) = suspend_and_stop(restart_callback_flow(600));
    let id = callback_id(&run, "wait");

    block_on(async {
        let engine = restarted(store, restart_callback_flow(600));
        assert_eq!(engine.restore_waits().await.unwrap(), 1);
        assert!(engine.handle_callback(&id, json!({"ok": 1})).await.unwrap());

        let run = wait_for_status(&engine, &run.run_id, RunStatus::Completed).await;
        assert_eq!(run.context["wait"], json!({"ok": 1}));
        assert_eq!(engine.restore_waits().await.unwrap(), 0);
    });
}

#[test]
fn test_wait_that_expired_while_down_fails_on_restore() {
    let (store, run) = suspend_and_stop(restart_callback_flow(1));
    std::thread::sleep(std::time::Duration::from_millis(1500));

    block_on(async {
        let engine = restarted(store, restart_callback_flow(1));
        assert_eq!(engine.restore_waits().await.unwrap(), 1);

        let run = engine.get_run(TENANT, &run.run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Error);
        let error = run.node("wait").unwrap().error.clone().unwrap();
        assert!(error.contains("deadline"), "{}", error);
        assert_eq!(engine.restore_waits().await.unwrap(), 0);
    });
}

#[test]
fn test_restored_event_wait_still_times_out() {
    let (store, run) = suspend_and_stop(restart_event_flow(2));

    block_on(async {
        let engine = restarted(store, restart_event_flow(2));
        assert_eq!(engine.restore_waits().await.unwrap(), 1);

        let run = wait_for_status(&engine, &run.run_id, RunStatus::Error).await;
        let error = run.node("wait").unwrap().error.clone().unwrap();
        assert!(error.contains("not received"), "{}", error);
        assert_eq!(engine.emit_event("shipment_arrived", json!({})).await.unwrap(), 0);
    });
}

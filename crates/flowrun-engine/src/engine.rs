//! Flow execution core
//!
//! Drives a run through its graph one node at a time. Nodes that depend on
//! an outside event suspend the run; their resumption reloads the run
//! snapshot from the state store, so any process sharing the store can
//! continue it. All work on one run is serialized by a per-run lock.

use chrono::{DateTime, Utc};
use flowrun_callback::{generate_callback_url, CallbackOutcome};
use flowrun_core::{
    deadline_after, remaining_until, Error, ExecutionMode, FlowDefinition, FlowRun,
    NodeDefinition, Result, RetryPolicy, RunStatus, WaitKind, WaitingState,
};
use flowrun_state_store::{load, save};
use flowrun_timer::{FireEvent, TimerFire, TimerJob};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::action::{payload_error, ActionContext};
use crate::context::EngineContext;
use crate::graph::{error_edges, join_ready, select_edges, validate_flow};

/// Event waits outlive their timeout by this much; the timeout task owns
/// expiry, the TTL only reclaims records orphaned by a restart.
const EVENT_WAIT_GRACE: Duration = Duration::from_secs(60);

/// Background work that re-enters the engine. Boxed so the resume path
/// does not contain its own future type.
type Detached = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Store key of a run snapshot (tenant namespace)
pub fn run_key(run_id: &str) -> String {
    format!("flow_run:{}", run_id)
}

/// Store key of an event wait (engine namespace)
pub fn event_wait_key(event: &str, run_id: &str, node_id: &str) -> String {
    format!("event_wait:{}:{}:{}", event, run_id, node_id)
}

/// Store key marking a run with callback or event waits (engine namespace)
pub fn suspended_run_key(run_id: &str) -> String {
    format!("suspended_run:{}", run_id)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventWait {
    tenant_id: String,
    run_id: String,
    node_id: String,
    #[serde(default)]
    timeout_secs: u64,
    #[serde(default)]
    deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SuspendedRun {
    tenant_id: String,
}

enum NodeOutcome {
    Completed,
    Waiting,
    Failed(String),
}

/// Which suspension a resume call may end
#[derive(Debug, Clone, Copy)]
enum Resumes {
    Any,
    Input,
    Timer,
}

impl Resumes {
    fn accepts(self, waiting_for: Option<&WaitKind>) -> bool {
        match self {
            Resumes::Any => true,
            Resumes::Input => matches!(waiting_for, Some(WaitKind::Input)),
            Resumes::Timer => matches!(waiting_for, Some(WaitKind::Timer { .. })),
        }
    }
}

struct Inner {
    ctx: EngineContext,
    flows: RwLock<HashMap<String, Arc<FlowDefinition>>>,
    run_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Exclusive hold on one run. The lock entry goes away with its last
/// holder, so ids that never reach a terminal state leave nothing behind.
struct RunGuard {
    inner: Arc<Inner>,
    run_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self
            .inner
            .run_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if locks
            .get(&self.run_id)
            .map_or(false, |lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.run_id);
        }
    }
}

/// Handle to the execution core. Cheap to clone.
#[derive(Clone)]
pub struct FlowEngine {
    inner: Arc<Inner>,
}

impl FlowEngine {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                flows: RwLock::new(HashMap::new()),
                run_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.inner.ctx
    }

    // === Flow registry ===

    /// Validate and register a flow, replacing one with the same id
    pub fn register_flow(&self, flow: FlowDefinition) -> Result<()> {
        validate_flow(&flow, &self.inner.ctx.evaluator)?;
        info!(flow_id = %flow.id, nodes = flow.nodes.len(), "Flow registered");
        self.inner
            .flows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(flow.id.clone(), Arc::new(flow));
        Ok(())
    }

    pub fn flow(&self, flow_id: &str) -> Result<Arc<FlowDefinition>> {
        self.lookup_flow(flow_id)
            .ok_or_else(|| Error::FlowNotFound(flow_id.to_string()))
    }

    pub fn flows(&self) -> Vec<Arc<FlowDefinition>> {
        let flows = self.inner.flows.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<_> = flows.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    fn lookup_flow(&self, flow_id: &str) -> Option<Arc<FlowDefinition>> {
        self.inner
            .flows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(flow_id)
            .cloned()
    }

    // === Run operations ===

    /// Start a run of `flow_id` and drive it until it finishes or suspends
    pub async fn start_run(&self, tenant_id: &str, flow_id: &str, input: Value) -> Result<FlowRun> {
        let flow = self.flow(flow_id)?;
        let mut run = FlowRun::new(tenant_id, &flow, input);
        let _guard = self.lock_run(&run.run_id).await;

        self.persist(&run).await?;
        self.inner.ctx.metrics.flow_started(flow_id);
        info!(run_id = %run.run_id, flow_id = %flow_id, tenant_id = %tenant_id, "Flow run started");

        let entry: Vec<String> = flow.entry_nodes().iter().map(|n| n.id.clone()).collect();
        let failed = self.drive(&flow, &mut run, None, entry).await?;
        self.finalize(&mut run, failed).await?;
        Ok(run)
    }

    pub async fn get_run(&self, tenant_id: &str, run_id: &str) -> Result<FlowRun> {
        load::<FlowRun>(self.inner.ctx.store.as_ref(), tenant_id, &run_key(run_id))
            .await?
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))
    }

    /// Complete a waiting node with `result` and continue along its edges.
    /// Resuming a node that is not waiting is a logged no-op.
    pub async fn resume_node(
        &self,
        tenant_id: &str,
        run_id: &str,
        node_id: &str,
        result: Value,
    ) -> Result<FlowRun> {
        self.resume(tenant_id, run_id, node_id, result, Resumes::Any, None)
            .await
    }

    /// Supply input to a `wait_for_input` node
    pub async fn resume_with_input(
        &self,
        tenant_id: &str,
        run_id: &str,
        node_id: &str,
        input: Value,
    ) -> Result<FlowRun> {
        self.resume(tenant_id, run_id, node_id, input, Resumes::Input, None)
            .await
    }

    /// Fail a waiting node. Its error edges run if it has any, otherwise
    /// the run ends in `error`.
    pub async fn fail_node(
        &self,
        tenant_id: &str,
        run_id: &str,
        node_id: &str,
        message: &str,
    ) -> Result<FlowRun> {
        let _guard = self.lock_run(run_id).await;
        let mut run = self.get_run(tenant_id, run_id).await?;
        if !Self::is_resumable(&run, node_id, Resumes::Any) {
            warn!(run_id = %run_id, node_id = %node_id, "Node is not waiting, ignoring failure");
            return Ok(run);
        }
        let flow = self.flow(&run.flow_id)?;

        run.status = RunStatus::Running;
        self.record_failure(&flow, &mut run, node_id, message);
        let failed = match error_edges(&flow, node_id, &run.context, &self.inner.ctx.evaluator) {
            handlers if handlers.is_empty() => true,
            handlers => self.drive(&flow, &mut run, Some(node_id), handlers).await?,
        };
        self.finalize(&mut run, failed).await?;
        Ok(run)
    }

    /// Continue a paused manual node along `selected_next`, which must be
    /// one of the node's `manual_next` entries.
    pub async fn progress_manual_node(
        &self,
        tenant_id: &str,
        run_id: &str,
        node_id: &str,
        selected_next: &str,
        input: Option<Value>,
    ) -> Result<FlowRun> {
        let _guard = self.lock_run(run_id).await;
        let mut run = self.get_run(tenant_id, run_id).await?;
        let flow = self.flow(&run.flow_id)?;
        let node_def = flow
            .node(node_id)
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;

        if node_def.mode != ExecutionMode::Manual {
            return Err(Error::invalid_node(node_id, "not a manual node"));
        }
        if !node_def.manual_next.iter().any(|n| n == selected_next) {
            return Err(Error::invalid_node(
                node_id,
                format!("Invalid next node selection: {}", selected_next),
            ));
        }
        if !Self::is_resumable(&run, node_id, Resumes::Any) {
            warn!(run_id = %run_id, node_id = %node_id, "Manual node is not waiting, ignoring");
            return Ok(run);
        }

        if let Some(input) = &input {
            run.context
                .insert(format!("{}_input", node_id), input.clone());
        }
        let result = json!({ "selected": selected_next, "input": input });
        run.status = RunStatus::Running;
        run.triggers += 1;
        self.complete_node(node_def, &mut run, result, "Manually progressed");
        info!(run_id = %run_id, node_id = %node_id, selected = %selected_next, "Manual node progressed");

        let failed = self
            .drive(&flow, &mut run, Some(node_id), vec![selected_next.to_string()])
            .await?;
        self.finalize(&mut run, failed).await?;
        Ok(run)
    }

    /// Resume every node waiting on `event`. Returns how many resumed.
    pub async fn emit_event(&self, event: &str, data: Value) -> Result<usize> {
        let ctx = &self.inner.ctx;
        let pattern = format!("event_wait:{}:*", event);
        let keys = ctx.store.keys(&ctx.config.namespace, &pattern).await?;

        let mut resumed = 0;
        for key in keys {
            let Some(raw) = ctx.store.take(&ctx.config.namespace, &key).await? else {
                continue;
            };
            let wait: EventWait = serde_json::from_value(raw)?;
            match self
                .resume(&wait.tenant_id, &wait.run_id, &wait.node_id, data.clone(), Resumes::Any, None)
                .await
            {
                Ok(_) => resumed += 1,
                Err(e) => error!(
                    event = %event,
                    run_id = %wait.run_id,
                    node_id = %wait.node_id,
                    error = %e,
                    "Failed to resume event wait"
                ),
            }
        }
        debug!(event = %event, resumed, "Event emitted");
        Ok(resumed)
    }

    /// Inbound callback. Returns false when no waiting state matched
    /// (duplicate, late or unknown callback).
    pub async fn handle_callback(&self, callback_id: &str, data: Value) -> Result<bool> {
        match self
            .inner
            .ctx
            .callbacks
            .handle_callback(callback_id, data.clone())
            .await?
        {
            CallbackOutcome::Ignored => Ok(false),
            CallbackOutcome::Delivered(_) => Ok(true),
            CallbackOutcome::Orphaned(state) => {
                info!(
                    callback_id = %callback_id,
                    run_id = %state.run_id(),
                    "No local waiter for callback, resuming from persisted state"
                );
                let (tenant, run_id, node_id) = (
                    state.flow_run.tenant_id.clone(),
                    state.flow_run.run_id.clone(),
                    state.node_id().to_string(),
                );
                self.resume(&tenant, &run_id, &node_id, data, Resumes::Any, Some(*state))
                    .await?;
                Ok(true)
            }
        }
    }

    /// Apply one timer fire to its node
    pub async fn handle_timer_fire(&self, fire: TimerFire) -> Result<()> {
        let TimerFire {
            job_id,
            event,
            kind,
            tenant_id,
            flow_run_id,
            node_id,
            payload,
        } = fire;
        debug!(job_id = %job_id, ?event, ?kind, "Timer fired");

        match (event, kind) {
            (FireEvent::Tick, flowrun_core::TimerKind::Timeout) => {
                self.resume(&tenant_id, &flow_run_id, &node_id, payload, Resumes::Timer, None)
                    .await?;
            }
            (FireEvent::Tick, _) => {
                self.timer_tick(&tenant_id, &flow_run_id, &node_id, payload)
                    .await?;
            }
            (FireEvent::Expired, _) => {
                self.timer_expired(&tenant_id, &flow_run_id, &node_id, payload)
                    .await?;
            }
        }
        Ok(())
    }

    /// Feed timer fires into the engine until the channel closes
    pub fn spawn_timer_dispatcher(&self, mut fires: mpsc::UnboundedReceiver<TimerFire>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(fire) = fires.recv().await {
                let job_id = fire.job_id.clone();
                if let Err(e) = engine.handle_timer_fire(fire).await {
                    error!(job_id = %job_id, error = %e, "Timer misfire: resume failed");
                }
            }
            debug!("Timer dispatcher stopped");
        })
    }

    /// End a run in `error`, releasing every wait it holds
    pub async fn cancel_run(&self, tenant_id: &str, run_id: &str) -> Result<FlowRun> {
        let _guard = self.lock_run(run_id).await;
        let mut run = self.get_run(tenant_id, run_id).await?;
        if run.status.is_terminal() {
            info!(run_id = %run_id, status = ?run.status, "Flow run already finished");
            return Ok(run);
        }
        self.release_waits(&mut run, "Flow run cancelled").await;
        self.inner
            .ctx
            .timers
            .cleanup_run(run_id)
            .await
            .unwrap_or_else(|e| {
                warn!(run_id = %run_id, error = %e, "Failed to clean up timers");
                0
            });
        self.finalize(&mut run, true).await?;
        info!(run_id = %run_id, "Flow run cancelled");
        Ok(run)
    }

    // === Internals ===

    async fn lock_run(&self, run_id: &str) -> RunGuard {
        let lock = self
            .inner
            .run_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(run_id.to_string())
            .or_default()
            .clone();
        RunGuard {
            inner: self.inner.clone(),
            run_id: run_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn persist(&self, run: &FlowRun) -> Result<()> {
        let ctx = &self.inner.ctx;
        save(
            ctx.store.as_ref(),
            &run.tenant_id,
            &run_key(&run.run_id),
            run,
            Some(Duration::from_secs(ctx.config.run_ttl_secs)),
        )
        .await?;
        Ok(())
    }

    fn is_resumable(run: &FlowRun, node_id: &str, resumes: Resumes) -> bool {
        !run.status.is_terminal()
            && run.node(node_id).map_or(false, |s| {
                s.is_waiting() && resumes.accepts(s.waiting_for.as_ref())
            })
    }

    async fn resume(
        &self,
        tenant_id: &str,
        run_id: &str,
        node_id: &str,
        result: Value,
        resumes: Resumes,
        fallback: Option<WaitingState>,
    ) -> Result<FlowRun> {
        let _guard = self.lock_run(run_id).await;
        let stored = load::<FlowRun>(self.inner.ctx.store.as_ref(), tenant_id, &run_key(run_id)).await?;
        let (mut run, fallback_flow) = match (stored, fallback) {
            (Some(run), fallback) => (run, fallback.map(|s| s.flow)),
            (None, Some(state)) => (state.flow_run, Some(state.flow)),
            (None, None) => return Err(Error::RunNotFound(run_id.to_string())),
        };

        if !Self::is_resumable(&run, node_id, resumes) {
            warn!(
                run_id = %run_id,
                node_id = %node_id,
                status = ?run.node(node_id).map(|s| s.status),
                "Node is not waiting, ignoring resume"
            );
            return Ok(run);
        }

        let flow = match (self.lookup_flow(&run.flow_id), fallback_flow) {
            (Some(flow), _) => flow,
            (None, Some(flow)) => Arc::new(flow),
            (None, None) => return Err(Error::FlowNotFound(run.flow_id.clone())),
        };
        let node_def = flow
            .node(node_id)
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;

        run.status = RunStatus::Running;
        run.triggers += 1;
        self.complete_node(node_def, &mut run, result, "Resumed");
        info!(run_id = %run_id, node_id = %node_id, "Node resumed");

        let next = select_edges(&flow, node_id, &run.context, &self.inner.ctx.evaluator);
        let failed = self.drive(&flow, &mut run, Some(node_id), next).await?;
        self.finalize(&mut run, failed).await?;
        Ok(run)
    }

    /// Recurring timer tick: the timer node stays waiting, its successors
    /// run with the tick payload bound as the node result.
    async fn timer_tick(&self, tenant_id: &str, run_id: &str, node_id: &str, payload: Value) -> Result<()> {
        let _guard = self.lock_run(run_id).await;
        let mut run = self.get_run(tenant_id, run_id).await?;
        if !Self::is_resumable(&run, node_id, Resumes::Timer) {
            warn!(run_id = %run_id, node_id = %node_id, "Timer tick for a node that is not waiting");
            if run.status.is_terminal() {
                self.inner.ctx.timers.cleanup_timer(run_id, node_id).await?;
            }
            return Ok(());
        }
        let flow = self.flow(&run.flow_id)?;

        run.status = RunStatus::Running;
        run.triggers += 1;
        let tick = payload.get("tick").cloned().unwrap_or(Value::Null);
        run.node_mut(node_id).log(format!("Timer tick {}", tick));
        run.record_result(node_id, &payload);

        let next = select_edges(&flow, node_id, &run.context, &self.inner.ctx.evaluator);
        let failed = self.drive(&flow, &mut run, Some(node_id), next).await?;
        self.finalize(&mut run, failed).await
    }

    /// A recurring schedule ended: the timer node completes
    async fn timer_expired(&self, tenant_id: &str, run_id: &str, node_id: &str, payload: Value) -> Result<()> {
        let _guard = self.lock_run(run_id).await;
        let mut run = self.get_run(tenant_id, run_id).await?;
        if !Self::is_resumable(&run, node_id, Resumes::Timer) {
            debug!(run_id = %run_id, node_id = %node_id, "Timer expiry for a node that is not waiting");
            return Ok(());
        }
        let flow = self.flow(&run.flow_id)?;
        let node_def = flow
            .node(node_id)
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;

        run.status = RunStatus::Running;
        self.complete_node(node_def, &mut run, payload, "Timer schedule ended");
        // Edges are not followed again, but joins parked on this node may go
        let failed = self.drive(&flow, &mut run, Some(node_id), Vec::new()).await?;
        self.finalize(&mut run, failed).await
    }

    /// Execute queued nodes depth first until the queue drains or a node
    /// fails without an error edge. `start` holds the successors of
    /// `origin`. Returns whether the run failed.
    async fn drive(
        &self,
        flow: &FlowDefinition,
        run: &mut FlowRun,
        origin: Option<&str>,
        start: Vec<String>,
    ) -> Result<bool> {
        let mut queue: VecDeque<String> = VecDeque::new();
        admit(flow, run, &mut queue, origin, start);

        loop {
            let Some(node_id) = queue.pop_front().or_else(|| release_join(flow, run)) else {
                break;
            };
            let node_def = flow
                .node(&node_id)
                .ok_or_else(|| Error::NodeNotFound(node_id.clone()))?;

            let next = match self.execute_node(flow, run, node_def).await {
                NodeOutcome::Completed => {
                    select_edges(flow, &node_id, &run.context, &self.inner.ctx.evaluator)
                }
                NodeOutcome::Waiting => Vec::new(),
                NodeOutcome::Failed(_) => {
                    let handlers =
                        error_edges(flow, &node_id, &run.context, &self.inner.ctx.evaluator);
                    if handlers.is_empty() {
                        self.persist(run).await?;
                        return Ok(true);
                    }
                    handlers
                }
            };
            admit(flow, run, &mut queue, Some(&node_id), next);
            self.persist(run).await?;
        }
        Ok(false)
    }

    async fn execute_node(&self, flow: &FlowDefinition, run: &mut FlowRun, node_def: &NodeDefinition) -> NodeOutcome {
        let node_id = node_def.id.as_str();
        let started = Instant::now();
        run.node_mut(node_id).start();
        debug!(run_id = %run.run_id, node_id = %node_id, mode = ?node_def.mode, "Executing node");

        let outcome = match node_def.mode {
            ExecutionMode::Standard => self.run_action(flow, run, node_def, None).await.map(Some),
            ExecutionMode::HttpCallback => self.suspend_on_callback(flow, run, node_def).await.map(|_| None),
            ExecutionMode::Timer => self.suspend_on_timer(run, node_def).await.map(|_| None),
            ExecutionMode::Event => self.suspend_on_event(run, node_def).await.map(|_| None),
            ExecutionMode::Manual => {
                let state = run.node_mut(node_id);
                state.wait(WaitKind::Manual {
                    choices: node_def.manual_next.clone(),
                });
                state.log("Waiting for manual progression");
                Ok(None)
            }
            ExecutionMode::WaitForInput => {
                let state = run.node_mut(node_id);
                state.wait(WaitKind::Input);
                state.log("Waiting for user input");
                Ok(None)
            }
        };

        match outcome {
            Ok(Some(result)) => {
                let state = run.node_mut(node_id);
                state.complete(result.clone());
                state.log("Completed");
                run.record_result(node_id, &result);
                run.record_step(node_id, node_def.display_name());
                self.inner
                    .ctx
                    .metrics
                    .record_node_execution(node_id, started.elapsed());
                debug!(run_id = %run.run_id, node_id = %node_id, "Node completed");
                NodeOutcome::Completed
            }
            Ok(None) => {
                run.record_step(node_id, node_def.display_name());
                info!(
                    run_id = %run.run_id,
                    node_id = %node_id,
                    waiting_for = ?run.node(node_id).and_then(|s| s.waiting_for.clone()),
                    "Node waiting"
                );
                NodeOutcome::Waiting
            }
            Err(e) => {
                let message = match e {
                    Error::FlowExecution { message, .. } => message,
                    other => other.to_string(),
                };
                self.record_failure(flow, run, node_id, &message);
                NodeOutcome::Failed(message)
            }
        }
    }

    fn complete_node(&self, node_def: &NodeDefinition, run: &mut FlowRun, result: Value, note: &str) {
        let node_id = node_def.id.as_str();
        let state = run.node_mut(node_id);
        state.complete(result.clone());
        state.log(note);
        let elapsed = state.duration_ms().map(Duration::from_millis);
        run.record_result(node_id, &result);
        run.record_step(node_id, node_def.display_name());
        if let Some(elapsed) = elapsed {
            self.inner.ctx.metrics.record_node_execution(node_id, elapsed);
        }
    }

    fn record_failure(&self, flow: &FlowDefinition, run: &mut FlowRun, node_id: &str, message: &str) {
        let state = run.node_mut(node_id);
        state.fail(message);
        state.log(format!("Error: {}", message));
        run.errors += 1;
        run.context
            .insert(format!("{}_error", node_id), Value::String(message.to_string()));
        let name = flow.node(node_id).map_or(node_id, |n| n.display_name());
        run.record_step(node_id, name);
        self.inner.ctx.metrics.record_node_failure(node_id);
        warn!(run_id = %run.run_id, node_id = %node_id, error = %message, "Node failed");
    }

    /// Invoke the node's action with retries and the per-call timeout
    async fn run_action(
        &self,
        flow: &FlowDefinition,
        run: &mut FlowRun,
        node_def: &NodeDefinition,
        extra: Option<Map<String, Value>>,
    ) -> Result<Value> {
        let node_id = node_def.id.as_str();
        let name = node_def
            .action
            .as_deref()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| Error::invalid_node(node_id, "No action configured"))?;
        let action = self
            .inner
            .ctx
            .actions
            .get(name)
            .await
            .ok_or_else(|| Error::invalid_node(node_id, format!("No action registered as '{}'", name)))?;

        let mut input = merge_input(&run.context, &node_def.input);
        if let (Some(extra), Value::Object(map)) = (extra, &mut input) {
            map.extend(extra);
        }
        let policy = node_def.retry.unwrap_or(RetryPolicy {
            max_attempts: 1,
            backoff_ms: 0,
        });

        let mut attempt = 0;
        loop {
            attempt += 1;
            let ctx = ActionContext {
                tenant_id: run.tenant_id.clone(),
                flow_id: flow.id.clone(),
                run_id: run.run_id.clone(),
                node_id: node_id.to_string(),
                attempt,
            };
            let call = action.execute(input.clone(), &node_def.config, &ctx);
            let outcome = match node_def.timeout_secs {
                Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), call).await {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(_) => Err(format!("action timed out after {}s", secs)),
                },
                None => call.await.map_err(|e| e.to_string()),
            };

            let failure = match outcome {
                Ok(output) => match payload_error(&output) {
                    None => return Ok(output),
                    Some(message) => message,
                },
                Err(message) => message,
            };

            if attempt >= policy.max_attempts {
                return Err(Error::execution(&flow.id, node_id, failure));
            }
            let delay = Duration::from_millis(
                policy
                    .backoff_ms
                    .saturating_mul(1u64 << (attempt - 1).min(16)),
            );
            run.node_mut(node_id)
                .log(format!("Attempt {} failed: {}", attempt, failure));
            warn!(
                run_id = %run.run_id,
                node_id = %node_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Action failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn suspend_on_callback(
        &self,
        flow: &FlowDefinition,
        run: &mut FlowRun,
        node_def: &NodeDefinition,
    ) -> Result<()> {
        let ctx = &self.inner.ctx;
        let node_id = node_def.id.as_str();
        let callback_id = ctx.callbacks.setup_callback(flow, run, node_def).await?;
        let timeout = ctx.callbacks.effective_timeout(node_def);
        let url = generate_callback_url(&ctx.config.callback_base_url, &callback_id);
        run.context
            .insert(format!("{}_callback_url", node_id), Value::String(url.clone()));

        // An action on a callback node hands the URL to the external system
        if node_def.action.is_some() {
            let mut extra = Map::new();
            extra.insert("callbackUrl".to_string(), Value::String(url.clone()));
            extra.insert("callbackId".to_string(), Value::String(callback_id.clone()));
            if let Err(e) = self.run_action(flow, run, node_def, Some(extra)).await {
                ctx.callbacks.cancel(&callback_id).await?;
                return Err(e);
            }
        }

        let state = run.node_mut(node_id);
        state.wait(WaitKind::Callback {
            callback_id: callback_id.clone(),
        });
        state.deadline = deadline_after(Utc::now(), timeout);
        state.log(format!("Waiting for callback at {}", url));

        tokio::spawn(self.clone().await_callback(
            callback_id,
            timeout,
            run.tenant_id.clone(),
            run.run_id.clone(),
            node_id.to_string(),
        ));
        Ok(())
    }

    async fn suspend_on_timer(&self, run: &mut FlowRun, node_def: &NodeDefinition) -> Result<()> {
        let node_id = node_def.id.as_str();
        let config = node_def
            .timer
            .as_ref()
            .ok_or_else(|| Error::invalid_node(node_id, "timer nodes require a timer configuration"))?;
        let job = TimerJob::from_config(
            &run.tenant_id,
            &run.run_id,
            node_id,
            config,
            node_def.input.clone(),
        );
        let job_id = self.inner.ctx.timers.schedule_timer(job).await?;

        let state = run.node_mut(node_id);
        state.wait(WaitKind::Timer { job_id });
        state.log(format!("Waiting for {:?} timer", config.kind));
        Ok(())
    }

    async fn suspend_on_event(&self, run: &mut FlowRun, node_def: &NodeDefinition) -> Result<()> {
        let ctx = &self.inner.ctx;
        let node_id = node_def.id.as_str();
        let event = node_def
            .event
            .as_ref()
            .ok_or_else(|| Error::invalid_node(node_id, "Event name not specified"))?;
        let timeout_secs = event.timeout_secs.unwrap_or(ctx.config.event_timeout_secs);
        let timeout = Duration::from_secs(timeout_secs);
        let deadline = deadline_after(Utc::now(), timeout);
        let key = event_wait_key(&event.name, &run.run_id, node_id);
        let wait = EventWait {
            tenant_id: run.tenant_id.clone(),
            run_id: run.run_id.clone(),
            node_id: node_id.to_string(),
            timeout_secs,
            deadline,
        };
        save(
            ctx.store.as_ref(),
            &ctx.config.namespace,
            &key,
            &wait,
            Some(timeout.saturating_add(EVENT_WAIT_GRACE)),
        )
        .await?;

        let state = run.node_mut(node_id);
        state.wait(WaitKind::Event {
            name: event.name.clone(),
        });
        state.deadline = deadline;
        state.log(format!("Waiting for event '{}'", event.name));

        tokio::spawn(self.clone().expire_event_wait(key, event.name.clone(), wait, timeout));
        Ok(())
    }

    /// Resume the node with the callback payload, or fail it on timeout
    fn await_callback(
        self,
        callback_id: String,
        timeout: Duration,
        tenant_id: String,
        run_id: String,
        node_id: String,
    ) -> Detached {
        Box::pin(async move {
            let outcome = self
                .inner
                .ctx
                .callbacks
                .wait_for_callback(&callback_id, timeout)
                .await;
            let settled = match outcome {
                Ok(data) => self.resume_node(&tenant_id, &run_id, &node_id, data).await,
                Err(e) => self.fail_node(&tenant_id, &run_id, &node_id, &e.to_string()).await,
            };
            if let Err(e) = settled {
                error!(run_id = %run_id, node_id = %node_id, error = %e, "Failed to settle callback wait");
            }
        })
    }

    /// Fail the node if its event wait is still unclaimed after `delay`
    fn expire_event_wait(self, key: String, event: String, wait: EventWait, delay: Duration) -> Detached {
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            let ctx = &self.inner.ctx;
            match ctx.store.take(&ctx.config.namespace, &key).await {
                Ok(Some(_)) => {
                    let message = format!("Event '{}' not received within {}s", event, wait.timeout_secs);
                    if let Err(e) = self
                        .fail_node(&wait.tenant_id, &wait.run_id, &wait.node_id, &message)
                        .await
                    {
                        error!(run_id = %wait.run_id, node_id = %wait.node_id, error = %e, "Failed to time out event wait");
                    }
                }
                Ok(None) => {}
                Err(e) => error!(key = %key, error = %e, "Failed to expire event wait"),
            }
        })
    }

    /// Cancel every outstanding wait of the run and fail its waiting nodes
    async fn release_waits(&self, run: &mut FlowRun, reason: &str) {
        let ctx = &self.inner.ctx;
        let run_id = run.run_id.clone();
        for (node_id, state) in run.node_states.iter_mut().filter(|(_, s)| s.is_waiting()) {
            let released = match &state.waiting_for {
                Some(WaitKind::Callback { callback_id }) => {
                    ctx.callbacks.cancel(callback_id).await.map(|_| ())
                }
                Some(WaitKind::Timer { .. }) => ctx.timers.cleanup_timer(&run_id, node_id).await,
                Some(WaitKind::Event { name }) => ctx
                    .store
                    .delete(&ctx.config.namespace, &event_wait_key(name, &run_id, node_id))
                    .await
                    .map(|_| ())
                    .map_err(Into::into),
                _ => Ok(()),
            };
            if let Err(e) = released {
                warn!(run_id = %run_id, node_id = %node_id, error = %e, "Failed to release wait");
            }
            state.fail(reason);
            state.log(reason);
        }
    }

    /// Settle the run status, finish metrics for terminal runs and persist
    async fn finalize(&self, run: &mut FlowRun, failed: bool) -> Result<()> {
        if failed {
            self.release_waits(run, "Flow run failed").await;
        }
        let status = run.settle(failed);
        if status.is_terminal() {
            self.inner.ctx.metrics.flow_finished(
                &run.flow_id,
                run.duration_ms().map(Duration::from_millis),
                status == RunStatus::Completed,
            );
            info!(
                run_id = %run.run_id,
                status = ?status,
                errors = run.errors,
                duration_ms = run.duration_ms(),
                "Flow run finished"
            );
        } else {
            debug!(run_id = %run.run_id, status = ?status, waiting = ?run.waiting_nodes(), "Flow run suspended");
        }
        self.persist(run).await?;
        self.track_suspension(run).await
    }

    /// Keep the `suspended_run` marker in step with the run's callback and
    /// event waits, so `restore_waits` can find them after a restart.
    async fn track_suspension(&self, run: &FlowRun) -> Result<()> {
        let ctx = &self.inner.ctx;
        let key = suspended_run_key(&run.run_id);
        let watched = !run.status.is_terminal()
            && run.node_states.values().any(|s| {
                s.is_waiting()
                    && matches!(
                        s.waiting_for,
                        Some(WaitKind::Callback { .. }) | Some(WaitKind::Event { .. })
                    )
            });
        if watched {
            let marker = SuspendedRun {
                tenant_id: run.tenant_id.clone(),
            };
            save(
                ctx.store.as_ref(),
                &ctx.config.namespace,
                &key,
                &marker,
                Some(Duration::from_secs(ctx.config.run_ttl_secs)),
            )
            .await?;
        } else {
            ctx.store.delete(&ctx.config.namespace, &key).await?;
        }
        Ok(())
    }

    /// Restart the callback and event timeouts of every suspended run.
    ///
    /// Those timeouts live in process tasks, so after a restart nothing
    /// would end a wait that never gets its callback or event. A wait whose
    /// record is still stored is re-armed for the time left until its
    /// deadline. One whose record is gone and whose deadline has passed
    /// failed while no process was watching, and is failed now.
    pub async fn restore_waits(&self) -> Result<usize> {
        let ctx = &self.inner.ctx;
        let keys = ctx.store.keys(&ctx.config.namespace, "suspended_run:*").await?;
        let mut restored = 0;

        for key in keys {
            let Some(run_id) = key.strip_prefix("suspended_run:") else {
                continue;
            };
            let Some(marker) =
                load::<SuspendedRun>(ctx.store.as_ref(), &ctx.config.namespace, &key).await?
            else {
                continue;
            };
            match self.get_run(&marker.tenant_id, run_id).await {
                Ok(run) if !run.status.is_terminal() => {
                    restored += self.restore_run_waits(&run).await?;
                }
                Ok(_) | Err(Error::RunNotFound(_)) => {
                    ctx.store.delete(&ctx.config.namespace, &key).await?;
                }
                Err(e) => return Err(e),
            }
        }

        info!(restored, "Restored callback and event waits");
        Ok(restored)
    }

    async fn restore_run_waits(&self, run: &FlowRun) -> Result<usize> {
        let ctx = &self.inner.ctx;
        let now = Utc::now();
        let mut restored = 0;

        for (node_id, state) in run.node_states.iter().filter(|(_, s)| s.is_waiting()) {
            let remaining = state.deadline.map(|at| remaining_until(now, at));
            let overdue = remaining == Some(Duration::ZERO);
            match &state.waiting_for {
                Some(WaitKind::Callback { callback_id }) => {
                    if ctx.callbacks.is_pending(callback_id).await? {
                        let timeout = remaining.unwrap_or_else(|| ctx.config.callback_timeout(None));
                        tokio::spawn(self.clone().await_callback(
                            callback_id.clone(),
                            timeout,
                            run.tenant_id.clone(),
                            run.run_id.clone(),
                            node_id.clone(),
                        ));
                    } else if overdue {
                        let message = Error::timeout(format!(
                            "callback {} not received before its deadline",
                            callback_id
                        ));
                        self.fail_node(&run.tenant_id, &run.run_id, node_id, &message.to_string())
                            .await?;
                    } else {
                        continue;
                    }
                }
                Some(WaitKind::Event { name }) => {
                    let key = event_wait_key(name, &run.run_id, node_id);
                    match load::<EventWait>(ctx.store.as_ref(), &ctx.config.namespace, &key).await? {
                        Some(wait) => {
                            let delay = remaining.unwrap_or_else(|| {
                                Duration::from_secs(ctx.config.event_timeout_secs)
                            });
                            tokio::spawn(self.clone().expire_event_wait(key, name.clone(), wait, delay));
                        }
                        None if overdue => {
                            let message = format!("Event '{}' not received before its deadline", name);
                            self.fail_node(&run.tenant_id, &run.run_id, node_id, &message)
                                .await?;
                        }
                        None => continue,
                    }
                }
                _ => continue,
            }
            debug!(run_id = %run.run_id, node_id = %node_id, overdue, "Wait restored");
            restored += 1;
        }
        Ok(restored)
    }
}

/// Queue the successors of `origin` ahead of the rest of the queue. A
/// join whose other predecessors may still run is parked in
/// `run.deferred` until they settle.
fn admit(
    flow: &FlowDefinition,
    run: &mut FlowRun,
    queue: &mut VecDeque<String>,
    origin: Option<&str>,
    next: Vec<String>,
) {
    let mut ready: Vec<String> = Vec::new();
    for node_id in &next {
        if ready.contains(node_id) || queue.contains(node_id) {
            continue;
        }
        run.deferred.retain(|d| d != node_id);
        let pending = queue
            .iter()
            .chain(next.iter().filter(|n| *n != node_id))
            .chain(run.deferred.iter());
        if join_ready(flow, run, pending, node_id, origin) {
            ready.push(node_id.clone());
        } else {
            debug!(run_id = %run.run_id, node_id = %node_id, "Join waiting on other branches");
            run.deferred.push(node_id.clone());
        }
    }
    for node_id in ready.into_iter().rev() {
        queue.push_front(node_id);
    }
}

/// Take the first parked join whose predecessors have all settled
fn release_join(flow: &FlowDefinition, run: &mut FlowRun) -> Option<String> {
    let view: &FlowRun = run;
    let position = view.deferred.iter().position(|node_id| {
        let others = view.deferred.iter().filter(|d| *d != node_id);
        join_ready(flow, view, others, node_id, None)
    })?;
    Some(run.deferred.remove(position))
}

/// Node input merged over the run context
fn merge_input(context: &Map<String, Value>, node_input: &Value) -> Value {
    match node_input {
        Value::Null => Value::Object(context.clone()),
        Value::Object(fields) => {
            let mut merged = context.clone();
            merged.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            Value::Object(merged)
        }
        other => other.clone(),
    }
}

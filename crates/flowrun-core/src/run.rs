//! Flow run and node state records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::flow::FlowDefinition;

/// Flow run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    /// Only manual nodes are outstanding
    Paused,
    Completed,
    Error,
    /// Suspended on a callback, timer, input or event
    Waiting,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Error)
    }
}

/// Node status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Waiting,
    Completed,
    Error,
}

/// What a waiting node is suspended on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitKind {
    Callback { callback_id: String },
    Timer { job_id: String },
    Manual { choices: Vec<String> },
    Input,
    Event { name: String },
}

/// Per-node, per-run state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub waiting_for: Option<WaitKind>,
    /// When a callback or event wait times out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl NodeState {
    pub fn start(&mut self) {
        self.status = NodeStatus::Running;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
        self.error = None;
        self.waiting_for = None;
        self.deadline = None;
    }

    pub fn wait(&mut self, on: WaitKind) {
        self.status = NodeStatus::Waiting;
        self.waiting_for = Some(on);
    }

    pub fn complete(&mut self, result: Value) {
        self.status = NodeStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.result = Some(result);
        self.waiting_for = None;
        self.deadline = None;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = NodeStatus::Error;
        self.finished_at = Some(Utc::now());
        self.error = Some(error.into());
        self.waiting_for = None;
        self.deadline = None;
    }

    /// Append a timestamped log line
    pub fn log(&mut self, line: impl AsRef<str>) {
        self.logs
            .push(format!("[{}] {}", Utc::now().to_rfc3339(), line.as_ref()));
    }

    pub fn is_waiting(&self) -> bool {
        self.status == NodeStatus::Waiting
    }

    /// Wall time between start and finish
    pub fn duration_ms(&self) -> Option<u64> {
        let (start, end) = (self.started_at?, self.finished_at?);
        u64::try_from((end - start).num_milliseconds()).ok()
    }
}

/// One executed step, in execution order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub node_id: String,
    pub name: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

/// One execution instance of a flow for a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRun {
    pub run_id: String,
    pub tenant_id: String,
    pub flow_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Completed nodes over total nodes, 0-100
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub triggers: u32,
    #[serde(default)]
    pub errors: u32,
    #[serde(default)]
    pub node_states: BTreeMap<String, NodeState>,
    /// Trigger input plus the results of completed nodes
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Join nodes reached by one branch, held until their other
    /// predecessors settle
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deferred: Vec<String>,
}

impl FlowRun {
    /// Create a running flow run for `flow`
    pub fn new(tenant_id: &str, flow: &FlowDefinition, input: Value) -> Self {
        let mut context = Map::new();
        context.insert("input".to_string(), input);
        Self {
            run_id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            flow_id: flow.id.clone(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            progress: 0,
            steps: Vec::new(),
            triggers: 0,
            errors: 0,
            node_states: flow
                .nodes
                .iter()
                .map(|n| (n.id.clone(), NodeState::default()))
                .collect(),
            context,
            deferred: Vec::new(),
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeState> {
        self.node_states.get(node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> &mut NodeState {
        self.node_states.entry(node_id.to_string()).or_default()
    }

    /// Expose a node result to later guards and actions
    pub fn record_result(&mut self, node_id: &str, result: &Value) {
        self.context.insert(node_id.to_string(), result.clone());
        self.context
            .insert(format!("{}_result", node_id), result.clone());
    }

    /// Record the node's current status. A step still marked waiting is
    /// updated in place when the node resumes.
    pub fn record_step(&mut self, node_id: &str, name: &str) {
        let state = self.node(node_id).cloned().unwrap_or_default();
        let step = StepRecord {
            node_id: node_id.to_string(),
            name: name.to_string(),
            status: state.status,
            duration_ms: state.duration_ms(),
        };
        let pending = self
            .steps
            .iter_mut()
            .rev()
            .find(|s| s.node_id == node_id && s.status == NodeStatus::Waiting);
        match pending {
            Some(existing) => *existing = step,
            None => self.steps.push(step),
        }
    }

    pub fn update_progress(&mut self) {
        let total = self.node_states.len();
        if total == 0 {
            self.progress = 100;
            return;
        }
        let done = self
            .node_states
            .values()
            .filter(|s| s.status == NodeStatus::Completed)
            .count();
        self.progress = ((done * 100) / total) as u8;
    }

    /// Ids of nodes currently waiting
    pub fn waiting_nodes(&self) -> Vec<&str> {
        self.node_states
            .iter()
            .filter(|(_, s)| s.is_waiting())
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Status implied by node states once no node is running:
    /// `error` beats `waiting`, which beats `paused` (only manual waits).
    pub fn settle(&mut self, failed: bool) -> RunStatus {
        let waiting: Vec<&NodeState> = self
            .node_states
            .values()
            .filter(|s| s.is_waiting())
            .collect();
        let status = if failed {
            RunStatus::Error
        } else if waiting.is_empty() {
            RunStatus::Completed
        } else if waiting
            .iter()
            .all(|s| matches!(s.waiting_for, Some(WaitKind::Manual { .. })))
        {
            RunStatus::Paused
        } else {
            RunStatus::Waiting
        };
        self.status = status;
        if status.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        self.update_progress();
        status
    }

    /// Total run duration, once ended
    pub fn duration_ms(&self) -> Option<u64> {
        let end = self.ended_at?;
        u64::try_from((end - self.started_at).num_milliseconds()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{ExecutionMode, NodeDefinition};
    use serde_json::json;

    fn flow() -> FlowDefinition {
        FlowDefinition::new("f", "f")
            .with_node(NodeDefinition::new("a", "log"))
            .with_node(NodeDefinition::with_mode("m", ExecutionMode::Manual))
    }

    #[test]
    fn test_new_run_seeds_input_and_nodes() {
        let run = FlowRun::new("t1", &flow(), json!({"x": 1}));
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.context["input"], json!({"x": 1}));
        assert_eq!(run.node_states.len(), 2);
    }

    #[test]
    fn test_record_result_binds_both_names() {
        let mut run = FlowRun::new("t1", &flow(), Value::Null);
        run.record_result("a", &json!({"ok": true}));
        assert_eq!(run.context["a"], json!({"ok": true}));
        assert_eq!(run.context["a_result"], json!({"ok": true}));
    }

    #[test]
    fn test_settle_paused_when_only_manual_waits() {
        let mut run = FlowRun::new("t1", &flow(), Value::Null);
        run.node_mut("a").complete(json!(1));
        run.node_mut("m").wait(WaitKind::Manual {
            choices: vec!["a".into()],
        });
        assert_eq!(run.settle(false), RunStatus::Paused);
        assert_eq!(run.progress, 50);
        assert!(run.ended_at.is_none());

        run.node_mut("m").wait(WaitKind::Input);
        assert_eq!(run.settle(false), RunStatus::Waiting);
    }

    #[test]
    fn test_settle_terminal_sets_end() {
        let mut run = FlowRun::new("t1", &flow(), Value::Null);
        assert_eq!(run.settle(true), RunStatus::Error);
        assert!(run.ended_at.is_some());
    }

    #[test]
    fn test_resumed_step_replaces_waiting_entry() {
        let mut run = FlowRun::new("t1", &flow(), Value::Null);
        run.node_mut("m").start();
        run.node_mut("m").wait(WaitKind::Input);
        run.record_step("m", "m");
        run.node_mut("m").complete(json!("done"));
        run.record_step("m", "m");
        assert_eq!(run.steps.len(), 1);
        assert_eq!(run.steps[0].status, NodeStatus::Completed);
    }
}

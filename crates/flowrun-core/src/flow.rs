//! Flow definitions - a directed graph of nodes joined by guarded edges
//!
//! Definitions are plain serializable data. Validation here covers the
//! structure of the graph; guard expressions are checked by the engine,
//! which owns the evaluator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};

/// Upper bound for every timeout, delay and interval in a definition
/// (ten years). Larger values overflow clock arithmetic.
pub const MAX_WAIT_SECS: u64 = 10 * 365 * 24 * 60 * 60;

fn check_wait(field: &str, secs: Option<u64>) -> std::result::Result<(), String> {
    match secs {
        Some(secs) if secs > MAX_WAIT_SECS => Err(format!(
            "{} must not exceed {} seconds",
            field, MAX_WAIT_SECS
        )),
        _ => Ok(()),
    }
}

/// Flow definition (serializable)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// Unique identifier
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// How the core drives a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Invoke the plugin action and continue
    #[default]
    Standard,
    /// Suspend until an external HTTP callback arrives
    HttpCallback,
    /// Suspend until a timer fires
    Timer,
    /// Suspend until an operator picks the next node
    Manual,
    /// Suspend until input is supplied
    WaitForInput,
    /// Suspend until a named event is emitted
    Event,
}

/// Node definition within a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Node ID (unique within the flow)
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Registered plugin action invoked by standard nodes
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Static input merged over the run context
    #[serde(default)]
    pub input: Value,
    /// Auth/config handed to the action untouched
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub callback: Option<CallbackConfig>,
    #[serde(default)]
    pub timer: Option<TimerConfig>,
    #[serde(default)]
    pub event: Option<EventConfig>,
    /// Allowed selections for manual nodes
    #[serde(default)]
    pub manual_next: Vec<String>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Upper bound for a single action call
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackConfig {
    /// Overrides the global callback timeout
    #[serde(default, alias = "timeout")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventConfig {
    pub name: String,
    #[serde(default, alias = "timeout")]
    pub timeout_secs: Option<u64>,
}

/// Retry policy for action calls: `max_attempts` includes the first call,
/// the delay doubles after every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_backoff_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    Cron,
    Interval,
    Timeout,
}

/// Timer node configuration. Only the field matching `kind` is meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerConfig {
    #[serde(rename = "type")]
    pub kind: TimerKind,
    #[serde(default)]
    pub cron: Option<String>,
    /// Period in seconds
    #[serde(default)]
    pub interval: Option<u64>,
    /// Delay in seconds
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default, rename = "endDate", alias = "end_date")]
    pub end_date: Option<DateTime<Utc>>,
}

impl TimerConfig {
    /// Check that the field required by `kind` is present and in range.
    pub fn validate(&self) -> std::result::Result<(), String> {
        check_wait("interval", self.interval)?;
        check_wait("timeout", self.timeout)?;
        match self.kind {
            TimerKind::Cron => match self.cron.as_deref() {
                Some(expr) if !expr.trim().is_empty() => Ok(()),
                _ => Err("cron expression is required for cron timers".to_string()),
            },
            TimerKind::Interval => match self.interval {
                Some(secs) if secs > 0 => Ok(()),
                _ => Err("interval (seconds > 0) is required for interval timers".to_string()),
            },
            TimerKind::Timeout => match self.timeout {
                Some(_) => Ok(()),
                None => Err("timeout (seconds) is required for timeout timers".to_string()),
            },
        }
    }
}

/// A directed edge, optionally guarded by a boolean expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub condition: Option<String>,
    /// Followed only when `from` fails
    #[serde(default)]
    pub on_error: bool,
}

impl Edge {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            condition: None,
            on_error: false,
        }
    }

    /// Guard the edge with an expression
    pub fn when(mut self, condition: &str) -> Self {
        self.condition = Some(condition.to_string());
        self
    }

    /// Turn this into an error-handling edge
    pub fn on_error(mut self) -> Self {
        self.on_error = true;
        self
    }
}

impl NodeDefinition {
    /// Create a standard node invoking `action`
    pub fn new(id: &str, action: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            action: Some(action.to_string()),
            mode: ExecutionMode::Standard,
            input: Value::Null,
            config: Value::Null,
            callback: None,
            timer: None,
            event: None,
            manual_next: Vec::new(),
            retry: None,
            timeout_secs: None,
        }
    }

    /// Create a node with no action in the given mode
    pub fn with_mode(id: &str, mode: ExecutionMode) -> Self {
        Self {
            action: None,
            mode,
            ..Self::new(id, "")
        }
    }

    pub fn timer(id: &str, timer: TimerConfig) -> Self {
        Self {
            timer: Some(timer),
            ..Self::with_mode(id, ExecutionMode::Timer)
        }
    }

    pub fn http_callback(id: &str, timeout_secs: Option<u64>) -> Self {
        Self {
            callback: Some(CallbackConfig { timeout_secs }),
            ..Self::with_mode(id, ExecutionMode::HttpCallback)
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff_ms: u64) -> Self {
        self.retry = Some(RetryPolicy {
            max_attempts,
            backoff_ms,
        });
        self
    }

    /// Display name, falling back to the id
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Check the mode-specific configuration.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Error::invalid_node(&self.id, reason);
        match self.mode {
            ExecutionMode::Standard => {
                if self.action.as_deref().map_or(true, str::is_empty) {
                    return Err(invalid("standard nodes require an action"));
                }
            }
            ExecutionMode::Timer => {
                let timer = self
                    .timer
                    .as_ref()
                    .ok_or_else(|| invalid("timer nodes require a timer configuration"))?;
                timer.validate().map_err(|reason| invalid(&reason))?;
            }
            ExecutionMode::Event => {
                let event = self
                    .event
                    .as_ref()
                    .ok_or_else(|| invalid("event nodes require an event name"))?;
                if event.name.trim().is_empty() {
                    return Err(invalid("event name must not be empty"));
                }
            }
            ExecutionMode::Manual => {
                if self.manual_next.is_empty() {
                    return Err(invalid("manual nodes require at least one manual_next entry"));
                }
            }
            ExecutionMode::HttpCallback | ExecutionMode::WaitForInput => {}
        }
        if let Some(retry) = self.retry {
            if retry.max_attempts == 0 {
                return Err(invalid("retry.max_attempts must be at least 1"));
            }
        }
        let waits = [
            ("timeout_secs", self.timeout_secs),
            ("callback.timeout_secs", self.callback.as_ref().and_then(|c| c.timeout_secs)),
            ("event.timeout_secs", self.event.as_ref().and_then(|e| e.timeout_secs)),
        ];
        for (field, secs) in waits {
            check_wait(field, secs).map_err(|reason| invalid(&reason))?;
        }
        Ok(())
    }
}

impl FlowDefinition {
    /// Create an empty flow definition
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Add a node
    pub fn with_node(mut self, node: NodeDefinition) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add an edge
    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// Outgoing edges of a node, in definition order
    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from == node_id)
    }

    /// Nodes without incoming edges, in definition order. Manual
    /// selections count as incoming edges.
    pub fn entry_nodes(&self) -> Vec<&NodeDefinition> {
        let targets: HashSet<&str> = self
            .edges
            .iter()
            .map(|e| e.to.as_str())
            .chain(self.nodes.iter().flat_map(|n| n.manual_next.iter().map(String::as_str)))
            .collect();
        self.nodes
            .iter()
            .filter(|n| !targets.contains(n.id.as_str()))
            .collect()
    }

    /// All nodes reachable from `node_id` (excluding itself)
    pub fn downstream(&self, node_id: &str) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = vec![node_id];
        let mut order = Vec::new();
        while let Some(current) = stack.pop() {
            for edge in self.outgoing(current) {
                if edge.to != node_id && seen.insert(edge.to.as_str()) {
                    order.push(edge.to.clone());
                    stack.push(edge.to.as_str());
                }
            }
        }
        order
    }

    /// Validate the flow definition
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::validation("flow id must not be empty"));
        }
        if self.nodes.is_empty() {
            return Err(Error::validation(format!("flow '{}' has no nodes", self.id)));
        }

        let mut seen_ids = HashSet::new();
        for node in &self.nodes {
            if !seen_ids.insert(node.id.as_str()) {
                return Err(Error::validation(format!("Duplicate node ID: {}", node.id)));
            }
            node.validate()?;
        }

        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !seen_ids.contains(end.as_str()) {
                    return Err(Error::validation(format!(
                        "Edge {} -> {} references unknown node: {}",
                        edge.from, edge.to, end
                    )));
                }
            }
        }

        for node in &self.nodes {
            for next in &node.manual_next {
                if !seen_ids.contains(next.as_str()) {
                    return Err(Error::invalid_node(
                        &node.id,
                        format!("manual_next references unknown node: {}", next),
                    ));
                }
            }
        }

        self.check_acyclic()
    }

    /// Kahn's algorithm over the edge set
    fn check_acyclic(&self) -> Result<()> {
        let mut in_degree: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        for edge in &self.edges {
            *in_degree.entry(edge.to.as_str()).or_default() += 1;
        }

        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;

        while let Some(node_id) = ready.pop() {
            visited += 1;
            for edge in self.outgoing(node_id) {
                if let Some(d) = in_degree.get_mut(edge.to.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(edge.to.as_str());
                    }
                }
            }
        }

        if visited != self.nodes.len() {
            return Err(Error::validation(format!("flow '{}' contains a cycle", self.id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn linear_flow() -> FlowDefinition {
        FlowDefinition::new("f1", "Linear")
            .with_node(NodeDefinition::new("a", "log"))
            .with_node(NodeDefinition::new("b", "log"))
            .with_node(NodeDefinition::new("c", "log"))
            .with_edge(Edge::new("a", "b"))
            .with_edge(Edge::new("b", "c"))
    }

    #[test]
    fn test_valid_flow() {
        let flow = linear_flow();
        assert!(flow.validate().is_ok());
        let entries: Vec<_> = flow.entry_nodes().iter().map(|n| n.id.clone()).collect();
        assert_eq!(entries, vec!["a"]);
        assert_eq!(flow.downstream("a"), vec!["b", "c"]);
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let flow = linear_flow().with_node(NodeDefinition::new("a", "log"));
        assert!(matches!(flow.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_unknown_edge_target_rejected() {
        let flow = linear_flow().with_edge(Edge::new("c", "missing"));
        assert!(flow.validate().is_err());
    }

    #[test]
    fn test_cycle_rejected() {
        let flow = linear_flow().with_edge(Edge::new("c", "a"));
        let err = flow.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_timer_config_requires_matching_field() {
        let node = NodeDefinition::timer(
            "t",
            TimerConfig {
                kind: TimerKind::Interval,
                cron: None,
                interval: None,
                timeout: None,
                end_date: None,
            },
        );
        assert!(matches!(
            node.validate(),
            Err(Error::InvalidNodeConfig { .. })
        ));
    }

    #[test]
    fn test_timer_config_deserializes_wire_shape() {
        let cfg: TimerConfig = serde_json::from_value(json!({
            "type": "cron",
            "cron": "*/5 * * * *",
            "endDate": "2030-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(cfg.kind, TimerKind::Cron);
        assert!(cfg.end_date.is_some());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_out_of_range_waits_rejected() {
        let mut timer = TimerConfig {
            kind: TimerKind::Timeout,
            cron: None,
            interval: None,
            timeout: Some(100_000_000_000_000_000),
            end_date: None,
        };
        assert!(NodeDefinition::timer("t", timer.clone()).validate().is_err());
        timer.timeout = Some(MAX_WAIT_SECS);
        assert!(NodeDefinition::timer("t", timer).validate().is_ok());

        let callback = NodeDefinition::http_callback("wait", Some(u64::MAX));
        assert!(matches!(
            callback.validate(),
            Err(Error::InvalidNodeConfig { .. })
        ));

        let mut event = NodeDefinition::with_mode("paid", ExecutionMode::Event);
        event.event = Some(EventConfig {
            name: "paid".into(),
            timeout_secs: Some(MAX_WAIT_SECS + 1),
        });
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_standard_node_requires_action() {
        let node = NodeDefinition::with_mode("x", ExecutionMode::Standard);
        assert!(node.validate().is_err());
    }
}

//! Flow graph checks and edge selection

use flowrun_core::{Error, FlowDefinition, FlowRun, Result};
use flowrun_expr::Evaluator;
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::debug;

/// Structural validation plus a parse of every guard expression
pub fn validate_flow(flow: &FlowDefinition, evaluator: &Evaluator) -> Result<()> {
    flow.validate()?;
    for node in &flow.nodes {
        if let Some(event) = &node.event {
            if event.name.contains(|c: char| matches!(c, ':' | '*' | '?' | '[' | ']')) {
                return Err(Error::invalid_node(
                    &node.id,
                    format!("event name '{}' may not contain ':' or glob characters", event.name),
                ));
            }
        }
    }
    for edge in &flow.edges {
        if let Some(condition) = &edge.condition {
            evaluator.compile(condition).map_err(|e| {
                Error::validation(format!(
                    "Invalid condition on edge {} -> {}: {}",
                    edge.from, edge.to, e
                ))
            })?;
        }
    }
    Ok(())
}

/// Targets of the non-error edges of `node_id` whose guard is absent or
/// true, in edge order
pub fn select_edges(
    flow: &FlowDefinition,
    node_id: &str,
    context: &Map<String, Value>,
    evaluator: &Evaluator,
) -> Vec<String> {
    flow.outgoing(node_id)
        .filter(|edge| !edge.on_error)
        .filter(|edge| match &edge.condition {
            Some(condition) => {
                let taken = evaluator.evaluate(condition, context);
                debug!(from = %edge.from, to = %edge.to, condition = %condition, taken, "Evaluated edge");
                taken
            }
            None => true,
        })
        .map(|edge| edge.to.clone())
        .collect()
}

/// Targets of the error-handling edges of `node_id`. Guards apply here
/// too, evaluated with the failure bound as `<node>_error`.
pub fn error_edges(
    flow: &FlowDefinition,
    node_id: &str,
    context: &Map<String, Value>,
    evaluator: &Evaluator,
) -> Vec<String> {
    flow.outgoing(node_id)
        .filter(|edge| edge.on_error)
        .filter(|edge| {
            edge.condition
                .as_deref()
                .map_or(true, |c| evaluator.evaluate(c, context))
        })
        .map(|edge| edge.to.clone())
        .collect()
}

/// Nodes that can follow `node_id`: edge targets and manual choices
fn successors<'a>(
    flow: &'a FlowDefinition,
    node_id: &'a str,
) -> impl Iterator<Item = &'a str> + 'a {
    let manual = flow
        .node(node_id)
        .into_iter()
        .flat_map(|n| n.manual_next.iter().map(String::as_str));
    flow.outgoing(node_id).map(|e| e.to.as_str()).chain(manual)
}

/// `roots` and every node reachable from them
fn reachable(flow: &FlowDefinition, roots: Vec<String>) -> HashSet<String> {
    let mut seen: HashSet<String> = roots.iter().cloned().collect();
    let mut stack = roots;
    while let Some(current) = stack.pop() {
        for next in successors(flow, &current) {
            if seen.insert(next.to_string()) {
                stack.push(next.to_string());
            }
        }
    }
    seen
}

/// Whether `node_id` may run now, reached from `arriving`.
///
/// It must wait while any other predecessor can still run: one that is
/// `pending` (queued or parked), waiting, or downstream of either.
pub fn join_ready<'a>(
    flow: &FlowDefinition,
    run: &FlowRun,
    pending: impl IntoIterator<Item = &'a String>,
    node_id: &str,
    arriving: Option<&str>,
) -> bool {
    let others: Vec<&str> = flow
        .nodes
        .iter()
        .filter(|n| Some(n.id.as_str()) != arriving)
        .filter(|n| successors(flow, &n.id).any(|s| s == node_id))
        .map(|n| n.id.as_str())
        .collect();
    if others.is_empty() {
        return true;
    }

    let roots: Vec<String> = pending
        .into_iter()
        .cloned()
        .chain(run.waiting_nodes().into_iter().map(str::to_string))
        .collect();
    let live = reachable(flow, roots);
    !others.iter().any(|p| live.contains(*p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrun_core::{Edge, NodeDefinition};
    use serde_json::json;

    fn flow() -> FlowDefinition {
        FlowDefinition::new("f", "branching")
            .with_node(NodeDefinition::new("fetch", "passthrough"))
            .with_node(NodeDefinition::new("ok", "log"))
            .with_node(NodeDefinition::new("big", "log"))
            .with_node(NodeDefinition::new("fallback", "log"))
            .with_edge(Edge::new("fetch", "ok").when("fetch_result.status == 200"))
            .with_edge(Edge::new("fetch", "big").when("fetch_result.size > 10"))
            .with_edge(Edge::new("fetch", "fallback").on_error())
    }

    #[test]
    fn test_fan_out_follows_every_true_guard() {
        let evaluator = Evaluator::default();
        let mut ctx = Map::new();
        ctx.insert("fetch_result".into(), json!({"status": 200, "size": 50}));
        assert_eq!(select_edges(&flow(), "fetch", &ctx, &evaluator), vec!["ok", "big"]);

        ctx.insert("fetch_result".into(), json!({"status": 500, "size": 1}));
        assert!(select_edges(&flow(), "fetch", &ctx, &evaluator).is_empty());
    }

    #[test]
    fn test_error_edges_are_separate() {
        let evaluator = Evaluator::default();
        assert_eq!(error_edges(&flow(), "fetch", &Map::new(), &evaluator), vec!["fallback"]);
        assert!(error_edges(&flow(), "ok", &Map::new(), &evaluator).is_empty());
    }

    #[test]
    fn test_unparseable_guard_rejected_at_registration() {
        let evaluator = Evaluator::default();
        assert!(validate_flow(&flow(), &evaluator).is_ok());

        let bad = flow().with_edge(Edge::new("ok", "big").when("a +* b"));
        assert!(matches!(validate_flow(&bad, &evaluator), Err(Error::Validation(_))));

        let denied = flow().with_edge(Edge::new("ok", "big").when("process.exit()"));
        assert!(validate_flow(&denied, &evaluator).is_err());
    }

    #[test]
    fn test_join_waits_for_live_branches() {
        let diamond = FlowDefinition::new("d", "diamond")
            .with_node(NodeDefinition::new("a", "log"))
            .with_node(NodeDefinition::new("b", "log"))
            .with_node(NodeDefinition::new("c", "log"))
            .with_node(NodeDefinition::new("d", "log"))
            .with_edge(Edge::new("a", "b"))
            .with_edge(Edge::new("a", "c"))
            .with_edge(Edge::new("b", "d"))
            .with_edge(Edge::new("c", "d"));
        let mut run = FlowRun::new("t", &diamond, json!({}));
        let queued = vec!["c".to_string()];
        let none: Vec<String> = Vec::new();

        assert!(!join_ready(&diamond, &run, &queued, "d", Some("b")));
        // b settled (or can no longer run): c alone releases d
        assert!(join_ready(&diamond, &run, &none, "d", Some("c")));

        run.node_mut("b").wait(flowrun_core::WaitKind::Input);
        assert!(!join_ready(&diamond, &run, &none, "d", Some("c")));
        assert!(join_ready(&diamond, &run, &none, "b", Some("a")));
    }

    #[test]
    fn test_event_names_must_be_plain() {
        let mut node = NodeDefinition::with_mode("wait", flowrun_core::ExecutionMode::Event);
        node.event = Some(flowrun_core::EventConfig {
            name: "order:*".into(),
            timeout_secs: None,
        });
        let flow = FlowDefinition::new("f", "events").with_node(node);
        assert!(matches!(
            validate_flow(&flow, &Evaluator::default()),
            Err(Error::InvalidNodeConfig { .. })
        ));
    }
}

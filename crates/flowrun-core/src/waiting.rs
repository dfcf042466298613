//! Persisted context of a node suspended on an external event

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::flow::{FlowDefinition, NodeDefinition};
use crate::run::{FlowRun, NodeState};

/// Snapshot stored while a node waits. Consumed exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitingState {
    pub flow: FlowDefinition,
    pub flow_run: FlowRun,
    pub node_def: NodeDefinition,
    pub node_state: NodeState,
    /// Wall-clock time the wait times out
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

impl WaitingState {
    pub fn new(flow: &FlowDefinition, flow_run: &FlowRun, node_def: &NodeDefinition) -> Self {
        let node_state = flow_run.node(&node_def.id).cloned().unwrap_or_default();
        Self {
            flow: flow.clone(),
            flow_run: flow_run.clone(),
            node_def: node_def.clone(),
            node_state,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<DateTime<Utc>>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.flow_run.run_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_def.id
    }
}

/// `now + timeout`, or `None` when that is not representable
pub fn deadline_after(now: DateTime<Utc>, timeout: Duration) -> Option<DateTime<Utc>> {
    TimeDelta::from_std(timeout)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
}

/// Time left until `deadline`, zero once it has passed
pub fn remaining_until(now: DateTime<Utc>, deadline: DateTime<Utc>) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_arithmetic() {
        let now = Utc::now();
        let at = deadline_after(now, Duration::from_secs(30)).unwrap();
        assert_eq!(remaining_until(now, at), Duration::from_secs(30));
        assert_eq!(remaining_until(at, now), Duration::ZERO);
        assert_eq!(deadline_after(now, Duration::from_secs(u64::MAX)), None);
    }
}

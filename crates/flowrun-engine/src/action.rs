//! Plugin action contract and registry
//!
//! Every standard node names an action. The core only sees this trait:
//! input in, payload out. A payload that is an object carrying an `error`
//! field counts as a failure just like an `Err`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Failed(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl ActionError {
    pub fn failed(msg: impl Into<String>) -> Self {
        ActionError::Failed(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        ActionError::InvalidInput(msg.into())
    }
}

/// Who is calling an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionContext {
    pub tenant_id: String,
    pub flow_id: String,
    pub run_id: String,
    pub node_id: String,
    /// 1 for the first call, incremented by retries
    pub attempt: u32,
}

/// A unit of work a node can invoke
#[async_trait]
pub trait PluginAction: Send + Sync {
    /// Unique action name referenced by node definitions
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object" })
    }

    fn output_schema(&self) -> Value {
        json!({ "type": "object" })
    }

    /// `config` is the node's auth/config block, passed through untouched
    async fn execute(
        &self,
        input: Value,
        config: &Value,
        ctx: &ActionContext,
    ) -> Result<Value, ActionError>;
}

pub type BoxedAction = Arc<dyn PluginAction>;

/// The failure message carried by an `{ "error": .. }` payload
pub fn payload_error(output: &Value) -> Option<String> {
    let error = output.as_object()?.get("error")?;
    Some(match error {
        Value::String(s) => s.clone(),
        Value::Object(o) => o
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    })
}

type Handler = dyn Fn(Value, &Value) -> Result<Value, ActionError> + Send + Sync;

/// Action backed by a synchronous closure
#[derive(Clone)]
pub struct FnAction {
    name: String,
    description: String,
    handler: Arc<Handler>,
}

impl FnAction {
    pub fn new<F>(name: &str, description: &str, handler: F) -> Self
    where
        F: Fn(Value, &Value) -> Result<Value, ActionError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            handler: Arc::new(handler),
        }
    }
}

#[async_trait]
impl PluginAction for FnAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(
        &self,
        input: Value,
        config: &Value,
        _ctx: &ActionContext,
    ) -> Result<Value, ActionError> {
        (self.handler)(input, config)
    }
}

/// Listing entry for a registered action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Value,
    pub calls: u64,
}

struct RegisteredAction {
    action: BoxedAction,
    calls: AtomicU64,
}

impl RegisteredAction {
    fn new(action: BoxedAction) -> Arc<Self> {
        Arc::new(Self {
            action,
            calls: AtomicU64::new(0),
        })
    }
}

/// Actions by name
#[derive(Default)]
pub struct ActionRegistry {
    actions: RwLock<HashMap<String, Arc<RegisteredAction>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `log`, `passthrough` and `http_request`
    pub fn with_builtins() -> Self {
        let actions = crate::builtin::builtin_actions()
            .into_iter()
            .map(|action| (action.name().to_string(), RegisteredAction::new(action)))
            .collect();
        Self {
            actions: RwLock::new(actions),
        }
    }

    /// Register an action, replacing any action of the same name
    pub async fn register(&self, action: BoxedAction) {
        let name = action.name().to_string();
        let previous = self
            .actions
            .write()
            .await
            .insert(name.clone(), RegisteredAction::new(action));
        if previous.is_some() {
            info!(action = %name, "Replaced registered action");
        } else {
            debug!(action = %name, "Registered action");
        }
    }

    pub async fn get(&self, name: &str) -> Option<BoxedAction> {
        let actions = self.actions.read().await;
        let entry = actions.get(name)?;
        entry.calls.fetch_add(1, Ordering::Relaxed);
        Some(entry.action.clone())
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.actions.read().await.contains_key(name)
    }

    pub async fn list(&self) -> Vec<ActionDefinition> {
        let actions = self.actions.read().await;
        let mut defs: Vec<ActionDefinition> = actions
            .values()
            .map(|entry| ActionDefinition {
                name: entry.action.name().to_string(),
                description: entry.action.description().to_string(),
                input_schema: entry.action.input_schema(),
                output_schema: entry.action.output_schema(),
                calls: entry.calls.load(Ordering::Relaxed),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_error_detection() {
        assert_eq!(payload_error(&json!({"error": "boom"})), Some("boom".into()));
        assert_eq!(
            payload_error(&json!({"error": {"message": "bad token", "code": 401}})),
            Some("bad token".into())
        );
        assert_eq!(payload_error(&json!({"ok": true})), None);
        assert_eq!(payload_error(&json!("error")), None);
    }

    #[tokio::test]
    async fn test_registry_lookup_and_listing() {
        let registry = ActionRegistry::with_builtins();
        registry
            .register(Arc::new(FnAction::new("double", "x2", |input, _| {
                let n = input.get("n").and_then(Value::as_i64).unwrap_or(0);
                Ok(json!({ "n": n * 2 }))
            })))
            .await;

        let action = registry.get("double").await.unwrap();
        let ctx = ActionContext {
            tenant_id: "t".into(),
            flow_id: "f".into(),
            run_id: "r".into(),
            node_id: "n".into(),
            attempt: 1,
        };
        let out = action.execute(json!({"n": 21}), &Value::Null, &ctx).await.unwrap();
        assert_eq!(out, json!({"n": 42}));

        assert!(registry.get("missing").await.is_none());
        let names: Vec<String> = registry.list().await.into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["double", "http_request", "log", "passthrough"]);
    }
}

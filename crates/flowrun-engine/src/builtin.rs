//! Built-in actions

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::action::{ActionContext, ActionError, BoxedAction, PluginAction};

pub fn builtin_actions() -> Vec<BoxedAction> {
    vec![
        Arc::new(LogAction),
        Arc::new(PassthroughAction),
        Arc::new(HttpRequestAction::new()),
    ]
}

/// Logs `message` (or the whole input) and returns it
pub struct LogAction;

#[async_trait]
impl PluginAction for LogAction {
    fn name(&self) -> &str {
        "log"
    }

    fn description(&self) -> &str {
        "Write the input to the service log"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "message": { "type": "string" } }
        })
    }

    async fn execute(
        &self,
        input: Value,
        _config: &Value,
        ctx: &ActionContext,
    ) -> Result<Value, ActionError> {
        let message = input
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| input.to_string());
        info!(run_id = %ctx.run_id, node_id = %ctx.node_id, "{}", message);
        Ok(json!({ "logged": message }))
    }
}

/// Returns its input unchanged
pub struct PassthroughAction;

#[async_trait]
impl PluginAction for PassthroughAction {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn description(&self) -> &str {
        "Return the input unchanged"
    }

    async fn execute(
        &self,
        input: Value,
        _config: &Value,
        _ctx: &ActionContext,
    ) -> Result<Value, ActionError> {
        Ok(input)
    }
}

/// Calls an HTTP endpoint: `{url, method?, headers?, body?}`
pub struct HttpRequestAction {
    client: reqwest::Client,
}

impl HttpRequestAction {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpRequestAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PluginAction for HttpRequestAction {
    fn name(&self) -> &str {
        "http_request"
    }

    fn description(&self) -> &str {
        "Send an HTTP request and return status and body"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string" },
                "method": { "type": "string", "default": "GET" },
                "headers": { "type": "object" },
                "body": {}
            },
            "required": ["url"]
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "status": { "type": "integer" },
                "body": {}
            }
        })
    }

    async fn execute(
        &self,
        input: Value,
        _config: &Value,
        ctx: &ActionContext,
    ) -> Result<Value, ActionError> {
        let url = input
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ActionError::invalid_input("url is required"))?;
        let method = input
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| ActionError::invalid_input(format!("unsupported method: {}", method)))?;

        let mut request = self.client.request(method.clone(), url);
        if let Some(headers) = input.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name.as_str(), value);
                }
            }
        }
        if let Some(body) = input.get("body").filter(|b| !b.is_null()) {
            request = request.json(body);
        }

        info!(run_id = %ctx.run_id, node_id = %ctx.node_id, %method, url, "Sending HTTP request");
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        if status.is_success() {
            Ok(json!({ "status": status.as_u16(), "body": body }))
        } else {
            Ok(json!({
                "status": status.as_u16(),
                "body": body,
                "error": format!("HTTP {}", status),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ActionContext {
        ActionContext {
            tenant_id: "t".into(),
            flow_id: "f".into(),
            run_id: "r".into(),
            node_id: "n".into(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_log_and_passthrough() {
        let out = LogAction
            .execute(json!({"message": "hi"}), &Value::Null, &ctx())
            .await
            .unwrap();
        assert_eq!(out, json!({"logged": "hi"}));

        let input = json!({"a": [1, 2]});
        let out = PassthroughAction
            .execute(input.clone(), &Value::Null, &ctx())
            .await
            .unwrap();
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn test_http_request_requires_url() {
        let err = HttpRequestAction::new()
            .execute(json!({}), &Value::Null, &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidInput(_)));
    }
}

//! HTTP ingress
//!
//! Routes:
//! - `POST /api/callbacks?callbackId=`            inbound callback
//! - `POST /api/flows/:flow_id/runs?tenant=`       start a run
//! - `GET  /api/runs/:run_id?tenant=`              run snapshot
//! - `POST /api/runs/:run_id/nodes/:node_id/input`     resume with input
//! - `POST /api/runs/:run_id/nodes/:node_id/progress`  progress a manual node
//! - `POST /api/runs/:run_id/cancel`
//! - `POST /api/events/:name`
//! - `GET  /metrics`, `GET /api/metrics`, `GET /api/health`
//!
//! Routes that drive a run hand the work to its own task and are exempt
//! from the request timeout: a dropped request never strands a run
//! half-executed, or a callback consumed but not applied.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use flowrun_core::Error;
use flowrun_engine::FlowEngine;
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

const DEFAULT_TENANT: &str = "default";

pub struct AppState {
    pub engine: FlowEngine,
    started_at: Instant,
}

/// Core errors mapped onto HTTP status codes
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) | Error::InvalidNodeConfig { .. } => StatusCode::BAD_REQUEST,
            Error::NodeNotFound(_) | Error::FlowNotFound(_) | Error::RunNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::ExternalService { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self.0, "Request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Run engine work on a spawned task and wait for it
async fn detached<T, F>(work: F) -> ApiResult<T>
where
    F: Future<Output = flowrun_core::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(result) => result.map_err(ApiError),
        Err(e) => Err(ApiError(Error::internal(format!("engine task failed: {}", e)))),
    }
}

#[derive(Debug, Deserialize)]
pub struct TenantQuery {
    tenant: Option<String>,
}

impl TenantQuery {
    fn tenant(&self) -> &str {
        self.tenant.as_deref().unwrap_or(DEFAULT_TENANT)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackQuery {
    callback_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRequest {
    #[serde(alias = "selected_next")]
    selected_next: String,
    #[serde(default)]
    input: Option<Value>,
}

pub fn router(engine: FlowEngine) -> Router {
    let state = Arc::new(AppState {
        engine,
        started_at: Instant::now(),
    });

    let driving = Router::new()
        .route("/api/callbacks", post(callback_handler))
        .route("/api/flows/:flow_id/runs", post(start_run_handler))
        .route("/api/runs/:run_id/cancel", post(cancel_run_handler))
        .route("/api/runs/:run_id/nodes/:node_id/input", post(input_handler))
        .route("/api/runs/:run_id/nodes/:node_id/progress", post(progress_handler))
        .route("/api/events/:name", post(event_handler));

    Router::new()
        .route("/api/flows", get(list_flows_handler))
        .route("/api/runs/:run_id", get(get_run_handler))
        .route("/api/metrics", get(metrics_json_handler))
        .route("/api/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .merge(driving)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// POST /api/callbacks?callbackId=<id>
async fn callback_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
    body: Option<Json<Value>>,
) -> ApiResult<Response> {
    let Some(callback_id) = query.callback_id.filter(|id| !id.is_empty()) else {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "callbackId is required" })),
        )
            .into_response());
    };
    let data = body.map(|Json(v)| v).unwrap_or(Value::Null);

    let engine = state.engine.clone();
    let id = callback_id.clone();
    let resumed = detached(async move { engine.handle_callback(&id, data).await }).await?;
    if resumed {
        Ok(Json(json!({ "status": "accepted", "callbackId": callback_id })).into_response())
    } else {
        Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "status": "ignored", "callbackId": callback_id })),
        )
            .into_response())
    }
}

/// GET /api/flows
async fn list_flows_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let flows: Vec<Value> = state
        .engine
        .flows()
        .iter()
        .map(|f| json!({ "id": f.id, "name": f.name, "nodes": f.nodes.len() }))
        .collect();
    Json(json!({ "flows": flows, "count": flows.len() }))
}

/// POST /api/flows/:flow_id/runs
async fn start_run_handler(
    State(state): State<Arc<AppState>>,
    Path(flow_id): Path<String>,
    Query(query): Query<TenantQuery>,
    body: Option<Json<Value>>,
) -> ApiResult<Response> {
    let input = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let (engine, tenant, flow) = (state.engine.clone(), query.tenant().to_string(), flow_id.clone());
    let run = detached(async move { engine.start_run(&tenant, &flow, input).await }).await?;
    info!(run_id = %run.run_id, flow_id = %flow_id, "Run started via API");
    Ok((StatusCode::CREATED, Json(run)).into_response())
}

/// GET /api/runs/:run_id
async fn get_run_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Response> {
    let run = state.engine.get_run(query.tenant(), &run_id).await?;
    Ok(Json(run).into_response())
}

/// POST /api/runs/:run_id/cancel
async fn cancel_run_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Response> {
    let (engine, tenant) = (state.engine.clone(), query.tenant().to_string());
    let run = detached(async move { engine.cancel_run(&tenant, &run_id).await }).await?;
    Ok(Json(run).into_response())
}

/// POST /api/runs/:run_id/nodes/:node_id/input
async fn input_handler(
    State(state): State<Arc<AppState>>,
    Path((run_id, node_id)): Path<(String, String)>,
    Query(query): Query<TenantQuery>,
    body: Option<Json<Value>>,
) -> ApiResult<Response> {
    let input = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let (engine, tenant) = (state.engine.clone(), query.tenant().to_string());
    let run = detached(async move {
        engine
            .resume_with_input(&tenant, &run_id, &node_id, input)
            .await
    })
    .await?;
    Ok(Json(run).into_response())
}

/// POST /api/runs/:run_id/nodes/:node_id/progress
async fn progress_handler(
    State(state): State<Arc<AppState>>,
    Path((run_id, node_id)): Path<(String, String)>,
    Query(query): Query<TenantQuery>,
    Json(request): Json<ProgressRequest>,
) -> ApiResult<Response> {
    let (engine, tenant) = (state.engine.clone(), query.tenant().to_string());
    let run = detached(async move {
        engine
            .progress_manual_node(&tenant, &run_id, &node_id, &request.selected_next, request.input)
            .await
    })
    .await?;
    Ok(Json(run).into_response())
}

/// POST /api/events/:name
async fn event_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Option<Json<Value>>,
) -> ApiResult<Json<Value>> {
    let data = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let (engine, event) = (state.engine.clone(), name.clone());
    let resumed = detached(async move { engine.emit_event(&event, data).await }).await?;
    Ok(Json(json!({ "event": name, "resumed": resumed })))
}

/// GET /metrics - Prometheus text
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut body = state.engine.context().metrics.gather_text();
    body.push_str(&flowrun_state_store::metrics::gather_metrics());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

/// GET /api/metrics - JSON snapshot
async fn metrics_json_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.engine.context().metrics.snapshot();
    Json(serde_json::to_value(snapshot).unwrap_or(Value::Null))
}

/// GET /api/health
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let ctx = state.engine.context();
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "store": ctx.store.backend(),
        "active_timers": ctx.timers.active_count(),
        "flows": state.engine.flows().len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use flowrun_core::{Edge, EngineConfig, ExecutionMode, FlowDefinition, NodeDefinition, RunStatus};
    use flowrun_engine::{ActionContext, ActionError, EngineContext, PluginAction};
    use std::sync::Mutex;
    use tower::ServiceExt;

    /// Records the run it serves, then takes 40s
    struct Slow {
        run_id: Arc<Mutex<Option<String>>>,
    }

    #[async_trait]
    impl PluginAction for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn execute(
            &self,
            _input: Value,
            _config: &Value,
            ctx: &ActionContext,
        ) -> Result<Value, ActionError> {
            *self.run_id.lock().unwrap() = Some(ctx.run_id.clone());
            tokio::time::sleep(Duration::from_secs(40)).await;
            Ok(json!({"slept": 40}))
        }
    }

    async fn slow_app() -> (Router, FlowEngine, Arc<Mutex<Option<String>>>) {
        let (ctx, _fires) = EngineContext::in_memory(EngineConfig::default()).unwrap();
        let engine = FlowEngine::new(ctx);
        let seen = Arc::new(Mutex::new(None));
        engine
            .context()
            .actions
            .register(Arc::new(Slow {
                run_id: seen.clone(),
            }))
            .await;
        engine
            .register_flow(
                FlowDefinition::new("s", "Slow")
                    .with_node(NodeDefinition::new("first", "passthrough"))
                    .with_node(NodeDefinition::new("slow", "slow"))
                    .with_edge(Edge::new("first", "slow")),
            )
            .unwrap();
        (router(engine.clone()), engine, seen)
    }

    fn app() -> (Router, FlowEngine) {
        let (ctx, _fires) = EngineContext::in_memory(EngineConfig::default()).unwrap();
        let engine = FlowEngine::new(ctx);
        engine
            .register_flow(
                FlowDefinition::new("vendor", "Vendor")
                    .with_node(NodeDefinition::http_callback("wait", None))
                    .with_node(NodeDefinition::with_mode("ask", ExecutionMode::WaitForInput)),
            )
            .unwrap();
        (router(engine.clone()), engine)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_run_lifecycle_over_http() {
        let (app, _engine) = app();

        let (status, run) = send(&app, "POST", "/api/flows/vendor/runs?tenant=acme", json!({})).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(run["status"], "waiting");
        let run_id = run["run_id"].as_str().unwrap().to_string();
        let callback_id = run["node_states"]["wait"]["waiting_for"]["callback_id"]
            .as_str()
            .unwrap()
            .to_string();

        let (status, _) = send(
            &app,
            "POST",
            &format!("/api/callbacks?callbackId={}", callback_id),
            json!({"ok": true}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            &app,
            "POST",
            &format!("/api/callbacks?callbackId={}", callback_id),
            json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, run) = send(
            &app,
            "POST",
            &format!("/api/runs/{}/nodes/ask/input?tenant=acme", run_id),
            json!({"name": "ada"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(run["context"]["ask"], json!({"name": "ada"}));
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let (app, _engine) = app();

        let (status, body) = send(&app, "POST", "/api/flows/missing/runs", json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("missing"));

        let (status, _) = send(&app, "GET", "/api/runs/nope?tenant=acme", Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "POST", "/api/callbacks", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let (app, _engine) = app();
        let (status, body) = send(&app, "GET", "/api/health", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["store"], "memory");

        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("flowrun_"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_run_outlives_request_timeout() {
        let (app, engine, _seen) = slow_app().await;

        let (status, run) = send(&app, "POST", "/api/flows/s/runs?tenant=acme", json!({})).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(run["status"], "completed");
        assert_eq!(run["context"]["slow"], json!({"slept": 40}));
        assert_eq!(engine.context().metrics.active_flow_runs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_request_still_finishes_run() {
        let (app, engine, seen) = slow_app().await;

        let request = send(&app, "POST", "/api/flows/s/runs?tenant=acme", json!({}));
        assert!(tokio::time::timeout(Duration::from_secs(1), request)
            .await
            .is_err());
        let run_id = seen.lock().unwrap().clone().unwrap();

        let mut status = RunStatus::Running;
        for _ in 0..120 {
            status = engine.get_run("acme", &run_id).await.unwrap().status;
            if status == RunStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(status, RunStatus::Completed);
        assert_eq!(engine.context().metrics.active_flow_runs(), 0);
    }
}

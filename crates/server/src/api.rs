//! HTTP API: agent ingest, read-only queries, health checks and Prometheus metrics

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clogs_lib::{
    health::ComponentStatus,
    now_millis,
    transport::{Accepted, Envelope, EnvelopeType, ScopeSpec},
    ClogsCore, ContainerKey, IngestError, LogQuery, TimeRange, TransportError,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

/// Shared application state
pub struct AppState {
    pub core: Arc<ClogsCore>,
    /// `/health` reports down when no progress was made for this long
    pub progress_window: Duration,
}

impl AppState {
    pub fn new(core: Arc<ClogsCore>, progress_window: Duration) -> Self {
        Self {
            core,
            progress_window,
        }
    }
}

/// Error returned from API handlers
#[derive(Debug)]
pub enum ApiError {
    Transport(TransportError),
    NotFound(String),
    BadRequest(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    reason: &'static str,
}

impl From<TransportError> for ApiError {
    fn from(err: TransportError) -> Self {
        ApiError::Transport(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, reason, message) = match self {
            ApiError::Transport(err) => {
                let status = match &err {
                    TransportError::Decode(_) => StatusCode::BAD_REQUEST,
                    TransportError::Ingest(IngestError::Backpressure { .. }) => {
                        StatusCode::TOO_MANY_REQUESTS
                    }
                    TransportError::Ingest(IngestError::Closed) => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, err.reason(), err.to_string())
            }
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, "not_found", message),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad_request", message),
        };

        let body = Json(ErrorBody {
            error: message,
            reason,
        });
        if status == StatusCode::TOO_MANY_REQUESTS {
            (status, [(header::RETRY_AFTER, "1")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcceptedBody {
    agent_id: String,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    container: Option<String>,
}

fn accepted(receipt: Accepted) -> (StatusCode, Json<AcceptedBody>) {
    (
        StatusCode::ACCEPTED,
        Json(AcceptedBody {
            agent_id: receipt.agent_id,
            kind: receipt.kind,
            container: None,
        }),
    )
}

fn accepted_container(receipt: Accepted, key: &ContainerKey) -> (StatusCode, Json<AcceptedBody>) {
    let (status, Json(mut body)) = accepted(receipt);
    body.container = Some(key.id());
    (status, Json(body))
}

/// Raw envelope ingest
async fn ingest(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let receipt = state.core.transport.submit_bytes(&body)?;
    Ok(accepted(receipt))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterBody {
    #[serde(default, alias = "id")]
    agent_id: Option<String>,
    #[serde(default)]
    scope: Option<ScopeSpec>,
    #[serde(default)]
    timestamp: Option<i64>,
    /// Remaining registration details (hostname, intervals, onHost)
    #[serde(flatten)]
    details: Map<String, Value>,
}

/// Agent registration. Agents that do not bring an id get one assigned.
async fn register_agent(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterBody>,
) -> ApiResult<impl IntoResponse> {
    let agent_id = body
        .agent_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let envelope = Envelope {
        scope: body.scope,
        timestamp: body.timestamp,
        payload: Some(Value::Object(body.details)),
        ..Envelope::new(EnvelopeType::Registration, agent_id, now_millis())
    };

    let receipt = state.core.transport.submit_envelope(envelope)?;
    Ok(accepted(receipt))
}

async fn agent_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let envelope = Envelope::new(EnvelopeType::Heartbeat, agent_id, now_millis());
    let receipt = state.core.transport.submit_envelope(envelope)?;
    Ok(accepted(receipt))
}

async fn agent_metrics(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(batch): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    let envelope = Envelope::new(EnvelopeType::MetricBatch, agent_id, now_millis()).with_payload(batch);
    let receipt = state.core.transport.submit_envelope(envelope)?;
    Ok(accepted(receipt))
}

async fn agent_logs(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(batch): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    let envelope = Envelope::new(EnvelopeType::LogBatch, agent_id, now_millis()).with_payload(batch);
    let receipt = state.core.transport.submit_envelope(envelope)?;
    Ok(accepted(receipt))
}

/// Remove an agent. Its containers keep their history and fall back to the
/// remaining contributors, or go stale right away.
async fn deregister_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.core.pipeline.retire(&agent_id, now_millis()).await {
        info!(agent_id = %agent_id, "Agent deregistered");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(unknown_agent(&agent_id))
    }
}

fn unknown_agent(agent_id: &str) -> ApiError {
    ApiError::NotFound(format!("agent `{}` is not registered", agent_id))
}

async fn agent_info(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state
        .core
        .query
        .agent(&agent_id, now_millis())
        .map(Json)
        .ok_or_else(|| unknown_agent(&agent_id))
}

async fn agent_containers(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if state.core.query.agent(&agent_id, now_millis()).is_none() {
        return Err(unknown_agent(&agent_id));
    }
    Ok(Json(state.core.query.agent_containers(&agent_id)))
}

/// Submit one container's state item under the id taken from the path
fn submit_container_state(
    state: &AppState,
    agent_id: String,
    key: &ContainerKey,
    mut item: Map<String, Value>,
) -> ApiResult<(StatusCode, Json<AcceptedBody>)> {
    item.insert("containerId".to_string(), Value::String(key.name.clone()));
    match &key.stack {
        Some(stack) => item.insert("stack".to_string(), Value::String(stack.clone())),
        None => item.remove("stack"),
    };

    let envelope = Envelope::new(EnvelopeType::ContainerState, agent_id, now_millis())
        .with_payload(Value::Array(vec![Value::Object(item)]));
    let receipt = state.core.transport.submit_envelope(envelope)?;
    Ok(accepted_container(receipt, key))
}

fn object_body(body: Value) -> ApiResult<Map<String, Value>> {
    match body {
        Value::Object(map) => Ok(map),
        _ => Err(ApiError::BadRequest("expected a JSON object".to_string())),
    }
}

/// Report a container with its metadata (`id`, `stack`, `image`,
/// `createdAt`, optionally `state` and `since`). A JSON array reports several.
async fn register_container(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    if body.is_array() {
        let envelope = Envelope::new(EnvelopeType::ContainerState, agent_id, now_millis()).with_payload(body);
        let receipt = state.core.transport.submit_envelope(envelope)?;
        return Ok(accepted(receipt).into_response());
    }

    let item = object_body(body)?;
    let id = ["containerId", "id", "name"]
        .iter()
        .find_map(|field| item.get(*field).and_then(Value::as_str))
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest("missing container `id`".to_string()))?;
    let stack = item.get("stack").and_then(Value::as_str).filter(|s| !s.is_empty());
    let key = match stack {
        Some(stack) => ContainerKey::new(Some(stack.to_string()), &id),
        None => ContainerKey::parse(&id),
    };

    let mut item = item;
    for alias in ["id", "name"] {
        item.remove(alias);
    }
    Ok(submit_container_state(&state, agent_id, &key, item)?.into_response())
}

/// Update metadata or state of a container
async fn update_container(
    State(state): State<Arc<AppState>>,
    Path((agent_id, container_id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    let key = ContainerKey::parse(&container_id);
    let mut item = object_body(body)?;
    for alias in ["id", "name", "containerId"] {
        item.remove(alias);
    }
    submit_container_state(&state, agent_id, &key, item)
}

#[derive(Debug, Deserialize)]
struct StatusParams {
    status: String,
    since: Option<i64>,
}

/// Runtime status change, e.g. `?status=exited&since=1700000000000`
async fn update_container_status(
    State(state): State<Arc<AppState>>,
    Path((agent_id, container_id)): Path<(String, String)>,
    Query(params): Query<StatusParams>,
) -> ApiResult<impl IntoResponse> {
    let key = ContainerKey::parse(&container_id);
    let mut item = Map::new();
    item.insert("state".to_string(), Value::String(params.status.to_lowercase()));
    if let Some(since) = params.since {
        item.insert("since".to_string(), json!(since));
    }
    submit_container_state(&state, agent_id, &key, item)
}

/// The agent no longer runs this container
async fn delete_container(
    State(state): State<Arc<AppState>>,
    Path((agent_id, container_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let key = ContainerKey::parse(&container_id);
    let mut item = Map::new();
    item.insert("containerId".to_string(), Value::String(key.name.clone()));
    if let Some(stack) = &key.stack {
        item.insert("stack".to_string(), Value::String(stack.clone()));
    }

    let envelope = Envelope::new(EnvelopeType::ContainerRemoved, agent_id, now_millis())
        .with_payload(Value::Array(vec![Value::Object(item)]));
    let receipt = state.core.transport.submit_envelope(envelope)?;
    Ok(accepted_container(receipt, &key))
}

#[derive(Debug, Default, Deserialize)]
struct ContainersParams {
    stack: Option<String>,
}

async fn list_containers(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ContainersParams>,
) -> impl IntoResponse {
    let containers = state
        .core
        .query
        .container_statuses(params.stack.as_deref(), now_millis())
        .await;
    Json(containers)
}

/// Container ids are `stack/name` or `name`; the slash arrives percent-encoded
async fn get_container(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let key = ContainerKey::parse(&id);
    Json(state.core.query.container_status(&key, now_millis()).await)
}

fn time_range(from: Option<i64>, to: Option<i64>) -> ApiResult<TimeRange> {
    if let (Some(from), Some(to)) = (from, to) {
        if from > to {
            return Err(ApiError::BadRequest("`from` must not be after `to`".to_string()));
        }
    }
    Ok(TimeRange { from, to })
}

#[derive(Debug, Default, Deserialize)]
struct MetricsParams {
    metric: Option<String>,
    from: Option<i64>,
    to: Option<i64>,
}

/// Metric history; without `metric`, the container's metric names
async fn container_metrics(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<MetricsParams>,
) -> ApiResult<Response> {
    let key = ContainerKey::parse(&id);
    let range = time_range(params.from, params.to)?;

    let response = match params.metric {
        Some(metric) => Json(state.core.query.metric_history(&key, &metric, range).await).into_response(),
        None => Json(json!({
            "container": key.id(),
            "metrics": state.core.query.metric_names(&key).await,
        }))
        .into_response(),
    };
    Ok(response)
}

#[derive(Debug, Default, Deserialize)]
struct LogsParams {
    from: Option<i64>,
    to: Option<i64>,
    limit: Option<usize>,
    level: Option<String>,
}

async fn container_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<LogsParams>,
) -> ApiResult<impl IntoResponse> {
    let key = ContainerKey::parse(&id);
    let range = time_range(params.from, params.to)?;

    let query = LogQuery {
        range,
        limit: params.limit,
        level: params.level.filter(|l| !l.is_empty()),
    };
    Ok(Json(state.core.query.recent_logs(&key, &query).await))
}

async fn list_agents(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.core.query.agents(now_millis()))
}

async fn list_services(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.core.query.services(now_millis()).await)
}

async fn list_orphans(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.core.query.orphans(now_millis()).await)
}

async fn uptime(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.core.query.uptime(now_millis()).await)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProgressBody {
    healthy: bool,
    last_ingest: i64,
    last_sweep: i64,
    backlog: usize,
    window_secs: u64,
}

/// Process liveness - 200 while the sweep runs and queued events get processed
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now = now_millis();
    let core = &state.core;
    let healthy = core.is_progressing(now, state.progress_window);

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ProgressBody {
            healthy,
            last_ingest: core.progress.last_progress(),
            last_sweep: core.sweep_progress.last_progress(),
            backlog: core.pipeline.backlog(),
            window_secs: state.progress_window.as_secs(),
        }),
    )
}

/// Component health - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.core.health.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.core.health.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/ingest", post(ingest))
        .route("/api/agent", post(register_agent))
        .route("/api/agent/", post(register_agent))
        .route("/api/agent/:agent_id", get(agent_info).delete(deregister_agent))
        .route("/api/agent/:agent_id/", get(agent_info).delete(deregister_agent))
        .route("/api/agent/:agent_id/heartbeat", post(agent_heartbeat))
        .route("/api/agent/:agent_id/metrics", post(agent_metrics))
        .route("/api/agent/:agent_id/logs", post(agent_logs))
        .route(
            "/api/agent/:agent_id/container",
            get(agent_containers).post(register_container),
        )
        .route(
            "/api/agent/:agent_id/container/",
            get(agent_containers).post(register_container),
        )
        .route(
            "/api/agent/:agent_id/container/:container_id",
            post(update_container).delete(delete_container),
        )
        .route(
            "/api/agent/:agent_id/container/:container_id/",
            post(update_container).delete(delete_container),
        )
        .route(
            "/api/agent/:agent_id/container/:container_id/status",
            post(update_container_status),
        )
        .route("/api/web/containers", get(list_containers))
        .route("/api/web/containers/:id", get(get_container))
        .route("/api/web/containers/:id/metrics", get(container_metrics))
        .route("/api/web/containers/:id/logs", get(container_logs))
        .route("/api/web/agents", get(list_agents))
        .route("/api/web/services", get(list_services))
        .route("/api/web/orphans", get(list_orphans))
        .route("/api/web/uptime", get(uptime))
        .route("/health", get(health))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the API until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);

    info!(addr = %listener.local_addr()?, "Starting API server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

//! Integration tests for the server API endpoints

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use clogs_lib::{
    engine::{LogPatternSpec, RuleSet, ThresholdRuleSpec},
    ClogsCore, CoreSettings,
};
use clogs_server::api::{create_router, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<ClogsCore>) {
    let rules = RuleSet::compile(
        &[ThresholdRuleSpec::Expression("cpu > 90 -> degraded".to_string())],
        &[LogPatternSpec {
            name: "fatal".to_string(),
            pattern: "(?i)fatal".to_string(),
            level: None,
            severity: None,
        }],
    )
    .unwrap();

    let core = Arc::new(ClogsCore::new(CoreSettings {
        instance: "api-test".to_string(),
        rules,
        ..Default::default()
    }));
    core.register_components().await;
    core.health.set_ready(true).await;

    let state = Arc::new(AppState::new(Arc::clone(&core), Duration::from_secs(120)));
    (create_router(state), core)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

/// Poll a container until it reports `status`, since ingestion is asynchronous
async fn wait_for_status(app: &Router, container: &str, status: &str) -> Value {
    let uri = format!("/api/web/containers/{}", container);
    let mut last = Value::Null;
    for _ in 0..100 {
        let (code, body) = send(app, Method::GET, &uri, None).await;
        assert_eq!(code, StatusCode::OK);
        if body["status"] == status {
            return body;
        }
        last = body;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("container {} never reached {}: {}", container, status, last);
}

#[tokio::test]
async fn test_ingest_envelope_accepted() {
    let (app, _core) = setup_test_app().await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/v1/ingest",
        Some(json!({ "type": "Heartbeat", "agentId": "agent-1" })),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["agentId"], "agent-1");
    assert_eq!(body["kind"], "heartbeat");
}

#[tokio::test]
async fn test_malformed_envelope_rejected() {
    let (app, _core) = setup_test_app().await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/ingest")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/v1/ingest",
        Some(json!({ "type": "MetricBatch", "agentId": "agent-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "decode");
}

#[tokio::test]
async fn test_threshold_breach_degrades_container() {
    let (app, _core) = setup_test_app().await;

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/agent",
        Some(json!({ "agentId": "agent-1", "scope": ["web"], "hostname": "node-a" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/agent/agent-1/metrics",
        Some(json!([{ "containerId": "web", "metric": "cpu", "value": 95.0 }])),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let container = wait_for_status(&app, "web", "degraded").await;
    assert_eq!(container["container"], "web");

    let (status, history) = send(
        &app,
        Method::GET,
        "/api/web/containers/web/metrics?metric=cpu",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history.as_array().map(|h| h.len()), Some(1));
    assert_eq!(history[0]["value"], 95.0);

    let (_, names) = send(&app, Method::GET, "/api/web/containers/web/metrics", None).await;
    assert_eq!(names["metrics"], json!(["cpu"]));
}

#[tokio::test]
async fn test_fatal_log_marks_stack_container_unhealthy() {
    let (app, _core) = setup_test_app().await;

    send(
        &app,
        Method::POST,
        "/api/agent",
        Some(json!({ "agentId": "stack-agent", "scope": { "stack": "shop" } })),
    )
    .await;

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/agent/stack-agent/logs",
        Some(json!([
            { "containerId": "api", "text": "listening on :80" },
            { "containerId": "api", "text": "FATAL: cannot reach database", "level": "error" }
        ])),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let container = wait_for_status(&app, "shop%2Fapi", "unhealthy").await;
    assert_eq!(container["stack"], "shop");
    assert_eq!(container["name"], "api");

    let (_, logs) = send(
        &app,
        Method::GET,
        "/api/web/containers/shop%2Fapi/logs?level=error",
        None,
    )
    .await;
    assert_eq!(logs.as_array().map(|l| l.len()), Some(1));

    let (_, services) = send(&app, Method::GET, "/api/web/services", None).await;
    assert_eq!(services[0]["stack"], "shop");
    assert_eq!(services[0]["status"], "unhealthy");

    let (_, orphans) = send(&app, Method::GET, "/api/web/orphans", None).await;
    assert_eq!(orphans, json!([]));
}

#[tokio::test]
async fn test_unknown_container_reads_unknown() {
    let (app, _core) = setup_test_app().await;

    let (status, body) = send(&app, Method::GET, "/api/web/containers/ghost", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "unknown");

    let (status, logs) = send(&app, Method::GET, "/api/web/containers/ghost/logs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(logs, json!([]));
}

#[tokio::test]
async fn test_inverted_range_rejected() {
    let (app, _core) = setup_test_app().await;

    let (status, body) = send(
        &app,
        Method::GET,
        "/api/web/containers/web/logs?from=200&to=100",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "bad_request");
}

#[tokio::test]
async fn test_register_without_id_assigns_one() {
    let (app, core) = setup_test_app().await;

    let (status, body) = send(&app, Method::POST, "/api/agent/", Some(json!({ "scope": [] }))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let agent_id = body["agentId"].as_str().unwrap().to_string();
    assert!(uuid::Uuid::parse_str(&agent_id).is_ok());

    for _ in 0..100 {
        if core.registry.agent(&agent_id, clogs_lib::now_millis()).is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("agent {} was never registered", agent_id);
}

#[tokio::test]
async fn test_deregister_agent() {
    let (app, core) = setup_test_app().await;

    send(
        &app,
        Method::POST,
        "/api/agent",
        Some(json!({ "agentId": "agent-9", "scope": ["db"] })),
    )
    .await;

    let mut registered = false;
    for _ in 0..100 {
        if core.registry.agent("agent-9", clogs_lib::now_millis()).is_some() {
            registered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(registered);

    let (status, _) = send(&app, Method::DELETE, "/api/agent/agent-9", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, agents) = send(&app, Method::GET, "/api/web/agents", None).await;
    assert_eq!(agents[0]["agent_id"], "agent-9");
    assert_eq!(agents[0]["state"], "retired");

    let (status, body) = send(&app, Method::DELETE, "/api/agent/nobody/", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["reason"], "not_found");
}

#[tokio::test]
async fn test_health_endpoints() {
    let (app, _core) = setup_test_app().await;

    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["healthy"], true);

    let (status, body) = send(&app, Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = send(&app, Method::GET, "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
}

#[tokio::test]
async fn test_not_ready_until_flagged() {
    let (app, core) = setup_test_app().await;
    core.health.set_ready(false).await;

    let (status, body) = send(&app, Method::GET, "/readyz", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["ready"], false);
}

#[tokio::test]
async fn test_ingest_after_shutdown_is_unavailable() {
    let (app, core) = setup_test_app().await;
    core.pipeline.shutdown(Duration::from_secs(1)).await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/agent/agent-1/heartbeat",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["reason"], "closed");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, _core) = setup_test_app().await;

    send(
        &app,
        Method::POST,
        "/api/v1/ingest",
        Some(json!({ "type": "Heartbeat", "agentId": "agent-m" })),
    )
    .await;

    let request = Request::builder()
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("clogs_server_events_accepted_total"));
}

/// Poll an endpoint until `done` accepts its body
async fn wait_for(app: &Router, uri: &str, done: impl Fn(&Value) -> bool) -> Value {
    let mut last = Value::Null;
    for _ in 0..100 {
        let (_, body) = send(app, Method::GET, uri, None).await;
        if done(&body) {
            return body;
        }
        last = body;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never reached the expected state: {}", uri, last);
}

#[tokio::test]
async fn test_exited_container_reports_unhealthy() {
    let (app, _core) = setup_test_app().await;

    send(
        &app,
        Method::POST,
        "/api/agent",
        Some(json!({ "agentId": "agent-1", "scope": ["web"] })),
    )
    .await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/agent/agent-1/container/",
        Some(json!({ "id": "web", "image": "nginx:1.25", "createdAt": 1_700_000_000_000i64 })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["container"], "web");

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/agent/agent-1/container/web/status?status=exited",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let container = wait_for_status(&app, "web", "unhealthy").await;
    assert_eq!(container["run_state"], "exited");
    assert_eq!(container["reason"], "container exited");

    let (status, containers) = send(&app, Method::GET, "/api/agent/agent-1/container", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(containers[0]["id"], "web");
    assert_eq!(containers[0]["image"], "nginx:1.25");
    assert_eq!(containers[0]["run_state"], "exited");

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/agent/agent-1/container/web/status?status=sleepy",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_update_container_metadata() {
    let (app, _core) = setup_test_app().await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/agent/agent-1/container/shop%2Fapi",
        Some(json!({ "image": "api:2", "state": "running" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["container"], "shop/api");

    let containers = wait_for(&app, "/api/agent/agent-1/container", |body| {
        body.as_array().map_or(false, |c| !c.is_empty())
    })
    .await;
    assert_eq!(containers[0]["id"], "shop/api");
    assert_eq!(containers[0]["image"], "api:2");
    assert_eq!(containers[0]["run_state"], "running");

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/agent/agent-1/container/api",
        Some(json!(["not", "an", "object"])),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_delete_container() {
    let (app, core) = setup_test_app().await;

    send(
        &app,
        Method::POST,
        "/api/agent/agent-1/metrics",
        Some(json!([{ "containerId": "web", "metric": "cpu", "value": 10.0 }])),
    )
    .await;
    wait_for_status(&app, "web", "healthy").await;

    let (status, body) = send(&app, Method::DELETE, "/api/agent/agent-1/container/web/", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["kind"], "container_removed");

    wait_for(&app, "/api/agent/agent-1/container", |body| *body == json!([])).await;
    assert_eq!(core.registry.container_count(), 0);

    let (_, history) = send(
        &app,
        Method::GET,
        "/api/web/containers/web/metrics?metric=cpu",
        None,
    )
    .await;
    assert_eq!(history, json!([]));
}

#[tokio::test]
async fn test_agent_info() {
    let (app, _core) = setup_test_app().await;

    send(
        &app,
        Method::POST,
        "/api/agent",
        Some(json!({ "agentId": "agent-3", "scope": ["db"], "hostname": "node-c" })),
    )
    .await;

    let agent = wait_for(&app, "/api/agent/agent-3/", |body| body["agent_id"] == "agent-3").await;
    assert_eq!(agent["hostname"], "node-c");

    let (status, body) = send(&app, Method::GET, "/api/agent/nobody", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["reason"], "not_found");

    let (status, _) = send(&app, Method::GET, "/api/agent/nobody/container", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_deregister_makes_containers_stale_immediately() {
    let (app, _core) = setup_test_app().await;

    send(
        &app,
        Method::POST,
        "/api/agent",
        Some(json!({ "agentId": "agent-9", "scope": ["db"] })),
    )
    .await;
    send(
        &app,
        Method::POST,
        "/api/agent/agent-9/metrics",
        Some(json!([{ "containerId": "db", "metric": "cpu", "value": 10.0 }])),
    )
    .await;
    wait_for_status(&app, "db", "healthy").await;

    let (status, _) = send(&app, Method::DELETE, "/api/agent/agent-9", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // no sweep in between
    let (_, container) = send(&app, Method::GET, "/api/web/containers/db", None).await;
    assert_eq!(container["status"], "stale");
}

#[tokio::test]
async fn test_health_reports_ingest_and_sweep_progress() {
    let (app, _core) = setup_test_app().await;

    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["lastIngest"].is_i64());
    assert!(body["lastSweep"].is_i64());
    assert_eq!(body["backlog"], 0);
    assert_eq!(body["windowSecs"], 120);
}

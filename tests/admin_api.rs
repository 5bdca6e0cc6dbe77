//! Admin API routes and status mapping

mod common;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use common::{harness, Harness, ScriptedClient};
use http_body_util::BodyExt;
use publish_gate::queue::PlatformClients;
use publish_gate::server::{router, AppState};
use publish_gate::GateSettings;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn setup() -> (Harness, Router) {
    let h = harness(
        GateSettings::default(),
        PlatformClients::new().with("x", ScriptedClient::new()),
    )
    .await;
    let app = router(AppState::new(h.gate.clone()));
    (h, app)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

async fn send_json(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = send(app, method, uri, body).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_configure_and_list_windows() {
    let (_h, app) = setup().await;

    let (status, body) = send_json(
        &app,
        Method::PUT,
        "/rate-limits",
        Some(json!({"platform": "x", "window_seconds": 900, "max_actions": 300})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["window"]["max_actions"], json!(300));

    let (status, body) = send_json(&app, Method::GET, "/rate-limits", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().unwrap().len(), 1);
    assert_eq!(body["items"][0]["platform"], json!("x"));
}

#[tokio::test]
async fn test_invalid_window_is_bad_request() {
    let (_h, app) = setup().await;
    let (status, body) = send_json(
        &app,
        Method::PUT,
        "/rate-limits",
        Some(json!({"platform": "x", "window_seconds": 0, "max_actions": 10})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("window_seconds"));
}

#[tokio::test]
async fn test_reset_unknown_platform_is_not_found() {
    let (_h, app) = setup().await;
    let (status, body) = send_json(&app, Method::POST, "/rate-limits/nope/reset", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_override_set_and_clear() {
    let (_h, app) = setup().await;
    send_json(
        &app,
        Method::PUT,
        "/rate-limits",
        Some(json!({"platform": "x", "window_seconds": 60, "max_actions": 10})),
    )
    .await;

    let (status, body) = send_json(
        &app,
        Method::POST,
        "/rate-limits/x/override",
        Some(json!({"factor": 2.0, "minutes": 30})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true, "platform": "x", "factor": 2.0, "minutes": 30}));

    let (_, body) = send_json(&app, Method::DELETE, "/rate-limits/x/override", None).await;
    assert_eq!(body, json!({"ok": true, "cleared": true}));
    let (_, body) = send_json(&app, Method::DELETE, "/rate-limits/x/override", None).await;
    assert_eq!(body, json!({"ok": true, "cleared": false}));
}

#[tokio::test]
async fn test_usage_series_and_csv() {
    let (h, app) = setup().await;
    h.gate.registry().configure("x", 60, 10).await.unwrap();
    h.gate.registry().acquire("x", 2).await.unwrap();

    let (status, body) = send_json(&app, Method::GET, "/rate-limits/x/usage?window=6h", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["window"], json!("6h"));
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), body["moving_average"].as_array().unwrap().len());
    let total: u64 = items.iter().map(|i| i["total"].as_u64().unwrap()).sum();
    assert_eq!(total, 2);

    let (status, _) = send_json(&app, Method::GET, "/rate-limits/x/usage?window=1y", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/rate-limits/x/usage.csv?window=6h")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/csv"));
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let csv = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(csv.lines().count() > 1);
}

#[tokio::test]
async fn test_queue_item_lifecycle() {
    let (_h, app) = setup().await;

    let (status, item) = send_json(
        &app,
        Method::POST,
        "/queue/items",
        Some(json!({"platform": "x", "payload": {"text": "hello"}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(item["state"], json!("queued"));
    let id = item["id"].as_str().unwrap().to_string();

    let (status, item) = send_json(&app, Method::POST, &format!("/queue/items/{}/pause", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(item["state"], json!("paused"));

    // Only failed items can be requeued
    let (status, _) = send_json(&app, Method::POST, &format!("/queue/items/{}/requeue", id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, item) = send_json(&app, Method::POST, &format!("/queue/items/{}/resume", id), None).await;
    assert_eq!(item["state"], json!("queued"));

    let (_, stats) = send_json(&app, Method::GET, "/queue/stats", None).await;
    assert_eq!(stats["total"], json!(1));
    assert_eq!(stats["queued"], json!(1));

    let (_, list) = send_json(&app, Method::GET, "/queue/items?platform=x&state=queued", None).await;
    assert_eq!(list["items"].as_array().unwrap().len(), 1);
    let (status, _) = send_json(&app, Method::GET, "/queue/items?state=bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send_json(&app, Method::GET, "/queue/items/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_enqueue_unknown_platform_is_not_found() {
    let (_h, app) = setup().await;
    let (status, _) = send_json(
        &app,
        Method::POST,
        "/queue/items",
        Some(json!({"platform": "nowhere", "payload": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_platform_pause_and_resume_all() {
    let (h, app) = setup().await;

    let (_, body) = send_json(&app, Method::POST, "/platforms/x/pause", None).await;
    assert_eq!(body["ok"], json!(true));
    assert!(h.gate.queue().is_platform_paused("x").await);

    let (_, body) = send_json(&app, Method::POST, "/platforms/x/resume", None).await;
    assert_eq!(body["ok"], json!(true));
    assert!(!h.gate.queue().is_platform_paused("x").await);

    h.gate.queue().halt_all("store unavailable").await;
    let (_, health) = send_json(&app, Method::GET, "/health", None).await;
    assert_eq!(health["status"], json!("critical"));

    let (_, body) = send_json(&app, Method::POST, "/platforms/resume-all", None).await;
    assert_eq!(body["ok"], json!(true));
    assert!(h.gate.queue().halted_reason().await.is_none());
}

#[tokio::test]
async fn test_slo_and_health() {
    let (_h, app) = setup().await;

    let (status, slo) = send_json(&app, Method::GET, "/metrics/slo", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(slo["errorRate"], json!(0.0));
    assert!(slo["rateLimitSaturation"].is_array());

    let (status, health) = send_json(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], json!("healthy"));
    assert!(health["uptime_secs"].is_u64());
    assert!(health["metrics"]["queueAge"].is_number());
}

#[tokio::test]
async fn test_store_outage_is_service_unavailable() {
    let (h, app) = setup().await;
    h.store.set_available(false);
    let (status, body) = send_json(
        &app,
        Method::PUT,
        "/rate-limits",
        Some(json!({"platform": "x", "window_seconds": 60, "max_actions": 10})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("Store unavailable"));
}

#[tokio::test]
async fn test_prometheus_endpoint() {
    let (_h, app) = setup().await;
    publish_gate::metrics::init().unwrap();
    let (status, body) = send(&app, Method::GET, "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("store_available"));
}

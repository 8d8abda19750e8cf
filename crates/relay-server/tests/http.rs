//! Router status codes and error bodies.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt as _;

struct TestApp {
    dir: tempfile::TempDir,
    app: Router,
}

fn test_app(tweak: impl FnOnce(&mut relay_config::Config)) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let mut config = relay_config::Config::default();
    config.sessions.roots = vec![dir.path().to_path_buf()];
    config.recording.dir = Some(dir.path().join("recordings"));
    config.runs.dir = Some(dir.path().join("runs"));
    tweak(&mut config);
    let app = relay_server::router(relay_server::build(Arc::new(config)));
    TestApp { dir, app }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let t = test_app(|_| {});
    let (status, body) = send(&t.app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn test_unknown_ids_are_not_found() {
    let t = test_app(|_| {});
    for request in [
        get("/api/runs/task/nope/output?offset=0"),
        get("/api/runs/stream/nope"),
        post_json("/api/runs/task/nope/stop", Value::Null),
        get("/api/terminal/snapshot/pty-missing"),
        get("/api/terminal/replay/pty-missing?tailBytes=10"),
    ] {
        let uri = request.uri().to_string();
        let (status, body) = send(&t.app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert!(body["error"].is_string(), "{uri}: {body}");
    }
}

#[tokio::test]
async fn test_bad_run_requests_are_client_errors() {
    let t = test_app(|c| c.agents.claude.binary = Some("/nonexistent/claude".into()));

    let outside = t.dir.path().parent().unwrap().display().to_string();
    let (status, body) = send(
        &t.app,
        post_json(
            "/api/runs/start",
            serde_json::json!({"prompt": "hi", "mode": "claude", "cwd": outside}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, body) = send(
        &t.app,
        post_json(
            "/api/runs/start",
            serde_json::json!({"prompt": "hi", "mode": "claude"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("claude"), "{body}");
}

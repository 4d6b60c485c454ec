mod support;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use uuid::Uuid;

use support::api_app::{build_test_app, create_session, request, send_json};

#[tokio::test]
async fn health_reports_service_identity() {
    let app = build_test_app().await;

    let response = send_json(&app.router, request(Method::GET, "/health", None)).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["status"], "healthy");
    assert_eq!(response.body["service"], "docchat-api");
    assert!(response.body["version"].as_str().is_some());
    assert!(response.body["timestamp"].as_str().is_some());
}

#[tokio::test]
async fn ready_counts_active_sessions() {
    let app = build_test_app().await;

    let before = send_json(&app.router, request(Method::GET, "/ready", None)).await;
    assert_eq!(before.status, StatusCode::OK);
    assert_eq!(before.body["status"], "ready");
    assert_eq!(before.body["active_sessions"], 0);

    create_session(&app.router).await;
    create_session(&app.router).await;

    let after = send_json(&app.router, request(Method::GET, "/ready", None)).await;
    assert_eq!(after.body["active_sessions"], 2);
}

#[tokio::test]
async fn created_sessions_are_unique_uuids() {
    let app = build_test_app().await;

    let first = create_session(&app.router).await;
    let second = create_session(&app.router).await;

    assert_ne!(first, second);
    Uuid::parse_str(&first).expect("session id should be a uuid");
    assert!(app.state.sessions.get(&first).is_some());
}

#[tokio::test]
async fn request_id_is_echoed_or_generated() {
    let app = build_test_app().await;

    let supplied = Request::builder()
        .method(Method::GET)
        .uri("/health")
        .header("x-request-id", "client-supplied-id")
        .body(Body::empty())
        .expect("request should build");
    let echoed = send_json(&app.router, supplied).await;
    assert_eq!(echoed.request_id.as_deref(), Some("client-supplied-id"));

    let generated = send_json(&app.router, request(Method::GET, "/health", None)).await;
    let generated_id = generated.request_id.expect("request id should be generated");
    assert!(!generated_id.is_empty());
}

#[tokio::test]
async fn sweep_expires_idle_sessions_but_keeps_their_data() {
    let app = build_test_app().await;
    let session_id = create_session(&app.router).await;
    support::api_app::upload_text(&app.router, &session_id, "notes.txt", "kept content").await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    let removed = app.state.sessions.sweep(Duration::from_millis(5));

    assert_eq!(removed, 1);
    assert!(app.state.sessions.is_empty());

    let ready = send_json(&app.router, request(Method::GET, "/ready", None)).await;
    assert_eq!(ready.body["active_sessions"], 0);

    let documents = send_json(
        &app.router,
        request(Method::GET, &format!("/documents/{session_id}"), None),
    )
    .await;
    assert_eq!(documents.status, StatusCode::OK);
    assert_eq!(documents.body.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn recently_touched_sessions_survive_sweep() {
    let app = build_test_app().await;
    let session_id = create_session(&app.router).await;

    let removed = app.state.sessions.sweep(Duration::from_secs(3600));

    assert_eq!(removed, 0);
    assert!(app.state.sessions.get(&session_id).is_some());
}

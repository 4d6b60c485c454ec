#![allow(dead_code)]

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use serde_json::{Value, json};
use shared::chat::ChatSettings;
use shared::config::{ApiConfig, LlmConfig};
use shared::documents::DocumentLimits;
use shared::repos::Store;
use tower::ServiceExt;

use api_server::http::{AppState, build_router};

const MULTIPART_BOUNDARY: &str = "docchat-integration-boundary";

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Store,
}

pub struct JsonResponse {
    pub status: StatusCode,
    pub body: Value,
    pub request_id: Option<String>,
}

pub struct RawResponse {
    pub status: StatusCode,
    pub retry_after: Option<String>,
    pub content_type: Option<String>,
    pub body: String,
}

pub fn test_config() -> ApiConfig {
    ApiConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        database_url: "sqlite::memory:".to_string(),
        database_max_connections: 1,
        credential_secret: "integration-test-credential-secret".to_string(),
        credential_salt: "integration-test-salt".to_string(),
        cors_origins: vec!["http://localhost:3000".to_string()],
        rate_limit_requests: 1_000,
        rate_limit_window_seconds: 60,
        session_max_age_seconds: 24 * 3600,
        session_sweep_interval_seconds: 0,
        documents: DocumentLimits::default(),
        chat: ChatSettings::default(),
        llm: LlmConfig {
            simulation_mode: true,
            simulation_delay_ms: 0,
            ..LlmConfig::default()
        },
    }
}

pub async fn build_test_app() -> TestApp {
    build_test_app_with(test_config()).await
}

pub async fn build_test_app_with(config: ApiConfig) -> TestApp {
    let store = super::test_store().await;
    let state =
        AppState::from_config(store.clone(), &config).expect("simulated provider should build");
    let router = build_router(state.clone());

    TestApp {
        router,
        state,
        store,
    }
}

pub async fn send_json(app: &Router, request: Request<Body>) -> JsonResponse {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request should succeed");
    let status = response.status();
    let request_id = response
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string);
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body should read");
    let body = serde_json::from_slice::<Value>(&body).unwrap_or_else(|_| json!({}));

    JsonResponse {
        status,
        body,
        request_id,
    }
}

pub async fn send_raw(app: &Router, request: Request<Body>) -> RawResponse {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request should succeed");
    let status = response.status();
    let header_value = |name: header::HeaderName| {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string)
    };
    let retry_after = header_value(header::RETRY_AFTER);
    let content_type = header_value(header::CONTENT_TYPE);
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body should read");

    RawResponse {
        status,
        retry_after,
        content_type,
        body: String::from_utf8(body.to_vec()).expect("response body should be utf-8"),
    }
}

pub fn request(method: Method, uri: &str, json_body: Option<Value>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);

    match json_body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request should build"),
        None => builder.body(Body::empty()).expect("request should build"),
    }
}

pub fn multipart_request(
    uri: &str,
    field_name: &str,
    filename: &str,
    content: &[u8],
) -> Request<Body> {
    let mut body = format!(
        "--{MULTIPART_BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"{field_name}\"; filename=\"{filename}\"\r\n\
         Content-Type: text/plain\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{MULTIPART_BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={MULTIPART_BOUNDARY}"),
        )
        .body(Body::from(body))
        .expect("request should build")
}

pub fn error_code(body: &Value) -> Option<&str> {
    body.get("error")
        .and_then(|error| error.get("code"))
        .and_then(Value::as_str)
}

/// Data payloads of every event in an SSE body, in order. Comment lines
/// such as keep-alives are skipped.
pub fn sse_data_events(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter_map(|event| {
            let data: Vec<&str> = event
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|value| value.strip_prefix(' ').unwrap_or(value))
                .collect();
            (!data.is_empty()).then(|| data.join("\n"))
        })
        .collect()
}

pub async fn create_session(app: &Router) -> String {
    let response = send_json(app, request(Method::POST, "/sessions", None)).await;
    assert_eq!(response.status, StatusCode::OK);
    response.body["session_id"]
        .as_str()
        .expect("session id should be returned")
        .to_string()
}

pub async fn configure_credential(app: &Router, session_id: &str) {
    let response = send_json(
        app,
        request(
            Method::POST,
            "/config/credential",
            Some(json!({"session_id": session_id, "secret": "sk-integration-test"})),
        ),
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);
}

pub async fn upload_text(app: &Router, session_id: &str, filename: &str, content: &str) -> Value {
    let response = send_json(
        app,
        request(
            Method::POST,
            "/documents",
            Some(json!({
                "session_id": session_id,
                "filename": filename,
                "content": content
            })),
        ),
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);
    response.body
}

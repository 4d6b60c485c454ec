use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use shared::models::{ErrorBody, ErrorResponse, HealthResponse, ReadinessResponse};
use tracing::warn;

use super::AppState;

const SERVICE_NAME: &str = "docchat-api";

pub(super) async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            service: SERVICE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
        }),
    )
}

pub(super) async fn ready(State(state): State<AppState>) -> Response {
    match state.store.ping().await {
        Ok(_) => (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready".to_string(),
                active_sessions: state.sessions.len(),
            }),
        )
            .into_response(),
        Err(err) => {
            warn!("readiness check failed: {err}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: ErrorBody {
                        code: "db_unavailable".to_string(),
                        message: "Database not ready".to_string(),
                    },
                }),
            )
                .into_response()
        }
    }
}

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use shared::models::CreateSessionResponse;
use tracing::{debug, info};

use super::AppState;

pub(super) async fn create_session(State(state): State<AppState>) -> impl IntoResponse {
    let session_id = state.sessions.create();
    info!(session_id = %session_id, active_sessions = state.sessions.len(), "session created");

    (StatusCode::OK, Json(CreateSessionResponse { session_id }))
}

/// Refreshes activity for sessions the registry knows. Unknown ids are
/// still served since their stored data outlives the registry.
pub(super) fn touch_session(state: &AppState, session_id: &str) {
    if !state.sessions.touch(session_id) {
        debug!(session_id, "request for session unknown to registry");
    }
}

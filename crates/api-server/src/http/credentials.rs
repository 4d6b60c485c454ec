use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use shared::models::{SetCredentialRequest, StatusResponse};
use tracing::info;

use super::AppState;
use super::errors::{json_rejection_response, vault_error_response};
use super::observability::RequestContext;
use super::sessions::touch_session;

pub(super) async fn set_credential(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    payload: Result<Json<SetCredentialRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return json_rejection_response(rejection),
    };
    touch_session(&state, &req.session_id);

    match state
        .vault
        .validate_and_store(&req.session_id, &req.secret)
        .await
    {
        Ok(_) => {
            info!(
                request_id = %context.request_id,
                session_id = %req.session_id,
                "api credential configured"
            );
            (
                StatusCode::OK,
                Json(StatusResponse {
                    status: "success".to_string(),
                    message: "API credential configured successfully".to_string(),
                }),
            )
                .into_response()
        }
        Err(err) => vault_error_response(err),
    }
}

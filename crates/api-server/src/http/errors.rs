use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use shared::chat::ChatError;
use shared::documents::DocumentError;
use shared::models::{ErrorBody, ErrorResponse};
use shared::repos::StoreError;
use shared::vault::VaultError;
use tracing::error;

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: message.to_string(),
            },
        }),
    )
        .into_response()
}

pub(super) fn bad_request_response(code: &str, message: &str) -> Response {
    error_response(StatusCode::BAD_REQUEST, code, message)
}

/// Malformed or mistyped JSON bodies keep axum's status but use the
/// standard error body.
pub(super) fn json_rejection_response(rejection: JsonRejection) -> Response {
    error_response(rejection.status(), "invalid_request", &rejection.body_text())
}

pub(super) fn internal_error_response() -> Response {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        "Unexpected server error",
    )
}

pub(super) fn too_many_requests_response(retry_after_seconds: u64) -> Response {
    let mut response = error_response(
        StatusCode::TOO_MANY_REQUESTS,
        "rate_limited",
        "Too many requests; retry later",
    );

    if let Ok(retry_after_value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, retry_after_value);
    }

    response
}

pub(super) fn store_error_response(err: StoreError) -> Response {
    error!("database operation failed: {err}");
    internal_error_response()
}

pub(super) fn document_error_response(err: DocumentError) -> Response {
    let message = err.to_string();
    match err {
        DocumentError::InvalidEncoding => bad_request_response("invalid_encoding", &message),
        DocumentError::TooLarge { .. } => bad_request_response("document_too_large", &message),
        DocumentError::UnsupportedFileType => {
            bad_request_response("unsupported_file_type", &message)
        }
        DocumentError::Store(err) => store_error_response(err),
    }
}

pub(super) fn vault_error_response(err: VaultError) -> Response {
    match err {
        VaultError::NotConfigured => bad_request_response(
            "credential_missing",
            "API credential is not configured for this session",
        ),
        VaultError::Invalid => {
            bad_request_response("credential_invalid", "Invalid API credential")
        }
        VaultError::DecryptFailed => bad_request_response(
            "credential_invalid",
            "Stored API credential could not be read; set it again",
        ),
        VaultError::EncryptFailed => {
            error!("credential encryption failed");
            internal_error_response()
        }
        VaultError::Store(err) => store_error_response(err),
    }
}

pub(super) fn chat_error_response(err: ChatError) -> Response {
    match err {
        ChatError::EmptyQuery => bad_request_response("invalid_query", "Query must not be empty"),
        ChatError::CredentialMissing => vault_error_response(VaultError::NotConfigured),
        ChatError::Vault(err) => vault_error_response(err),
        ChatError::Store(err) => store_error_response(err),
    }
}

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use shared::documents::{StoredDocument, ensure_text_filename};
use shared::models::{DocumentSummary, DocumentUploadResponse, UploadDocumentRequest};
use tracing::{info, warn};

use super::AppState;
use super::errors::{
    bad_request_response, document_error_response, json_rejection_response, store_error_response,
};
use super::sessions::touch_session;

const FILE_FIELD: &str = "file";

pub(super) async fn upload_document_file(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    mut multipart: Multipart,
) -> Response {
    touch_session(&state, &session_id);

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                warn!(session_id = %session_id, "malformed multipart upload: {err}");
                return bad_request_response("invalid_multipart", "Malformed multipart body");
            }
        };

        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let filename = field.file_name().map(ToString::to_string);
        if let Err(err) = ensure_text_filename(filename.as_deref().unwrap_or_default()) {
            return document_error_response(err);
        }

        let bytes = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(session_id = %session_id, "failed to read uploaded file: {err}");
                return bad_request_response("invalid_multipart", "Uploaded file could not be read");
            }
        };

        return match state
            .documents
            .store_bytes(&session_id, filename.as_deref(), bytes.to_vec())
            .await
        {
            Ok(stored) => upload_response(&session_id, stored),
            Err(err) => document_error_response(err),
        };
    }

    bad_request_response("missing_file", "Multipart field 'file' is required")
}

pub(super) async fn upload_document_json(
    State(state): State<AppState>,
    payload: Result<Json<UploadDocumentRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return json_rejection_response(rejection),
    };
    touch_session(&state, &req.session_id);

    match state
        .documents
        .store_text(&req.session_id, req.filename.as_deref(), req.content)
        .await
    {
        Ok(stored) => upload_response(&req.session_id, stored),
        Err(err) => document_error_response(err),
    }
}

pub(super) async fn list_documents(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    touch_session(&state, &session_id);

    match state.documents.list(&session_id).await {
        Ok(documents) => {
            let summaries: Vec<DocumentSummary> =
                documents.iter().map(DocumentSummary::from).collect();
            (StatusCode::OK, Json(summaries)).into_response()
        }
        Err(err) => store_error_response(err),
    }
}

fn upload_response(session_id: &str, stored: StoredDocument) -> Response {
    info!(
        session_id,
        document_id = %stored.document.id,
        size_bytes = stored.document.size_bytes,
        deduplicated = !stored.created,
        "document upload handled"
    );

    (
        StatusCode::OK,
        Json(DocumentUploadResponse {
            document: DocumentSummary::from(&stored.document),
            deduplicated: !stored.created,
            stats: stored.stats,
        }),
    )
        .into_response()
}

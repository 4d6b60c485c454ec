use std::convert::Infallible;
use std::time::Instant;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde::Deserialize;
use shared::chat::ChatQuery;
use shared::models::{ChatHistoryEntry, ChatQueryRequest};
use tracing::info;

use super::AppState;
use super::errors::{chat_error_response, json_rejection_response, store_error_response};
use super::observability::RequestContext;
use super::sessions::touch_session;

const DEFAULT_HISTORY_LIMIT: u32 = 50;
const MAX_HISTORY_LIMIT: u32 = 500;

#[derive(Debug, Deserialize)]
pub(super) struct HistoryParams {
    limit: Option<u32>,
}

/// Streams the answer as server-sent events: one `data:` event per
/// fragment, ending with `[DONE]` or `ERROR: <message>`.
pub(super) async fn query(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    payload: Result<Json<ChatQueryRequest>, JsonRejection>,
) -> Response {
    let started_at = Instant::now();
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return json_rejection_response(rejection),
    };
    touch_session(&state, &req.session_id);

    let session_id = req.session_id.clone();
    let events = match state
        .chat
        .start(ChatQuery {
            request_id: context.request_id.clone(),
            session_id: req.session_id,
            query: req.query,
            document_id: req.document_id,
            started_at,
        })
        .await
    {
        Ok(events) => events,
        Err(err) => return chat_error_response(err),
    };

    info!(
        request_id = %context.request_id,
        session_id = %session_id,
        document_id = ?req.document_id,
        "chat stream started"
    );

    let stream =
        events.map(|event| Ok::<Event, Infallible>(Event::default().data(event.payload())));
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

pub(super) async fn history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Response {
    touch_session(&state, &session_id);

    match state
        .store
        .recent_messages(&session_id, history_limit(params.limit))
        .await
    {
        Ok(messages) => {
            let entries: Vec<ChatHistoryEntry> =
                messages.into_iter().map(ChatHistoryEntry::from).collect();
            (StatusCode::OK, Json(entries)).into_response()
        }
        Err(err) => store_error_response(err),
    }
}

fn history_limit(requested: Option<u32>) -> u32 {
    requested
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::history_limit;

    #[test]
    fn history_limit_defaults_and_clamps() {
        assert_eq!(history_limit(None), 50);
        assert_eq!(history_limit(Some(0)), 1);
        assert_eq!(history_limit(Some(10)), 10);
        assert_eq!(history_limit(Some(10_000)), 500);
    }
}

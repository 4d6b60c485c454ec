use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method, header};
use axum::routing::{get, post};
use axum::{Router, middleware};
use shared::chat::ChatPipeline;
use shared::config::ApiConfig;
use shared::documents::DocumentStore;
use shared::llm::{CompletionProvider, ProviderConfigError, provider_from_config};
use shared::repos::Store;
use shared::sessions::SessionRegistry;
use shared::vault::{CredentialCipher, CredentialVault};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

mod chat;
mod credentials;
mod documents;
mod errors;
mod health;
mod observability;
mod rate_limit;
mod sessions;

pub use rate_limit::{RateLimitPolicy, RateLimiter};

const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;
const CORS_WILDCARD: &str = "*";

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub sessions: SessionRegistry,
    pub documents: DocumentStore,
    pub vault: CredentialVault,
    pub chat: ChatPipeline,
    pub rate_limiter: RateLimiter,
    pub rate_limit_policy: RateLimitPolicy,
    pub cors_origins: Vec<String>,
}

impl AppState {
    /// Wires every component from configuration, choosing the provider
    /// named by the LLM settings.
    pub fn from_config(store: Store, config: &ApiConfig) -> Result<Self, ProviderConfigError> {
        let provider = provider_from_config(&config.llm)?;
        Ok(Self::with_provider(store, config, provider))
    }

    pub fn with_provider(
        store: Store,
        config: &ApiConfig,
        provider: Arc<dyn CompletionProvider>,
    ) -> Self {
        let documents = DocumentStore::new(store.clone(), config.documents);
        let vault = CredentialVault::new(
            store.clone(),
            CredentialCipher::derive(&config.credential_secret, &config.credential_salt),
            Arc::clone(&provider),
        );
        let chat = ChatPipeline::new(
            store.clone(),
            documents.clone(),
            vault.clone(),
            provider,
            config.chat.clone(),
        );

        Self {
            store,
            sessions: SessionRegistry::new(),
            documents,
            vault,
            chat,
            rate_limiter: RateLimiter::default(),
            rate_limit_policy: RateLimitPolicy {
                max_requests: config.rate_limit_requests,
                window_seconds: config.rate_limit_window_seconds,
            },
            cors_origins: config.cors_origins.clone(),
        }
    }
}

pub fn build_router(app_state: AppState) -> Router {
    let body_limit = app_state
        .documents
        .limits()
        .max_document_bytes
        .saturating_add(MULTIPART_OVERHEAD_BYTES);
    let cors = cors_layer(&app_state.cors_origins);
    let rate_limit_state = app_state.clone();

    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/sessions", post(sessions::create_session))
        .route(
            "/sessions/{session_id}/documents",
            post(documents::upload_document_file),
        )
        .route("/documents", post(documents::upload_document_json))
        .route("/documents/{session_id}", get(documents::list_documents))
        .route("/config/credential", post(credentials::set_credential))
        .route("/chat/query", post(chat::query))
        .route("/chat/history/{session_id}", get(chat::history))
        .layer(middleware::from_fn_with_state(
            rate_limit_state,
            rate_limit::rate_limit_middleware,
        ))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(middleware::from_fn(
            observability::request_observability_middleware,
        ))
        .with_state(app_state)
}

/// Explicit origins allow credentials. A `*` entry opens CORS to any origin,
/// which browsers only accept without credentials.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .max_age(Duration::from_secs(3600));

    if origins.iter().any(|origin| origin.trim() == CORS_WILDCARD) {
        warn!("CORS open to any origin; credentials disabled");
        return base.allow_origin(AllowOrigin::any());
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    base.allow_origin(AllowOrigin::list(allowed))
        .allow_credentials(true)
}

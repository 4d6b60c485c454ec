use std::future::Future;
use std::pin::Pin;

use futures_util::Stream;
use serde::Serialize;
use thiserror::Error;

pub type ProviderFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, CompletionError>> + Send + 'a>>;

/// Text fragments of a streamed completion, in arrival order.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, CompletionError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: PromptRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<PromptMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Raw user query, kept alongside the assembled messages for providers
    /// that answer without a model.
    pub query: String,
    pub document: Option<String>,
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("provider rejected the API credential")]
    Unauthorized,
    #[error("provider rate limit exceeded")]
    RateLimited,
    #[error("provider request timed out")]
    Timeout,
    #[error("provider request failed: {0}")]
    ProviderFailure(String),
    #[error("provider returned an invalid payload: {0}")]
    InvalidProviderPayload(String),
}

pub trait CompletionProvider: Send + Sync {
    /// Issues a minimal probe request. `Ok(false)` means the provider
    /// rejected the key.
    fn validate_key<'a>(&'a self, api_key: &'a str) -> ProviderFuture<'a, bool>;

    /// Opens a streaming completion. Retries, if any, happen before the
    /// first fragment is produced.
    fn open_stream<'a>(
        &'a self,
        api_key: &'a str,
        request: CompletionRequest,
    ) -> ProviderFuture<'a, FragmentStream>;
}

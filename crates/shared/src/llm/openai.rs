use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::provider::{
    CompletionError, CompletionProvider, CompletionRequest, FragmentStream, ProviderFuture,
};
use crate::config::LlmConfig;

const DONE_MARKER: &str = "[DONE]";
const VALIDATION_PROBE: &str = "Test";

#[derive(Debug, Clone)]
pub struct ChatCompletionsConfig {
    pub chat_completions_url: String,
    pub model: String,
    /// Bounds connecting, each retry attempt and every idle gap between
    /// streamed chunks.
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
}

impl From<&LlmConfig> for ChatCompletionsConfig {
    fn from(config: &LlmConfig) -> Self {
        Self {
            chat_completions_url: config.chat_completions_url.clone(),
            model: config.model.clone(),
            timeout_ms: config.timeout_ms,
            max_retries: config.max_retries,
            retry_base_backoff_ms: config.retry_base_backoff_ms,
            retry_max_backoff_ms: config.retry_max_backoff_ms,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderConfigError {
    #[error("failed to build provider http client: {0}")]
    HttpClient(String),
}

/// Streaming client for OpenAI-compatible `chat/completions` endpoints.
#[derive(Clone)]
pub struct ChatCompletionsProvider {
    client: reqwest::Client,
    config: ChatCompletionsConfig,
}

impl ChatCompletionsProvider {
    pub fn new(config: ChatCompletionsConfig) -> Result<Self, ProviderConfigError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|err| ProviderConfigError::HttpClient(err.to_string()))?;

        Ok(Self { client, config })
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let backoff_multiplier = 2_u64.saturating_pow(attempt);
        let backoff_ms = self
            .config
            .retry_base_backoff_ms
            .saturating_mul(backoff_multiplier)
            .min(self.config.retry_max_backoff_ms);
        Duration::from_millis(backoff_ms)
    }

    async fn connect_with_retries(
        &self,
        api_key: &str,
        body: &Value,
    ) -> Result<reqwest::Response, CompletionError> {
        let mut attempt = 0_u32;

        loop {
            match self.send_once(api_key, body).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    if err.retryable && attempt < self.config.max_retries {
                        let backoff = self.backoff_for(attempt);
                        warn!(
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            "provider request failed, retrying: {}",
                            err.error
                        );
                        sleep(backoff).await;
                        attempt = attempt.saturating_add(1);
                        continue;
                    }

                    return Err(err.error);
                }
            }
        }
    }

    async fn send_once(
        &self,
        api_key: &str,
        body: &Value,
    ) -> Result<reqwest::Response, SendAttemptError> {
        let send = self
            .client
            .post(&self.config.chat_completions_url)
            .bearer_auth(api_key)
            .header(ACCEPT, "text/event-stream")
            .json(body)
            .send();

        let response = match timeout(self.request_timeout(), send).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return Err(transport_attempt_error(&err)),
            Err(_) => return Err(SendAttemptError::retryable(CompletionError::Timeout)),
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_attempt_error(status, &body))
    }
}

impl CompletionProvider for ChatCompletionsProvider {
    fn validate_key<'a>(&'a self, api_key: &'a str) -> ProviderFuture<'a, bool> {
        Box::pin(async move {
            let probe = json!({
                "model": self.config.model,
                "messages": [{ "role": "user", "content": VALIDATION_PROBE }],
                "max_tokens": 1
            });

            let send = self
                .client
                .post(&self.config.chat_completions_url)
                .bearer_auth(api_key)
                .json(&probe)
                .send();

            let response = match timeout(self.request_timeout(), send).await {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => return Err(transport_attempt_error(&err).error),
                Err(_) => return Err(CompletionError::Timeout),
            };

            let status = response.status();
            if status.is_success() {
                return Ok(true);
            }
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Ok(false);
            }

            let body = response.text().await.unwrap_or_default();
            Err(status_attempt_error(status, &body).error)
        })
    }

    fn open_stream<'a>(
        &'a self,
        api_key: &'a str,
        request: CompletionRequest,
    ) -> ProviderFuture<'a, FragmentStream> {
        Box::pin(async move {
            let body = json!({
                "model": self.config.model,
                "messages": request.messages,
                "max_tokens": request.max_tokens,
                "temperature": request.temperature,
                "stream": true
            });

            let response = self.connect_with_retries(api_key, &body).await?;
            debug!(model = %self.config.model, "provider stream opened");

            Ok(sse_fragments(response.bytes_stream(), self.request_timeout()))
        })
    }
}

#[derive(Debug)]
struct SendAttemptError {
    error: CompletionError,
    retryable: bool,
}

impl SendAttemptError {
    fn retryable(error: CompletionError) -> Self {
        Self {
            error,
            retryable: true,
        }
    }

    fn non_retryable(error: CompletionError) -> Self {
        Self {
            error,
            retryable: false,
        }
    }
}

fn transport_attempt_error(err: &reqwest::Error) -> SendAttemptError {
    if err.is_timeout() {
        SendAttemptError::retryable(CompletionError::Timeout)
    } else {
        SendAttemptError::retryable(CompletionError::ProviderFailure(
            "request_unavailable".to_string(),
        ))
    }
}

fn status_attempt_error(status: StatusCode, body: &str) -> SendAttemptError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SendAttemptError::non_retryable(CompletionError::Unauthorized)
        }
        StatusCode::TOO_MANY_REQUESTS => SendAttemptError::retryable(CompletionError::RateLimited),
        _ => SendAttemptError {
            error: CompletionError::ProviderFailure(format!(
                "status={} code={}",
                status.as_u16(),
                parse_provider_error_code(body)
            )),
            retryable: is_retryable_status(status),
        },
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

fn parse_provider_error_code(body: &str) -> String {
    #[derive(Deserialize)]
    struct ProviderErrorEnvelope {
        error: Option<ProviderErrorDetails>,
    }

    #[derive(Deserialize)]
    struct ProviderErrorDetails {
        code: Option<Value>,
    }

    let parsed = serde_json::from_str::<ProviderErrorEnvelope>(body).ok();
    let Some(provider_error_code) = parsed
        .and_then(|envelope| envelope.error)
        .and_then(|details| details.code)
    else {
        return "unknown".to_string();
    };

    match provider_error_code {
        Value::String(code) => code,
        Value::Number(code) => code.to_string(),
        _ => "unknown".to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<StreamErrorBody>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamErrorBody {
    message: Option<String>,
}

enum SseEvent {
    Fragment(String),
    Done,
    Ignored,
    Failed(CompletionError),
}

struct SseState<S> {
    body: Pin<Box<S>>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String, CompletionError>>,
    finished: bool,
    idle_timeout: Duration,
}

impl<S> SseState<S> {
    fn push_event(&mut self, raw: &[u8]) {
        match parse_sse_event(raw) {
            SseEvent::Fragment(text) => self.pending.push_back(Ok(text)),
            SseEvent::Ignored => {}
            SseEvent::Done => self.finished = true,
            SseEvent::Failed(err) => {
                self.pending.push_back(Err(err));
                self.finished = true;
            }
        }
    }

    fn drain_complete_events(&mut self) {
        while !self.finished {
            let Some(pos) = find_event_boundary(&self.buffer) else {
                break;
            };
            let event: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            self.push_event(&event[..pos]);
        }
    }
}

/// Turns a server-sent-events byte stream of chat completion chunks into
/// text fragments. Ends at `[DONE]`, at end of body, or with an error when
/// no chunk arrives within `idle_timeout`.
fn sse_fragments<S, B, E>(body: S, idle_timeout: Duration) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let state = SseState {
        body: Box::pin(body),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
        idle_timeout,
    };

    Box::pin(futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match timeout(state.idle_timeout, state.body.next()).await {
                Ok(Some(Ok(chunk))) => {
                    state
                        .buffer
                        .extend(chunk.as_ref().iter().copied().filter(|byte| *byte != b'\r'));
                    state.drain_complete_events();
                }
                Ok(Some(Err(err))) => {
                    state.finished = true;
                    state
                        .pending
                        .push_back(Err(CompletionError::ProviderFailure(format!(
                            "stream interrupted: {err}"
                        ))));
                }
                Ok(None) => {
                    let tail = std::mem::take(&mut state.buffer);
                    state.push_event(&tail);
                    state.finished = true;
                }
                Err(_) => {
                    state.finished = true;
                    state.pending.push_back(Err(CompletionError::Timeout));
                }
            }
        }
    }))
}

fn find_event_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|window| window == b"\n\n")
}

fn parse_sse_event(raw: &[u8]) -> SseEvent {
    let text = String::from_utf8_lossy(raw);
    let data_lines: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .collect();
    if data_lines.is_empty() {
        return SseEvent::Ignored;
    }

    let data = data_lines.join("\n");
    if data.trim() == DONE_MARKER {
        return SseEvent::Done;
    }

    let chunk: StreamChunk = match serde_json::from_str(&data) {
        Ok(chunk) => chunk,
        Err(_) => {
            return SseEvent::Failed(CompletionError::InvalidProviderPayload(
                "stream_chunk_parse_failed".to_string(),
            ));
        }
    };

    if let Some(error) = chunk.error {
        return SseEvent::Failed(CompletionError::ProviderFailure(
            error
                .message
                .unwrap_or_else(|| "stream_error".to_string()),
        ));
    }

    let fragment: String = chunk
        .choices
        .into_iter()
        .filter_map(|choice| choice.delta.content)
        .collect();
    if fragment.is_empty() {
        SseEvent::Ignored
    } else {
        SseEvent::Fragment(fragment)
    }
}

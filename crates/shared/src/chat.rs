use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::documents::DocumentStore;
use crate::llm::{
    CompletionProvider, CompletionRequest, PromptLimits, assemble_prompt, estimate_tokens,
};
use crate::models::MessageRole;
use crate::repos::{Store, StoreError};
use crate::vault::{CredentialVault, VaultError};

pub const DONE_SENTINEL: &str = "[DONE]";
pub const ERROR_PREFIX: &str = "ERROR: ";

#[derive(Debug, Clone, PartialEq)]
pub struct ChatSettings {
    /// Stored messages loaded as context for each query.
    pub history_fetch_limit: u32,
    /// Subset of the loaded history placed in the prompt.
    pub history_prompt_turns: usize,
    pub document_context_chars: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    pub channel_capacity: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            history_fetch_limit: 20,
            history_prompt_turns: 10,
            document_context_chars: 8000,
            max_tokens: 1000,
            temperature: 0.7,
            channel_capacity: 32,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Query must not be empty")]
    EmptyQuery,
    #[error("API credential is not configured for this session")]
    CredentialMissing,
    #[error(transparent)]
    Vault(VaultError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<VaultError> for ChatError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::NotConfigured => Self::CredentialMissing,
            other => Self::Vault(other),
        }
    }
}

/// One unit of the streamed answer as delivered to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Fragment(String),
    Done,
    Error(String),
}

impl StreamEvent {
    /// Text carried in the `data:` field of the server-sent event.
    pub fn payload(&self) -> String {
        match self {
            Self::Fragment(text) => text.clone(),
            Self::Done => DONE_SENTINEL.to_string(),
            Self::Error(message) => format!("{ERROR_PREFIX}{message}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatQuery {
    /// Correlates the relay's log lines with the HTTP request.
    pub request_id: String,
    pub session_id: String,
    pub query: String,
    pub document_id: Option<Uuid>,
    /// Request arrival, used for the stored processing time.
    pub started_at: Instant,
}

/// Per-session async locks. A held guard keeps its entry alive; idle entries
/// are dropped on the next acquire.
#[derive(Clone, Default)]
struct SessionLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl SessionLocks {
    async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.lock_map();
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(session_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    fn lock_map(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Runs a query end to end: credential, document and history lookup, user
/// message persistence, prompt assembly and the streamed provider answer.
#[derive(Clone)]
pub struct ChatPipeline {
    store: Store,
    documents: DocumentStore,
    vault: CredentialVault,
    provider: Arc<dyn CompletionProvider>,
    settings: ChatSettings,
    session_locks: SessionLocks,
}

impl ChatPipeline {
    pub fn new(
        store: Store,
        documents: DocumentStore,
        vault: CredentialVault,
        provider: Arc<dyn CompletionProvider>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            store,
            documents,
            vault,
            provider,
            settings,
            session_locks: SessionLocks::default(),
        }
    }

    /// Validates the query and returns the event stream for its answer.
    ///
    /// Failures before streaming starts are returned as errors. Once the
    /// stream is returned, failures arrive in-band as a final
    /// [`StreamEvent::Error`]. Queries on the same session run one at a
    /// time, from the history read until the answer is stored.
    pub async fn start(&self, query: ChatQuery) -> Result<ReceiverStream<StreamEvent>, ChatError> {
        if query.query.trim().is_empty() {
            return Err(ChatError::EmptyQuery);
        }
        let text = query.query;

        let api_key = self.vault.resolve(&query.session_id).await?;
        let session_guard = self.session_locks.acquire(&query.session_id).await;

        let document = self
            .resolve_document(&query.session_id, query.document_id)
            .await?;
        let history = self
            .store
            .recent_messages(&query.session_id, self.settings.history_fetch_limit)
            .await?;

        self.store
            .append_message(&query.session_id, MessageRole::User, &text, 0, 0)
            .await?;

        let messages = assemble_prompt(
            &text,
            document.as_deref(),
            &history,
            PromptLimits {
                document_context_chars: self.settings.document_context_chars,
                history_turns: self.settings.history_prompt_turns,
            },
        );
        let request = CompletionRequest {
            messages,
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            query: text,
            document,
        };

        debug!(
            request_id = %query.request_id,
            session_id = %query.session_id,
            history_messages = history.len(),
            has_document = request.document.is_some(),
            "chat query accepted"
        );

        let (tx, rx) = mpsc::channel(self.settings.channel_capacity.max(1));
        let relay = AnswerRelay {
            store: self.store.clone(),
            provider: Arc::clone(&self.provider),
            request_id: query.request_id,
            session_id: query.session_id,
            started_at: query.started_at,
            tx,
            _session_guard: session_guard,
        };
        tokio::spawn(relay.run(api_key, request));

        Ok(ReceiverStream::new(rx))
    }

    /// Content of the requested document. Ids that do not resolve within the
    /// session fall back to no document.
    async fn resolve_document(
        &self,
        session_id: &str,
        document_id: Option<Uuid>,
    ) -> Result<Option<String>, StoreError> {
        let Some(document_id) = document_id else {
            return Ok(None);
        };

        match self.documents.get_for_session(session_id, document_id).await? {
            Some(document) => Ok(Some(document.content)),
            None => {
                warn!(
                    session_id,
                    %document_id,
                    "document not found for session, answering without document"
                );
                Ok(None)
            }
        }
    }
}

/// Producer side of one streamed answer.
struct AnswerRelay {
    store: Store,
    provider: Arc<dyn CompletionProvider>,
    request_id: String,
    session_id: String,
    started_at: Instant,
    tx: mpsc::Sender<StreamEvent>,
    _session_guard: OwnedMutexGuard<()>,
}

impl AnswerRelay {
    async fn run(self, api_key: String, request: CompletionRequest) {
        let opened = tokio::select! {
            _ = self.tx.closed() => {
                info!(
                    request_id = %self.request_id,
                    session_id = %self.session_id,
                    "client disconnected before provider stream opened",
                );
                return;
            }
            opened = self.provider.open_stream(&api_key, request) => opened,
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) => {
                warn!(
                    request_id = %self.request_id,
                    session_id = %self.session_id,
                    "provider stream failed to open: {err}",
                );
                self.send(StreamEvent::Error(err.to_string())).await;
                return;
            }
        };

        let mut answer = String::new();
        loop {
            let next = tokio::select! {
                _ = self.tx.closed() => {
                    info!(
                        request_id = %self.request_id,
                        session_id = %self.session_id,
                        "client disconnected, provider stream released",
                    );
                    return;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(fragment)) => {
                    answer.push_str(&fragment);
                    if !self.send(StreamEvent::Fragment(fragment)).await {
                        return;
                    }
                }
                Some(Err(err)) => {
                    warn!(
                        request_id = %self.request_id,
                        session_id = %self.session_id,
                        "provider stream failed: {err}",
                    );
                    self.send(StreamEvent::Error(err.to_string())).await;
                    return;
                }
                None => break,
            }
        }
        drop(stream);

        let tokens_used = estimate_tokens(&answer);
        let processing_time_ms =
            u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX);

        match self
            .store
            .append_message(
                &self.session_id,
                MessageRole::Assistant,
                &answer,
                tokens_used,
                processing_time_ms,
            )
            .await
        {
            Ok(_) => {
                info!(
                    request_id = %self.request_id,
                    session_id = %self.session_id,
                    tokens_used,
                    processing_time_ms,
                    "chat answer stored"
                );
                self.send(StreamEvent::Done).await;
            }
            Err(err) => {
                warn!(
                    request_id = %self.request_id,
                    session_id = %self.session_id,
                    "failed to store chat answer: {err}",
                );
                self.send(StreamEvent::Error("failed to store response".to_string()))
                    .await;
            }
        }
    }

    async fn send(&self, event: StreamEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use futures_util::StreamExt;

    use super::*;
    use crate::documents::DocumentLimits;
    use crate::llm::{CompletionError, FragmentStream, ProviderFuture, SimulatedProvider};
    use crate::repos::test_store;
    use crate::vault::CredentialCipher;

    /// Replays fixed fragments and records every request it receives.
    #[derive(Default)]
    struct ScriptedProvider {
        fragments: Vec<&'static str>,
        fail_after: bool,
        requests: StdMutex<Vec<CompletionRequest>>,
    }

    impl CompletionProvider for ScriptedProvider {
        fn validate_key<'a>(&'a self, _api_key: &'a str) -> ProviderFuture<'a, bool> {
            Box::pin(async { Ok(true) })
        }

        fn open_stream<'a>(
            &'a self,
            _api_key: &'a str,
            request: CompletionRequest,
        ) -> ProviderFuture<'a, FragmentStream> {
            self.requests
                .lock()
                .expect("request log should lock")
                .push(request);
            let mut items: Vec<Result<String, CompletionError>> = self
                .fragments
                .iter()
                .map(|fragment| Ok(fragment.to_string()))
                .collect();
            if self.fail_after {
                items.push(Err(CompletionError::Timeout));
            }
            Box::pin(async move {
                let stream: FragmentStream = Box::pin(futures_util::stream::iter(items));
                Ok(stream)
            })
        }
    }

    async fn pipeline_with(provider: Arc<dyn CompletionProvider>) -> (ChatPipeline, Store) {
        let store = test_store().await;
        let documents = DocumentStore::new(store.clone(), DocumentLimits::default());
        let vault = CredentialVault::new(
            store.clone(),
            CredentialCipher::derive("unit-test-secret-value", "unit-test-salt"),
            Arc::new(SimulatedProvider::default()),
        );
        let pipeline = ChatPipeline::new(
            store.clone(),
            documents,
            vault.clone(),
            provider,
            ChatSettings::default(),
        );
        vault
            .store("session-a", "sk-test")
            .await
            .expect("credential should store");
        (pipeline, store)
    }

    fn query(text: &str, document_id: Option<Uuid>) -> ChatQuery {
        ChatQuery {
            request_id: "req-test".to_string(),
            session_id: "session-a".to_string(),
            query: text.to_string(),
            document_id,
            started_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn streams_fragments_then_done_and_stores_both_turns() {
        let provider = Arc::new(ScriptedProvider {
            fragments: vec!["The sky ", "is blue."],
            ..ScriptedProvider::default()
        });
        let (pipeline, store) = pipeline_with(provider.clone()).await;

        let events: Vec<_> = pipeline
            .start(query("What color is the sky?", None))
            .await
            .expect("query should start")
            .collect()
            .await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Fragment("The sky ".to_string()),
                StreamEvent::Fragment("is blue.".to_string()),
                StreamEvent::Done,
            ]
        );

        let history = store
            .recent_messages("session-a", 10)
            .await
            .expect("history should load");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, MessageRole::User);
        assert_eq!(history[0].content, "What color is the sky?");
        assert_eq!(history[1].role, MessageRole::Assistant);
        assert_eq!(history[1].content, "The sky is blue.");
        assert_eq!(history[1].tokens_used, 4);
    }

    #[tokio::test]
    async fn empty_query_is_rejected_before_any_write() {
        let (pipeline, store) = pipeline_with(Arc::new(ScriptedProvider::default())).await;

        assert!(matches!(
            pipeline.start(query("   ", None)).await,
            Err(ChatError::EmptyQuery)
        ));
        assert!(
            store
                .recent_messages("session-a", 10)
                .await
                .expect("history should load")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn missing_credential_is_reported_without_storing_query() {
        let (pipeline, store) = pipeline_with(Arc::new(ScriptedProvider::default())).await;
        let mut other = query("hello", None);
        other.session_id = "session-without-key".to_string();

        assert!(matches!(
            pipeline.start(other).await,
            Err(ChatError::CredentialMissing)
        ));
        assert!(
            store
                .recent_messages("session-without-key", 10)
                .await
                .expect("history should load")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn provider_failure_ends_stream_with_error_and_keeps_user_turn() {
        let provider = Arc::new(ScriptedProvider {
            fragments: vec!["partial"],
            fail_after: true,
            ..ScriptedProvider::default()
        });
        let (pipeline, store) = pipeline_with(provider).await;

        let events: Vec<_> = pipeline
            .start(query("hello", None))
            .await
            .expect("query should start")
            .collect()
            .await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Fragment("partial".to_string()));
        assert!(matches!(&events[1], StreamEvent::Error(message) if message.contains("timed out")));

        let history = store
            .recent_messages("session-a", 10)
            .await
            .expect("history should load");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn document_and_history_reach_the_prompt() {
        let provider = Arc::new(ScriptedProvider {
            fragments: vec!["ok"],
            ..ScriptedProvider::default()
        });
        let (pipeline, store) = pipeline_with(provider.clone()).await;
        let documents = DocumentStore::new(store.clone(), DocumentLimits::default());
        let stored = documents
            .store_text("session-a", Some("sky.txt"), "The sky is blue.".to_string())
            .await
            .expect("document should store");

        let _: Vec<_> = pipeline
            .start(query("first", Some(stored.document.id)))
            .await
            .expect("query should start")
            .collect()
            .await;
        let _: Vec<_> = pipeline
            .start(query("second", Some(stored.document.id)))
            .await
            .expect("query should start")
            .collect()
            .await;

        let requests = provider.requests.lock().expect("request log should lock");
        let second = &requests[1];
        assert_eq!(second.document.as_deref(), Some("The sky is blue."));
        let contents: Vec<_> = second
            .messages
            .iter()
            .map(|message| message.content.as_str())
            .collect();
        assert!(contents[1].contains("The sky is blue."));
        assert_eq!(&contents[2..], &["first", "ok", "second"]);
    }

    #[tokio::test]
    async fn foreign_document_id_falls_back_to_no_document() {
        let provider = Arc::new(ScriptedProvider {
            fragments: vec!["ok"],
            ..ScriptedProvider::default()
        });
        let (pipeline, store) = pipeline_with(provider.clone()).await;
        let documents = DocumentStore::new(store, DocumentLimits::default());
        let foreign = documents
            .store_text("session-b", None, "Private notes.".to_string())
            .await
            .expect("document should store");

        let events: Vec<_> = pipeline
            .start(query("hello", Some(foreign.document.id)))
            .await
            .expect("query should start")
            .collect()
            .await;

        assert_eq!(events.last(), Some(&StreamEvent::Done));
        let requests = provider.requests.lock().expect("request log should lock");
        assert!(requests[0].document.is_none());
    }

    #[tokio::test]
    async fn dropped_receiver_stops_relay_without_storing_answer() {
        let (pipeline, store) = pipeline_with(Arc::new(SimulatedProvider::new(
            Duration::from_millis(50),
        )))
        .await;

        let mut events = pipeline
            .start(query("hello", None))
            .await
            .expect("query should start");
        let first = events.next().await;
        assert!(matches!(first, Some(StreamEvent::Fragment(_))));
        drop(events);

        // The next query on the session waits for the relay to let go of the
        // session lock, so completing it proves the relay stopped.
        tokio::time::timeout(Duration::from_secs(5), async {
            let stream = pipeline
                .start(query("again", None))
                .await
                .expect("second query should start");
            drop(stream);
        })
        .await
        .expect("session lock should be released");

        let history = store
            .recent_messages("session-a", 10)
            .await
            .expect("history should load");
        assert!(
            history
                .iter()
                .all(|message| message.role == MessageRole::User)
        );
    }

    #[tokio::test]
    async fn query_text_is_stored_and_prompted_as_sent() {
        let provider = Arc::new(ScriptedProvider {
            fragments: vec!["ok"],
            ..ScriptedProvider::default()
        });
        let (pipeline, store) = pipeline_with(provider.clone()).await;

        let _: Vec<_> = pipeline
            .start(query("  What color is the sky?\n", None))
            .await
            .expect("query should start")
            .collect()
            .await;

        let history = store
            .recent_messages("session-a", 10)
            .await
            .expect("history should load");
        assert_eq!(history[0].content, "  What color is the sky?\n");

        let requests = provider.requests.lock().expect("request log should lock");
        let last = requests[0].messages.last().expect("prompt should end with the query");
        assert_eq!(last.content, "  What color is the sky?\n");
    }

    #[tokio::test]
    async fn concurrent_queries_on_one_session_are_serialized() {
        let (pipeline, store) =
            pipeline_with(Arc::new(SimulatedProvider::new(Duration::from_millis(5)))).await;

        let tasks: Vec<_> = ["first", "second"]
            .into_iter()
            .map(|text| {
                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    pipeline
                        .start(query(text, None))
                        .await
                        .expect("query should start")
                        .collect::<Vec<_>>()
                        .await
                })
            })
            .collect();

        for task in tasks {
            let events = task.await.expect("query task should finish");
            assert_eq!(events.last(), Some(&StreamEvent::Done));
        }

        let history = store
            .recent_messages("session-a", 10)
            .await
            .expect("history should load");
        let roles: Vec<_> = history.iter().map(|message| message.role).collect();
        assert_eq!(
            roles,
            vec![
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::User,
                MessageRole::Assistant,
            ]
        );

        let mut questions = vec![history[0].content.as_str(), history[2].content.as_str()];
        questions.sort_unstable();
        assert_eq!(questions, vec!["first", "second"]);
        assert!(history[1].content.contains(history[0].content.as_str()));
        assert!(history[3].content.contains(history[2].content.as_str()));
    }

    #[tokio::test]
    async fn idle_session_locks_are_pruned_on_next_acquire() {
        let locks = SessionLocks::default();
        let released = locks.acquire("session-a").await;
        let _held = locks.acquire("session-b").await;
        drop(released);

        let _latest = locks.acquire("session-c").await;

        let mut sessions: Vec<_> = locks.lock_map().keys().cloned().collect();
        sessions.sort_unstable();
        assert_eq!(sessions, vec!["session-b", "session-c"]);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<StdMutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0
                .lock()
                .expect("log buffer should lock")
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn relay_logs_carry_the_request_id() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let provider = Arc::new(ScriptedProvider {
            fragments: vec!["ok"],
            ..ScriptedProvider::default()
        });
        let (pipeline, _store) = pipeline_with(provider).await;
        let mut traced = query("hello", None);
        traced.request_id = "req-relay-42".to_string();

        let events: Vec<_> = pipeline
            .start(traced)
            .await
            .expect("query should start")
            .collect()
            .await;
        assert_eq!(events.last(), Some(&StreamEvent::Done));

        let output = String::from_utf8(logs.0.lock().expect("log buffer should lock").clone())
            .expect("logs should be utf-8");
        let stored = output
            .lines()
            .find(|line| line.contains("chat answer stored"))
            .expect("answer storage should be logged");
        assert!(stored.contains("request_id=req-relay-42"));
        assert!(stored.contains("session_id=session-a"));
    }

    #[test]
    fn stream_event_payloads() {
        assert_eq!(StreamEvent::Fragment("hi".to_string()).payload(), "hi");
        assert_eq!(StreamEvent::Done.payload(), "[DONE]");
        assert_eq!(
            StreamEvent::Error("boom".to_string()).payload(),
            "ERROR: boom"
        );
    }
}

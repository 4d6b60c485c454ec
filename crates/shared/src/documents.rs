use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::models::{Document, DocumentStats};
use crate::repos::{NewDocument, Store, StoreError};

const DEFAULT_MAX_DOCUMENT_BYTES: usize = 1024 * 1024;
const DEFAULT_MAX_CHUNK_CHARS: usize = 4000;
const SENTENCE_SEPARATOR: &str = ". ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentLimits {
    pub max_document_bytes: usize,
    pub max_chunk_chars: usize,
}

impl Default for DocumentLimits {
    fn default() -> Self {
        Self {
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
            max_chunk_chars: DEFAULT_MAX_CHUNK_CHARS,
        }
    }
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Document must be valid UTF-8 text")]
    InvalidEncoding,
    #[error("Document too large. Maximum size: {max_bytes} bytes")]
    TooLarge { size_bytes: usize, max_bytes: usize },
    #[error("Only .txt files are supported")]
    UnsupportedFileType,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validated document content ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedDocument {
    pub content: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub stats: DocumentStats,
}

#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub document: Document,
    pub created: bool,
    pub stats: DocumentStats,
}

pub fn prepare_document_bytes(
    raw: Vec<u8>,
    limits: &DocumentLimits,
) -> Result<PreparedDocument, DocumentError> {
    check_size(raw.len(), limits)?;
    let content = String::from_utf8(raw).map_err(|_| DocumentError::InvalidEncoding)?;
    Ok(prepare_checked(content, limits))
}

pub fn prepare_document_text(
    content: String,
    limits: &DocumentLimits,
) -> Result<PreparedDocument, DocumentError> {
    check_size(content.len(), limits)?;
    Ok(prepare_checked(content, limits))
}

pub fn ensure_text_filename(filename: &str) -> Result<(), DocumentError> {
    if filename.to_ascii_lowercase().ends_with(".txt") {
        Ok(())
    } else {
        Err(DocumentError::UnsupportedFileType)
    }
}

/// Lowercase hex SHA-256 of the UTF-8 bytes.
pub fn content_hash(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// Sentence-based chunking: sentences split on ". " are packed greedily while
/// the running chunk stays under `max_chunk_chars`.
pub fn chunk_document(content: &str, max_chunk_chars: usize) -> Vec<String> {
    if content.trim().is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0_usize;

    for sentence in content.split(SENTENCE_SEPARATOR) {
        let sentence_chars = sentence.chars().count();
        if current_chars + sentence_chars >= max_chunk_chars && !current.is_empty() {
            chunks.push(current.trim().to_string());
            current.clear();
            current_chars = 0;
        }

        current.push_str(sentence);
        current.push_str(SENTENCE_SEPARATOR);
        current_chars += sentence_chars + SENTENCE_SEPARATOR.len();
    }

    if !current.is_empty() {
        chunks.push(current.trim().to_string());
    }

    chunks
}

fn check_size(size_bytes: usize, limits: &DocumentLimits) -> Result<(), DocumentError> {
    if size_bytes > limits.max_document_bytes {
        return Err(DocumentError::TooLarge {
            size_bytes,
            max_bytes: limits.max_document_bytes,
        });
    }
    Ok(())
}

fn prepare_checked(content: String, limits: &DocumentLimits) -> PreparedDocument {
    let stats = DocumentStats {
        word_count: content.split_whitespace().count(),
        char_count: content.chars().count(),
        chunk_count: chunk_document(&content, limits.max_chunk_chars).len(),
    };

    PreparedDocument {
        content_hash: content_hash(&content),
        size_bytes: content.len() as u64,
        content,
        stats,
    }
}

/// Document persistence with validation and per-session deduplication.
#[derive(Clone)]
pub struct DocumentStore {
    store: Store,
    limits: DocumentLimits,
}

impl DocumentStore {
    pub fn new(store: Store, limits: DocumentLimits) -> Self {
        Self { store, limits }
    }

    pub fn limits(&self) -> &DocumentLimits {
        &self.limits
    }

    /// Validates and stores raw uploaded bytes. Invalid input never reaches
    /// the database.
    pub async fn store_bytes(
        &self,
        session_id: &str,
        filename: Option<&str>,
        raw: Vec<u8>,
    ) -> Result<StoredDocument, DocumentError> {
        let prepared = prepare_document_bytes(raw, &self.limits)?;
        self.persist(session_id, filename, prepared).await
    }

    pub async fn store_text(
        &self,
        session_id: &str,
        filename: Option<&str>,
        content: String,
    ) -> Result<StoredDocument, DocumentError> {
        let prepared = prepare_document_text(content, &self.limits)?;
        self.persist(session_id, filename, prepared).await
    }

    pub async fn list(&self, session_id: &str) -> Result<Vec<Document>, StoreError> {
        self.store.list_documents(session_id).await
    }

    pub async fn get(&self, document_id: Uuid) -> Result<Option<Document>, StoreError> {
        self.store.get_document(document_id).await
    }

    pub async fn get_for_session(
        &self,
        session_id: &str,
        document_id: Uuid,
    ) -> Result<Option<Document>, StoreError> {
        self.store.get_session_document(session_id, document_id).await
    }

    async fn persist(
        &self,
        session_id: &str,
        filename: Option<&str>,
        prepared: PreparedDocument,
    ) -> Result<StoredDocument, DocumentError> {
        let (document, created) = self
            .store
            .insert_document_dedup(&NewDocument {
                session_id,
                filename,
                content: &prepared.content,
                content_hash: &prepared.content_hash,
                size_bytes: prepared.size_bytes,
            })
            .await?;

        debug!(
            session_id,
            document_id = %document.id,
            size_bytes = prepared.size_bytes,
            created,
            "document stored"
        );

        Ok(StoredDocument {
            document,
            created,
            stats: prepared.stats,
        })
    }
}

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

mod credentials;
mod documents;
mod messages;

pub use credentials::CredentialRecord;
pub use documents::NewDocument;

const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS documents (
        id BLOB PRIMARY KEY NOT NULL,
        session_id TEXT NOT NULL,
        filename TEXT,
        content TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        uploaded_at TEXT NOT NULL
     )",
    "CREATE UNIQUE INDEX IF NOT EXISTS documents_session_hash_idx
        ON documents (session_id, content_hash)",
    "CREATE INDEX IF NOT EXISTS documents_session_uploaded_idx
        ON documents (session_id, uploaded_at)",
    "CREATE TABLE IF NOT EXISTS chat_messages (
        id BLOB PRIMARY KEY NOT NULL,
        session_id TEXT NOT NULL,
        role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
        content TEXT NOT NULL,
        created_at TEXT NOT NULL,
        tokens_used INTEGER NOT NULL DEFAULT 0,
        processing_time_ms INTEGER NOT NULL DEFAULT 0
     )",
    "CREATE INDEX IF NOT EXISTS chat_messages_session_created_idx
        ON chat_messages (session_id, created_at)",
    "CREATE TABLE IF NOT EXISTS api_credentials (
        id BLOB PRIMARY KEY NOT NULL,
        session_id TEXT NOT NULL,
        service TEXT NOT NULL,
        encrypted_secret TEXT NOT NULL,
        created_at TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1
     )",
    "CREATE INDEX IF NOT EXISTS api_credentials_session_service_idx
        ON api_credentials (session_id, service, is_active)",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid persisted data: {0}")]
    InvalidData(String),
}

/// Durable storage for documents, chat messages and encrypted credentials.
///
/// Every operation commits on its own; there is no cross-operation
/// transaction.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let filename = options.get_filename();
        if let Some(parent) = filename.parent()
            && !parent.as_os_str().is_empty()
            && filename != std::path::Path::new(":memory:")
        {
            std::fs::create_dir_all(parent)?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Private in-memory database. The pool is pinned to a single connection
    /// that never expires, since closing it would discard the data.
    pub async fn connect_in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let _: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    /// Creates tables and indexes when they do not exist yet. Safe to run on
    /// every startup.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!(statements = SCHEMA_STATEMENTS.len(), "database schema ensured");
        Ok(())
    }
}

fn new_record_id() -> Uuid {
    Uuid::new_v4()
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

fn u64_from_db(value: i64, column: &str) -> Result<u64, StoreError> {
    u64::try_from(value)
        .map_err(|_| StoreError::InvalidData(format!("{column} is negative: {value}")))
}

fn u64_to_db(value: u64, column: &str) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::InvalidData(format!("{column} exceeds i64: {value}")))
}

#[cfg(test)]
pub(crate) async fn test_store() -> Store {
    let store = Store::connect_in_memory()
        .await
        .expect("in-memory store should open");
    store
        .ensure_schema()
        .await
        .expect("schema should apply");
    store
}

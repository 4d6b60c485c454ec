use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use crate::models::Document;

use super::{Store, StoreError, new_record_id, now, u64_from_db, u64_to_db};

const DOCUMENT_COLUMNS: &str =
    "id, session_id, filename, content, content_hash, size_bytes, uploaded_at";

#[derive(Debug, Clone)]
pub struct NewDocument<'a> {
    pub session_id: &'a str,
    pub filename: Option<&'a str>,
    pub content: &'a str,
    pub content_hash: &'a str,
    pub size_bytes: u64,
}

impl Store {
    /// Inserts the document unless the session already holds the same
    /// content hash. Returns the stored record and whether it was created by
    /// this call.
    pub async fn insert_document_dedup(
        &self,
        document: &NewDocument<'_>,
    ) -> Result<(Document, bool), StoreError> {
        let result = sqlx::query(
            "INSERT INTO documents (
                id,
                session_id,
                filename,
                content,
                content_hash,
                size_bytes,
                uploaded_at
             ) VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (session_id, content_hash) DO NOTHING",
        )
        .bind(new_record_id())
        .bind(document.session_id)
        .bind(document.filename)
        .bind(document.content)
        .bind(document.content_hash)
        .bind(u64_to_db(document.size_bytes, "size_bytes")?)
        .bind(now())
        .execute(&self.pool)
        .await?;

        let created = result.rows_affected() > 0;
        let stored = self
            .find_document_by_hash(document.session_id, document.content_hash)
            .await?
            .ok_or_else(|| {
                StoreError::InvalidData("document missing after insert".to_string())
            })?;

        Ok((stored, created))
    }

    pub async fn find_document_by_hash(
        &self,
        session_id: &str,
        content_hash: &str,
    ) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS}
             FROM documents
             WHERE session_id = $1
               AND content_hash = $2"
        ))
        .bind(session_id)
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(document_from_row).transpose()
    }

    pub async fn get_document(&self, document_id: Uuid) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS}
             FROM documents
             WHERE id = $1"
        ))
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(document_from_row).transpose()
    }

    pub async fn get_session_document(
        &self,
        session_id: &str,
        document_id: Uuid,
    ) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS}
             FROM documents
             WHERE id = $1
               AND session_id = $2"
        ))
        .bind(document_id)
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(document_from_row).transpose()
    }

    /// Most recent upload first.
    pub async fn list_documents(&self, session_id: &str) -> Result<Vec<Document>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS}
             FROM documents
             WHERE session_id = $1
             ORDER BY uploaded_at DESC, rowid DESC"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(document_from_row).collect()
    }
}

fn document_from_row(row: &SqliteRow) -> Result<Document, StoreError> {
    let size_bytes: i64 = row.try_get("size_bytes")?;

    Ok(Document {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        filename: row.try_get("filename")?,
        content: row.try_get("content")?,
        content_hash: row.try_get("content_hash")?,
        size_bytes: u64_from_db(size_bytes, "size_bytes")?,
        uploaded_at: row.try_get("uploaded_at")?,
    })
}

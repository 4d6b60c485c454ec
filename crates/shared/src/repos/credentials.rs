use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use super::{Store, StoreError, new_record_id, now};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub id: Uuid,
    pub session_id: String,
    pub service: String,
    pub encrypted_secret: String,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
}

impl Store {
    /// Stores a new active credential and deactivates any earlier active
    /// record for the same session and service. Older rows are kept.
    pub async fn replace_active_credential(
        &self,
        session_id: &str,
        service: &str,
        encrypted_secret: &str,
    ) -> Result<CredentialRecord, StoreError> {
        let record = CredentialRecord {
            id: new_record_id(),
            session_id: session_id.to_string(),
            service: service.to_string(),
            encrypted_secret: encrypted_secret.to_string(),
            created_at: now(),
            is_active: true,
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE api_credentials
             SET is_active = 0
             WHERE session_id = $1
               AND service = $2
               AND is_active = 1",
        )
        .bind(session_id)
        .bind(service)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO api_credentials (
                id,
                session_id,
                service,
                encrypted_secret,
                created_at,
                is_active
             ) VALUES ($1, $2, $3, $4, $5, 1)",
        )
        .bind(record.id)
        .bind(&record.session_id)
        .bind(&record.service)
        .bind(&record.encrypted_secret)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(record)
    }

    pub async fn latest_active_credential(
        &self,
        session_id: &str,
        service: &str,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, session_id, service, encrypted_secret, created_at, is_active
             FROM api_credentials
             WHERE session_id = $1
               AND service = $2
               AND is_active = 1
             ORDER BY created_at DESC, rowid DESC
             LIMIT 1",
        )
        .bind(session_id)
        .bind(service)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(credential_from_row).transpose()
    }

    pub async fn list_credentials(
        &self,
        session_id: &str,
        service: &str,
    ) -> Result<Vec<CredentialRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, session_id, service, encrypted_secret, created_at, is_active
             FROM api_credentials
             WHERE session_id = $1
               AND service = $2
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(session_id)
        .bind(service)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(credential_from_row).collect()
    }
}

fn credential_from_row(row: &SqliteRow) -> Result<CredentialRecord, StoreError> {
    Ok(CredentialRecord {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        service: row.try_get("service")?,
        encrypted_secret: row.try_get("encrypted_secret")?,
        created_at: row.try_get("created_at")?,
        is_active: row.try_get("is_active")?,
    })
}

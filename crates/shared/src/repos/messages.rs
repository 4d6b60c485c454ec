use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::models::{ChatMessage, MessageRole};

use super::{Store, StoreError, new_record_id, now, u64_from_db, u64_to_db};

impl Store {
    pub async fn append_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
        tokens_used: u32,
        processing_time_ms: u64,
    ) -> Result<ChatMessage, StoreError> {
        let message = ChatMessage {
            id: new_record_id(),
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            timestamp: now(),
            tokens_used,
            processing_time_ms,
        };

        sqlx::query(
            "INSERT INTO chat_messages (
                id,
                session_id,
                role,
                content,
                created_at,
                tokens_used,
                processing_time_ms
             ) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(message.id)
        .bind(&message.session_id)
        .bind(role.as_str())
        .bind(&message.content)
        .bind(message.timestamp)
        .bind(i64::from(tokens_used))
        .bind(u64_to_db(processing_time_ms, "processing_time_ms")?)
        .execute(&self.pool)
        .await?;

        Ok(message)
    }

    /// The `limit` most recent messages of a session, returned oldest first.
    pub async fn recent_messages(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, session_id, role, content, created_at, tokens_used, processing_time_ms
             FROM chat_messages
             WHERE session_id = $1
             ORDER BY created_at DESC, rowid DESC
             LIMIT $2",
        )
        .bind(session_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }
}

fn message_from_row(row: &SqliteRow) -> Result<ChatMessage, StoreError> {
    let role: String = row.try_get("role")?;
    let tokens_used: i64 = row.try_get("tokens_used")?;
    let processing_time_ms: i64 = row.try_get("processing_time_ms")?;

    Ok(ChatMessage {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        role: role_from_db(&role)?,
        content: row.try_get("content")?,
        timestamp: row.try_get("created_at")?,
        tokens_used: u32::try_from(tokens_used).map_err(|_| {
            StoreError::InvalidData(format!("tokens_used out of range: {tokens_used}"))
        })?,
        processing_time_ms: u64_from_db(processing_time_ms, "processing_time_ms")?,
    })
}

fn role_from_db(value: &str) -> Result<MessageRole, StoreError> {
    match value {
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => Err(StoreError::InvalidData(format!(
            "unknown message role persisted: {value}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use crate::models::MessageRole;
    use crate::repos::test_store;

    #[tokio::test]
    async fn recent_messages_returns_latest_window_in_chronological_order() {
        let store = test_store().await;

        for index in 0..5 {
            let role = if index % 2 == 0 {
                MessageRole::User
            } else {
                MessageRole::Assistant
            };
            store
                .append_message("session-a", role, &format!("turn {index}"), 0, 0)
                .await
                .expect("append should succeed");
        }

        let recent = store
            .recent_messages("session-a", 3)
            .await
            .expect("fetch should succeed");
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["turn 2", "turn 3", "turn 4"]);
    }

    #[tokio::test]
    async fn unknown_session_has_empty_history() {
        let store = test_store().await;

        let recent = store
            .recent_messages("missing", 50)
            .await
            .expect("fetch should succeed");
        assert!(recent.is_empty());
    }

    #[tokio::test]
    async fn persists_usage_metadata() {
        let store = test_store().await;

        store
            .append_message("session-a", MessageRole::Assistant, "answer", 42, 1_250)
            .await
            .expect("append should succeed");

        let recent = store
            .recent_messages("session-a", 10)
            .await
            .expect("fetch should succeed");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].role, MessageRole::Assistant);
        assert_eq!(recent[0].tokens_used, 42);
        assert_eq!(recent[0].processing_time_ms, 1_250);
    }
}

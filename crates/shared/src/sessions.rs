use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Process-local registry of live sessions.
///
/// Nothing here is persisted: a restart forgets every session while the
/// documents and messages that reference them stay in the database.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self) -> String {
        self.create_at(Utc::now())
    }

    fn create_at(&self, now: DateTime<Utc>) -> String {
        let mut sessions = self.lock_sessions();
        let id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        sessions.insert(
            id.clone(),
            Session {
                id: id.clone(),
                created_at: now,
                last_activity: now,
            },
        );
        debug!(session_id = %id, "session created");
        id
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.lock_sessions().get(session_id).cloned()
    }

    /// Refreshes last activity. Returns false for unknown ids.
    pub fn touch(&self, session_id: &str) -> bool {
        self.touch_at(session_id, Utc::now())
    }

    fn touch_at(&self, session_id: &str, now: DateTime<Utc>) -> bool {
        match self.lock_sessions().get_mut(session_id) {
            Some(session) => {
                session.last_activity = now;
                true
            }
            None => false,
        }
    }

    /// Removes every session idle for longer than `max_age`.
    pub fn sweep(&self, max_age: Duration) -> usize {
        self.sweep_at(Utc::now(), max_age)
    }

    fn sweep_at(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let mut sessions = self.lock_sessions();
        let before = sessions.len();
        sessions.retain(|_, session| now.signed_duration_since(session.last_activity) <= max_age);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.lock_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn spawn_sweeper(&self, interval: Duration, max_age: Duration) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = registry.sweep(max_age);
                if removed > 0 {
                    info!(removed, remaining = registry.len(), "expired sessions swept");
                }
            }
        })
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

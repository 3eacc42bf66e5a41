//! Chat sessions and append-only message storage.
//!
//! One active session per user, enforced by get-or-create rather than a
//! uniqueness constraint. Appends publish to the owning user's broadcast
//! group after the write commits, so other open connections for that user
//! see the message.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::broadcast::{BroadcastRegistry, MessagePush};

/// Durable chat session record.
#[derive(Debug, Clone)]
pub struct ChatSession {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_active: bool,
}

/// Durable message row, append-only.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub session_id: String,
    pub content: String,
    pub from_user: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("empty message content")]
    EmptyContent,
}

/// Storage collaborator for sessions and messages.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Idempotent: concurrent calls for the same user converge on one
    /// session.
    async fn get_or_create_session(&self, user_id: &str) -> ChatSession;

    /// Append a message verbatim. `origin` names the gateway connection
    /// that caused the write, if any; it is carried on the broadcast push
    /// so that connection can skip its own echo.
    async fn append_message(
        &self,
        session_id: &str,
        content: &str,
        from_user: bool,
        origin: Option<&str>,
    ) -> Result<StoredMessage, StoreError>;

    /// Messages for a session, oldest first.
    async fn messages(&self, session_id: &str) -> Result<Vec<StoredMessage>, StoreError>;
}

struct Inner {
    /// user_id -> session (one active session per user).
    by_user: HashMap<String, ChatSession>,
    /// session_id -> owning user (for publish routing).
    session_owner: HashMap<String, String>,
    /// session_id -> messages in insertion order.
    messages: HashMap<String, Vec<StoredMessage>>,
}

/// In-memory session store. The durable SQL variant lives with the REST
/// layer; the gateway only needs these three operations.
pub struct MemorySessionStore {
    inner: Arc<RwLock<Inner>>,
    events: Arc<BroadcastRegistry>,
}

impl MemorySessionStore {
    pub fn new(events: Arc<BroadcastRegistry>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                by_user: HashMap::new(),
                session_owner: HashMap::new(),
                messages: HashMap::new(),
            })),
            events,
        }
    }

    /// Number of sessions held; test observability.
    pub async fn session_count(&self) -> usize {
        self.inner.read().await.by_user.len()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_or_create_session(&self, user_id: &str) -> ChatSession {
        // Lookup-else-insert under one write lock so two connects from the
        // same user cannot race into two sessions.
        let mut g = self.inner.write().await;
        if let Some(session) = g.by_user.get(user_id) {
            return session.clone();
        }
        let now = Utc::now();
        let session = ChatSession {
            id: format!("sess-{}", uuid::Uuid::new_v4()),
            user_id: user_id.to_string(),
            created_at: now,
            updated_at: now,
            is_active: true,
        };
        g.session_owner
            .insert(session.id.clone(), user_id.to_string());
        g.messages.insert(session.id.clone(), Vec::new());
        g.by_user.insert(user_id.to_string(), session.clone());
        session
    }

    async fn append_message(
        &self,
        session_id: &str,
        content: &str,
        from_user: bool,
        origin: Option<&str>,
    ) -> Result<StoredMessage, StoreError> {
        if content.is_empty() {
            return Err(StoreError::EmptyContent);
        }
        let (message, user_id) = {
            let mut g = self.inner.write().await;
            let user_id = g
                .session_owner
                .get(session_id)
                .cloned()
                .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
            let message = StoredMessage {
                id: uuid::Uuid::new_v4().to_string(),
                session_id: session_id.to_string(),
                content: content.to_string(),
                from_user,
                created_at: Utc::now(),
            };
            g.messages
                .get_mut(session_id)
                .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?
                .push(message.clone());
            if let Some(session) = g.by_user.get_mut(&user_id) {
                session.updated_at = message.created_at;
            }
            (message, user_id)
        };
        // Publish after the write commits (lock released above).
        self.events
            .publish(
                &user_id,
                MessagePush {
                    message_id: message.id.clone(),
                    content: message.content.clone(),
                    from_user: message.from_user,
                    created_at: message.created_at,
                    origin: origin.map(|s| s.to_string()),
                },
            )
            .await;
        Ok(message)
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        self.inner
            .read()
            .await
            .messages
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }
}

//! Per-user broadcast registry.
//!
//! Whenever a message is durably appended, by a gateway connection or any
//! other writer, the session store publishes it here, keyed by the owning
//! user. Every open connection for that user subscribes at bind time, so
//! externally written messages reach live sockets without a framework hook.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Buffered pushes per user before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 64;

/// One committed message fanned out to a user's open connections.
#[derive(Debug, Clone)]
pub struct MessagePush {
    pub message_id: String,
    pub content: String,
    pub from_user: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Connection that caused the write, when it came through the gateway.
    /// Subscribers skip pushes bearing their own id; the writing connection
    /// already sent its frames directly.
    pub origin: Option<String>,
}

/// Registry of per-user broadcast senders.
pub struct BroadcastRegistry {
    inner: Arc<RwLock<HashMap<String, broadcast::Sender<MessagePush>>>>,
}

impl Default for BroadcastRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Subscribe a connection to pushes for `user_id`. Dropping the receiver
    /// unsubscribes.
    pub async fn subscribe(&self, user_id: &str) -> broadcast::Receiver<MessagePush> {
        let mut g = self.inner.write().await;
        g.entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish a committed message to `user_id`'s group. Returns how many
    /// subscribers received it; groups without subscribers are pruned.
    pub async fn publish(&self, user_id: &str, push: MessagePush) -> usize {
        let mut g = self.inner.write().await;
        let sent = match g.get(user_id) {
            Some(tx) => tx.send(push),
            None => return 0,
        };
        match sent {
            Ok(n) => n,
            Err(_) => {
                g.remove(user_id);
                0
            }
        }
    }
}

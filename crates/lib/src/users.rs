//! User directory: resolve a token's user id to a display identity.
//!
//! The gateway only consumes identities; issuing accounts is the REST/admin
//! layer's concern. The in-memory directory is seeded from config.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::UserEntry;

/// Resolved user principal: opaque id and display name. Immutable once
/// resolved for the lifetime of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

/// Lookup collaborator for token verification. The lookup may hit durable
/// storage, so it is async.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Resolve a user id to an identity; None when the user does not exist.
    async fn resolve(&self, user_id: &str) -> Option<Identity>;
}

/// In-memory directory keyed by user id.
pub struct MemoryUserDirectory {
    inner: Arc<RwLock<HashMap<String, Identity>>>,
}

impl Default for MemoryUserDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Build a directory from config user entries.
    pub fn from_entries(entries: &[UserEntry]) -> Self {
        let map = entries
            .iter()
            .map(|e| {
                (
                    e.id.clone(),
                    Identity {
                        user_id: e.id.clone(),
                        username: e.username.clone(),
                    },
                )
            })
            .collect();
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }

    /// Add or replace a user.
    pub async fn insert(&self, id: impl Into<String>, username: impl Into<String>) {
        let id = id.into();
        let identity = Identity {
            user_id: id.clone(),
            username: username.into(),
        };
        self.inner.write().await.insert(id, identity);
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn resolve(&self, user_id: &str) -> Option<Identity> {
        self.inner.read().await.get(user_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_known_and_unknown() {
        let dir = MemoryUserDirectory::new();
        dir.insert("7", "ada").await;
        let id = dir.resolve("7").await.expect("known user");
        assert_eq!(id.username, "ada");
        assert!(dir.resolve("8").await.is_none());
    }

    #[tokio::test]
    async fn from_config_entries() {
        let entries = vec![UserEntry {
            id: "1".to_string(),
            username: "local".to_string(),
        }];
        let dir = MemoryUserDirectory::from_entries(&entries);
        assert_eq!(dir.resolve("1").await.unwrap().username, "local");
    }
}

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

/// Per-user integration credentials. The permission gate only needs the set
/// of connected integrations; the generation driver needs the raw tokens to
/// inject into the sandbox after a successful auth flow.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn connected_integrations(&self, user_id: &str) -> HashSet<String>;

    async fn store_tokens(&self, user_id: &str, integration: &str, tokens: Value);

    async fn tokens(&self, user_id: &str, integration: &str) -> Option<Value>;
}

/// Process-local store. Survives for the daemon's lifetime; durable storage
/// sits behind the same trait in hosted deployments.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    entries: Mutex<HashMap<(String, String), Value>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn connected_integrations(&self, user_id: &str) -> HashSet<String> {
        self.entries
            .lock()
            .await
            .keys()
            .filter(|(user, _)| user == user_id)
            .map(|(_, integration)| integration.clone())
            .collect()
    }

    async fn store_tokens(&self, user_id: &str, integration: &str, tokens: Value) {
        self.entries
            .lock()
            .await
            .insert((user_id.to_string(), integration.to_string()), tokens);
    }

    async fn tokens(&self, user_id: &str, integration: &str) -> Option<Value> {
        self.entries
            .lock()
            .await
            .get(&(user_id.to_string(), integration.to_string()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn stored_tokens_show_up_as_connected() {
        let store = InMemoryCredentialStore::new();
        store
            .store_tokens("u1", "gmail", json!({ "access_token": "abc" }))
            .await;

        let connected = store.connected_integrations("u1").await;
        assert!(connected.contains("gmail"));
        assert!(store.connected_integrations("u2").await.is_empty());

        let tokens = store.tokens("u1", "gmail").await.unwrap();
        assert_eq!(tokens["access_token"], "abc");
        assert!(store.tokens("u1", "slack").await.is_none());
    }

    #[tokio::test]
    async fn tokens_are_scoped_per_user() {
        let store = InMemoryCredentialStore::new();
        store.store_tokens("u1", "slack", json!({ "t": 1 })).await;
        store.store_tokens("u2", "slack", json!({ "t": 2 })).await;

        assert_eq!(store.tokens("u1", "slack").await.unwrap()["t"], 1);
        assert_eq!(store.tokens("u2", "slack").await.unwrap()["t"], 2);
    }
}

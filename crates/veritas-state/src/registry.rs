//! Prompt registry: the out-of-band channel carrying prompts the ledger only
//! commits to. Entries are written by the bridge and read by the pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use veritas_core::{PromptPayload, RegistryEntry, RequestId, Result, B256};

use crate::store::StateStore;

const KEY_PREFIX: &str = "prompt:";

/// Registered prompts keyed by request identifier.
pub struct PromptRegistry {
    entries: RwLock<HashMap<RequestId, RegistryEntry>>,
    store: Arc<dyn StateStore>,
}

impl PromptRegistry {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Load persisted registrations. Returns how many were restored.
    pub async fn recover(&self) -> Result<usize> {
        let persisted = self.store.get_prefix(KEY_PREFIX).await?;
        let mut entries = self.entries.write().await;

        for row in persisted {
            let Some(id) = row
                .key
                .strip_prefix(KEY_PREFIX)
                .and_then(|raw| raw.parse::<RequestId>().ok())
            else {
                warn!("Skipping malformed registry key {}", row.key);
                continue;
            };
            match serde_json::from_value::<RegistryEntry>(row.value) {
                Ok(entry) => {
                    entries.insert(id, entry);
                }
                Err(e) => warn!("Skipping unreadable registry entry {}: {}", row.key, e),
            }
        }

        Ok(entries.len())
    }

    /// Store a prompt for `id`. A later registration for the same id replaces
    /// the earlier one.
    pub async fn register(
        &self,
        id: RequestId,
        prompt: PromptPayload,
        prompt_hash: Option<B256>,
    ) -> Result<RegistryEntry> {
        let entry = RegistryEntry {
            prompt,
            prompt_hash,
            registered_at: Utc::now(),
        };

        let mut entries = self.entries.write().await;
        self.store
            .set(&format!("{}{}", KEY_PREFIX, id), serde_json::to_value(&entry)?)
            .await?;
        if entries.insert(id, entry.clone()).is_some() {
            info!("📥  Replaced registered prompt for requestId={}", id);
        } else {
            info!("📥  Registered prompt for requestId={}", id);
        }

        Ok(entry)
    }

    /// Registered prompt for `id`, if any.
    pub async fn get(&self, id: RequestId) -> Option<RegistryEntry> {
        self.entries.read().await.get(&id).cloned()
    }

    pub async fn contains(&self, id: RequestId) -> bool {
        self.entries.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStateStore;
    use veritas_core::commit_prompt;

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = PromptRegistry::new(Arc::new(InMemoryStateStore::new()));

        registry
            .register(3, PromptPayload::Plain("hi".into()), Some(commit_prompt("hi")))
            .await
            .unwrap();

        let entry = registry.get(3).await.unwrap();
        assert_eq!(entry.prompt, PromptPayload::Plain("hi".into()));
        assert_eq!(entry.prompt_hash, Some(commit_prompt("hi")));
        assert!(registry.get(4).await.is_none());
    }

    #[tokio::test]
    async fn test_reregistration_replaces() {
        let registry = PromptRegistry::new(Arc::new(InMemoryStateStore::new()));

        registry.register(1, PromptPayload::Plain("first".into()), None).await.unwrap();
        registry.register(1, PromptPayload::Plain("second".into()), None).await.unwrap();

        assert_eq!(registry.len().await, 1);
        assert_eq!(
            registry.get(1).await.unwrap().prompt,
            PromptPayload::Plain("second".into())
        );
    }

    #[tokio::test]
    async fn test_recover_from_store() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());

        PromptRegistry::new(store.clone())
            .register(11, PromptPayload::Plain("persisted".into()), None)
            .await
            .unwrap();

        let restarted = PromptRegistry::new(store);
        assert_eq!(restarted.recover().await.unwrap(), 1);
        assert!(restarted.contains(11).await);
    }
}

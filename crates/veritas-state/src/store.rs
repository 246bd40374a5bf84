//! State store implementations.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;
use veritas_core::{Result, VeritasError};

/// A stored key and its value.
#[derive(Debug, Clone)]
pub struct StateEntry {
    pub key: String,
    pub value: serde_json::Value,
}

/// Keyed persistence behind the guard and the registry.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Get all entries whose key starts with `prefix`.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<StateEntry>>;

    /// Set the value for a key, replacing any earlier one.
    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()>;
}

/// In-memory implementation of StateStore. Lost on restart.
#[derive(Default)]
pub struct InMemoryStateStore {
    entries: Arc<RwLock<HashMap<String, serde_json::Value>>>,
}

impl InMemoryStateStore {
    /// Create a new in-memory state store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<StateEntry>> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| StateEntry {
                key: k.clone(),
                value: v.clone(),
            })
            .collect())
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }
}

/// StateStore on an embedded sled database. Each `set` writes one key and
/// flushes before returning.
pub struct SledStateStore {
    db: sled::Db,
}

impl SledStateStore {
    /// Open (or create) the database directory at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(sled_error)?;
        info!("Opened state store {} ({} entries)", path.display(), db.len());
        Ok(Self { db })
    }
}

#[async_trait]
impl StateStore for SledStateStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<StateEntry>> {
        let mut entries = Vec::new();
        for row in self.db.scan_prefix(prefix) {
            let (key, value) = row.map_err(sled_error)?;
            entries.push(StateEntry {
                key: String::from_utf8_lossy(&key).into_owned(),
                value: serde_json::from_slice(&value)?,
            });
        }
        Ok(entries)
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let bytes = serde_json::to_vec(&value)?;
        let key = key.to_string();
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || {
            db.insert(key.as_bytes(), bytes)?;
            db.flush()
        })
        .await
        .map_err(|e| VeritasError::StateError {
            message: format!("store write task failed: {e}"),
        })?
        .map_err(sled_error)?;

        Ok(())
    }
}

fn sled_error(err: sled::Error) -> VeritasError {
    VeritasError::StateError {
        message: err.to_string(),
    }
}

// # Memory Store
//
// In-memory implementation of `Publisher` and `ConfigSource`.
//
// ## Purpose
//
// Holds the configuration snapshot and the published facts in maps that live
// as long as the process. Used by tests and by embedders that read the facts
// back through `get`.
//
// ## Crash Behavior
//
// - Published facts are lost on restart; the engine republishes everything
//   it establishes after start
// - The snapshot must be set again by whoever embeds the engine

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use crate::Error;
use crate::config::ConfigSnapshot;
use crate::traits::store::{ConfigSource, Entity, Publisher, Store, StoreConfig, StoreFactory};

/// In-memory store
///
/// Clones share the same maps, so a test can keep one handle and give the
/// engine another.
///
/// # Example
///
/// ```rust,no_run
/// use ipconfig_core::store::MemoryStore;
/// use ipconfig_core::traits::{Entity, Publisher};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryStore::new();
///     store.publish("svc-1", Entity::Status, Some(serde_json::json!("success"))).await?;
///     assert_eq!(
///         store.get("svc-1", Entity::Status).await,
///         Some(serde_json::json!("success"))
///     );
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    snapshot: Arc<RwLock<ConfigSnapshot>>,
    facts: Arc<RwLock<BTreeMap<(String, Entity), Value>>>,
    publish_calls: Arc<AtomicUsize>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store serving `snapshot`
    pub fn with_snapshot(snapshot: ConfigSnapshot) -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(snapshot)),
            ..Self::default()
        }
    }

    /// Replace the configuration snapshot
    pub async fn set_snapshot(&self, snapshot: ConfigSnapshot) {
        *self.snapshot.write().await = snapshot;
    }

    /// Current value of one entity
    pub async fn get(&self, owner: &str, entity: Entity) -> Option<Value> {
        self.facts
            .read()
            .await
            .get(&(owner.to_string(), entity))
            .cloned()
    }

    /// Owners that currently have `entity` published
    pub async fn owners(&self, entity: Entity) -> Vec<String> {
        self.facts
            .read()
            .await
            .keys()
            .filter(|(_, e)| *e == entity)
            .map(|(owner, _)| owner.clone())
            .collect()
    }

    /// Number of published entities
    pub async fn len(&self) -> usize {
        self.facts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.facts.read().await.is_empty()
    }

    /// Number of `publish` calls so far (removals included)
    pub fn publish_count(&self) -> usize {
        self.publish_calls.load(Ordering::Relaxed)
    }

    /// Remove all published facts
    pub async fn clear(&self) {
        self.facts.write().await.clear();
    }
}

#[async_trait]
impl Publisher for MemoryStore {
    async fn publish(&self, owner: &str, entity: Entity, value: Option<Value>) -> Result<(), Error> {
        self.publish_calls.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.facts.write().await;
        let key = (owner.to_string(), entity);
        match value {
            Some(value) => {
                guard.insert(key, value);
            }
            None => {
                guard.remove(&key);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigSource for MemoryStore {
    async fn read_snapshot(&self) -> Result<ConfigSnapshot, Error> {
        Ok(self.snapshot.read().await.clone())
    }
}

/// Factory for `memory` stores
pub struct MemoryStoreFactory;

#[async_trait]
impl StoreFactory for MemoryStoreFactory {
    /// Seeds the snapshot from `config_path` when one is given; published
    /// facts stay in memory
    async fn create(&self, config: &StoreConfig) -> Result<Arc<dyn Store>, Error> {
        let Some(path) = &config.config_path else {
            return Ok(Arc::new(MemoryStore::new()));
        };
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let snapshot: ConfigSnapshot = serde_json::from_str(&content)?;
        snapshot.validate()?;
        Ok(Arc::new(MemoryStore::with_snapshot(snapshot)))
    }
}

// # File Store
//
// File-based implementation of `Publisher` and `ConfigSource` with crash
// recovery.
//
// ## Purpose
//
// Reads the desired configuration from a JSON snapshot file and persists the
// published facts to a second JSON file, so other processes can read what the
// engine established.
//
// ## Crash Recovery
//
// - Atomic writes: published facts use write-then-rename
// - Automatic backup: the previous facts file is kept as `.backup`; every
//   snapshot that parses is copied to its own `.backup`
// - Recovery: a snapshot that fails to parse falls back to its backup
//
// ## File Format (published facts)
//
// ```json
// {
//   "version": "1.0",
//   "updated": "2025-01-09T12:00:00Z",
//   "facts": {
//     "svc-1": {
//       "ipv4": { "addresses": ["10.0.0.2"], "subnet_masks": ["255.255.255.0"] },
//       "status": "success"
//     },
//     "en0": { "busy": false }
//   }
// }
// ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::Error;
use crate::config::ConfigSnapshot;
use crate::traits::store::{ConfigSource, Entity, Publisher, Store, StoreConfig, StoreFactory};

/// Facts file format version
const FACTS_FILE_VERSION: &str = "1.0";

/// Published entities, keyed by owner then entity name
type FactMap = BTreeMap<String, BTreeMap<String, Value>>;

/// File-based store with crash recovery
#[derive(Debug)]
pub struct FileStore {
    config_path: Option<PathBuf>,
    state_path: PathBuf,
    state: Arc<RwLock<FileState>>,
}

#[derive(Debug, Default)]
struct FileState {
    facts: FactMap,
    dirty: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct FactsFileFormat {
    version: String,
    updated: DateTime<Utc>,
    facts: FactMap,
}

impl FileStore {
    /// Create a file store
    ///
    /// Published facts always start empty: they describe what this run of
    /// the engine established. Parent directories of the facts file are
    /// created if needed.
    pub async fn new(config_path: Option<PathBuf>, state_path: impl AsRef<Path>) -> Result<Self, Error> {
        let state_path = state_path.as_ref().to_path_buf();

        if let Some(parent) = state_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::config(format!(
                    "Failed to create state directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        Ok(Self {
            config_path,
            state_path,
            state: Arc::new(RwLock::new(FileState::default())),
        })
    }

    /// Current value of one entity
    pub async fn get(&self, owner: &str, entity: Entity) -> Option<Value> {
        let guard = self.state.read().await;
        guard.facts.get(owner)?.get(entity.as_str()).cloned()
    }

    /// Load the snapshot, recovering from the backup when the file is corrupt
    async fn load_snapshot_with_recovery(path: &Path) -> Result<ConfigSnapshot, Error> {
        match Self::load_snapshot(path).await {
            Ok(snapshot) => {
                let backup_path = Self::backup_path(path);
                if let Err(e) = fs::copy(path, &backup_path).await {
                    tracing::warn!("Failed to back up configuration: {}", e);
                }
                Ok(snapshot)
            }
            Err(SnapshotError::Corrupt(e)) => {
                tracing::warn!(
                    "Configuration file appears corrupted: {}. Attempting recovery from backup.",
                    e
                );
                let backup_path = Self::backup_path(path);
                if !backup_path.exists() {
                    return Err(e);
                }
                match Self::load_snapshot(&backup_path).await {
                    Ok(snapshot) => {
                        tracing::info!(
                            "Recovered configuration from backup: {} interfaces",
                            snapshot.interfaces.len()
                        );
                        Ok(snapshot)
                    }
                    Err(SnapshotError::Corrupt(backup_err) | SnapshotError::Io(backup_err)) => {
                        tracing::error!("Backup also unusable: {}", backup_err);
                        Err(e)
                    }
                }
            }
            Err(SnapshotError::Io(e)) => Err(e),
        }
    }

    async fn load_snapshot(path: &Path) -> Result<ConfigSnapshot, SnapshotError> {
        if !path.exists() {
            tracing::debug!("Configuration file does not exist: {}", path.display());
            return Ok(ConfigSnapshot::default());
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            SnapshotError::Io(Error::store(format!(
                "Failed to read configuration {}: {}",
                path.display(),
                e
            )))
        })?;

        let snapshot: ConfigSnapshot = serde_json::from_str(&content).map_err(|e| {
            SnapshotError::Corrupt(Error::store(format!(
                "Failed to parse configuration {}: {}",
                path.display(),
                e
            )))
        })?;
        snapshot.validate().map_err(SnapshotError::Corrupt)?;
        Ok(snapshot)
    }

    /// Write the facts file atomically
    async fn write_facts(&self) -> Result<(), Error> {
        let state_guard = self.state.read().await;
        let facts_file = FactsFileFormat {
            version: FACTS_FILE_VERSION.to_string(),
            updated: Utc::now(),
            facts: state_guard.facts.clone(),
        };
        drop(state_guard);

        let json = serde_json::to_string_pretty(&facts_file)
            .map_err(|e| Error::store(format!("Failed to serialize facts: {}", e)))?;

        let temp_path = self.temp_path();
        {
            let mut file = fs::File::create(&temp_path).await.map_err(|e| {
                Error::store(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.write_all(json.as_bytes()).await.map_err(|e| {
                Error::store(format!(
                    "Failed to write to temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.flush().await.map_err(|e| {
                Error::store(format!(
                    "Failed to flush temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
        }

        if self.state_path.exists() {
            let backup_path = Self::backup_path(&self.state_path);
            if let Err(e) = fs::copy(&self.state_path, &backup_path).await {
                tracing::warn!("Failed to create backup: {}", e);
            }
        }

        fs::rename(&temp_path, &self.state_path).await.map_err(|e| {
            Error::store(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.state_path.display(),
                e
            ))
        })?;

        self.state.write().await.dirty = false;
        tracing::trace!("Facts written to {}", self.state_path.display());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.state_path.clone();
        temp.set_extension("tmp");
        temp
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }
}

/// Why a snapshot could not be loaded
enum SnapshotError {
    /// Present but unparseable or invalid
    Corrupt(Error),
    /// Could not be read at all
    Io(Error),
}

#[async_trait]
impl Publisher for FileStore {
    async fn publish(&self, owner: &str, entity: Entity, value: Option<Value>) -> Result<(), Error> {
        let mut guard = self.state.write().await;
        match value {
            Some(value) => {
                guard
                    .facts
                    .entry(owner.to_string())
                    .or_default()
                    .insert(entity.as_str().to_string(), value);
            }
            None => {
                let Some(entities) = guard.facts.get_mut(owner) else {
                    return Ok(());
                };
                if entities.remove(entity.as_str()).is_none() {
                    return Ok(());
                }
                if entities.is_empty() {
                    guard.facts.remove(owner);
                }
            }
        }
        guard.dirty = true;
        Ok(())
    }

    async fn flush(&self) -> Result<(), Error> {
        if self.state.read().await.dirty {
            self.write_facts().await
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ConfigSource for FileStore {
    async fn read_snapshot(&self) -> Result<ConfigSnapshot, Error> {
        match &self.config_path {
            Some(path) => Self::load_snapshot_with_recovery(path).await,
            None => Ok(ConfigSnapshot::default()),
        }
    }
}

/// Factory for `file` stores
pub struct FileStoreFactory;

#[async_trait]
impl StoreFactory for FileStoreFactory {
    async fn create(&self, config: &StoreConfig) -> Result<Arc<dyn Store>, Error> {
        let state_path = config
            .state_path
            .clone()
            .ok_or_else(|| Error::config("File store requires a state path"))?;
        let store = FileStore::new(config.config_path.clone(), state_path).await?;
        Ok(Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InterfaceConfig, MethodConfig};
    use serde_json::json;
    use tempfile::tempdir;

    fn snapshot() -> ConfigSnapshot {
        ConfigSnapshot {
            order: vec!["svc-1".to_string()],
            boot_interface: None,
            interfaces: vec![
                InterfaceConfig::new("en0").with_service("svc-1", MethodConfig::Dhcp { client_id: None }),
            ],
        }
    }

    #[tokio::test]
    async fn test_facts_are_written_on_flush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("facts.json");
        let store = FileStore::new(None, &path).await.unwrap();

        store
            .publish("svc-1", Entity::Status, Some(json!("success")))
            .await
            .unwrap();
        assert!(!path.exists());
        store.flush().await.unwrap();

        let content: FactsFileFormat =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(content.version, FACTS_FILE_VERSION);
        assert_eq!(content.facts["svc-1"]["status"], json!("success"));

        store.publish("svc-1", Entity::Status, None).await.unwrap();
        store.flush().await.unwrap();
        assert_eq!(store.get("svc-1", Entity::Status).await, None);
        assert!(FileStore::backup_path(&path).exists());
    }

    #[tokio::test]
    async fn test_snapshot_recovers_from_backup() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("config.json");
        std::fs::write(&config, serde_json::to_string(&snapshot()).unwrap()).unwrap();
        let store = FileStore::new(Some(config.clone()), dir.path().join("facts.json"))
            .await
            .unwrap();

        // First read leaves a backup behind
        assert_eq!(store.read_snapshot().await.unwrap(), snapshot());

        std::fs::write(&config, b"{ not json").unwrap();
        assert_eq!(store.read_snapshot().await.unwrap(), snapshot());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_without_backup_is_an_error() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("config.json");
        std::fs::write(&config, b"[1, 2").unwrap();
        let store = FileStore::new(Some(config), dir.path().join("facts.json"))
            .await
            .unwrap();

        assert!(store.read_snapshot().await.is_err());
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_empty() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(Some(dir.path().join("absent.json")), dir.path().join("facts.json"))
            .await
            .unwrap();
        assert_eq!(store.read_snapshot().await.unwrap(), ConfigSnapshot::default());
    }
}

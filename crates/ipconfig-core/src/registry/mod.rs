//! Plugin-based backend registry
//!
//! The registry allows capture backends and stores to be registered
//! dynamically at runtime, avoiding hardcoded if-else chains.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ipconfig_core::registry::BackendRegistry;
//! use ipconfig_core::traits::StoreConfig;
//!
//! let registry = BackendRegistry::new();
//! ipconfig_linux::register(&registry);
//!
//! let capture = registry.create_capture("packet")?;
//! let store = registry.create_store("file", &StoreConfig::default()).await?;
//! ```
//!
//! ## Registration
//!
//! Backend crates register themselves during initialization:
//!
//! ```rust,ignore
//! // In ipconfig-linux
//! pub fn register(registry: &BackendRegistry) {
//!     registry.register_capture("packet", Box::new(PacketCaptureFactory));
//! }
//! ```

use crate::error::{Error, Result};
use crate::store::{FileStoreFactory, MemoryStoreFactory};
use crate::traits::{LinkCapture, LinkCaptureFactory, Store, StoreConfig, StoreFactory};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Registry of named backend factories
///
/// ## Thread Safety
///
/// The registry uses interior mutability with RwLock, allowing concurrent
/// reads and exclusive writes.
#[derive(Default)]
pub struct BackendRegistry {
    /// Registered capture backend factories
    captures: RwLock<HashMap<String, Box<dyn LinkCaptureFactory>>>,

    /// Registered store factories
    stores: RwLock<HashMap<String, Arc<dyn StoreFactory>>>,
}

impl BackendRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in `memory` and `file` stores
    pub fn with_builtin_stores() -> Self {
        let registry = Self::new();
        registry.register_store("memory", Box::new(MemoryStoreFactory));
        registry.register_store("file", Box::new(FileStoreFactory));
        registry
    }

    /// Register a capture backend factory
    ///
    /// # Parameters
    ///
    /// - `name`: Backend name (e.g., "packet")
    /// - `factory`: Factory object for creating capture backends
    pub fn register_capture(&self, name: impl Into<String>, factory: Box<dyn LinkCaptureFactory>) {
        let mut captures = self.captures.write().unwrap_or_else(PoisonError::into_inner);
        captures.insert(name.into(), factory);
    }

    /// Register a store factory
    ///
    /// # Parameters
    ///
    /// - `name`: Store type name (e.g., "file", "memory")
    /// - `factory`: Factory object for creating stores
    pub fn register_store(&self, name: impl Into<String>, factory: Box<dyn StoreFactory>) {
        let mut stores = self.stores.write().unwrap_or_else(PoisonError::into_inner);
        stores.insert(name.into(), Arc::from(factory));
    }

    /// Create a capture backend by name
    ///
    /// # Returns
    ///
    /// - `Ok(Arc<dyn LinkCapture>)`: Created backend
    /// - `Err(Error)`: If the name is not registered or creation fails
    pub fn create_capture(&self, name: &str) -> Result<Arc<dyn LinkCapture>> {
        let captures = self.captures.read().unwrap_or_else(PoisonError::into_inner);
        let factory = captures
            .get(name)
            .ok_or_else(|| Error::config(format!("Unknown capture backend: {}", name)))?;
        Ok(Arc::from(factory.create()?))
    }

    /// Create a store by name
    ///
    /// # Returns
    ///
    /// - `Ok(Arc<dyn Store>)`: Created store
    /// - `Err(Error)`: If the name is not registered or creation fails
    pub async fn create_store(&self, name: &str, config: &StoreConfig) -> Result<Arc<dyn Store>> {
        let factory = {
            let stores = self.stores.read().unwrap_or_else(PoisonError::into_inner);
            stores
                .get(name)
                .cloned()
                .ok_or_else(|| Error::config(format!("Unknown store type: {}", name)))?
        };
        // Lock released before the async create
        factory.create(config).await
    }

    /// List registered capture backends
    pub fn list_captures(&self) -> Vec<String> {
        let captures = self.captures.read().unwrap_or_else(PoisonError::into_inner);
        captures.keys().cloned().collect()
    }

    /// List registered store types
    pub fn list_stores(&self) -> Vec<String> {
        let stores = self.stores.read().unwrap_or_else(PoisonError::into_inner);
        stores.keys().cloned().collect()
    }

    pub fn has_capture(&self, name: &str) -> bool {
        let captures = self.captures.read().unwrap_or_else(PoisonError::into_inner);
        captures.contains_key(name)
    }

    pub fn has_store(&self, name: &str) -> bool {
        let stores = self.stores.read().unwrap_or_else(PoisonError::into_inner);
        stores.contains_key(name)
    }
}

// ABOUTME: Sandbox registry contract mapping tenant keys to live containers
// ABOUTME: The registry is the single source of truth for which sandboxes exist

use crate::model::{ContainerModel, SandboxKey};
use crate::store::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

pub mod local;
pub mod shared;

pub use local::LocalSandboxRegistry;
pub use shared::SharedSandboxRegistry;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Registry store error: {0}")]
    Store(#[from] StoreError),
    #[error("Corrupt registry record {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Bijective index between sandbox keys and container ids, plus the model
/// of each container.
///
/// Misses are `None`/`false`, never errors. Errors mean the backing store
/// could not be reached or held unreadable data.
#[async_trait]
pub trait SandboxRegistry: Send + Sync {
    /// Bind `key` to `model`. An existing binding for `key` is replaced.
    async fn add(&self, key: &SandboxKey, model: &ContainerModel) -> Result<()>;

    async fn get(&self, key: &SandboxKey) -> Result<Option<ContainerModel>>;

    async fn get_by_container_id(&self, container_id: &str) -> Result<Option<ContainerModel>>;

    /// Reverse lookup from a container id to the key bound to it
    async fn lookup_key(&self, container_id: &str) -> Result<Option<SandboxKey>>;

    async fn remove(&self, key: &SandboxKey) -> Result<bool>;

    async fn remove_by_container_id(&self, container_id: &str) -> Result<bool>;

    async fn contains(&self, key: &SandboxKey) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn contains_container_id(&self, container_id: &str) -> Result<bool> {
        Ok(self.get_by_container_id(container_id).await?.is_some())
    }

    /// Every registered container, keyed by container id
    async fn list_all(&self) -> Result<HashMap<String, ContainerModel>>;

    fn name(&self) -> &'static str;
}

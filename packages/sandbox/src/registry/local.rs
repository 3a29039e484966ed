// ABOUTME: In-process sandbox registry for single-instance deployments
// ABOUTME: Keeps forward, reverse and model maps consistent under one lock

use super::{Result, SandboxRegistry};
use crate::model::{ContainerModel, SandboxKey};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct Index {
    by_key: HashMap<SandboxKey, String>,
    keys: HashMap<String, SandboxKey>,
    models: HashMap<String, ContainerModel>,
}

impl Index {
    fn unlink_id(&mut self, container_id: &str) -> Option<SandboxKey> {
        self.models.remove(container_id);
        let key = self.keys.remove(container_id)?;
        if self.by_key.get(&key).map(String::as_str) == Some(container_id) {
            self.by_key.remove(&key);
        }
        Some(key)
    }
}

#[derive(Default)]
pub struct LocalSandboxRegistry {
    index: RwLock<Index>,
}

impl LocalSandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SandboxRegistry for LocalSandboxRegistry {
    async fn add(&self, key: &SandboxKey, model: &ContainerModel) -> Result<()> {
        let mut index = self.index.write().await;
        if let Some(previous) = index.by_key.get(key).cloned() {
            if previous != model.container_id {
                index.unlink_id(&previous);
            }
        }
        // A container can only back one key
        if let Some(old_key) = index.keys.get(&model.container_id).cloned() {
            index.by_key.remove(&old_key);
        }

        index
            .by_key
            .insert(key.clone(), model.container_id.clone());
        index
            .keys
            .insert(model.container_id.clone(), key.clone());
        index
            .models
            .insert(model.container_id.clone(), model.clone());
        debug!(key = %key, container_id = %model.container_id, "Registered sandbox");
        Ok(())
    }

    async fn get(&self, key: &SandboxKey) -> Result<Option<ContainerModel>> {
        let index = self.index.read().await;
        Ok(index
            .by_key
            .get(key)
            .and_then(|id| index.models.get(id))
            .cloned())
    }

    async fn get_by_container_id(&self, container_id: &str) -> Result<Option<ContainerModel>> {
        Ok(self.index.read().await.models.get(container_id).cloned())
    }

    async fn lookup_key(&self, container_id: &str) -> Result<Option<SandboxKey>> {
        Ok(self.index.read().await.keys.get(container_id).cloned())
    }

    async fn remove(&self, key: &SandboxKey) -> Result<bool> {
        let mut index = self.index.write().await;
        let Some(container_id) = index.by_key.remove(key) else {
            return Ok(false);
        };
        index.keys.remove(&container_id);
        index.models.remove(&container_id);
        Ok(true)
    }

    async fn remove_by_container_id(&self, container_id: &str) -> Result<bool> {
        let mut index = self.index.write().await;
        Ok(index.unlink_id(container_id).is_some())
    }

    async fn list_all(&self) -> Result<HashMap<String, ContainerModel>> {
        Ok(self.index.read().await.models.clone())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

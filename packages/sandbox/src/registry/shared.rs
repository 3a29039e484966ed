// ABOUTME: Sandbox registry stored in a shared key-value store so several manager instances agree
// ABOUTME: Each entry is three records: key to id, id to key, and id to model, all JSON text

use super::{RegistryError, Result, SandboxRegistry};
use crate::model::{ContainerModel, SandboxKey};
use crate::store::KvStore;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_REGISTRY_PREFIX: &str = "warden:sandbox:";

pub struct SharedSandboxRegistry {
    store: Arc<dyn KvStore>,
    prefix: String,
}

impl SharedSandboxRegistry {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_prefix(store, DEFAULT_REGISTRY_PREFIX)
    }

    pub fn with_prefix(store: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    fn forward_key(&self, key: &SandboxKey) -> Result<String> {
        Ok(format!("{}key:{}", self.prefix, serde_json::to_string(key)?))
    }

    fn reverse_key(&self, container_id: &str) -> String {
        format!("{}rev:{}", self.prefix, container_id)
    }

    fn model_key(&self, container_id: &str) -> String {
        format!("{}model:{}", self.prefix, container_id)
    }

    fn model_namespace(&self) -> String {
        format!("{}model:", self.prefix)
    }

    async fn read_json<T: DeserializeOwned>(&self, record: &str) -> Result<Option<T>> {
        match self.store.get(record).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| RegistryError::Corrupt {
                    key: record.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    async fn drop_container_records(&self, container_id: &str) -> Result<bool> {
        let had_rev = self.store.delete(&self.reverse_key(container_id)).await?;
        let had_model = self.store.delete(&self.model_key(container_id)).await?;
        Ok(had_rev || had_model)
    }
}

#[async_trait]
impl SandboxRegistry for SharedSandboxRegistry {
    async fn add(&self, key: &SandboxKey, model: &ContainerModel) -> Result<()> {
        let forward = self.forward_key(key)?;
        if let Some(previous) = self.store.get(&forward).await? {
            if previous != model.container_id {
                self.drop_container_records(&previous).await?;
            }
        }
        // A container can only back one key
        if let Some(old_key) = self.lookup_key(&model.container_id).await? {
            if &old_key != key {
                let old_forward = self.forward_key(&old_key)?;
                if self.store.get(&old_forward).await?.as_deref() == Some(model.container_id.as_str()) {
                    self.store.delete(&old_forward).await?;
                }
            }
        }

        // Model and reverse record first, so a reader that sees the forward
        // record can always resolve it.
        self.store
            .set(&self.model_key(&model.container_id), &serde_json::to_string(model)?)
            .await?;
        self.store
            .set(&self.reverse_key(&model.container_id), &serde_json::to_string(key)?)
            .await?;
        self.store.set(&forward, &model.container_id).await?;

        debug!(key = %key, container_id = %model.container_id, "Registered sandbox in shared store");
        Ok(())
    }

    async fn get(&self, key: &SandboxKey) -> Result<Option<ContainerModel>> {
        let Some(container_id) = self.store.get(&self.forward_key(key)?).await? else {
            return Ok(None);
        };
        let model = self.get_by_container_id(&container_id).await?;
        if model.is_none() {
            warn!(key = %key, container_id = %container_id, "Forward record points at missing model");
        }
        Ok(model)
    }

    async fn get_by_container_id(&self, container_id: &str) -> Result<Option<ContainerModel>> {
        self.read_json(&self.model_key(container_id)).await
    }

    async fn lookup_key(&self, container_id: &str) -> Result<Option<SandboxKey>> {
        self.read_json(&self.reverse_key(container_id)).await
    }

    async fn remove(&self, key: &SandboxKey) -> Result<bool> {
        let forward = self.forward_key(key)?;
        let Some(container_id) = self.store.get(&forward).await? else {
            return Ok(false);
        };
        self.store.delete(&forward).await?;
        self.drop_container_records(&container_id).await?;
        Ok(true)
    }

    async fn remove_by_container_id(&self, container_id: &str) -> Result<bool> {
        // The reverse record is the only way back to the forward record
        if let Some(key) = self.lookup_key(container_id).await? {
            let forward = self.forward_key(&key)?;
            if self.store.get(&forward).await?.as_deref() == Some(container_id) {
                self.store.delete(&forward).await?;
            }
        }
        self.drop_container_records(container_id).await
    }

    async fn list_all(&self) -> Result<HashMap<String, ContainerModel>> {
        let namespace = self.model_namespace();
        let mut models = HashMap::new();
        for (record, raw) in self.store.scan_prefix(&namespace).await? {
            let model: ContainerModel =
                serde_json::from_str(&raw).map_err(|source| RegistryError::Corrupt {
                    key: record.clone(),
                    source,
                })?;
            let container_id = record[namespace.len()..].to_string();
            models.insert(container_id, model);
        }
        Ok(models)
    }

    fn name(&self) -> &'static str {
        "shared"
    }
}

// ABOUTME: Sandbox lifecycle manager that provisions, reuses, health-gates and tears down containers
// ABOUTME: Owns rollback of ports and containers when any provisioning step fails

use crate::client::{ClientError, ClientFactory, HttpClientFactory, SandboxClient};
use crate::config::{BackendConfig, ConfigError, ManagerConfig, RegistryConfig};
use crate::model::{ContainerModel, SandboxKey};
use crate::ports::PortAllocator;
use crate::providers::{
    BackendError, ContainerRequest, ContainerStatus, DeploymentBackend, DockerBackend,
    KubernetesBackend, VolumeMount,
};
use crate::registry::{
    LocalSandboxRegistry, RegistryError, SandboxRegistry, SharedSandboxRegistry,
};
use crate::storage::{ArtifactStorage, LocalArtifactStorage, StorageError};
use crate::store::SqliteKvStore;
use crate::types::{SandboxConfig, SandboxTypeRegistry};
use std::collections::{HashMap, VecDeque};
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Container path the session workspace is mounted at
pub const WORKSPACE_MOUNT: &str = "/workspace";

const SESSION_ID_LEN: usize = 25;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("No free ports for {key}: {requested} needed")]
    ResourceExhausted { key: SandboxKey, requested: usize },

    #[error("Failed to create container for {key}: {source}")]
    BackendCreateFailed {
        key: SandboxKey,
        #[source]
        source: BackendError,
    },

    #[error("Container {container_id} for {key} not healthy within {timeout:?}")]
    HealthTimeout {
        key: SandboxKey,
        container_id: String,
        timeout: Duration,
    },

    #[error("Health check for container {container_id} ({key}) failed: {source}")]
    HealthCheckFailed {
        key: SandboxKey,
        container_id: String,
        #[source]
        source: ClientError,
    },

    #[error("Sandbox registry unavailable: {0}")]
    RegistryUnavailable(#[from] RegistryError),

    #[error("Unknown sandbox type: {0}")]
    UnknownSandboxType(String),

    #[error("Invalid sandbox key {key}: {reason}")]
    InvalidKey { key: SandboxKey, reason: String },

    #[error("Backend error for container {container_id}: {source}")]
    Backend {
        container_id: String,
        #[source]
        source: BackendError,
    },

    #[error("Deployment backend unavailable: {0}")]
    BackendUnavailable(#[source] BackendError),

    #[error("Sandbox client error: {0}")]
    Client(#[from] ClientError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ManagerError>;

/// A sandbox bound to a tenant key, with a client ready to use.
#[derive(Clone)]
pub struct SandboxHandle {
    pub key: SandboxKey,
    pub model: ContainerModel,
    pub client: Arc<dyn SandboxClient>,
}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("key", &self.key)
            .field("container_id", &self.model.container_id)
            .finish()
    }
}

/// Outcome of a cleanup sweep
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CleanupReport {
    pub stopped: usize,
    pub errors: Vec<String>,
}

/// A container that passed the health gate but is not yet in the registry
struct Launched {
    model: ContainerModel,
    client: Arc<dyn SandboxClient>,
}

/// Orchestrates sandbox containers for tenant keys.
///
/// The registry decides whether a sandbox exists; the backend is only asked
/// about containers the registry already knows.
pub struct SandboxManager {
    config: ManagerConfig,
    types: Arc<SandboxTypeRegistry>,
    ports: Arc<PortAllocator>,
    registry: Arc<dyn SandboxRegistry>,
    backend: Arc<dyn DeploymentBackend>,
    clients: Arc<dyn ClientFactory>,
    storage: Option<Arc<dyn ArtifactStorage>>,
    provisioning: Mutex<HashMap<SandboxKey, Arc<Mutex<()>>>>,
    pool: Mutex<VecDeque<ContainerModel>>,
    /// Held for the whole of a refill so two refills never overfill the pool
    pool_refill: Mutex<()>,
}

impl SandboxManager {
    pub fn new(
        config: ManagerConfig,
        backend: Arc<dyn DeploymentBackend>,
        registry: Arc<dyn SandboxRegistry>,
        clients: Arc<dyn ClientFactory>,
    ) -> Self {
        let types = Arc::new(SandboxTypeRegistry::with_builtins(&config.image_registry));
        let ports = Arc::new(PortAllocator::new(config.port_range));
        let storage = config
            .storage_root
            .clone()
            .map(|root| Arc::new(LocalArtifactStorage::new(root)) as Arc<dyn ArtifactStorage>);

        Self {
            config,
            types,
            ports,
            registry,
            backend,
            clients,
            storage,
            provisioning: Mutex::new(HashMap::new()),
            pool: Mutex::new(VecDeque::new()),
            pool_refill: Mutex::new(()),
        }
    }

    /// Build a manager with the registry and backend the config selects
    pub async fn from_config(config: ManagerConfig) -> Result<Self> {
        config.validate()?;

        let backend: Arc<dyn DeploymentBackend> = match &config.backend {
            BackendConfig::Docker(docker) => Arc::new(
                DockerBackend::new(docker.clone()).map_err(ManagerError::BackendUnavailable)?,
            ),
            BackendConfig::Kubernetes(kubernetes) => Arc::new(
                KubernetesBackend::connect(kubernetes.clone())
                    .await
                    .map_err(ManagerError::BackendUnavailable)?,
            ),
        };

        let registry: Arc<dyn SandboxRegistry> = match &config.registry {
            RegistryConfig::Local => Arc::new(LocalSandboxRegistry::new()),
            RegistryConfig::Shared { path, prefix } => {
                let store = SqliteKvStore::open(path)
                    .await
                    .map_err(RegistryError::from)?;
                Arc::new(SharedSandboxRegistry::with_prefix(Arc::new(store), prefix.clone()))
            }
        };

        info!(
            backend = backend.name(),
            registry = registry.name(),
            "Sandbox manager configured"
        );
        let manager = Self::new(
            config,
            backend,
            registry,
            Arc::new(HttpClientFactory::default()),
        );
        manager.start().await;
        Ok(manager)
    }

    /// Bring the warm pool up to `pool_size`. Returns how many containers were started.
    ///
    /// `from_config` calls this; managers assembled with `new` call it themselves.
    pub async fn start(&self) -> usize {
        if self.config.pool_size == 0 {
            return 0;
        }
        info!(pool_size = self.config.pool_size, "Filling sandbox pool");
        self.refill_pool().await
    }

    pub fn with_types(mut self, types: Arc<SandboxTypeRegistry>) -> Self {
        self.types = types;
        self
    }

    pub fn with_port_allocator(mut self, ports: Arc<PortAllocator>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn ArtifactStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn types(&self) -> &SandboxTypeRegistry {
        &self.types
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn backend(&self) -> &dyn DeploymentBackend {
        self.backend.as_ref()
    }

    /// Return the sandbox bound to `key`, provisioning one if none exists
    pub async fn get_or_provision(&self, key: &SandboxKey) -> Result<SandboxHandle> {
        if let Some(handle) = self.existing(key).await? {
            return Ok(handle);
        }

        let type_config = self
            .types
            .lookup(&key.sandbox_type)
            .ok_or_else(|| ManagerError::UnknownSandboxType(key.sandbox_type.clone()))?;
        let remote = match &self.storage {
            Some(_) => Some(storage_path(key)?),
            None => None,
        };

        let lock = {
            let mut locks = self.provisioning.lock().await;
            locks.entry(key.clone()).or_default().clone()
        };
        let result = {
            let _guard = lock.lock().await;
            // Another caller may have committed while we waited
            match self.existing(key).await {
                Ok(Some(handle)) => Ok(handle),
                Ok(None) => self.provision(key, &type_config, remote.as_deref()).await,
                Err(e) => Err(e),
            }
        };
        self.forget_lock(key, lock).await;

        result
    }

    async fn forget_lock(&self, key: &SandboxKey, lock: Arc<Mutex<()>>) {
        let mut locks = self.provisioning.lock().await;
        // One reference in the map plus ours means nobody else is waiting
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(key);
        }
    }

    async fn existing(&self, key: &SandboxKey) -> Result<Option<SandboxHandle>> {
        let Some(model) = self.registry.get(key).await? else {
            return Ok(None);
        };
        debug!(key = %key, container_id = %model.container_id, "Reusing sandbox");
        let client = self.clients.connect(&model)?;
        Ok(Some(SandboxHandle {
            key: key.clone(),
            model,
            client,
        }))
    }

    async fn provision(
        &self,
        key: &SandboxKey,
        type_config: &SandboxConfig,
        remote: Option<&str>,
    ) -> Result<SandboxHandle> {
        if key.sandbox_type.eq_ignore_ascii_case(&self.config.default_sandbox_type) {
            if let Some(handle) = self.claim_pooled(key, remote).await? {
                self.refill_pool().await;
                return Ok(handle);
            }
        }

        let launched = self.launch(key, type_config, remote).await?;
        self.commit(key, launched).await
    }

    /// Register a health-gated container under `key`, undoing it if the registry write fails
    async fn commit(&self, key: &SandboxKey, launched: Launched) -> Result<SandboxHandle> {
        if let Err(e) = self.registry.add(key, &launched.model).await {
            error!(key = %key, container_id = %launched.model.container_id, "Registry write failed: {}", e);
            self.teardown(&launched.model, false).await;
            return Err(e.into());
        }

        info!(key = %key, container_id = %launched.model.container_id, "Sandbox ready");
        Ok(SandboxHandle {
            key: key.clone(),
            model: launched.model,
            client: launched.client,
        })
    }

    /// Allocate ports, create the container and wait for it to become healthy.
    ///
    /// Every step taken is undone in reverse order if a later one fails.
    /// `remote` is the storage path the workspace is seeded from, if any.
    async fn launch(
        &self,
        key: &SandboxKey,
        type_config: &SandboxConfig,
        remote: Option<&str>,
    ) -> Result<Launched> {
        let requested = type_config.ports.len();
        let host_ports = self
            .ports
            .allocate_batch(requested)
            .await
            .ok_or_else(|| ManagerError::ResourceExhausted {
                key: key.clone(),
                requested,
            })?;

        let session_id: String = Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(SESSION_ID_LEN)
            .collect();
        let container_name = format!("{}{}", self.config.container_prefix, session_id);

        let volumes = match self
            .prepare_workspace(key, &session_id, remote)
            .await
        {
            Ok(volumes) => volumes,
            Err(e) => {
                self.ports.release_batch(&host_ports).await;
                return Err(e);
            }
        };

        let request = ContainerRequest {
            key: key.clone(),
            name: container_name.clone(),
            session_id: session_id.clone(),
            config: type_config.clone(),
            host_ports: host_ports.clone(),
            runtime_token: Uuid::new_v4().simple().to_string(),
            volumes,
            labels: HashMap::new(),
        };

        info!(key = %key, name = %container_name, ports = ?host_ports, "Provisioning sandbox");
        let mut model = match self.backend.create(&request).await {
            Ok(model) => model,
            Err(source) => {
                warn!(key = %key, "Container create failed: {}", source);
                if let Some(orphan) = source.orphaned_container() {
                    self.stop_quietly(orphan).await;
                }
                self.ports.release_batch(&host_ports).await;
                self.remove_workspace(&session_id).await;
                return Err(ManagerError::BackendCreateFailed {
                    key: key.clone(),
                    source,
                });
            }
        };
        model.storage_path = remote.map(str::to_string);

        let timeout = self
            .config
            .health_timeout
            .unwrap_or(type_config.startup_timeout);
        let health = match self.clients.connect(&model) {
            // The outer timeout also bounds a health check stuck on the network
            Ok(client) => match tokio::time::timeout(timeout, client.wait_until_healthy(timeout)).await {
                Ok(Ok(())) => Ok(client),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ClientError::HealthTimeout(timeout)),
            },
            Err(e) => Err(e),
        };

        let client = match health {
            Ok(client) => client,
            Err(source) => {
                warn!(key = %key, container_id = %model.container_id, "Health gate failed: {}", source);
                self.stop_quietly(&model.container_id).await;
                self.ports.release_batch(&host_ports).await;
                self.remove_workspace(&session_id).await;
                return Err(match source {
                    ClientError::HealthTimeout(timeout) => ManagerError::HealthTimeout {
                        key: key.clone(),
                        container_id: model.container_id,
                        timeout,
                    },
                    source => ManagerError::HealthCheckFailed {
                        key: key.clone(),
                        container_id: model.container_id,
                        source,
                    },
                });
            }
        };

        model.healthy = true;
        self.ports
            .register_ownership(&model.container_name, &host_ports)
            .await;
        Ok(Launched { model, client })
    }

    async fn prepare_workspace(
        &self,
        key: &SandboxKey,
        session_id: &str,
        remote: Option<&str>,
    ) -> Result<Vec<VolumeMount>> {
        let Some(mount_root) = &self.config.mount_root else {
            return Ok(Vec::new());
        };

        let mount_dir = mount_root.join(session_id);
        tokio::fs::create_dir_all(&mount_dir).await?;
        if let Some(remote) = remote {
            self.seed_workspace(key, remote, &mount_dir).await;
        }

        Ok(vec![VolumeMount {
            host_path: mount_dir.to_string_lossy().into_owned(),
            container_path: WORKSPACE_MOUNT.to_string(),
            readonly: false,
        }])
    }

    async fn seed_workspace(&self, key: &SandboxKey, remote: &str, mount_dir: &Path) {
        let Some(storage) = &self.storage else {
            return;
        };
        match storage.download_folder(remote, mount_dir).await {
            Ok(true) => debug!(key = %key, "Seeded workspace from storage"),
            Ok(false) => {}
            Err(e) => warn!(key = %key, "Failed to seed workspace: {}", e),
        }
    }

    async fn remove_workspace(&self, session_id: &str) {
        if let Some(mount_root) = &self.config.mount_root {
            remove_dir_logged(&mount_root.join(session_id)).await;
        }
    }

    async fn stop_quietly(&self, container_id: &str) {
        if let Err(e) = self.backend.stop(container_id).await {
            warn!(container_id, "Failed to stop container: {}", e);
        }
    }

    /// Stop the container, then free what it held.
    ///
    /// With `strict`, a failed stop is returned and nothing else is released.
    async fn teardown_inner(&self, model: &ContainerModel, strict: bool) -> Result<()> {
        if let Err(source) = self.backend.stop(&model.container_id).await {
            if strict {
                return Err(ManagerError::Backend {
                    container_id: model.container_id.clone(),
                    source,
                });
            }
            warn!(container_id = %model.container_id, "Failed to stop container: {}", source);
        }
        self.reclaim(model).await;
        Ok(())
    }

    /// Release the ports of a stopped container and persist then drop its workspace
    async fn reclaim(&self, model: &ContainerModel) {
        let released = self.ports.release_by_owner(&model.container_name).await;
        debug!(container_id = %model.container_id, ports = ?released, "Released ports");

        let Some(mount_dir) = &model.mount_dir else {
            return;
        };
        let mount_dir = Path::new(mount_dir);
        if self.persist_workspace(model, mount_dir).await {
            remove_dir_logged(mount_dir).await;
        }
    }

    /// Upload the workspace to storage. False means the mount holds the only copy.
    async fn persist_workspace(&self, model: &ContainerModel, mount_dir: &Path) -> bool {
        let (Some(storage), Some(remote)) = (&self.storage, &model.storage_path) else {
            return true;
        };
        match storage.upload_folder(mount_dir, remote).await {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    container_id = %model.container_id,
                    dir = %mount_dir.display(),
                    "Failed to persist workspace, keeping it on the host: {}",
                    e
                );
                false
            }
        }
    }

    async fn teardown(&self, model: &ContainerModel, strict: bool) {
        if let Err(e) = self.teardown_inner(model, strict).await {
            warn!(container_id = %model.container_id, "Teardown failed: {}", e);
        }
    }

    /// Release the sandbox bound to `key`. Returns false if there was none.
    pub async fn release(&self, key: &SandboxKey) -> Result<bool> {
        let Some(model) = self.registry.get(key).await? else {
            return Ok(false);
        };
        self.teardown_inner(&model, true).await?;
        self.registry.remove(key).await?;
        info!(key = %key, container_id = %model.container_id, "Released sandbox");
        Ok(true)
    }

    /// Release a sandbox when only its container id is known
    pub async fn release_by_container_id(&self, container_id: &str) -> Result<bool> {
        let Some(model) = self.registry.get_by_container_id(container_id).await? else {
            return Ok(false);
        };
        self.teardown_inner(&model, true).await?;
        self.registry.remove_by_container_id(container_id).await?;
        info!(container_id, "Released sandbox");
        Ok(true)
    }

    /// Runtime status of the container bound to `key`, `None` if unregistered
    pub async fn status(&self, key: &SandboxKey) -> Result<Option<(ContainerModel, ContainerStatus)>> {
        let Some(model) = self.registry.get(key).await? else {
            return Ok(None);
        };
        let status = self
            .backend
            .inspect(&model.container_id)
            .await
            .map_err(|source| ManagerError::Backend {
                container_id: model.container_id.clone(),
                source,
            })?;
        Ok(Some((model, status)))
    }

    /// Every registered sandbox, keyed by container id
    pub async fn list_sandboxes(&self) -> Result<HashMap<String, ContainerModel>> {
        Ok(self.registry.list_all().await?)
    }

    /// Every registered sandbox together with the key it is bound to
    pub async fn list_bindings(&self) -> Result<Vec<(Option<SandboxKey>, ContainerModel)>> {
        let mut bindings = Vec::new();
        for (container_id, model) in self.registry.list_all().await? {
            let key = self.registry.lookup_key(&container_id).await?;
            bindings.push((key, model));
        }
        bindings.sort_by(|a, b| a.1.created_at.cmp(&b.1.created_at));
        Ok(bindings)
    }

    /// Stop every registered and pooled container, then clear the registry.
    ///
    /// Per-container failures are logged and reported, never fatal.
    pub async fn cleanup_all(&self) -> Result<CleanupReport> {
        let registered = self.registry.list_all().await?;
        let pooled: Vec<ContainerModel> = self.pool.lock().await.drain(..).collect();
        let mut report = CleanupReport::default();

        info!(
            registered = registered.len(),
            pooled = pooled.len(),
            "Cleaning up sandboxes"
        );

        for model in registered.values().chain(pooled.iter()) {
            match self.backend.stop(&model.container_id).await {
                Ok(()) => report.stopped += 1,
                Err(e) => {
                    let message = format!("Failed to stop container {}: {}", model.container_id, e);
                    warn!("{}", message);
                    report.errors.push(message);
                }
            }
            self.reclaim(model).await;
        }

        for container_id in registered.keys() {
            if let Err(e) = self.registry.remove_by_container_id(container_id).await {
                let message = format!("Failed to unregister container {}: {}", container_id, e);
                warn!("{}", message);
                report.errors.push(message);
            }
        }

        info!(
            stopped = report.stopped,
            failed = report.errors.len(),
            "Cleanup complete"
        );
        Ok(report)
    }

    /// Start containers of the default type until the pool is full
    pub async fn refill_pool(&self) -> usize {
        if self.config.pool_size == 0 {
            return 0;
        }
        let Some(type_config) = self.types.lookup(&self.config.default_sandbox_type) else {
            warn!(
                sandbox_type = %self.config.default_sandbox_type,
                "Default sandbox type is not registered, pool stays empty"
            );
            return 0;
        };

        let _refilling = self.pool_refill.lock().await;
        let mut added = 0;
        while self.pool.lock().await.len() < self.config.pool_size {
            let pool_key = SandboxKey::new("pool", "", self.config.default_sandbox_type.clone());
            match self.launch(&pool_key, &type_config, None).await {
                Ok(launched) => {
                    self.pool.lock().await.push_back(launched.model);
                    added += 1;
                }
                Err(e) => {
                    warn!("Failed to fill sandbox pool: {}", e);
                    break;
                }
            }
        }
        if added > 0 {
            info!(added, "Sandbox pool refilled");
        }
        added
    }

    pub async fn pool_len(&self) -> usize {
        self.pool.lock().await.len()
    }

    async fn claim_pooled(
        &self,
        key: &SandboxKey,
        remote: Option<&str>,
    ) -> Result<Option<SandboxHandle>> {
        let Some(mut model) = self.pool.lock().await.pop_front() else {
            return Ok(None);
        };

        debug!(key = %key, container_id = %model.container_id, "Claiming pooled sandbox");
        if let (Some(mount_dir), Some(remote)) = (model.mount_dir.clone(), remote) {
            self.seed_workspace(key, remote, Path::new(&mount_dir)).await;
        }
        model.storage_path = remote.map(str::to_string);

        let client = match self.clients.connect(&model) {
            Ok(client) => client,
            Err(e) => {
                self.teardown(&model, false).await;
                return Err(e.into());
            }
        };
        self.commit(key, Launched { model, client }).await.map(Some)
    }
}

/// Durable location of a tenant's workspace, `user/session/type`.
///
/// Each field must be a single plain path segment.
fn storage_path(key: &SandboxKey) -> Result<String> {
    for (field, value) in [
        ("user id", &key.user_id),
        ("session id", &key.session_id),
        ("sandbox type", &key.sandbox_type),
    ] {
        if let Some(reason) = unsafe_segment(value) {
            return Err(ManagerError::InvalidKey {
                key: key.clone(),
                reason: format!("{} {}", field, reason),
            });
        }
    }
    Ok(format!("{}/{}/{}", key.user_id, key.session_id, key.sandbox_type))
}

fn unsafe_segment(value: &str) -> Option<&'static str> {
    if value.is_empty() {
        return Some("is empty");
    }
    if value.contains(['/', '\\', '\0']) {
        return Some("contains a path separator");
    }
    let mut components = Path::new(value).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => None,
        _ => Some("is not a plain path segment"),
    }
}

async fn remove_dir_logged(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), "Failed to remove workspace: {}", e),
    }
}

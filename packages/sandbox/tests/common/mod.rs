// ABOUTME: Shared fakes for manager integration tests
// ABOUTME: A recording deployment backend and a scripted sandbox client factory

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use warden_sandbox::client::Result as ClientResult;
use warden_sandbox::providers::Result as BackendResult;
use warden_sandbox::storage::Result as StorageResult;
use warden_sandbox::store::Result as StoreResult;
use warden_sandbox::{
    ArtifactStorage, BackendError, ClientFactory, ContainerModel, ContainerRequest,
    ContainerStatus, DeploymentBackend, KvStore, ManagerConfig, MemoryKvStore, PortAllocator,
    PortRange, SandboxClient, SandboxManager, SandboxRegistration, SandboxRegistry, SandboxType,
    SandboxTypeRegistry, StorageError, StoreError,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CreateBehavior {
    Succeed,
    Fail,
    /// Container left behind after a failed start
    FailWithOrphan,
}

#[derive(Default)]
pub struct Recorded {
    pub creates: Vec<ContainerRequest>,
    pub stops: Vec<String>,
    pub live: HashSet<String>,
}

pub struct FakeBackend {
    pub behavior: Mutex<CreateBehavior>,
    pub create_delay: Duration,
    pub failing_stops: Mutex<HashSet<String>>,
    pub recorded: Mutex<Recorded>,
    counter: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(create_delay: Duration) -> Self {
        Self {
            behavior: Mutex::new(CreateBehavior::Succeed),
            create_delay,
            failing_stops: Mutex::new(HashSet::new()),
            recorded: Mutex::new(Recorded::default()),
            counter: AtomicUsize::new(0),
        }
    }

    pub fn set_behavior(&self, behavior: CreateBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn fail_stop_for(&self, container_id: &str) {
        self.failing_stops
            .lock()
            .unwrap()
            .insert(container_id.to_string());
    }

    pub fn create_count(&self) -> usize {
        self.recorded.lock().unwrap().creates.len()
    }

    pub fn stops(&self) -> Vec<String> {
        self.recorded.lock().unwrap().stops.clone()
    }

    pub fn live_count(&self) -> usize {
        self.recorded.lock().unwrap().live.len()
    }

    pub fn last_request(&self) -> ContainerRequest {
        self.recorded
            .lock()
            .unwrap()
            .creates
            .last()
            .cloned()
            .expect("no create recorded")
    }
}

#[async_trait]
impl DeploymentBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn create(&self, request: &ContainerRequest) -> BackendResult<ContainerModel> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let container_id = format!("fake-{}", n);
        let behavior = *self.behavior.lock().unwrap();

        let mut recorded = self.recorded.lock().unwrap();
        recorded.creates.push(request.clone());
        match behavior {
            CreateBehavior::Fail => Err(BackendError::Image("pull denied".to_string())),
            CreateBehavior::FailWithOrphan => {
                recorded.live.insert(container_id.clone());
                Err(BackendError::StartFailed {
                    container_id,
                    message: "port already in use".to_string(),
                })
            }
            CreateBehavior::Succeed => {
                recorded.live.insert(container_id.clone());
                let mut model = ContainerModel::for_endpoint(
                    container_id,
                    request.name.clone(),
                    request.session_id.clone(),
                    request.config.type_name.clone(),
                    "localhost",
                    request.host_ports[0],
                    request.runtime_token.clone(),
                    request.host_ports.clone(),
                );
                model.mount_dir = request.volumes.first().map(|v| v.host_path.clone());
                Ok(model)
            }
        }
    }

    async fn stop(&self, container_id: &str) -> BackendResult<()> {
        let mut recorded = self.recorded.lock().unwrap();
        recorded.stops.push(container_id.to_string());
        if self.failing_stops.lock().unwrap().contains(container_id) {
            return Err(BackendError::Container("daemon hung".to_string()));
        }
        recorded.live.remove(container_id);
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> BackendResult<ContainerStatus> {
        if self.recorded.lock().unwrap().live.contains(container_id) {
            Ok(ContainerStatus::Running)
        } else {
            Ok(ContainerStatus::Missing)
        }
    }
}

pub struct ScriptedClient {
    healthy: bool,
    checks: Arc<AtomicUsize>,
}

#[async_trait]
impl SandboxClient for ScriptedClient {
    async fn check_health(&self) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.healthy
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> ClientResult<Value> {
        Ok(json!({ "tool": name, "arguments": arguments }))
    }

    async fn list_tools(&self, _tool_type: Option<&str>) -> ClientResult<Value> {
        Ok(json!({}))
    }

    async fn add_mcp_servers(&self, server_configs: Value, overwrite: bool) -> ClientResult<Value> {
        Ok(json!({ "servers": server_configs, "overwrite": overwrite }))
    }
}

pub struct ScriptedClients {
    pub healthy: Mutex<bool>,
    pub checks: Arc<AtomicUsize>,
    pub connects: AtomicUsize,
}

impl ScriptedClients {
    pub fn healthy() -> Self {
        Self {
            healthy: Mutex::new(true),
            checks: Arc::new(AtomicUsize::new(0)),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn never_healthy() -> Self {
        let clients = Self::healthy();
        *clients.healthy.lock().unwrap() = false;
        clients
    }

    pub fn check_count(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

impl ClientFactory for ScriptedClients {
    fn connect(&self, _model: &ContainerModel) -> ClientResult<Arc<dyn SandboxClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedClient {
            healthy: *self.healthy.lock().unwrap(),
            checks: self.checks.clone(),
        }))
    }
}

pub const TEST_RANGE: PortRange = PortRange {
    start: 41000,
    end: 41009,
};

/// Type registry with `base` and a 30s-timeout `browser` using image `X`
pub fn test_types() -> Arc<SandboxTypeRegistry> {
    let types = SandboxTypeRegistry::new();
    types
        .register(SandboxRegistration::builtin(SandboxType::Base, "base:latest"))
        .unwrap();
    types
        .register(SandboxRegistration {
            timeout: Duration::from_secs(30),
            ..SandboxRegistration::builtin(SandboxType::Browser, "X")
        })
        .unwrap();
    Arc::new(types)
}

pub fn test_config() -> ManagerConfig {
    ManagerConfig {
        port_range: TEST_RANGE,
        health_timeout: Some(Duration::from_secs(2)),
        ..Default::default()
    }
}

pub fn build_manager(
    config: ManagerConfig,
    backend: Arc<FakeBackend>,
    registry: Arc<dyn SandboxRegistry>,
    clients: Arc<ScriptedClients>,
) -> SandboxManager {
    let range = config.port_range;
    SandboxManager::new(config, backend, registry, clients)
        .with_types(test_types())
        .with_port_allocator(Arc::new(PortAllocator::with_check(range, Arc::new(|_| true))))
}

/// Key-value store whose reads succeed and whose writes always fail
#[derive(Default)]
pub struct ReadOnlyStore {
    inner: MemoryKvStore,
}

#[async_trait]
impl KvStore for ReadOnlyStore {
    async fn set(&self, _key: &str, _value: &str) -> StoreResult<()> {
        Err(StoreError::Unavailable("connection reset".to_string()))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn delete(&self, _key: &str) -> StoreResult<bool> {
        Err(StoreError::Unavailable("connection reset".to_string()))
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, String)>> {
        self.inner.scan_prefix(prefix).await
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> StoreResult<bool> {
        Err(StoreError::Unavailable("connection reset".to_string()))
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.inner.ttl(key).await
    }
}

/// Artifact storage that records how many containers were still live at each upload
pub struct WatchingStorage {
    backend: Arc<FakeBackend>,
    fail_uploads: bool,
    pub live_at_upload: Mutex<Vec<usize>>,
}

impl WatchingStorage {
    pub fn new(backend: Arc<FakeBackend>, fail_uploads: bool) -> Self {
        Self {
            backend,
            fail_uploads,
            live_at_upload: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ArtifactStorage for WatchingStorage {
    async fn download_folder(&self, _remote_path: &str, _local_dir: &Path) -> StorageResult<bool> {
        Ok(false)
    }

    async fn upload_folder(&self, _local_dir: &Path, _remote_path: &str) -> StorageResult<bool> {
        self.live_at_upload
            .lock()
            .unwrap()
            .push(self.backend.live_count());
        if self.fail_uploads {
            return Err(StorageError::Task("bucket unreachable".to_string()));
        }
        Ok(true)
    }
}

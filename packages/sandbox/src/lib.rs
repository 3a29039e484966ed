// ABOUTME: Sandbox orchestration library: ports, sandbox types, registries, backends and lifecycle
// ABOUTME: Re-exports the public surface used by the CLI and by embedding services

pub mod client;
pub mod config;
pub mod manager;
pub mod model;
pub mod ports;
pub mod providers;
pub mod registry;
pub mod storage;
pub mod store;
pub mod tools;
pub mod types;

pub use client::{
    ClientError, ClientFactory, HttpClientFactory, SandboxClient, SandboxHttpClient,
    GENERIC_TOOLS,
};
pub use config::{BackendConfig, ConfigError, ManagerConfig, RegistryConfig};
pub use manager::{CleanupReport, ManagerError, SandboxHandle, SandboxManager};
pub use model::{ContainerModel, SandboxKey};
pub use ports::{PortAllocator, PortRange};
pub use providers::{
    BackendError, ContainerRequest, ContainerStatus, DeploymentBackend, DockerBackend,
    DockerBackendConfig, KubernetesBackend, KubernetesBackendConfig, VolumeMount,
};
pub use registry::{
    LocalSandboxRegistry, RegistryError, SandboxRegistry, SharedSandboxRegistry,
};
pub use storage::{ArtifactStorage, LocalArtifactStorage, StorageError};
pub use store::{KvStore, MemoryKvStore, SqliteKvStore, StoreError};
pub use tools::{SandboxTool, ToolHost};
pub use types::{
    ResourceLimits, SandboxConfig, SandboxRegistration, SandboxType, SandboxTypeRegistry,
    SecurityLevel, TypeRegistryError,
};

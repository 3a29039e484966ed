// ABOUTME: Manager configuration with defaults, environment overrides and validation
// ABOUTME: Selects the registry flavor and the single deployment backend for a manager instance

use crate::ports::PortRange;
use crate::providers::kubernetes::ServiceType;
use crate::providers::{DockerBackendConfig, KubernetesBackendConfig};
use crate::registry::shared::DEFAULT_REGISTRY_PREFIX;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use warden_config::*;

/// Container names are `prefix + 25-char id` and must fit a 63-char DNS label
pub const MAX_CONTAINER_PREFIX_LEN: usize = 63 - 25;

pub const DEFAULT_CONTAINER_PREFIX: &str = "warden_sandbox_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: '{value}'")]
    InvalidValue { name: String, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegistryConfig {
    Local,
    /// Registry records kept in an SQLite key-value file shared between instances
    Shared { path: PathBuf, prefix: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Docker(DockerBackendConfig),
    Kubernetes(KubernetesBackendConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    pub container_prefix: String,
    pub port_range: PortRange,
    /// Warm containers of the default type kept ready
    pub pool_size: usize,
    pub default_sandbox_type: String,
    /// Prefix for built-in sandbox images, empty for local images
    pub image_registry: String,
    pub registry: RegistryConfig,
    pub backend: BackendConfig,
    /// Host directory holding one workspace per sandbox session
    pub mount_root: Option<PathBuf>,
    /// Durable artifact root that workspaces are seeded from and synced back to
    pub storage_root: Option<PathBuf>,
    /// Overrides every type's startup timeout when set
    pub health_timeout: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            container_prefix: DEFAULT_CONTAINER_PREFIX.to_string(),
            port_range: PortRange::default(),
            pool_size: 0,
            default_sandbox_type: "base".to_string(),
            image_registry: String::new(),
            registry: RegistryConfig::Local,
            backend: BackendConfig::Docker(DockerBackendConfig::default()),
            mount_root: None,
            storage_root: None,
            health_timeout: None,
        }
    }
}

impl ManagerConfig {
    /// Defaults overridden by `WARDEN_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable name
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(prefix) = get(WARDEN_CONTAINER_PREFIX) {
            config.container_prefix = prefix;
        }
        if let Some(start) = parse(&get, WARDEN_PORT_RANGE_START)? {
            config.port_range.start = start;
        }
        if let Some(end) = parse(&get, WARDEN_PORT_RANGE_END)? {
            config.port_range.end = end;
        }
        if let Some(size) = parse(&get, WARDEN_POOL_SIZE)? {
            config.pool_size = size;
        }
        if let Some(default_type) = get(WARDEN_DEFAULT_SANDBOX_TYPE) {
            config.default_sandbox_type = default_type.trim().to_lowercase();
        }
        if let Some(image_registry) = get(WARDEN_IMAGE_REGISTRY) {
            config.image_registry = image_registry;
        }

        let registry_kind = get(WARDEN_REGISTRY_BACKEND).unwrap_or_else(|| "local".to_string());
        config.registry = match registry_kind.to_lowercase().as_str() {
            "local" => RegistryConfig::Local,
            "shared" => RegistryConfig::Shared {
                path: get(WARDEN_REGISTRY_PATH)
                    .map(PathBuf::from)
                    .unwrap_or_default(),
                prefix: get(WARDEN_REGISTRY_PREFIX)
                    .unwrap_or_else(|| DEFAULT_REGISTRY_PREFIX.to_string()),
            },
            _ => {
                return Err(ConfigError::InvalidValue {
                    name: WARDEN_REGISTRY_BACKEND.to_string(),
                    value: registry_kind,
                })
            }
        };

        let backend_kind = get(WARDEN_BACKEND).unwrap_or_else(|| "docker".to_string());
        config.backend = match backend_kind.as_str() {
            "docker" => {
                let mut docker = DockerBackendConfig {
                    host: get(WARDEN_DOCKER_HOST),
                    ..Default::default()
                };
                if let Some(host) = get(WARDEN_PUBLIC_HOST) {
                    docker.public_host = host;
                }
                if let Some(secs) = parse::<u64, _>(&get, WARDEN_IMAGE_PULL_TIMEOUT_SECS)? {
                    docker.pull_timeout = Duration::from_secs(secs);
                }
                if let Some(secs) = parse::<u64, _>(&get, WARDEN_CONTAINER_STOP_TIMEOUT_SECS)? {
                    docker.stop_timeout = Duration::from_secs(secs);
                }
                BackendConfig::Docker(docker)
            }
            "kubernetes" => {
                let mut kubernetes = KubernetesBackendConfig {
                    kubeconfig: get(WARDEN_KUBECONFIG).map(PathBuf::from),
                    public_host: get(WARDEN_PUBLIC_HOST),
                    ..Default::default()
                };
                if let Some(namespace) = get(WARDEN_K8S_NAMESPACE) {
                    kubernetes.namespace = namespace;
                }
                if let Some(service_type) = parse::<ServiceType, _>(&get, WARDEN_K8S_SERVICE_TYPE)? {
                    kubernetes.service_type = service_type;
                }
                BackendConfig::Kubernetes(kubernetes)
            }
            _ => {
                return Err(ConfigError::InvalidValue {
                    name: WARDEN_BACKEND.to_string(),
                    value: backend_kind,
                })
            }
        };

        config.mount_root = get(WARDEN_MOUNT_DIR).map(PathBuf::from);
        config.storage_root = get(WARDEN_STORAGE_DIR).map(PathBuf::from);
        config.health_timeout =
            parse::<u64, _>(&get, WARDEN_HEALTH_TIMEOUT_SECS)?.map(Duration::from_secs);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port_range.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "port range {}-{} is empty",
                self.port_range.start, self.port_range.end
            )));
        }
        if self.container_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "container prefix cannot be empty".to_string(),
            ));
        }
        if self.container_prefix.len() > MAX_CONTAINER_PREFIX_LEN {
            return Err(ConfigError::Invalid(format!(
                "container prefix '{}' exceeds {} characters",
                self.container_prefix, MAX_CONTAINER_PREFIX_LEN
            )));
        }
        if let RegistryConfig::Shared { path, .. } = &self.registry {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "shared registry requires {}",
                    WARDEN_REGISTRY_PATH
                )));
            }
        }
        if self.storage_root.is_some() && self.mount_root.is_none() {
            return Err(ConfigError::Invalid(format!(
                "{} requires {}",
                WARDEN_STORAGE_DIR, WARDEN_MOUNT_DIR
            )));
        }
        if self.health_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid(
                "health timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse<T, G>(get: &G, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    get(name)
        .map(|raw| {
            raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                name: name.to_string(),
                value: raw,
            })
        })
        .transpose()
}

// ABOUTME: Deployment backend trait and the request/status types shared by backends
// ABOUTME: A backend starts, stops and inspects containers on one concrete runtime

use crate::model::{ContainerModel, SandboxKey};
use crate::types::SandboxConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

pub mod docker;
pub mod kubernetes;

pub use docker::{DockerBackend, DockerBackendConfig};
pub use kubernetes::{KubernetesBackend, KubernetesBackendConfig};

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Container error: {0}")]
    Container(String),

    /// The container exists but could not be started or cleaned up
    #[error("Container {container_id} failed to start: {message}")]
    StartFailed {
        container_id: String,
        message: String,
    },

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Invalid container request: {0}")]
    InvalidRequest(String),

    #[error("Backend not available: {0}")]
    NotAvailable(String),
}

impl BackendError {
    /// Id of a container the backend left behind, which the caller must stop
    pub fn orphaned_container(&self) -> Option<&str> {
        match self {
            Self::StartFailed { container_id, .. } => Some(container_id),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Serde helper storing a `Duration` as whole seconds
pub(crate) mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
}

/// Everything a backend needs to start one sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerRequest {
    /// Tenant the container is provisioned for
    pub key: SandboxKey,
    pub name: String,
    pub session_id: String,
    pub config: SandboxConfig,
    /// Host ports, one per entry of `config.ports`, in order
    pub host_ports: Vec<u16>,
    pub runtime_token: String,
    pub volumes: Vec<VolumeMount>,
    pub labels: HashMap<String, String>,
}

impl ContainerRequest {
    /// Split a `port/proto` spec into its number and protocol
    pub fn parse_port_spec(spec: &str) -> Result<(u16, String)> {
        let (port, protocol) = spec.split_once('/').unwrap_or((spec, "tcp"));
        let port = port
            .trim()
            .parse()
            .map_err(|_| BackendError::InvalidRequest(format!("invalid container port '{}'", spec)))?;
        Ok((port, protocol.trim().to_lowercase()))
    }

    /// Pair each declared container port with its allocated host port
    pub fn port_bindings(&self) -> Result<Vec<(String, u16)>> {
        if self.host_ports.len() != self.config.ports.len() {
            return Err(BackendError::InvalidRequest(format!(
                "type {} declares {} ports but {} were allocated",
                self.config.type_name,
                self.config.ports.len(),
                self.host_ports.len()
            )));
        }

        Ok(self
            .config
            .ports
            .iter()
            .map(|spec| {
                if spec.contains('/') {
                    spec.clone()
                } else {
                    format!("{}/tcp", spec)
                }
            })
            .zip(self.host_ports.iter().copied())
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Stopped,
    Dead,
    /// The backend has no container with this id
    Missing,
    Unknown(String),
}

impl ContainerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Running => f.write_str("running"),
            Self::Paused => f.write_str("paused"),
            Self::Restarting => f.write_str("restarting"),
            Self::Stopped => f.write_str("stopped"),
            Self::Dead => f.write_str("dead"),
            Self::Missing => f.write_str("missing"),
            Self::Unknown(state) => write!(f, "unknown ({})", state),
        }
    }
}

/// Driver for one container runtime.
///
/// `create` either returns a started container or leaves nothing running.
/// If it cannot clean up after itself it returns
/// [`BackendError::StartFailed`] so the caller can issue the `stop`.
#[async_trait]
pub trait DeploymentBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Check if the runtime is reachable
    async fn is_available(&self) -> bool;

    async fn create(&self, request: &ContainerRequest) -> Result<ContainerModel>;

    /// Stop and remove a container. Stopping an unknown container is not an error.
    async fn stop(&self, container_id: &str) -> Result<()>;

    async fn inspect(&self, container_id: &str) -> Result<ContainerStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(ports: Vec<&str>, host_ports: Vec<u16>) -> ContainerRequest {
        let mut config = SandboxConfig::new("img", "browser");
        config.ports = ports.into_iter().map(String::from).collect();
        ContainerRequest {
            key: SandboxKey::new("u", "s", "browser"),
            name: "c".to_string(),
            session_id: "sess".to_string(),
            config,
            host_ports,
            runtime_token: "tok".to_string(),
            volumes: vec![],
            labels: HashMap::new(),
        }
    }

    #[test]
    fn test_port_bindings_pair_in_order() {
        let bindings = request(vec!["80/tcp", "9000"], vec![50000, 50001])
            .port_bindings()
            .unwrap();
        assert_eq!(
            bindings,
            vec![("80/tcp".to_string(), 50000), ("9000/tcp".to_string(), 50001)]
        );
    }

    #[test]
    fn test_port_count_mismatch_rejected() {
        let err = request(vec!["80/tcp"], vec![]).port_bindings().unwrap_err();
        assert!(matches!(err, BackendError::InvalidRequest(_)));
    }

    #[test]
    fn test_parse_port_spec() {
        assert_eq!(
            ContainerRequest::parse_port_spec("80/tcp").unwrap(),
            (80, "tcp".to_string())
        );
        assert_eq!(
            ContainerRequest::parse_port_spec("9000").unwrap(),
            (9000, "tcp".to_string())
        );
        assert_eq!(
            ContainerRequest::parse_port_spec("53/UDP").unwrap(),
            (53, "udp".to_string())
        );
        assert!(ContainerRequest::parse_port_spec("http/tcp").is_err());
    }

    #[test]
    fn test_only_start_failures_report_orphans() {
        let err = BackendError::StartFailed {
            container_id: "abc".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(err.orphaned_container(), Some("abc"));
        assert_eq!(BackendError::Image("x".to_string()).orphaned_container(), None);
    }
}

// ABOUTME: Docker deployment backend for local container-based sandboxes
// ABOUTME: Uses bollard to pull images, start sandbox containers and tear them down

use super::{BackendError, ContainerRequest, ContainerStatus, DeploymentBackend, Result};
use crate::model::ContainerModel;
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
        StopContainerOptions,
    },
    image::CreateImageOptions,
    models::{HostConfig, PortBinding},
    Docker, API_DEFAULT_VERSION,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const LABEL_PREFIX: &str = "warden.sandbox";
const CONNECT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockerBackendConfig {
    /// Daemon address (`unix://...` or `tcp://...`); `None` uses the Docker defaults
    pub host: Option<String>,
    /// Host name clients use to reach published ports
    pub public_host: String,
    #[serde(with = "super::secs")]
    pub pull_timeout: Duration,
    #[serde(with = "super::secs")]
    pub stop_timeout: Duration,
}

impl Default for DockerBackendConfig {
    fn default() -> Self {
        Self {
            host: None,
            public_host: "localhost".to_string(),
            pull_timeout: Duration::from_secs(600),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

pub struct DockerBackend {
    client: Docker,
    config: DockerBackendConfig,
    /// Images already pulled by this backend, with the pull time
    image_cache: Arc<RwLock<HashMap<String, chrono::DateTime<chrono::Utc>>>>,
}

impl DockerBackend {
    pub fn new(config: DockerBackendConfig) -> Result<Self> {
        let client = match config.host.as_deref() {
            None => Docker::connect_with_defaults(),
            #[cfg(unix)]
            Some(host) if host.starts_with("unix://") => {
                Docker::connect_with_unix(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Some(host) => Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION),
        }
        .map_err(|e| BackendError::Connection(e.to_string()))?;

        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Docker, config: DockerBackendConfig) -> Self {
        Self {
            client,
            config,
            image_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(BackendError::Image(e.to_string())),
        }
    }

    /// Make sure `image` is present locally, pulling it within the configured timeout
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.image_cache.read().await.contains_key(image) {
            if self.image_exists(image).await? {
                return Ok(());
            }
            self.image_cache.write().await.remove(image);
            info!("Image {} was removed outside the backend, pulling again", image);
        } else if self.image_exists(image).await? {
            return Ok(());
        }

        info!(image, timeout = ?self.config.pull_timeout, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        let pulled = tokio::time::timeout(self.config.pull_timeout, async {
            let mut last_status = String::new();
            while let Some(progress) = stream.next().await {
                let progress = progress.map_err(|e| {
                    BackendError::Image(format!("Failed to pull image {}: {}", image, e))
                })?;
                if let Some(error) = progress.error {
                    return Err(BackendError::Image(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
                if let Some(status) = progress.status {
                    if status != last_status {
                        debug!("Pull status: {}", status);
                        last_status = status;
                    }
                }
            }
            Ok(())
        })
        .await;

        match pulled {
            Ok(Ok(())) => {
                info!("Pulled image {}", image);
                self.image_cache
                    .write()
                    .await
                    .insert(image.to_string(), chrono::Utc::now());
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BackendError::Image(format!(
                "Timeout pulling image {} after {:?}",
                image, self.config.pull_timeout
            ))),
        }
    }

    async fn force_remove(&self, container_id: &str) -> std::result::Result<(), bollard::errors::Error> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.client
            .remove_container(container_id, Some(options))
            .await
    }
}

/// Translate a container request into a bollard create config
fn container_config(request: &ContainerRequest) -> Result<Config<String>> {
    let mut labels = request.labels.clone();
    labels.insert(format!("{}.managed", LABEL_PREFIX), "true".to_string());
    labels.insert(format!("{}.type", LABEL_PREFIX), request.config.type_name.clone());
    labels.insert(format!("{}.user", LABEL_PREFIX), request.key.user_id.clone());
    labels.insert(format!("{}.session", LABEL_PREFIX), request.key.session_id.clone());

    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for (container_port, host_port) in request.port_bindings()? {
        exposed_ports.insert(container_port.clone(), HashMap::new());
        port_bindings.insert(
            container_port,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(host_port.to_string()),
            }]),
        );
    }

    let binds: Vec<String> = request
        .volumes
        .iter()
        .map(|v| {
            format!(
                "{}:{}:{}",
                v.host_path,
                v.container_path,
                if v.readonly { "ro" } else { "rw" }
            )
        })
        .collect();

    let mut env: Vec<String> = request
        .config
        .environment
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    env.sort();
    env.push(format!("SECRET_TOKEN={}", request.runtime_token));

    let limits = &request.config.resource_limits;
    let host_config = HostConfig {
        binds: (!binds.is_empty()).then_some(binds),
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        memory: limits.memory_bytes(),
        nano_cpus: limits.cpus.map(|cpus| (cpus * 1_000_000_000.0) as i64),
        runtime: request.config.runtime().map(str::to_string),
        ..Default::default()
    };

    Ok(Config {
        image: Some(request.config.image.clone()),
        env: Some(env),
        labels: Some(labels),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    })
}

fn convert_status(state: &str) -> ContainerStatus {
    match state.to_lowercase().as_str() {
        "created" => ContainerStatus::Created,
        "running" => ContainerStatus::Running,
        "paused" => ContainerStatus::Paused,
        "restarting" => ContainerStatus::Restarting,
        "removing" | "exited" => ContainerStatus::Stopped,
        "dead" => ContainerStatus::Dead,
        other => ContainerStatus::Unknown(other.to_string()),
    }
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl DeploymentBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn is_available(&self) -> bool {
        match self.client.ping().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Docker not available: {}", e);
                false
            }
        }
    }

    async fn create(&self, request: &ContainerRequest) -> Result<ContainerModel> {
        let bollard_config = container_config(request)?;
        let Some(&endpoint_port) = request.host_ports.first() else {
            return Err(BackendError::InvalidRequest(format!(
                "type {} exposes no ports",
                request.config.type_name
            )));
        };

        self.ensure_image(&request.config.image).await?;

        info!(name = %request.name, image = %request.config.image, "Creating container");
        let options = CreateContainerOptions {
            name: request.name.clone(),
            platform: None,
        };
        let container = self
            .client
            .create_container(Some(options), bollard_config)
            .await
            .map_err(|e| BackendError::Container(e.to_string()))?;

        if let Err(start_error) = self
            .client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
        {
            warn!(container_id = %container.id, "Start failed, removing container: {}", start_error);
            return match self.force_remove(&container.id).await {
                Ok(()) => Err(BackendError::Container(format!(
                    "Failed to start {}: {}",
                    request.name, start_error
                ))),
                Err(remove_error) => Err(BackendError::StartFailed {
                    container_id: container.id,
                    message: format!("{} (cleanup failed: {})", start_error, remove_error),
                }),
            };
        }

        debug!(container_id = %container.id, port = endpoint_port, "Container started");
        let mut model = ContainerModel::for_endpoint(
            container.id,
            request.name.clone(),
            request.session_id.clone(),
            request.config.type_name.clone(),
            &self.config.public_host,
            endpoint_port,
            request.runtime_token.clone(),
            request.host_ports.clone(),
        );
        model.mount_dir = request.volumes.first().map(|v| v.host_path.clone());
        Ok(model)
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        info!(container_id, "Stopping container");
        let options = StopContainerOptions {
            t: self.config.stop_timeout.as_secs() as i64,
        };
        match self.client.stop_container(container_id, Some(options)).await {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => {
                debug!(container_id, "Container already gone");
                return Ok(());
            }
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => return Err(BackendError::Container(e.to_string())),
        }

        match self.force_remove(container_id).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(BackendError::Container(e.to_string())),
        }
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerStatus> {
        let inspect = match self.client.inspect_container(container_id, None).await {
            Ok(inspect) => inspect,
            Err(e) if is_not_found(&e) => return Ok(ContainerStatus::Missing),
            Err(e) => return Err(BackendError::Container(e.to_string())),
        };

        let state = inspect
            .state
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .map(|s| AsRef::<str>::as_ref(s).to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(convert_status(&state))
    }
}

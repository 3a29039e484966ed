// ABOUTME: Kubernetes deployment backend running each sandbox as a one-replica Deployment
// ABOUTME: A Service named after the Deployment exposes the allocated ports to clients

use super::{BackendError, ContainerRequest, ContainerStatus, DeploymentBackend, Result};
use crate::model::ContainerModel;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HostPathVolumeSource, PodSpec, PodTemplateSpec,
    ResourceRequirements, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount as PodVolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const LABEL_PREFIX: &str = "warden.sandbox";
const CONTAINER_NAME: &str = "sandbox";
/// Kubernetes object names are DNS labels
const MAX_NAME_LEN: usize = 63;
const SERVICE_SUFFIX: &str = "-svc";
const INGRESS_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    LoadBalancer,
    NodePort,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoadBalancer => "LoadBalancer",
            Self::NodePort => "NodePort",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "loadbalancer" => Ok(Self::LoadBalancer),
            "nodeport" => Ok(Self::NodePort),
            other => Err(format!("unknown service type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KubernetesBackendConfig {
    pub namespace: String,
    /// Kubeconfig file; `None` uses in-cluster config or `~/.kube/config`
    pub kubeconfig: Option<PathBuf>,
    pub service_type: ServiceType,
    /// Host clients use to reach the Service. When unset, a LoadBalancer's
    /// ingress address is used, falling back to `localhost`.
    pub public_host: Option<String>,
    /// How long to wait for a LoadBalancer ingress address
    #[serde(with = "super::secs")]
    pub ingress_timeout: Duration,
}

impl Default for KubernetesBackendConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            kubeconfig: None,
            service_type: ServiceType::LoadBalancer,
            public_host: None,
            ingress_timeout: Duration::from_secs(30),
        }
    }
}

pub struct KubernetesBackend {
    client: Client,
    config: KubernetesBackendConfig,
}

impl KubernetesBackend {
    pub async fn connect(config: KubernetesBackendConfig) -> Result<Self> {
        let client = match &config.kubeconfig {
            None => Client::try_default()
                .await
                .map_err(|e| BackendError::Connection(e.to_string()))?,
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    BackendError::Connection(format!("{}: {}", path.display(), e))
                })?;
                let client_config =
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .map_err(|e| BackendError::Connection(e.to_string()))?;
                Client::try_from(client_config)
                    .map_err(|e| BackendError::Connection(e.to_string()))?
            }
        };
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: KubernetesBackendConfig) -> Self {
        Self { client, config }
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    /// Host clients should use for a freshly created Service
    async fn resolve_public_host(&self, service_name: &str) -> String {
        if let Some(host) = &self.config.public_host {
            return host.clone();
        }
        if self.config.service_type == ServiceType::NodePort {
            return "localhost".to_string();
        }

        let services = self.services();
        let waited = tokio::time::timeout(self.config.ingress_timeout, async {
            loop {
                match services.get(service_name).await {
                    Ok(service) => {
                        if let Some(host) = ingress_host(&service) {
                            return host;
                        }
                    }
                    Err(e) => debug!(service = service_name, "Reading service status failed: {}", e),
                }
                tokio::time::sleep(INGRESS_POLL).await;
            }
        })
        .await;

        waited.unwrap_or_else(|_| {
            warn!(
                service = service_name,
                timeout = ?self.config.ingress_timeout,
                "No load balancer address assigned, using localhost"
            );
            "localhost".to_string()
        })
    }

    async fn delete_deployment(&self, name: &str) -> std::result::Result<(), kube::Error> {
        match self.deployments().delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_service(&self, name: &str) -> std::result::Result<(), kube::Error> {
        match self.services().delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Map an arbitrary container name onto a valid Kubernetes object name
pub fn resource_name(name: &str) -> String {
    let mapped: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let limit = MAX_NAME_LEN - SERVICE_SUFFIX.len();
    let truncated: String = mapped.chars().take(limit).collect();
    let trimmed = truncated.trim_matches('-');
    if trimmed.is_empty() {
        "sandbox".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn service_name(deployment_name: &str) -> String {
    format!("{}{}", deployment_name, SERVICE_SUFFIX)
}

/// Label values must be short DNS-ish strings, so tenant ids go in annotations
fn selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), name.to_string())])
}

fn object_meta(name: &str, request: &ContainerRequest) -> ObjectMeta {
    let mut labels = selector_labels(name);
    labels.insert(format!("{}/managed", LABEL_PREFIX), "true".to_string());
    labels.insert(
        format!("{}/type", LABEL_PREFIX),
        resource_name(&request.config.type_name),
    );

    let mut annotations: BTreeMap<String, String> = request
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    annotations.insert(format!("{}/user", LABEL_PREFIX), request.key.user_id.clone());
    annotations.insert(
        format!("{}/session", LABEL_PREFIX),
        request.key.session_id.clone(),
    );
    annotations.insert(format!("{}/name", LABEL_PREFIX), request.name.clone());

    ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(labels),
        annotations: Some(annotations),
        ..Default::default()
    }
}

fn resource_requirements(request: &ContainerRequest) -> Option<ResourceRequirements> {
    let limits = &request.config.resource_limits;
    let mut quantities = BTreeMap::new();
    if let Some(bytes) = limits.memory_bytes() {
        quantities.insert("memory".to_string(), Quantity(bytes.to_string()));
    }
    if let Some(cpus) = limits.cpus {
        quantities.insert(
            "cpu".to_string(),
            Quantity(format!("{}m", (cpus * 1000.0).round() as i64)),
        );
    }
    (!quantities.is_empty()).then(|| ResourceRequirements {
        limits: Some(quantities),
        ..Default::default()
    })
}

/// Build the one-replica Deployment for a sandbox
pub fn deployment_manifest(name: &str, request: &ContainerRequest) -> Result<Deployment> {
    let mut ports = Vec::new();
    for (spec, _) in request.port_bindings()? {
        let (port, protocol) = ContainerRequest::parse_port_spec(&spec)?;
        ports.push(ContainerPort {
            container_port: i32::from(port),
            protocol: Some(protocol.to_uppercase()),
            ..Default::default()
        });
    }

    let mut env: Vec<EnvVar> = request
        .config
        .environment
        .iter()
        .map(|(k, v)| EnvVar {
            name: k.clone(),
            value: Some(v.clone()),
            ..Default::default()
        })
        .collect();
    env.sort_by(|a, b| a.name.cmp(&b.name));
    env.push(EnvVar {
        name: "SECRET_TOKEN".to_string(),
        value: Some(request.runtime_token.clone()),
        ..Default::default()
    });

    let mut volumes = Vec::new();
    let mut volume_mounts = Vec::new();
    for (i, mount) in request.volumes.iter().enumerate() {
        let volume_name = format!("volume-{}", i);
        volumes.push(Volume {
            name: volume_name.clone(),
            host_path: Some(HostPathVolumeSource {
                path: mount.host_path.clone(),
                type_: Some("DirectoryOrCreate".to_string()),
            }),
            ..Default::default()
        });
        volume_mounts.push(PodVolumeMount {
            name: volume_name,
            mount_path: mount.container_path.clone(),
            read_only: Some(mount.readonly),
            ..Default::default()
        });
    }

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(request.config.image.clone()),
        env: Some(env),
        ports: (!ports.is_empty()).then_some(ports),
        resources: resource_requirements(request),
        volume_mounts: (!volume_mounts.is_empty()).then_some(volume_mounts),
        ..Default::default()
    };

    let meta = object_meta(name, request);
    Ok(Deployment {
        metadata: meta.clone(),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector_labels(name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: None,
                    ..meta
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    runtime_class_name: request.config.runtime().map(str::to_string),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Build the Service that publishes each container port on its allocated port
pub fn service_manifest(
    name: &str,
    request: &ContainerRequest,
    service_type: ServiceType,
) -> Result<Service> {
    let mut ports = Vec::new();
    for (i, (spec, host_port)) in request.port_bindings()?.into_iter().enumerate() {
        let (port, protocol) = ContainerRequest::parse_port_spec(&spec)?;
        ports.push(ServicePort {
            name: Some(format!("port-{}", i)),
            port: i32::from(host_port),
            target_port: Some(IntOrString::Int(i32::from(port))),
            protocol: Some(protocol.to_uppercase()),
            node_port: (service_type == ServiceType::NodePort).then_some(i32::from(host_port)),
            ..Default::default()
        });
    }

    let mut meta = object_meta(name, request);
    meta.name = Some(service_name(name));
    Ok(Service {
        metadata: meta,
        spec: Some(ServiceSpec {
            type_: Some(service_type.as_str().to_string()),
            selector: Some(selector_labels(name)),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn ingress_host(service: &Service) -> Option<String> {
    service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .iter()
        .find_map(|ingress| ingress.ip.clone().or_else(|| ingress.hostname.clone()))
}

fn deployment_status(deployment: &Deployment) -> ContainerStatus {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    if desired == 0 {
        return ContainerStatus::Stopped;
    }
    if deployment.metadata.deletion_timestamp.is_some() {
        return ContainerStatus::Stopped;
    }

    let Some(status) = deployment.status.as_ref() else {
        return ContainerStatus::Created;
    };
    if status.ready_replicas.unwrap_or(0) >= 1 {
        ContainerStatus::Running
    } else if status.replicas.unwrap_or(0) >= 1 {
        // Pods exist but none is ready: starting or crash looping
        ContainerStatus::Restarting
    } else {
        ContainerStatus::Created
    }
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(response) if response.code == 404)
}

#[async_trait]
impl DeploymentBackend for KubernetesBackend {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn is_available(&self) -> bool {
        match self.client.apiserver_version().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Kubernetes API not available: {}", e);
                false
            }
        }
    }

    async fn create(&self, request: &ContainerRequest) -> Result<ContainerModel> {
        let name = resource_name(&request.name);
        let deployment = deployment_manifest(&name, request)?;
        let service = service_manifest(&name, request, self.config.service_type)?;
        let Some(&endpoint_port) = request.host_ports.first() else {
            return Err(BackendError::InvalidRequest(format!(
                "type {} exposes no ports",
                request.config.type_name
            )));
        };

        info!(
            name = %name,
            namespace = %self.config.namespace,
            image = %request.config.image,
            "Creating deployment"
        );
        self.deployments()
            .create(&PostParams::default(), &deployment)
            .await
            .map_err(|e| BackendError::Container(e.to_string()))?;

        if let Err(service_error) = self.services().create(&PostParams::default(), &service).await {
            warn!(name = %name, "Service creation failed, removing deployment: {}", service_error);
            return match self.delete_deployment(&name).await {
                Ok(()) => Err(BackendError::Container(format!(
                    "Failed to expose {}: {}",
                    name, service_error
                ))),
                Err(delete_error) => Err(BackendError::StartFailed {
                    container_id: name,
                    message: format!("{} (cleanup failed: {})", service_error, delete_error),
                }),
            };
        }

        let host = self.resolve_public_host(&service_name(&name)).await;
        debug!(name = %name, host = %host, port = endpoint_port, "Deployment exposed");
        let mut model = ContainerModel::for_endpoint(
            name,
            request.name.clone(),
            request.session_id.clone(),
            request.config.type_name.clone(),
            &host,
            endpoint_port,
            request.runtime_token.clone(),
            request.host_ports.clone(),
        );
        model.mount_dir = request.volumes.first().map(|v| v.host_path.clone());
        Ok(model)
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        info!(container_id, namespace = %self.config.namespace, "Deleting deployment");
        let service = self.delete_service(&service_name(container_id)).await;
        let deployment = self.delete_deployment(container_id).await;
        service.map_err(|e| BackendError::Container(e.to_string()))?;
        deployment.map_err(|e| BackendError::Container(e.to_string()))
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerStatus> {
        match self.deployments().get(container_id).await {
            Ok(deployment) => Ok(deployment_status(&deployment)),
            Err(e) if is_not_found(&e) => Ok(ContainerStatus::Missing),
            Err(e) => Err(BackendError::Container(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SandboxKey;
    use crate::providers::VolumeMount;
    use crate::types::SandboxConfig;
    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceStatus};
    use std::collections::HashMap;

    fn request() -> ContainerRequest {
        let mut config = SandboxConfig::new("runtime-sandbox-browser:latest", "browser");
        config.ports = vec!["80/tcp".to_string(), "9222".to_string()];
        config.resource_limits.memory = Some("512m".to_string());
        config.resource_limits.cpus = Some(1.5);
        config
            .runtime_config
            .insert("runtime".to_string(), "gvisor".to_string());
        config
            .environment
            .insert("FOO".to_string(), "bar".to_string());

        ContainerRequest {
            key: SandboxKey::new("user@example.com", "s1", "browser"),
            name: "warden_sandbox_AB12".to_string(),
            session_id: "ab12".to_string(),
            config,
            host_ports: vec![30080, 30081],
            runtime_token: "secret".to_string(),
            volumes: vec![VolumeMount {
                host_path: "/tmp/mount/ab12".to_string(),
                container_path: "/workspace".to_string(),
                readonly: false,
            }],
            labels: HashMap::new(),
        }
    }

    #[test]
    fn test_resource_name_is_a_dns_label() {
        assert_eq!(resource_name("warden_sandbox_AB12"), "warden-sandbox-ab12");
        assert_eq!(resource_name("__x__"), "x");
        assert_eq!(resource_name("___"), "sandbox");

        let long = resource_name(&"a".repeat(100));
        assert!(service_name(&long).len() <= MAX_NAME_LEN);
    }

    #[test]
    fn test_deployment_manifest() {
        let deployment = deployment_manifest("warden-sandbox-ab12", &request()).unwrap();
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(
            spec.selector.match_labels.unwrap()["app"],
            "warden-sandbox-ab12"
        );

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.runtime_class_name.as_deref(), Some("gvisor"));
        assert_eq!(
            pod.volumes.unwrap()[0].host_path.as_ref().unwrap().path,
            "/tmp/mount/ab12"
        );

        let container = &pod.containers[0];
        assert_eq!(
            container.image.as_deref(),
            Some("runtime-sandbox-browser:latest")
        );
        let env = container.env.as_ref().unwrap();
        assert!(env
            .iter()
            .any(|e| e.name == "SECRET_TOKEN" && e.value.as_deref() == Some("secret")));
        assert!(env.iter().any(|e| e.name == "FOO"));

        let ports: Vec<i32> = container
            .ports
            .as_ref()
            .unwrap()
            .iter()
            .map(|p| p.container_port)
            .collect();
        assert_eq!(ports, vec![80, 9222]);

        let limits = container.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits["memory"], Quantity((512 * 1024 * 1024).to_string()));
        assert_eq!(limits["cpu"], Quantity("1500m".to_string()));

        let annotations = deployment.metadata.annotations.unwrap();
        assert_eq!(annotations["warden.sandbox/user"], "user@example.com");
    }

    #[test]
    fn test_service_manifest_maps_allocated_ports() {
        let service =
            service_manifest("warden-sandbox-ab12", &request(), ServiceType::NodePort).unwrap();
        assert_eq!(
            service.metadata.name.as_deref(),
            Some("warden-sandbox-ab12-svc")
        );

        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        let ports = spec.ports.unwrap();
        assert_eq!(ports[0].port, 30080);
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(80)));
        assert_eq!(ports[0].node_port, Some(30080));
        assert_eq!(ports[1].port, 30081);
        assert_eq!(ports[1].target_port, Some(IntOrString::Int(9222)));

        let lb = service_manifest("x", &request(), ServiceType::LoadBalancer).unwrap();
        assert_eq!(lb.spec.unwrap().ports.unwrap()[0].node_port, None);
    }

    #[test]
    fn test_manifest_rejects_unallocated_ports() {
        let mut request = request();
        request.host_ports.pop();
        assert!(matches!(
            deployment_manifest("x", &request),
            Err(BackendError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_deployment_status_mapping() {
        let with_status = |replicas: i32, ready: i32| Deployment {
            status: Some(DeploymentStatus {
                replicas: Some(replicas),
                ready_replicas: Some(ready),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_eq!(deployment_status(&with_status(1, 1)), ContainerStatus::Running);
        assert_eq!(deployment_status(&with_status(1, 0)), ContainerStatus::Restarting);
        assert_eq!(deployment_status(&with_status(0, 0)), ContainerStatus::Created);
        assert_eq!(deployment_status(&Deployment::default()), ContainerStatus::Created);
    }

    #[test]
    fn test_ingress_host_prefers_ip() {
        let service = Service {
            status: Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: Some("10.0.0.7".to_string()),
                        hostname: Some("lb.example.com".to_string()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(ingress_host(&service).as_deref(), Some("10.0.0.7"));
        assert_eq!(ingress_host(&Service::default()), None);
    }

    #[test]
    fn test_service_type_parse() {
        assert_eq!("nodeport".parse::<ServiceType>().unwrap(), ServiceType::NodePort);
        assert_eq!(
            "LoadBalancer".parse::<ServiceType>().unwrap(),
            ServiceType::LoadBalancer
        );
        assert!("clusterip".parse::<ServiceType>().is_err());
    }
}

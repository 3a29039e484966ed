// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Warden

// Container naming
pub const WARDEN_CONTAINER_PREFIX: &str = "WARDEN_CONTAINER_PREFIX";

// Port Allocation
pub const WARDEN_PORT_RANGE_START: &str = "WARDEN_PORT_RANGE_START";
pub const WARDEN_PORT_RANGE_END: &str = "WARDEN_PORT_RANGE_END";

// Warm Pool
pub const WARDEN_POOL_SIZE: &str = "WARDEN_POOL_SIZE";
pub const WARDEN_DEFAULT_SANDBOX_TYPE: &str = "WARDEN_DEFAULT_SANDBOX_TYPE";

// Sandbox Registry
pub const WARDEN_REGISTRY_BACKEND: &str = "WARDEN_REGISTRY_BACKEND"; // local | shared
pub const WARDEN_REGISTRY_PATH: &str = "WARDEN_REGISTRY_PATH";
pub const WARDEN_REGISTRY_PREFIX: &str = "WARDEN_REGISTRY_PREFIX";

// Deployment Backend
pub const WARDEN_BACKEND: &str = "WARDEN_BACKEND"; // docker | kubernetes
pub const WARDEN_PUBLIC_HOST: &str = "WARDEN_PUBLIC_HOST";

// Docker Backend
pub const WARDEN_DOCKER_HOST: &str = "WARDEN_DOCKER_HOST";
pub const WARDEN_IMAGE_PULL_TIMEOUT_SECS: &str = "WARDEN_IMAGE_PULL_TIMEOUT_SECS";
pub const WARDEN_CONTAINER_STOP_TIMEOUT_SECS: &str = "WARDEN_CONTAINER_STOP_TIMEOUT_SECS";
pub const WARDEN_IMAGE_REGISTRY: &str = "WARDEN_IMAGE_REGISTRY";

// Kubernetes Backend
pub const WARDEN_K8S_NAMESPACE: &str = "WARDEN_K8S_NAMESPACE";
pub const WARDEN_KUBECONFIG: &str = "WARDEN_KUBECONFIG";
pub const WARDEN_K8S_SERVICE_TYPE: &str = "WARDEN_K8S_SERVICE_TYPE"; // LoadBalancer | NodePort

// Workspace Mounts & Artifact Storage
pub const WARDEN_MOUNT_DIR: &str = "WARDEN_MOUNT_DIR";
pub const WARDEN_STORAGE_DIR: &str = "WARDEN_STORAGE_DIR";

// Health Gate
pub const WARDEN_HEALTH_TIMEOUT_SECS: &str = "WARDEN_HEALTH_TIMEOUT_SECS";

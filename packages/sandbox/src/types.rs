// ABOUTME: Sandbox type registry holding per-type deployment metadata
// ABOUTME: Seeds built-in types from an explicit table at startup and accepts custom types at runtime

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum TypeRegistryError {
    #[error("Unknown sandbox type: {0}")]
    UnknownType(String),
    #[error("Sandbox type not available in this build: {0}")]
    NotAvailable(String),
    #[error("Invalid sandbox type definition: {0}")]
    InvalidDefinition(String),
}

type Result<T> = std::result::Result<T, TypeRegistryError>;

/// Sandbox types known at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxType {
    Base,
    Filesystem,
    Browser,
    Appworld,
    Bfcl,
    Webshop,
}

impl SandboxType {
    pub const ALL: [SandboxType; 6] = [
        Self::Base,
        Self::Filesystem,
        Self::Browser,
        Self::Appworld,
        Self::Bfcl,
        Self::Webshop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Filesystem => "filesystem",
            Self::Browser => "browser",
            Self::Appworld => "appworld",
            Self::Bfcl => "bfcl",
            Self::Webshop => "webshop",
        }
    }
}

impl FromStr for SandboxType {
    type Err = TypeRegistryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| TypeRegistryError::UnknownType(s.to_string()))
    }
}

impl fmt::Display for SandboxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Low,
    Medium,
    High,
}

impl FromStr for SecurityLevel {
    type Err = TypeRegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(TypeRegistryError::InvalidDefinition(format!(
                "security level must be low, medium or high, got '{}'",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Docker-style memory string such as "512m" or "2g"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
}

impl ResourceLimits {
    /// Memory limit in bytes, if set and parseable
    pub fn memory_bytes(&self) -> Option<i64> {
        let raw = self.memory.as_deref()?.trim().to_lowercase();
        let split = raw
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(raw.len());
        let (digits, unit) = raw.split_at(split);
        let value: i64 = digits.parse().ok()?;
        let multiplier: i64 = match unit.trim_end_matches('b') {
            "" => 1,
            "k" => 1024,
            "m" => 1024 * 1024,
            "g" => 1024 * 1024 * 1024,
            _ => return None,
        };
        value.checked_mul(multiplier)
    }
}

/// Deployment metadata for one sandbox type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub image: String,
    /// Built-in tag, `None` for custom types
    #[serde(skip_serializing_if = "Option::is_none")]
    pub builtin: Option<SandboxType>,
    pub type_name: String,
    pub security_level: SecurityLevel,
    #[serde(with = "duration_secs")]
    pub startup_timeout: Duration,
    pub description: String,
    /// Container ports in `port/proto` form; each gets one host port
    pub ports: Vec<String>,
    pub resource_limits: ResourceLimits,
    pub environment: HashMap<String, String>,
    pub runtime_config: HashMap<String, String>,
}

impl SandboxConfig {
    pub fn new(image: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            builtin: None,
            type_name: type_name.into(),
            security_level: SecurityLevel::Medium,
            startup_timeout: Duration::from_secs(300),
            description: String::new(),
            ports: vec!["80/tcp".to_string()],
            resource_limits: ResourceLimits::default(),
            environment: HashMap::new(),
            runtime_config: HashMap::new(),
        }
    }

    /// Container runtime requested by this type (e.g. `runc`, `nvidia`)
    pub fn runtime(&self) -> Option<&str> {
        self.runtime_config.get("runtime").map(String::as_str)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// A registration request. A non-empty `custom_type` wins over `sandbox_type`.
#[derive(Debug, Clone)]
pub struct SandboxRegistration {
    pub image: String,
    pub sandbox_type: SandboxType,
    pub custom_type: Option<String>,
    pub security_level: SecurityLevel,
    pub timeout: Duration,
    pub description: String,
    /// `KEY=VALUE` entries
    pub environment: Vec<String>,
    /// `memory=1g`, `cpu=2.0`
    pub resource_limits: Vec<String>,
    /// `key=value` entries
    pub runtime_config: Vec<String>,
}

impl SandboxRegistration {
    pub fn builtin(sandbox_type: SandboxType, image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            sandbox_type,
            custom_type: None,
            security_level: SecurityLevel::Medium,
            timeout: Duration::from_secs(300),
            description: String::new(),
            environment: Vec::new(),
            resource_limits: Vec::new(),
            runtime_config: Vec::new(),
        }
    }

    fn into_config(self) -> Result<(Option<String>, SandboxConfig)> {
        if self.image.trim().is_empty() {
            return Err(TypeRegistryError::InvalidDefinition(
                "image name is required".to_string(),
            ));
        }

        let custom = self
            .custom_type
            .map(|name| name.trim().to_lowercase())
            .filter(|name| !name.is_empty());

        let mut limits = ResourceLimits::default();
        for (key, value) in parse_pairs(&self.resource_limits)? {
            match key.as_str() {
                "memory" => limits.memory = Some(value),
                "cpu" | "cpus" => {
                    limits.cpus = Some(value.parse().map_err(|_| {
                        TypeRegistryError::InvalidDefinition(format!("invalid cpu limit '{}'", value))
                    })?)
                }
                other => warn!("Ignoring unsupported resource limit '{}'", other),
            }
        }

        let type_name = custom
            .clone()
            .unwrap_or_else(|| self.sandbox_type.as_str().to_string());

        let config = SandboxConfig {
            image: self.image,
            builtin: if custom.is_some() {
                None
            } else {
                Some(self.sandbox_type)
            },
            type_name,
            security_level: self.security_level,
            startup_timeout: self.timeout,
            description: self.description,
            ports: vec!["80/tcp".to_string()],
            resource_limits: limits,
            environment: parse_pairs(&self.environment)?.into_iter().collect(),
            runtime_config: parse_pairs(&self.runtime_config)?.into_iter().collect(),
        };

        Ok((custom, config))
    }
}

fn parse_pairs(entries: &[String]) -> Result<Vec<(String, String)>> {
    entries
        .iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| {
                    TypeRegistryError::InvalidDefinition(format!(
                        "expected KEY=VALUE, got '{}'",
                        entry
                    ))
                })
        })
        .collect()
}

#[derive(Default)]
struct Namespaces {
    builtin: HashMap<SandboxType, SandboxConfig>,
    custom: HashMap<String, SandboxConfig>,
}

/// Registry of deployable sandbox types.
///
/// Built-in and custom types live in separate namespaces. Re-registering a
/// type replaces its config (last write wins).
#[derive(Default)]
pub struct SandboxTypeRegistry {
    inner: RwLock<Namespaces>,
}

impl SandboxTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry seeded with every built-in type this build provides
    pub fn with_builtins(image_registry: &str) -> Self {
        let registry = Self::new();
        registry.register_builtins(image_registry);
        registry
    }

    /// Try every known built-in type, skipping those absent from this build
    pub fn register_builtins(&self, image_registry: &str) {
        for entry in BUILTIN_SANDBOXES {
            match (entry.resolve)(image_registry) {
                Ok(registration) => {
                    if let Err(e) = self.register(registration) {
                        warn!(
                            "Failed to register built-in sandbox {}: {}",
                            entry.sandbox_type, e
                        );
                    }
                }
                Err(e) => debug!("Skipping built-in sandbox {}: {}", entry.sandbox_type, e),
            }
        }

        let (builtin, custom) = self.counts();
        info!(builtin, custom, "Sandbox type registry initialized");
    }

    /// Register a type from a registration descriptor, returning its resolved name
    pub fn register(&self, registration: SandboxRegistration) -> Result<String> {
        let sandbox_type = registration.sandbox_type;
        let (custom, config) = registration.into_config()?;
        let name = config.type_name.clone();
        let mut inner = self.write();

        let previous = match custom {
            Some(custom) => inner.custom.insert(custom, config),
            None => inner.builtin.insert(sandbox_type, config),
        };
        if let Some(previous) = previous {
            info!(
                "Sandbox type '{}' re-registered, replacing image {}",
                name, previous.image
            );
        } else {
            debug!("Registered sandbox type '{}'", name);
        }

        Ok(name)
    }

    /// Register a custom type with explicit metadata
    #[allow(clippy::too_many_arguments)]
    pub fn register_custom(
        &self,
        name: &str,
        image: &str,
        resource_limits: Vec<String>,
        security_level: SecurityLevel,
        timeout: Duration,
        description: &str,
        environment: Vec<String>,
        runtime_config: Vec<String>,
    ) -> Result<String> {
        if name.trim().is_empty() {
            return Err(TypeRegistryError::InvalidDefinition(
                "custom type name cannot be empty".to_string(),
            ));
        }

        self.register(SandboxRegistration {
            image: image.to_string(),
            sandbox_type: SandboxType::Base,
            custom_type: Some(name.to_string()),
            security_level,
            timeout,
            description: description.to_string(),
            environment,
            resource_limits,
            runtime_config,
        })
    }

    /// Look up a type by name: custom namespace first, then built-in
    pub fn lookup(&self, name: &str) -> Option<SandboxConfig> {
        let inner = self.read();
        let normalized = name.trim().to_lowercase();
        if let Some(config) = inner.custom.get(&normalized) {
            return Some(config.clone());
        }
        let builtin = normalized.parse::<SandboxType>().ok()?;
        inner.builtin.get(&builtin).cloned()
    }

    pub fn lookup_builtin(&self, sandbox_type: SandboxType) -> Option<SandboxConfig> {
        self.read().builtin.get(&sandbox_type).cloned()
    }

    pub fn list_all(&self) -> HashMap<SandboxType, SandboxConfig> {
        self.read().builtin.clone()
    }

    pub fn list_all_custom(&self) -> HashMap<String, SandboxConfig> {
        self.read().custom.clone()
    }

    pub fn remove_custom(&self, name: &str) -> bool {
        self.write()
            .custom
            .remove(&name.trim().to_lowercase())
            .is_some()
    }

    fn counts(&self) -> (usize, usize) {
        let inner = self.read();
        (inner.builtin.len(), inner.custom.len())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Namespaces> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Namespaces> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

struct BuiltinSandbox {
    sandbox_type: SandboxType,
    resolve: fn(&str) -> Result<SandboxRegistration>,
}

const BUILTIN_SANDBOXES: &[BuiltinSandbox] = &[
    BuiltinSandbox {
        sandbox_type: SandboxType::Base,
        resolve: base_sandbox,
    },
    BuiltinSandbox {
        sandbox_type: SandboxType::Filesystem,
        resolve: filesystem_sandbox,
    },
    BuiltinSandbox {
        sandbox_type: SandboxType::Browser,
        resolve: browser_sandbox,
    },
    BuiltinSandbox {
        sandbox_type: SandboxType::Appworld,
        resolve: appworld_sandbox,
    },
    BuiltinSandbox {
        sandbox_type: SandboxType::Bfcl,
        resolve: bfcl_sandbox,
    },
    BuiltinSandbox {
        sandbox_type: SandboxType::Webshop,
        resolve: webshop_sandbox,
    },
];

fn image(registry: &str, name: &str) -> String {
    let registry = registry.trim_end_matches('/');
    if registry.is_empty() {
        format!("runtime-sandbox-{}:latest", name)
    } else {
        format!("{}/runtime-sandbox-{}:latest", registry, name)
    }
}

fn base_sandbox(registry: &str) -> Result<SandboxRegistration> {
    Ok(SandboxRegistration {
        security_level: SecurityLevel::Medium,
        timeout: Duration::from_secs(30),
        description: "Base sandbox with Python and shell".to_string(),
        ..SandboxRegistration::builtin(SandboxType::Base, image(registry, "base"))
    })
}

fn filesystem_sandbox(registry: &str) -> Result<SandboxRegistration> {
    Ok(SandboxRegistration {
        security_level: SecurityLevel::Medium,
        timeout: Duration::from_secs(60),
        description: "Filesystem sandbox".to_string(),
        ..SandboxRegistration::builtin(SandboxType::Filesystem, image(registry, "filesystem"))
    })
}

fn browser_sandbox(registry: &str) -> Result<SandboxRegistration> {
    Ok(SandboxRegistration {
        security_level: SecurityLevel::Medium,
        timeout: Duration::from_secs(60),
        description: "Browser automation sandbox".to_string(),
        ..SandboxRegistration::builtin(SandboxType::Browser, image(registry, "browser"))
    })
}

fn training_sandbox(
    sandbox_type: SandboxType,
    registry: &str,
    description: &str,
) -> Result<SandboxRegistration> {
    if !cfg!(feature = "training") {
        return Err(TypeRegistryError::NotAvailable(
            sandbox_type.as_str().to_string(),
        ));
    }

    Ok(SandboxRegistration {
        security_level: SecurityLevel::High,
        timeout: Duration::from_secs(30),
        description: description.to_string(),
        environment: vec![format!("ENV_NAME={}", sandbox_type.as_str())],
        ..SandboxRegistration::builtin(sandbox_type, image(registry, sandbox_type.as_str()))
    })
}

fn appworld_sandbox(registry: &str) -> Result<SandboxRegistration> {
    training_sandbox(SandboxType::Appworld, registry, "AppWorld training sandbox")
}

fn bfcl_sandbox(registry: &str) -> Result<SandboxRegistration> {
    training_sandbox(SandboxType::Bfcl, registry, "BFCL training sandbox")
}

fn webshop_sandbox(registry: &str) -> Result<SandboxRegistration> {
    training_sandbox(SandboxType::Webshop, registry, "WebShop training sandbox")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_seeded() {
        let registry = SandboxTypeRegistry::with_builtins("example.io/sandboxes");
        let base = registry.lookup("base").unwrap();
        assert_eq!(base.image, "example.io/sandboxes/runtime-sandbox-base:latest");
        assert_eq!(base.builtin, Some(SandboxType::Base));
        assert!(registry.lookup("BROWSER").is_some());
        assert!(registry.lookup("filesystem").is_some());
    }

    #[cfg(not(feature = "training"))]
    #[test]
    fn test_training_types_skipped_without_feature() {
        let registry = SandboxTypeRegistry::with_builtins("");
        assert!(registry.lookup("bfcl").is_none());
        assert_eq!(registry.list_all().len(), 3);
    }

    #[cfg(feature = "training")]
    #[test]
    fn test_training_types_registered_with_feature() {
        let registry = SandboxTypeRegistry::with_builtins("");
        let bfcl = registry.lookup("bfcl").unwrap();
        assert_eq!(bfcl.security_level, SecurityLevel::High);
        assert_eq!(bfcl.environment.get("ENV_NAME").map(String::as_str), Some("bfcl"));
    }

    #[test]
    fn test_reregistration_overwrites() {
        let registry = SandboxTypeRegistry::new();
        registry
            .register(SandboxRegistration::builtin(SandboxType::Browser, "img:v1"))
            .unwrap();
        registry
            .register(SandboxRegistration::builtin(SandboxType::Browser, "img:v2"))
            .unwrap();

        assert_eq!(registry.lookup("browser").unwrap().image, "img:v2");
        assert_eq!(registry.list_all().len(), 1);
    }

    #[test]
    fn test_custom_type_takes_precedence_in_registration() {
        let registry = SandboxTypeRegistry::new();
        let name = registry
            .register(SandboxRegistration {
                custom_type: Some("My_Sandbox".to_string()),
                ..SandboxRegistration::builtin(SandboxType::Browser, "custom:latest")
            })
            .unwrap();

        assert_eq!(name, "my_sandbox");
        assert!(registry.lookup_builtin(SandboxType::Browser).is_none());
        let config = registry.lookup("my_sandbox").unwrap();
        assert_eq!(config.builtin, None);
        assert_eq!(registry.list_all_custom().len(), 1);
    }

    #[test]
    fn test_register_custom_parses_metadata() {
        let registry = SandboxTypeRegistry::new();
        registry
            .register_custom(
                "gpu-box",
                "gpu:latest",
                vec!["memory=2g".to_string(), "cpu=1.5".to_string()],
                SecurityLevel::High,
                Duration::from_secs(90),
                "GPU sandbox",
                vec!["MODE=fast".to_string()],
                vec!["runtime=nvidia".to_string()],
            )
            .unwrap();

        let config = registry.lookup("gpu-box").unwrap();
        assert_eq!(config.resource_limits.memory_bytes(), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(config.resource_limits.cpus, Some(1.5));
        assert_eq!(config.runtime(), Some("nvidia"));
        assert_eq!(config.environment.get("MODE").map(String::as_str), Some("fast"));
        assert_eq!(config.startup_timeout, Duration::from_secs(90));

        assert!(registry.remove_custom("gpu-box"));
        assert!(registry.lookup("gpu-box").is_none());
    }

    #[test]
    fn test_invalid_definitions_rejected() {
        let registry = SandboxTypeRegistry::new();
        let err = registry.register_custom(
            "bad",
            "img",
            vec!["memory".to_string()],
            SecurityLevel::Low,
            Duration::from_secs(1),
            "",
            vec![],
            vec![],
        );
        assert!(matches!(err, Err(TypeRegistryError::InvalidDefinition(_))));
        assert!(registry
            .register(SandboxRegistration::builtin(SandboxType::Base, " "))
            .is_err());
    }

    #[test]
    fn test_custom_and_builtin_namespaces_coexist() {
        let registry = SandboxTypeRegistry::with_builtins("");
        registry
            .register_custom(
                "browser",
                "my-browser:latest",
                vec![],
                SecurityLevel::Low,
                Duration::from_secs(10),
                "",
                vec![],
                vec![],
            )
            .unwrap();

        assert_eq!(registry.lookup("browser").unwrap().image, "my-browser:latest");
        assert_eq!(
            registry.lookup_builtin(SandboxType::Browser).unwrap().image,
            "runtime-sandbox-browser:latest"
        );
    }

    #[test]
    fn test_memory_parsing() {
        let limits = |m: &str| ResourceLimits {
            memory: Some(m.to_string()),
            cpus: None,
        };
        assert_eq!(limits("512m").memory_bytes(), Some(512 * 1024 * 1024));
        assert_eq!(limits("1024").memory_bytes(), Some(1024));
        assert_eq!(limits("1gb").memory_bytes(), Some(1024 * 1024 * 1024));
        assert_eq!(limits("lots").memory_bytes(), None);
    }
}

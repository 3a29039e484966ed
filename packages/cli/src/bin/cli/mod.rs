// ABOUTME: Shared helpers for CLI commands
// ABOUTME: Builds the sandbox manager from environment configuration

pub mod sandbox;
pub mod types;

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::debug;
use warden_sandbox::{ManagerConfig, RegistryConfig, SandboxManager};

const DEFAULT_REGISTRY_FILE: &str = ".warden/registry.db";

/// Manager configuration from the environment.
///
/// Each CLI invocation is a separate process, so an in-process registry would
/// forget every sandbox on exit. The CLI falls back to a shared registry file
/// under the home directory when none is configured.
pub fn load_config() -> Result<ManagerConfig> {
    let mut config = ManagerConfig::from_env().context("Invalid Warden configuration")?;

    if config.registry == RegistryConfig::Local {
        let path = default_registry_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        debug!(path = %path.display(), "Using shared registry file");
        config.registry = RegistryConfig::Shared {
            path,
            prefix: warden_sandbox::registry::shared::DEFAULT_REGISTRY_PREFIX.to_string(),
        };
    }

    // Pooled containers live in the process, which exits after one command
    if config.pool_size > 0 {
        debug!(pool_size = config.pool_size, "Warm pool disabled for CLI commands");
        config.pool_size = 0;
    }

    Ok(config)
}

pub async fn load_manager() -> Result<SandboxManager> {
    let config = load_config()?;
    SandboxManager::from_config(config)
        .await
        .context("Failed to initialize sandbox manager")
}

fn default_registry_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(DEFAULT_REGISTRY_FILE))
}

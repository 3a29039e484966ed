// ABOUTME: Core data model for tenant sandbox slots and the live containers bound to them
// ABOUTME: SandboxKey identifies a (user, session, type) slot; ContainerModel describes one running container

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tenant-scoped identity of a logical sandbox slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxKey {
    pub user_id: String,
    pub session_id: String,
    pub sandbox_type: String,
}

impl SandboxKey {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        sandbox_type: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            sandbox_type: sandbox_type.into(),
        }
    }
}

impl fmt::Display for SandboxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.user_id, self.session_id, self.sandbox_type
        )
    }
}

/// A live container as seen by the orchestrator.
///
/// Built by a deployment backend once the container has been started, and
/// committed to the sandbox registry only after the health gate passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerModel {
    pub container_id: String,
    pub container_name: String,
    /// Random id generated per container; also names the workspace mount
    pub session_id: String,
    /// Root of the in-container tool server
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub front_browser_ws: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_browser_ws: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts_sio: Option<String>,
    /// Bearer token the tool server expects on every call
    pub runtime_token: String,
    /// Host ports allocated to this container
    pub ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    pub sandbox_type: String,
    #[serde(default)]
    pub healthy: bool,
    pub created_at: DateTime<Utc>,
}

/// Fixed browser session id the in-container browser front-end expects.
const BROWSER_SESSION_ID: &str = "123e4567-e89b-12d3-a456-426614174000";

impl ContainerModel {
    /// Build a model whose endpoints are all served from `host:port`.
    #[allow(clippy::too_many_arguments)]
    pub fn for_endpoint(
        container_id: impl Into<String>,
        container_name: impl Into<String>,
        session_id: impl Into<String>,
        sandbox_type: impl Into<String>,
        host: &str,
        port: u16,
        runtime_token: impl Into<String>,
        ports: Vec<u16>,
    ) -> Self {
        let runtime_token = runtime_token.into();
        Self {
            container_id: container_id.into(),
            container_name: container_name.into(),
            session_id: session_id.into(),
            base_url: format!("http://{}:{}/fastapi", host, port),
            browser_url: Some(format!(
                "http://{}:{}/steel-api/{}",
                host, port, runtime_token
            )),
            front_browser_ws: Some(format!(
                "ws://{}:{}/steel-api/{}/v1/sessions/cast",
                host, port, runtime_token
            )),
            client_browser_ws: Some(format!(
                "ws://{}:{}/steel-api/{}/&sessionId={}",
                host, port, runtime_token, BROWSER_SESSION_ID
            )),
            artifacts_sio: Some(format!("http://{}:{}/v1", host, port)),
            runtime_token,
            ports,
            mount_dir: None,
            storage_path: None,
            sandbox_type: sandbox_type.into(),
            healthy: false,
            created_at: Utc::now(),
        }
    }
}

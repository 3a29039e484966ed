// ABOUTME: Client protocol for talking to the tool server inside a running sandbox
// ABOUTME: Provides the HTTP implementation plus the factory the manager uses to bind clients to containers

use crate::model::ContainerModel;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Header carrying the sandbox session on every request
pub const SESSION_HEADER: &str = "x-agentrun-session-id";

/// Tools served by every sandbox image outside the MCP namespace
pub const GENERIC_TOOLS: [&str; 2] = ["run_ipython_cell", "run_shell_command"];

const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Sandbox did not become healthy within {0:?}")]
    HealthTimeout(Duration),

    #[error("Tool {tool} failed with status {status}: {body}")]
    ToolFailed {
        tool: String,
        status: u16,
        body: String,
    },

    #[error("Sandbox API error: {0}")]
    ApiError(String),

    #[error("Failed to parse response: {0}")]
    ParseError(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Operations available against a running sandbox.
#[async_trait]
pub trait SandboxClient: Send + Sync {
    /// One health check. Network failures count as unhealthy.
    async fn check_health(&self) -> bool;

    /// Poll with exponential backoff until healthy or `timeout` elapses
    async fn wait_until_healthy(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut backoff = INITIAL_BACKOFF;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if self.check_health().await {
                debug!(attempts, "Sandbox is healthy");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(attempts, ?timeout, "Sandbox health wait timed out");
                return Err(ClientError::HealthTimeout(timeout));
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value>;

    /// Tool metadata grouped by tool type, optionally narrowed to one type
    async fn list_tools(&self, tool_type: Option<&str>) -> Result<Value>;

    async fn add_mcp_servers(&self, server_configs: Value, overwrite: bool) -> Result<Value>;
}

/// Builds clients bound to a specific container.
pub trait ClientFactory: Send + Sync {
    fn connect(&self, model: &ContainerModel) -> Result<Arc<dyn SandboxClient>>;
}

/// HTTP client for the in-container tool server.
///
/// Dropping the client releases its connection pool.
pub struct SandboxHttpClient {
    client: Client,
    base_url: String,
    token: String,
    session_id: String,
}

impl SandboxHttpClient {
    pub fn new(model: &ContainerModel, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            base_url: model.base_url.trim_end_matches('/').to_string(),
            token: model.runtime_token.clone(),
            session_id: model.session_id.clone(),
        })
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .bearer_auth(&self.token)
            .header(SESSION_HEADER, format!("s{}", self.session_id))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Response> {
        Ok(self
            .authorized(self.client.post(self.url(path)))
            .json(body)
            .send()
            .await?)
    }

    async fn tool_response(tool: &str, response: Response) -> Result<Value> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ClientError::ToolFailed {
                tool: tool.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        // Tool servers may answer with plain text
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

#[async_trait]
impl SandboxClient for SandboxHttpClient {
    async fn check_health(&self) -> bool {
        match self
            .authorized(self.client.get(self.url("/healthz")))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Health check failed: {}", e);
                false
            }
        }
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };

        let response = if GENERIC_TOOLS.contains(&name) {
            self.post_json(&format!("/tools/{}", name), &arguments).await?
        } else {
            self.post_json(
                "/mcp/call_tool",
                &json!({ "tool_name": name, "arguments": arguments }),
            )
            .await?
        };

        Self::tool_response(name, response).await
    }

    async fn list_tools(&self, tool_type: Option<&str>) -> Result<Value> {
        let response = self
            .authorized(self.client.get(self.url("/mcp/list_tools")))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::ApiError(format!(
                "list_tools returned {}: {}",
                status, body
            )));
        }

        let mut tools: Map<String, Value> = response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(e.to_string()))?;
        tools.insert("generic".to_string(), generic_tool_schemas());

        Ok(match tool_type.filter(|t| !t.is_empty()) {
            Some(tool_type) => {
                let selected = tools.remove(tool_type).unwrap_or_else(|| json!({}));
                let mut filtered = Map::new();
                filtered.insert(tool_type.to_string(), selected);
                Value::Object(filtered)
            }
            None => Value::Object(tools),
        })
    }

    async fn add_mcp_servers(&self, server_configs: Value, overwrite: bool) -> Result<Value> {
        let response = self
            .post_json(
                "/mcp/add_servers",
                &json!({ "server_configs": server_configs, "overwrite": overwrite }),
            )
            .await?;
        Self::tool_response("add_mcp_servers", response).await
    }
}

/// Function-call schemas for [`GENERIC_TOOLS`]
pub fn generic_tool_schemas() -> Value {
    let schema = |name: &str, description: &str, param: &str, param_doc: &str| {
        json!({
            "name": name,
            "json_schema": {
                "type": "function",
                "function": {
                    "name": name,
                    "description": description,
                    "parameters": {
                        "type": "object",
                        "properties": {
                            param: { "type": "string", "description": param_doc }
                        },
                        "required": [param]
                    }
                }
            }
        })
    };

    json!({
        "run_ipython_cell": schema(
            "run_ipython_cell",
            "Run an IPython cell.",
            "code",
            "IPython code to execute"
        ),
        "run_shell_command": schema(
            "run_shell_command",
            "Run a shell command.",
            "command",
            "Shell command to execute"
        ),
    })
}

pub struct HttpClientFactory {
    request_timeout: Duration,
}

impl HttpClientFactory {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl Default for HttpClientFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl ClientFactory for HttpClientFactory {
    fn connect(&self, model: &ContainerModel) -> Result<Arc<dyn SandboxClient>> {
        Ok(Arc::new(SandboxHttpClient::new(model, self.request_timeout)?))
    }
}

// ABOUTME: Binds sandbox-hosted tools to agents through an explicit capability trait
// ABOUTME: A tool call resolves the caller's sandbox through the manager and forwards the arguments

use crate::client::generic_tool_schemas;
use crate::manager::{Result, SandboxManager};
use crate::model::SandboxKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// A tool executed inside a sandbox of `sandbox_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxTool {
    pub name: String,
    pub sandbox_type: String,
    #[serde(default)]
    pub description: String,
    /// Function-call schema shown to the model
    #[serde(default)]
    pub schema: Value,
}

impl SandboxTool {
    pub fn new(name: impl Into<String>, sandbox_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sandbox_type: sandbox_type.into(),
            description: String::new(),
            schema: Value::Null,
        }
    }

    /// Tools every sandbox image serves (`run_ipython_cell`, `run_shell_command`)
    pub fn generic(sandbox_type: &str) -> Vec<SandboxTool> {
        Self::from_listing(sandbox_type, &generic_tool_schemas())
    }

    /// Build tools from one group of a `list_tools` response
    pub fn from_listing(sandbox_type: &str, group: &Value) -> Vec<SandboxTool> {
        let Some(entries) = group.as_object() else {
            return Vec::new();
        };

        let mut tools: Vec<SandboxTool> = entries
            .iter()
            .map(|(name, entry)| {
                let schema = entry.get("json_schema").cloned().unwrap_or(Value::Null);
                let description = schema
                    .pointer("/function/description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                SandboxTool {
                    name: name.clone(),
                    sandbox_type: sandbox_type.to_string(),
                    description,
                    schema,
                }
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Run the tool in the sandbox belonging to `(user_id, session_id)`
    pub async fn invoke(
        &self,
        manager: &SandboxManager,
        user_id: &str,
        session_id: &str,
        arguments: Value,
    ) -> Result<Value> {
        let key = SandboxKey::new(user_id, session_id, self.sandbox_type.clone());
        let handle = manager.get_or_provision(&key).await?;
        debug!(tool = %self.name, container_id = %handle.model.container_id, "Invoking sandbox tool");
        Ok(handle.client.call_tool(&self.name, arguments).await?)
    }
}

/// Implemented by agents that accept sandbox tools.
pub trait ToolHost {
    fn sandbox_tools(&self) -> &[SandboxTool];

    fn sandbox_tools_mut(&mut self) -> &mut Vec<SandboxTool>;

    /// Add a tool, replacing any existing tool with the same name
    fn bind_tool(&mut self, tool: SandboxTool) {
        let tools = self.sandbox_tools_mut();
        tools.retain(|existing| existing.name != tool.name);
        tools.push(tool);
    }

    fn bind_tools(&mut self, tools: impl IntoIterator<Item = SandboxTool>)
    where
        Self: Sized,
    {
        for tool in tools {
            self.bind_tool(tool);
        }
    }

    fn find_tool(&self, name: &str) -> Option<&SandboxTool> {
        self.sandbox_tools().iter().find(|tool| tool.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Agent {
        tools: Vec<SandboxTool>,
    }

    impl ToolHost for Agent {
        fn sandbox_tools(&self) -> &[SandboxTool] {
            &self.tools
        }

        fn sandbox_tools_mut(&mut self) -> &mut Vec<SandboxTool> {
            &mut self.tools
        }
    }

    #[test]
    fn test_generic_tools_listed() {
        let tools = SandboxTool::generic("base");
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["run_ipython_cell", "run_shell_command"]);
        assert_eq!(tools[1].description, "Run a shell command.");
    }

    #[test]
    fn test_from_listing_ignores_non_objects() {
        assert!(SandboxTool::from_listing("base", &json!([1, 2])).is_empty());
        let tools = SandboxTool::from_listing(
            "browser",
            &json!({ "browser_navigate": { "json_schema": { "function": { "description": "Go" } } } }),
        );
        assert_eq!(tools[0].sandbox_type, "browser");
        assert_eq!(tools[0].description, "Go");
    }

    #[test]
    fn test_binding_replaces_same_name() {
        let mut agent = Agent::default();
        agent.bind_tools(SandboxTool::generic("base"));
        let mut shell = SandboxTool::new("run_shell_command", "filesystem");
        shell.description = "custom".to_string();
        agent.bind_tool(shell);

        assert_eq!(agent.sandbox_tools().len(), 2);
        assert_eq!(
            agent.find_tool("run_shell_command").unwrap().sandbox_type,
            "filesystem"
        );
        assert!(agent.find_tool("missing").is_none());
    }
}

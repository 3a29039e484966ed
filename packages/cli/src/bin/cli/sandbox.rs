// ABOUTME: CLI commands for sandbox lifecycle (provision, list, status, call, release, cleanup)
// ABOUTME: Every command goes through the sandbox manager and its shared registry

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use serde_json::Value;
use warden_sandbox::{ContainerModel, SandboxKey, SandboxManager};

#[derive(Args, Debug, Clone)]
pub struct KeyArgs {
    /// Owning user id
    #[arg(long)]
    user: String,

    /// Session id within the user
    #[arg(long)]
    session: String,

    /// Sandbox type (default: WARDEN_DEFAULT_SANDBOX_TYPE or `base`)
    #[arg(long = "type", short = 't')]
    sandbox_type: Option<String>,
}

impl KeyArgs {
    fn key(&self, manager: &SandboxManager) -> SandboxKey {
        let sandbox_type = self
            .sandbox_type
            .clone()
            .unwrap_or_else(|| manager.config().default_sandbox_type.clone());
        SandboxKey::new(self.user.clone(), self.session.clone(), sandbox_type)
    }
}

#[derive(Subcommand)]
pub enum SandboxCommands {
    /// Return the sandbox for a session, starting one if needed
    Provision {
        #[command(flatten)]
        key: KeyArgs,
    },

    /// List registered sandboxes
    List,

    /// Show the runtime status of a session's sandbox
    Status {
        #[command(flatten)]
        key: KeyArgs,
    },

    /// List tools served by a session's sandbox
    Tools {
        #[command(flatten)]
        key: KeyArgs,

        /// Only show one tool group (e.g. `generic`, `browser`)
        #[arg(long)]
        tool_type: Option<String>,
    },

    /// Call a tool inside a session's sandbox
    Call {
        #[command(flatten)]
        key: KeyArgs,

        /// Tool name
        #[arg(long)]
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(long = "args", default_value = "{}")]
        arguments: String,
    },

    /// Stop a sandbox and remove it from the registry
    Release {
        /// Release by container id instead of by session
        #[arg(long, conflicts_with_all = ["user", "session"])]
        container_id: Option<String>,

        /// Owning user id
        #[arg(long, required_unless_present = "container_id")]
        user: Option<String>,

        /// Session id within the user
        #[arg(long, required_unless_present = "container_id")]
        session: Option<String>,

        /// Sandbox type
        #[arg(long = "type", short = 't')]
        sandbox_type: Option<String>,
    },

    /// Stop every registered sandbox
    Cleanup,
}

pub async fn handle_sandbox_command(command: SandboxCommands) -> Result<()> {
    let manager = super::load_manager().await?;

    match command {
        SandboxCommands::Provision { key } => provision_command(&manager, key.key(&manager)).await,
        SandboxCommands::List => list_command(&manager).await,
        SandboxCommands::Status { key } => status_command(&manager, key.key(&manager)).await,
        SandboxCommands::Tools { key, tool_type } => {
            tools_command(&manager, key.key(&manager), tool_type.as_deref()).await
        }
        SandboxCommands::Call {
            key,
            tool,
            arguments,
        } => call_command(&manager, key.key(&manager), &tool, &arguments).await,
        SandboxCommands::Release {
            container_id,
            user,
            session,
            sandbox_type,
        } => match (container_id, user, session) {
            (Some(container_id), _, _) => release_by_id_command(&manager, &container_id).await,
            (None, Some(user), Some(session)) => {
                let key = KeyArgs {
                    user,
                    session,
                    sandbox_type,
                }
                .key(&manager);
                release_command(&manager, key).await
            }
            _ => bail!("Specify --container-id or a user and session"),
        },
        SandboxCommands::Cleanup => cleanup_command(&manager).await,
    }
}

async fn provision_command(manager: &SandboxManager, key: SandboxKey) -> Result<()> {
    println!("{} {}", "Provisioning".cyan(), key);
    let handle = manager
        .get_or_provision(&key)
        .await
        .with_context(|| format!("Failed to provision sandbox for {}", key))?;

    println!("{} {}", "✓".green(), "Sandbox ready".green().bold());
    print_model(&handle.model);
    Ok(())
}

async fn list_command(manager: &SandboxManager) -> Result<()> {
    let bindings = manager
        .list_bindings()
        .await
        .context("Failed to read sandbox registry")?;

    if bindings.is_empty() {
        println!("{}", "No sandboxes registered".yellow());
        println!(
            "{}",
            "Use 'warden provision --user <id> --session <id>' to start one".dimmed()
        );
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Container", "User", "Session", "Type", "Endpoint", "Created"]);

    for (key, model) in &bindings {
        let (user, session) = match key {
            Some(key) => (key.user_id.clone(), key.session_id.clone()),
            None => ("-".to_string(), "-".to_string()),
        };
        table.add_row(vec![
            short_id(&model.container_id).to_string(),
            user,
            session,
            model.sandbox_type.clone(),
            model.base_url.clone(),
            model.created_at.format("%Y-%m-%d %H:%M").to_string(),
        ]);
    }

    println!("{table}");
    println!("{}", format!("{} sandbox(es)", bindings.len()).dimmed());
    Ok(())
}

async fn status_command(manager: &SandboxManager, key: SandboxKey) -> Result<()> {
    let Some((model, status)) = manager
        .status(&key)
        .await
        .with_context(|| format!("Failed to inspect sandbox for {}", key))?
    else {
        println!("{} {}", "No sandbox registered for".yellow(), key);
        return Ok(());
    };

    print_model(&model);
    println!("  {:<10} {}", "Status:".bold(), status);
    Ok(())
}

async fn tools_command(
    manager: &SandboxManager,
    key: SandboxKey,
    tool_type: Option<&str>,
) -> Result<()> {
    let handle = manager.get_or_provision(&key).await?;
    let tools = handle
        .client
        .list_tools(tool_type)
        .await
        .context("Failed to list sandbox tools")?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Group", "Tool", "Description"]);

    let groups = tools.as_object().cloned().unwrap_or_default();
    for (group, entries) in &groups {
        for tool in warden_sandbox::SandboxTool::from_listing(&key.sandbox_type, entries) {
            table.add_row(vec![group.clone(), tool.name, tool.description]);
        }
    }

    println!("{table}");
    Ok(())
}

async fn call_command(
    manager: &SandboxManager,
    key: SandboxKey,
    tool: &str,
    arguments: &str,
) -> Result<()> {
    let arguments: Value =
        serde_json::from_str(arguments).context("Tool arguments must be valid JSON")?;
    if !arguments.is_object() {
        bail!("Tool arguments must be a JSON object");
    }

    let handle = manager.get_or_provision(&key).await?;
    let output = handle
        .client
        .call_tool(tool, arguments)
        .await
        .with_context(|| format!("Tool '{}' failed", tool))?;

    match output {
        Value::String(text) => println!("{}", text),
        other => println!("{}", serde_json::to_string_pretty(&other)?),
    }
    Ok(())
}

async fn release_command(manager: &SandboxManager, key: SandboxKey) -> Result<()> {
    if manager
        .release(&key)
        .await
        .with_context(|| format!("Failed to release sandbox for {}", key))?
    {
        println!("{} Released sandbox for {}", "✓".green(), key);
    } else {
        println!("{} {}", "No sandbox registered for".yellow(), key);
    }
    Ok(())
}

async fn release_by_id_command(manager: &SandboxManager, container_id: &str) -> Result<()> {
    if manager
        .release_by_container_id(container_id)
        .await
        .with_context(|| format!("Failed to release container {}", container_id))?
    {
        println!("{} Released container {}", "✓".green(), short_id(container_id));
    } else {
        println!("{} {}", "No sandbox registered with id".yellow(), container_id);
    }
    Ok(())
}

async fn cleanup_command(manager: &SandboxManager) -> Result<()> {
    let report = manager.cleanup_all().await.context("Cleanup failed")?;

    println!("{} Stopped {} sandbox(es)", "✓".green(), report.stopped);
    for error in &report.errors {
        println!("  {} {}", "⚠".yellow(), error);
    }
    Ok(())
}

fn print_model(model: &ContainerModel) {
    println!("  {:<10} {}", "Container:".bold(), model.container_name);
    println!("  {:<10} {}", "Id:".bold(), short_id(&model.container_id));
    println!("  {:<10} {}", "Type:".bold(), model.sandbox_type);
    println!("  {:<10} {}", "Endpoint:".bold(), model.base_url);
    if let Some(browser_url) = &model.browser_url {
        println!("  {:<10} {}", "Browser:".bold(), browser_url);
    }
    if let Some(mount_dir) = &model.mount_dir {
        println!("  {:<10} {}", "Workspace:".bold(), mount_dir);
    }
    println!(
        "  {:<10} {}",
        "Ports:".bold(),
        model
            .ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn short_id(container_id: &str) -> &str {
    container_id.get(..12).unwrap_or(container_id)
}

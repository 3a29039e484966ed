// ABOUTME: CLI listing of the sandbox types this build can provision
// ABOUTME: Reads built-in types only; custom types are registered programmatically

use anyhow::Result;
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use warden_sandbox::SandboxTypeRegistry;

pub async fn list_types() -> Result<()> {
    let manager_config = super::load_config()?;
    let registry = SandboxTypeRegistry::with_builtins(&manager_config.image_registry);

    let mut types: Vec<_> = registry.list_all().into_values().collect();
    if types.is_empty() {
        println!("{}", "No sandbox types available".yellow());
        return Ok(());
    }
    types.sort_by(|a, b| a.type_name.cmp(&b.type_name));

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Type", "Image", "Security", "Timeout", "Description"]);

    for config in &types {
        let marker = if config.type_name == manager_config.default_sandbox_type {
            " (default)"
        } else {
            ""
        };
        table.add_row(vec![
            format!("{}{}", config.type_name, marker),
            config.image.clone(),
            format!("{:?}", config.security_level).to_lowercase(),
            format!("{}s", config.startup_timeout.as_secs()),
            config.description.clone(),
        ]);
    }

    println!("{table}");
    Ok(())
}

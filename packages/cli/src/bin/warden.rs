// ABOUTME: Warden command line entry point
// ABOUTME: Parses arguments, sets up logging and dispatches to sandbox commands

use clap::{Parser, Subcommand};
use colored::*;
use std::process;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::sandbox::SandboxCommands;

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Provision and manage per-session tool sandboxes")]
#[command(version)]
struct Cli {
    /// Log filter, e.g. `debug` or `warden_sandbox=trace`
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered sandbox types
    Types,
    #[command(flatten)]
    Sandbox(SandboxCommands),
}

fn init_tracing(filter: Option<&str>) {
    let filter = filter
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref());

    let result = match cli.command {
        Commands::Types => cli::types::list_types().await,
        Commands::Sandbox(command) => cli::sandbox::handle_sandbox_command(command).await,
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

//! Burrow CLI - Main entry point

mod app;
mod output;
mod settings;
mod stacks;
mod template;
mod workspace;

use app::App;
use burrow_provision::VmidKind;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Burrow - Proxmox LXC templates and development workspaces
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging (also echoes remote command output)
    #[arg(short, long, global = true)]
    debug: bool,

    /// Read config.json from this directory instead of the global/project lookup
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Owner of templates and workspaces (defaults to $USER)
    #[arg(short, long, global = true)]
    user: Option<String>,

    /// Print records as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build and manage templates
    #[command(subcommand)]
    Template(template::TemplateCommand),
    /// Inspect the tech stack catalog
    #[command(subcommand)]
    Stacks(stacks::StacksCommand),
    /// VMID allocation
    #[command(subcommand)]
    Vmid(VmidCommand),
    /// Create and use workspaces
    #[command(subcommand)]
    Workspace(workspace::WorkspaceCommand),
    /// Read and write persisted settings
    #[command(subcommand)]
    Settings(settings::SettingsCommand),
}

#[derive(Subcommand, Debug)]
enum VmidCommand {
    /// Show the id the next build would get
    Next {
        /// Use the workspace floor instead of the template floor
        #[arg(long)]
        workspace: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match args.command {
        // catalog commands need no config, storage or hypervisor
        Command::Stacks(command) => stacks::run(command, args.json),
        command => {
            let app = App::load(args.config_dir.as_deref(), args.user, args.json, args.debug)?;
            dispatch(&app, command).await
        }
    }
}

async fn dispatch(app: &App, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Template(command) => template::run(app, command).await,
        Command::Workspace(command) => workspace::run(app, command).await,
        Command::Settings(command) => settings::run(app, command),
        Command::Stacks(command) => stacks::run(command, app.json),
        Command::Vmid(VmidCommand::Next { workspace }) => {
            let kind = if workspace {
                VmidKind::Workspace
            } else {
                VmidKind::Template
            };
            let vmid = app.context()?.allocator.peek(kind).await?;
            println!("{}", vmid);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_template_create() {
        let args = Args::try_parse_from([
            "burrow",
            "template",
            "create",
            "agent",
            "--stacks",
            "claude,docker",
            "--stage",
            "--disk-gb",
            "32",
        ])
        .unwrap();
        let Command::Template(template::TemplateCommand::Create { name, stacks, .. }) =
            args.command
        else {
            panic!("expected template create");
        };
        assert_eq!(name, "agent");
        assert_eq!(stacks, vec!["claude", "docker"]);
    }

    #[test]
    fn test_parse_workspace_exec_keeps_flags() {
        let args = Args::try_parse_from([
            "burrow", "workspace", "exec", "ab12", "ls", "-la", "/srv",
        ])
        .unwrap();
        let Command::Workspace(workspace::WorkspaceCommand::Exec { id, command, .. }) =
            args.command
        else {
            panic!("expected workspace exec");
        };
        assert_eq!(id, "ab12");
        assert_eq!(command, vec!["ls", "-la", "/srv"]);
    }
}

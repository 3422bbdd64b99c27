//! `burrow stacks ...`

use crate::output::print_json;
use burrow_stack::{catalog, core_packages_script, install_script, verify_script};
use clap::Subcommand;

#[derive(Subcommand, Debug)]
pub enum StacksCommand {
    /// List every stack in the catalog
    List,
    /// Show install order, dependencies first
    Resolve {
        #[arg(required = true, value_delimiter = ',')]
        stacks: Vec<String>,
    },
    /// Print the script a build would run
    Script {
        #[arg(value_delimiter = ',')]
        stacks: Vec<String>,
        /// Print the presence check instead of the installer
        #[arg(long, conflicts_with = "core")]
        verify: bool,
        /// Print the core-packages script of a fresh build
        #[arg(long)]
        core: bool,
    },
}

pub fn run(command: StacksCommand, json: bool) -> anyhow::Result<()> {
    let registry = catalog();
    match command {
        StacksCommand::List => {
            let stacks = registry.list();
            if json {
                return print_json(&stacks);
            }
            println!("{:<12} {:<22} {:<10} {:<8} {}", "ID", "Name", "Category", "Nesting", "Requires");
            println!("{}", "-".repeat(70));
            for stack in stacks {
                println!(
                    "{:<12} {:<22} {:<10} {:<8} {}",
                    stack.id,
                    stack.name,
                    stack.category.as_str(),
                    if stack.requires_nesting { "yes" } else { "" },
                    stack.dependencies.join(",")
                );
            }
        }
        StacksCommand::Resolve { stacks } => {
            let ids = registry.resolve_ids(&stacks)?;
            let nesting = registry.requires_nesting(&stacks)?;
            if json {
                return print_json(&serde_json::json!({
                    "order": ids,
                    "requiresNesting": nesting,
                }));
            }
            println!("{}", ids.join(" -> "));
            if nesting {
                println!("(requires LXC nesting)");
            }
        }
        StacksCommand::Script { core: true, .. } => print!("{}", core_packages_script()),
        StacksCommand::Script {
            stacks,
            verify: true,
            ..
        } => print!("{}", verify_script(registry, &stacks)?),
        StacksCommand::Script { stacks, .. } => print!("{}", install_script(registry, &stacks)?),
    }
    Ok(())
}

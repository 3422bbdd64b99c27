//! `burrow workspace ...`

use crate::app::App;
use crate::output::{print_json, short_id, PassThrough, ProgressPrinter};
use burrow_foundation::ProgressSink;
use burrow_provision::{ContainerBackend, CreateWorkspaceRequest};
use burrow_ssh::{CommandSpec, ExecOptions};
use burrow_stack::{catalog, parse_verify_output, verify_script};
use clap::Subcommand;

#[derive(Subcommand, Debug)]
pub enum WorkspaceCommand {
    /// Clone a template into a new running workspace
    Create {
        name: String,
        /// Template to clone; defaults to your default template
        #[arg(short, long)]
        template: Option<String>,
        #[arg(long)]
        memory_mb: Option<u32>,
        #[arg(long)]
        cores: Option<u32>,
    },
    /// Stop and delete a workspace
    Destroy { id: String },
    /// Power state and address; every workspace when no id is given
    Status { id: Option<String> },
    Start { id: String },
    Stop { id: String },
    /// Run a command inside a workspace and exit with its status
    Exec {
        id: String,
        /// Working directory inside the container
        #[arg(long)]
        cwd: Option<String>,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Check that the template's stacks are present
    Verify { id: String },
}

pub async fn run(app: &App, command: WorkspaceCommand) -> anyhow::Result<()> {
    let backend = app.workspaces()?;
    match command {
        WorkspaceCommand::Create {
            name,
            template,
            memory_mb,
            cores,
        } => {
            let template_id = match template {
                Some(prefix) => Some(app.template_id(&prefix)?),
                None => None,
            };
            let request = CreateWorkspaceRequest {
                user_id: app.user.clone(),
                name,
                template_id,
                memory_mb,
                cores,
            };
            let printer = ProgressPrinter::spawn(app.verbose);
            let result = backend.create(&request, printer.sink()).await;
            printer.finish().await;
            let record = result?;
            if app.json {
                return print_json(&record);
            }
            println!(
                "Workspace {} ({}) is running as CT {}",
                record.name,
                short_id(&record.id),
                record.container_id
            );
        }
        WorkspaceCommand::Destroy { id } => {
            let id = app.workspace_id(&id)?;
            backend.destroy(&id).await?;
            println!("Destroyed workspace {}", short_id(&id));
        }
        WorkspaceCommand::Status { id: Some(id) } => {
            let info = backend.inspect(&app.workspace_id(&id)?).await?;
            if app.json {
                return print_json(&info);
            }
            println!(
                "{} {} CT {} {} {}",
                short_id(&info.id),
                info.name,
                info.container_id,
                info.state.as_str(),
                info.ip.as_deref().unwrap_or("-")
            );
        }
        WorkspaceCommand::Status { id: None } => {
            let mut infos = Vec::new();
            for record in backend.list()? {
                infos.push(backend.inspect(&record.id).await?);
            }
            if app.json {
                return print_json(&infos);
            }
            if infos.is_empty() {
                println!("No workspaces found.");
            }
            for info in infos {
                println!(
                    "{:<10} {:<24} {:<6} {:<8} {}",
                    short_id(&info.id),
                    info.name,
                    info.container_id,
                    info.state.as_str(),
                    info.ip.as_deref().unwrap_or("-")
                );
            }
        }
        WorkspaceCommand::Start { id } => {
            backend.start(&app.workspace_id(&id)?).await?;
            println!("Started");
        }
        WorkspaceCommand::Stop { id } => {
            backend.stop(&app.workspace_id(&id)?).await?;
            println!("Stopped");
        }
        WorkspaceCommand::Exec { id, cwd, command } => {
            let id = app.workspace_id(&id)?;
            let options = ExecOptions {
                cwd,
                ..Default::default()
            };
            let sink: &dyn ProgressSink = &PassThrough;
            let output = backend
                .exec(&id, &CommandSpec::argv(command), &options, Some(sink))
                .await?;
            if !output.success() {
                std::process::exit(output.exit_code.clamp(1, 255));
            }
        }
        WorkspaceCommand::Verify { id } => {
            let id = app.workspace_id(&id)?;
            let record = backend
                .list()?
                .into_iter()
                .find(|w| w.id == id)
                .ok_or_else(|| anyhow::anyhow!("workspace {} not found", id))?;
            let stacks = match &record.template_id {
                Some(template_id) => app.templates()?.get_template(template_id)?.all_tech_stacks(),
                None => Vec::new(),
            };
            if stacks.is_empty() {
                println!("Workspace has no tech stacks to verify.");
                return Ok(());
            }

            let script = verify_script(catalog(), &stacks)?;
            let output = backend
                .exec(&id, &CommandSpec::script(script), &ExecOptions::default(), None)
                .await?;
            let results = parse_verify_output(&output.stdout);
            let missing = results.iter().filter(|(_, ok)| !ok).count();
            for (stack, installed) in &results {
                println!("{:<12} {}", stack, if *installed { "installed" } else { "MISSING" });
            }
            if missing > 0 {
                anyhow::bail!("{} stack(s) missing", missing);
            }
        }
    }
    Ok(())
}

//! `burrow template ...`

use crate::app::App;
use crate::output::{print_json, print_templates, short_id, ProgressPrinter};
use burrow_foundation::Template;
use burrow_provision::{BuildOptions, CreateTemplateRequest};
use clap::{Args, Subcommand};

#[derive(Subcommand, Debug)]
pub enum TemplateCommand {
    /// Create and build a template
    Create {
        name: String,
        /// Comma separated stack ids, e.g. `nodejs,docker`
        #[arg(short, long, value_delimiter = ',')]
        stacks: Vec<String>,
        /// Clone from this ready template instead of an OS image
        #[arg(short, long)]
        parent: Option<String>,
        /// Appliance name prefix or volume id (fresh builds only)
        #[arg(long)]
        os_template: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[command(flatten)]
        build: BuildArgs,
    },
    /// Turn a staged template into a ready one
    Finalize { id: String },
    /// Delete a template and its container
    Delete { id: String },
    /// List templates
    List {
        /// Include every user's templates
        #[arg(long)]
        all: bool,
    },
    /// Rebuild a template that failed
    Retry {
        id: String,
        #[command(flatten)]
        build: BuildArgs,
    },
    /// Show or set the default template
    Default { id: Option<String> },
}

#[derive(Args, Debug, Clone, Copy)]
pub struct BuildArgs {
    /// Stop with the container running for manual changes
    #[arg(long)]
    stage: bool,
    /// Root disk size in GB
    #[arg(long)]
    disk_gb: Option<u32>,
}

impl From<BuildArgs> for BuildOptions {
    fn from(args: BuildArgs) -> Self {
        BuildOptions {
            stop_at_staging: args.stage,
            disk_gb: args.disk_gb,
        }
    }
}

pub async fn run(app: &App, command: TemplateCommand) -> anyhow::Result<()> {
    match command {
        TemplateCommand::List { all } => {
            let user = (!all).then_some(app.user.as_str());
            let templates = app.templates()?.list_templates(user)?;
            if app.json {
                return print_json(&templates);
            }
            print_templates(&templates);
            Ok(())
        }
        TemplateCommand::Create {
            name,
            stacks,
            parent,
            os_template,
            description,
            build,
        } => {
            let parent_template_id = match parent {
                Some(prefix) => Some(app.template_id(&prefix)?),
                None => None,
            };
            let request = CreateTemplateRequest {
                user_id: app.user.clone(),
                name,
                description,
                tech_stacks: stacks,
                parent_template_id,
                os_template,
                build: build.into(),
            };

            let manager = app.templates()?;
            let printer = ProgressPrinter::spawn(app.verbose);
            let result = manager.create_template(request, printer.sink()).await;
            printer.finish().await;
            report(app, result?)
        }
        TemplateCommand::Finalize { id } => {
            let id = app.template_id(&id)?;
            let manager = app.templates()?;
            let printer = ProgressPrinter::spawn(app.verbose);
            let result = manager.finalize_template(&id, printer.sink()).await;
            printer.finish().await;
            report(app, result?)
        }
        TemplateCommand::Retry { id, build } => {
            let id = app.template_id(&id)?;
            let manager = app.templates()?;
            let printer = ProgressPrinter::spawn(app.verbose);
            let result = manager
                .retry_template(&id, build.into(), printer.sink())
                .await;
            printer.finish().await;
            report(app, result?)
        }
        TemplateCommand::Delete { id } => {
            let id = app.template_id(&id)?;
            app.templates()?.delete_template(&id).await?;
            println!("Deleted template {}", short_id(&id));
            Ok(())
        }
        TemplateCommand::Default { id: None } => {
            match app.templates()?.default_template(&app.user)? {
                Some(t) if app.json => print_json(&t)?,
                Some(t) => println!("{} {}", short_id(&t.id), t.name),
                None => println!("No default template for {}", app.user),
            }
            Ok(())
        }
        TemplateCommand::Default { id: Some(id) } => {
            let id = app.template_id(&id)?;
            let template = app.templates()?.set_default_template(&app.user, &id)?;
            println!("Default template is now {}", template.name);
            Ok(())
        }
    }
}

fn report(app: &App, template: Template) -> anyhow::Result<()> {
    if app.json {
        return print_json(&template);
    }
    println!();
    print_templates(std::slice::from_ref(&template));
    if let Some(ip) = &template.staging_container_ip {
        println!(
            "\nStaged at {}. Make your changes, then run `burrow template finalize {}`.",
            ip,
            short_id(&template.id)
        );
    }
    Ok(())
}

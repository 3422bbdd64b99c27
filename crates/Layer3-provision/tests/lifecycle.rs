//! End-to-end template and workspace flows against the in-memory hypervisor

use burrow_foundation::{BuildEvent, ChannelProgress, NoopProgress, Storage, TemplateStatus};
use burrow_provision::{
    BuildOptions, ContainerBackend, CreateTemplateRequest, CreateWorkspaceRequest,
    ProvisionContext, ProvisionError, ProvisionSettings, ProxmoxBackend, TemplateManager,
    Timeouts,
};
use burrow_proxmox::{ContainerState, FakeHypervisor, HypervisorApi};
use burrow_ssh::{CommandSpec, ExecOptions, ScriptedExecutor, SshAuth};
use std::sync::Arc;

struct World {
    api: Arc<FakeHypervisor>,
    executor: Arc<ScriptedExecutor>,
    templates: Arc<TemplateManager>,
    workspaces: ProxmoxBackend,
}

fn world() -> World {
    let api = Arc::new(FakeHypervisor::new("pve"));
    api.add_storage_template("local:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst");
    let executor = Arc::new(ScriptedExecutor::new());
    let storage = Arc::new(Storage::in_memory().unwrap());

    let mut settings = ProvisionSettings::new(SshAuth::Password("secret".into()));
    settings.public_keys = vec!["ssh-ed25519 AAAAC3Nza dev@laptop".into()];
    let ctx = ProvisionContext::new(api.clone(), executor.clone(), storage, settings)
        .with_timeouts(Timeouts::fast());

    let templates = Arc::new(TemplateManager::new(Arc::new(ctx)));
    let workspaces = ProxmoxBackend::new(templates.clone());
    World {
        api,
        executor,
        templates,
        workspaces,
    }
}

fn template_request(name: &str, stacks: &[&str], parent: Option<&str>) -> CreateTemplateRequest {
    CreateTemplateRequest {
        user_id: "alice".into(),
        name: name.into(),
        tech_stacks: stacks.iter().map(|s| s.to_string()).collect(),
        parent_template_id: parent.map(String::from),
        ..Default::default()
    }
}

#[tokio::test]
async fn template_chain_to_workspace() {
    let w = world();

    let base = w
        .templates
        .create_template(template_request("base", &["nodejs"], None), &NoopProgress)
        .await
        .unwrap();
    let agent = w
        .templates
        .create_template(
            template_request("agent", &["claude"], Some(&base.id)),
            &NoopProgress,
        )
        .await
        .unwrap();
    assert_eq!(agent.status, TemplateStatus::Ready);
    assert_eq!(agent.all_tech_stacks(), vec!["nodejs", "claude"]);
    w.templates.set_default_template("alice", &agent.id).unwrap();

    let workspace = w
        .workspaces
        .create(
            &CreateWorkspaceRequest {
                user_id: "alice".into(),
                name: "feature-x".into(),
                ..Default::default()
            },
            &NoopProgress,
        )
        .await
        .unwrap();
    assert_eq!(workspace.template_id.as_deref(), Some(agent.id.as_str()));
    let vmid = workspace.vmid().unwrap();
    assert!(vmid > agent.vmid.unwrap());

    w.executor.respond("claude --version", "1.0.0 (Claude Code)\n");
    let output = w
        .workspaces
        .exec(
            &workspace.id,
            &CommandSpec::argv(["claude", "--version"]),
            &ExecOptions::default(),
            None,
        )
        .await
        .unwrap();
    assert!(output.success());
    assert!(output.stdout.starts_with("1.0.0"));

    // parent templates stay protected while anything is cloned from them
    assert!(matches!(
        w.templates.delete_template(&base.id).await.unwrap_err(),
        ProvisionError::HasChildren { .. }
    ));

    w.workspaces.destroy(&workspace.id).await.unwrap();
    w.templates.delete_template(&agent.id).await.unwrap();
    w.templates.delete_template(&base.id).await.unwrap();
    assert!(w.api.container_ids().is_empty());
    assert!(w.templates.list_templates(Some("alice")).unwrap().is_empty());
}

#[tokio::test]
async fn progress_stream_reports_milestones_and_output() {
    let w = world();
    w.executor.respond("get.docker.com", "Docker installed\n");
    let (sink, mut rx) = ChannelProgress::channel();

    let template = w
        .templates
        .create_template(template_request("docker", &["docker"], None), &sink)
        .await
        .unwrap();
    drop(sink);
    assert!(w.api.container(template.vmid.unwrap()).unwrap().nesting_enabled());

    let mut steps = Vec::new();
    let mut output = String::new();
    while let Some(event) = rx.recv().await {
        match event {
            BuildEvent::Progress(p) => steps.push((p.step, p.progress)),
            BuildEvent::Output(o) => output.push_str(&o.data),
        }
    }

    assert_eq!(steps.first().map(|(s, _)| s.as_str()), Some("validate"));
    assert_eq!(steps.last(), Some(&("ready".to_string(), 100)));
    assert!(steps.windows(2).all(|pair| pair[0].1 <= pair[1].1));
    assert!(output.contains("Docker installed"));
}

#[tokio::test]
async fn staged_template_survives_until_finalized() {
    let w = world();
    let mut request = template_request("manual", &["python"], None);
    request.build = BuildOptions {
        stop_at_staging: true,
        disk_gb: None,
    };

    let staged = w
        .templates
        .create_template(request, &NoopProgress)
        .await
        .unwrap();
    let vmid = staged.vmid.unwrap();
    assert_eq!(staged.status, TemplateStatus::Staging);

    assert_eq!(w.api.container(vmid).unwrap().state, ContainerState::Running);

    // stopped by hand while making changes; finalize boots it again
    w.api.stop_container("pve", vmid).await.unwrap();

    let ready = w
        .templates
        .finalize_template(&staged.id, &NoopProgress)
        .await
        .unwrap();
    assert_eq!(ready.status, TemplateStatus::Ready);
    let container = w.api.container(vmid).unwrap();
    assert!(container.template);
    assert_eq!(container.state, ContainerState::Stopped);
    assert_eq!(
        w.api.calls().iter().filter(|c| *c == &format!("start {}", vmid)).count(),
        2
    );
}

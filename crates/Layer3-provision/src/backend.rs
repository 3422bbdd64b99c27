//! Container backend trait and the Proxmox workspace backend

use crate::allocator::VmidKind;
use crate::context::{hostname_for, ProvisionContext};
use crate::error::{ProvisionError, Result, StepContext};
use crate::manager::TemplateManager;
use async_trait::async_trait;
use burrow_foundation::{
    sanitize_tags, ProgressSink, Template, TemplateStatus, WorkspaceRecord, BACKEND_PROXMOX,
};
use burrow_proxmox::{CloneParams, ContainerState};
use burrow_ssh::{
    CommandOutput, CommandSpec, ExecOptions, InteractiveStream, SshTarget, StreamRequest,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Input for a new workspace
#[derive(Debug, Clone, Default)]
pub struct CreateWorkspaceRequest {
    pub user_id: String,
    pub name: String,
    /// Falls back to the user's default template
    pub template_id: Option<String>,
    pub memory_mb: Option<u32>,
    pub cores: Option<u32>,
}

/// Live view of a workspace
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInfo {
    pub id: String,
    pub name: String,
    pub container_id: String,
    pub state: ContainerState,
    pub ip: Option<String>,
}

/// Backend trait - implement to host workspaces somewhere else
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Discriminator stored on workspace rows
    fn name(&self) -> &'static str;

    /// Provision and boot a workspace
    async fn create(
        &self,
        request: &CreateWorkspaceRequest,
        sink: &dyn ProgressSink,
    ) -> Result<WorkspaceRecord>;

    async fn start(&self, id: &str) -> Result<()>;

    async fn stop(&self, id: &str) -> Result<()>;

    /// Remove the container and its record
    async fn destroy(&self, id: &str) -> Result<()>;

    async fn inspect(&self, id: &str) -> Result<WorkspaceInfo>;

    /// Run a command; a non-zero exit is returned, not raised
    async fn exec(
        &self,
        id: &str,
        spec: &CommandSpec,
        options: &ExecOptions,
        sink: Option<&dyn ProgressSink>,
    ) -> Result<CommandOutput>;

    async fn open_stream(&self, id: &str, request: &StreamRequest) -> Result<InteractiveStream>;
}

/// Workspaces as full clones of ready templates
pub struct ProxmoxBackend {
    ctx: Arc<ProvisionContext>,
    templates: Arc<TemplateManager>,
}

impl ProxmoxBackend {
    pub fn new(templates: Arc<TemplateManager>) -> Self {
        Self {
            ctx: templates.context().clone(),
            templates,
        }
    }

    pub fn list(&self) -> Result<Vec<WorkspaceRecord>> {
        Ok(self
            .ctx
            .records
            .list_workspaces()?
            .into_iter()
            .filter(|w| w.container_backend == BACKEND_PROXMOX)
            .collect())
    }

    fn record(&self, id: &str) -> Result<(WorkspaceRecord, String, u32)> {
        let record = self
            .ctx
            .records
            .get_workspace(id)?
            .filter(|w| w.container_backend == BACKEND_PROXMOX)
            .ok_or_else(|| ProvisionError::NotFound(format!("workspace {}", id)))?;
        let vmid = record.vmid().ok_or_else(|| {
            ProvisionError::Validation(format!(
                "workspace {} has no valid VMID ({})",
                id, record.container_id
            ))
        })?;
        let node = record
            .node
            .clone()
            .unwrap_or_else(|| self.ctx.node().to_string());
        Ok((record, node, vmid))
    }

    /// Template a new workspace is cloned from
    async fn source_template(&self, request: &CreateWorkspaceRequest) -> Result<Template> {
        let id = match &request.template_id {
            Some(id) => id.clone(),
            None => self
                .templates
                .default_template(&request.user_id)?
                .map(|t| t.id)
                .ok_or_else(|| {
                    ProvisionError::NotFound(format!(
                        "no template given and user {} has no default",
                        request.user_id
                    ))
                })?,
        };
        let template = self
            .templates
            .resolve_template(&id)
            .await?
            .ok_or_else(|| ProvisionError::NotFound(format!("template {}", id)))?;
        if template.status != TemplateStatus::Ready || template.vmid.is_none() {
            return Err(ProvisionError::InvalidState {
                template_id: template.id.clone(),
                status: template.status.to_string(),
                expected: TemplateStatus::Ready.to_string(),
            });
        }
        Ok(template)
    }

    /// Address and login of a running workspace
    async fn target(&self, id: &str) -> Result<SshTarget> {
        let info = self.inspect(id).await?;
        match info.ip {
            Some(ip) if info.state == ContainerState::Running => {
                Ok(self.ctx.settings.container_target(&ip))
            }
            _ => Err(ProvisionError::Validation(format!(
                "workspace {} is {} and has no address",
                id,
                info.state.as_str()
            ))),
        }
    }

    async fn clone_and_boot(
        &self,
        record: &mut WorkspaceRecord,
        template: &Template,
        request: &CreateWorkspaceRequest,
        sink: &dyn ProgressSink,
        resource: &str,
    ) -> Result<()> {
        let Some(template_vmid) = template.vmid else {
            return Err(ProvisionError::Validation(format!(
                "template {} has no container",
                template.id
            )));
        };
        let node = template
            .node
            .clone()
            .unwrap_or_else(|| self.ctx.node().to_string());

        sink.report("clone", 20, &format!("Cloning template {}", template.name));
        let base = CloneParams {
            hostname: hostname_for(&request.name, "burrow-workspace"),
            full: true,
            storage: Some(self.ctx.settings.defaults.storage.clone()),
            description: Some(format!("Burrow workspace: {}", request.name)),
            ..Default::default()
        };
        let (vmid, upid) = self
            .ctx
            .allocator
            .allocate_with(VmidKind::Workspace, |vmid| {
                let api = self.ctx.api.clone();
                let node = node.clone();
                let params = CloneParams {
                    newid: vmid,
                    ..base.clone()
                };
                async move {
                    api.clone_container(&node, template_vmid, &params)
                        .await
                        .map_err(ProvisionError::from)
                }
            })
            .await
            .step(resource, "clone")?;
        record.container_id = vmid.to_string();
        record.node = Some(node.clone());
        info!(workspace_id = %record.id, vmid, template_vmid, "Workspace container cloned");
        self.ctx
            .wait_task(&upid, self.ctx.timeouts.task)
            .await
            .step(resource, "clone")?;

        sink.report("configure", 30, "Configuring container");
        let mut updates = vec![(
            "tags",
            sanitize_tags(["burrow", "workspace", template.name.as_str()]),
        )];
        if let Some(memory) = request.memory_mb {
            updates.push(("memory", memory.to_string()));
        }
        if let Some(cores) = request.cores {
            updates.push(("cores", cores.to_string()));
        }
        self.ctx
            .api
            .update_container_config(&node, vmid, &updates)
            .await
            .step(resource, "configure")?;

        sink.report("start", 50, "Starting container");
        self.ctx.start(&node, vmid).await.step(resource, "start")?;

        sink.report("network", 70, "Waiting for network");
        let ip = self.ctx.wait_network(&node, vmid).await.step(resource, "network")?;

        sink.report("ssh", 85, &format!("Waiting for SSH on {}", ip));
        self.ctx.wait_ssh(&ip).await.step(resource, "ssh")?;
        Ok(())
    }
}

#[async_trait]
impl ContainerBackend for ProxmoxBackend {
    fn name(&self) -> &'static str {
        BACKEND_PROXMOX
    }

    async fn create(
        &self,
        request: &CreateWorkspaceRequest,
        sink: &dyn ProgressSink,
    ) -> Result<WorkspaceRecord> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(ProvisionError::Validation("workspace name is required".into()));
        }

        sink.report("template", 10, "Resolving template");
        let template = self.source_template(request).await?;

        let mut record = WorkspaceRecord {
            id: Uuid::new_v4().to_string(),
            user_id: request.user_id.clone(),
            name: name.to_string(),
            container_id: String::new(),
            container_backend: BACKEND_PROXMOX.to_string(),
            template_id: Some(template.id.clone()),
            node: None,
            created_at: Utc::now(),
        };
        let resource = format!("workspace {}", record.id);

        if let Err(e) = self
            .clone_and_boot(&mut record, &template, request, sink, &resource)
            .await
        {
            error!(workspace_id = %record.id, step = e.step().unwrap_or("-"), error = %e, "Workspace creation failed");
            if let Some(vmid) = record.vmid() {
                let node = record
                    .node
                    .clone()
                    .unwrap_or_else(|| self.ctx.node().to_string());
                self.ctx.rollback(&node, vmid).await;
                self.ctx.allocator.release(vmid).await;
            }
            sink.report("error", 100, &e.to_string());
            return Err(e);
        }

        let saved = self.ctx.records.save_workspace(&record);
        if let Some(vmid) = record.vmid() {
            self.ctx.allocator.release(vmid).await;
        }
        saved?;
        info!(workspace_id = %record.id, vmid = %record.container_id, "Workspace ready");
        sink.report("ready", 100, &format!("Workspace {} is ready", record.name));
        Ok(record)
    }

    async fn start(&self, id: &str) -> Result<()> {
        let (_, node, vmid) = self.record(id)?;
        self.ctx
            .start(&node, vmid)
            .await
            .step(&format!("workspace {}", id), "start")
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let (_, node, vmid) = self.record(id)?;
        let resource = format!("workspace {}", id);
        let upid = self
            .ctx
            .api
            .stop_container(&node, vmid)
            .await
            .step(&resource, "stop")?;
        self.ctx
            .wait_task(&upid, self.ctx.timeouts.task)
            .await
            .step(&resource, "stop")?;
        Ok(())
    }

    async fn destroy(&self, id: &str) -> Result<()> {
        let (_, node, vmid) = self.record(id)?;
        self.ctx
            .destroy(&node, vmid)
            .await
            .step(&format!("workspace {}", id), "destroy")?;
        self.ctx.records.delete_workspace(id)?;
        info!(workspace_id = %id, vmid, "Workspace destroyed");
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<WorkspaceInfo> {
        let (record, node, vmid) = self.record(id)?;
        let status = self
            .ctx
            .api
            .get_container_status(&node, vmid)
            .await
            .step(&format!("workspace {}", id), "inspect")?;

        let ip = if status.status == ContainerState::Running {
            let interface = &self.ctx.timeouts.network.interface;
            self.ctx
                .api
                .get_interfaces(&node, vmid)
                .await
                .iter()
                .filter(|i| &i.name == interface)
                .find_map(|i| i.ipv4())
                .map(|ip| ip.to_string())
        } else {
            None
        };

        Ok(WorkspaceInfo {
            id: record.id,
            name: record.name,
            container_id: record.container_id,
            state: status.status,
            ip,
        })
    }

    async fn exec(
        &self,
        id: &str,
        spec: &CommandSpec,
        options: &ExecOptions,
        sink: Option<&dyn ProgressSink>,
    ) -> Result<CommandOutput> {
        let target = self.target(id).await?;
        Ok(self.ctx.executor.exec(&target, spec, options, sink).await?)
    }

    async fn open_stream(&self, id: &str, request: &StreamRequest) -> Result<InteractiveStream> {
        let target = self.target(id).await?;
        Ok(self.ctx.executor.open_stream(&target, request).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::CreateTemplateRequest;
    use crate::testing::{fake_ip, Harness};
    use burrow_foundation::{NoopProgress, RecordStore};
    use burrow_proxmox::HypervisorApi;
    use burrow_ssh::StreamChunk;
    use serde_json::json;

    async fn setup() -> (Harness, ProxmoxBackend, Template) {
        let harness = Harness::new();
        let templates = Arc::new(TemplateManager::new(harness.ctx.clone()));
        let template = templates
            .create_template(
                CreateTemplateRequest {
                    user_id: "u1".into(),
                    name: "base".into(),
                    tech_stacks: vec!["nodejs".into()],
                    ..Default::default()
                },
                &NoopProgress,
            )
            .await
            .unwrap();
        let backend = ProxmoxBackend::new(templates);
        (harness, backend, template)
    }

    fn request(template_id: Option<String>) -> CreateWorkspaceRequest {
        CreateWorkspaceRequest {
            user_id: "u1".into(),
            name: "dev box".into(),
            template_id,
            memory_mb: Some(4096),
            cores: None,
        }
    }

    #[tokio::test]
    async fn test_create_clones_template_into_workspace_range() {
        let (harness, backend, template) = setup().await;

        let record = backend
            .create(&request(Some(template.id.clone())), &NoopProgress)
            .await
            .unwrap();

        assert_eq!(record.container_backend, "proxmox");
        assert_eq!(record.template_id.as_deref(), Some(template.id.as_str()));
        // template took 500, workspaces start at 501
        assert_eq!(record.vmid(), Some(501));

        let container = harness.api.container(501).unwrap();
        assert_eq!(container.state, ContainerState::Running);
        assert_eq!(container.config["memory"], json!("4096"));
        assert_eq!(container.config["hostname"], json!("dev-box"));
        assert_eq!(container.config["tags"], json!("burrow;workspace;base"));

        let stored = harness.storage.get_workspace(&record.id).unwrap().unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn test_create_uses_default_template() {
        let (harness, backend, template) = setup().await;
        harness
            .storage
            .set_default_template("u1", &template.id)
            .unwrap();

        let record = backend.create(&request(None), &NoopProgress).await.unwrap();
        assert_eq!(record.template_id, Some(template.id));
    }

    #[tokio::test]
    async fn test_create_without_template_or_default() {
        let (_harness, backend, _template) = setup().await;
        let err = backend
            .create(&request(None), &NoopProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_boot_rolls_back() {
        let (harness, backend, template) = setup().await;
        harness.api.fail_next_task("vzstart", "startup for container '501' failed");

        let err = backend
            .create(&request(Some(template.id)), &NoopProgress)
            .await
            .unwrap_err();
        assert_eq!(err.step(), Some("start"));
        assert!(harness.api.container(501).is_none());
        assert!(backend.list().unwrap().is_empty());
        let next = backend.ctx.allocator.peek(VmidKind::Workspace).await.unwrap();
        assert_eq!(next, 501);
    }

    #[tokio::test]
    async fn test_lifecycle_inspect_stop_start_destroy() {
        let (harness, backend, template) = setup().await;
        let record = backend
            .create(&request(Some(template.id)), &NoopProgress)
            .await
            .unwrap();

        let info = backend.inspect(&record.id).await.unwrap();
        assert_eq!(info.state, ContainerState::Running);
        assert_eq!(info.ip, Some(fake_ip(501)));

        backend.stop(&record.id).await.unwrap();
        let info = backend.inspect(&record.id).await.unwrap();
        assert_eq!(info.state, ContainerState::Stopped);
        assert_eq!(info.ip, None);

        let err = backend
            .exec(&record.id, &CommandSpec::argv(["ls"]), &ExecOptions::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Validation(_)));

        backend.start(&record.id).await.unwrap();
        assert_eq!(
            backend.inspect(&record.id).await.unwrap().state,
            ContainerState::Running
        );

        backend.destroy(&record.id).await.unwrap();
        assert!(harness.api.container(501).is_none());
        assert!(matches!(
            backend.inspect(&record.id).await.unwrap_err(),
            ProvisionError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_exec_routes_to_container_address() {
        let (harness, backend, template) = setup().await;
        let record = backend
            .create(&request(Some(template.id)), &NoopProgress)
            .await
            .unwrap();
        harness.executor.respond("uname", "Linux\n");

        let output = backend
            .exec(
                &record.id,
                &CommandSpec::argv(["uname", "-s"]),
                &ExecOptions::default(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(output.stdout, "Linux\n");
        assert!(harness
            .executor
            .commands_for(&fake_ip(501))
            .iter()
            .any(|c| c.contains("uname -s")));
    }

    #[tokio::test]
    async fn test_open_stream_reaches_workspace() {
        let (harness, backend, template) = setup().await;
        let record = backend
            .create(&request(Some(template.id)), &NoopProgress)
            .await
            .unwrap();

        let mut stream = backend
            .open_stream(&record.id, &StreamRequest::shell())
            .await
            .unwrap();
        stream.write(b"pwd\n".to_vec()).await.unwrap();
        assert_eq!(stream.recv().await, Some(StreamChunk::Stdout(b"pwd\n".to_vec())));
        stream.close().await.unwrap();

        assert_eq!(harness.executor.streams(), vec![(fake_ip(501), None)]);
    }

    #[tokio::test]
    async fn test_stale_template_is_reported_missing() {
        let (harness, backend, template) = setup().await;
        harness
            .api
            .delete_container("pve", template.vmid.unwrap(), Default::default())
            .await
            .unwrap();

        let err = backend
            .create(&request(Some(template.id.clone())), &NoopProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::NotFound(_)));
        assert!(harness.storage.get_template(&template.id).unwrap().is_none());
    }
}

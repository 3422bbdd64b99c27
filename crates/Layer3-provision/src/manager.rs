//! Template lifecycle
//!
//! `pending -> creating -> staging | ready`, with `error` reachable from any
//! in-progress state. A build either creates a container from an OS image or
//! fully clones a ready parent template, then boots it, provisions it over
//! SSH and converts it to a hypervisor template. With `stop_at_staging` the
//! container is left running for manual changes until [`TemplateManager::finalize_template`].
//!
//! Failures before finalization destroy the partially built container and
//! leave the record in `error` with the causal message.

use crate::allocator::VmidKind;
use crate::context::{hostname_for, ProvisionContext};
use crate::error::{ProvisionError, Result, StepContext};
use burrow_foundation::{sanitize_tags, ProgressSink, Template, TemplateStatus};
use burrow_proxmox::types::parse_property_string;
use burrow_proxmox::{CloneParams, ContainerConfig, ContainerState, CreateContainerParams};
use burrow_stack::{cleanup_script, core_packages_script, install_script_for};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Input for a new template
#[derive(Debug, Clone, Default)]
pub struct CreateTemplateRequest {
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
    /// Stacks to install on top of whatever the parent has
    pub tech_stacks: Vec<String>,
    pub parent_template_id: Option<String>,
    /// Appliance name prefix or full volume id; fresh builds only
    pub os_template: Option<String>,
    pub build: BuildOptions,
}

/// Per-build knobs that are not persisted
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Leave the container running at `staging`
    pub stop_at_staging: bool,
    /// Root disk size; grows a clone when larger than the parent's
    pub disk_gb: Option<u32>,
}

pub struct TemplateManager {
    ctx: Arc<ProvisionContext>,
}

impl TemplateManager {
    pub fn new(ctx: Arc<ProvisionContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<ProvisionContext> {
        &self.ctx
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn list_templates(&self, user_id: Option<&str>) -> Result<Vec<Template>> {
        Ok(self.ctx.records.list_templates(user_id)?)
    }

    pub fn get_template(&self, id: &str) -> Result<Template> {
        self.ctx
            .records
            .get_template(id)?
            .ok_or_else(|| ProvisionError::NotFound(format!("template {}", id)))
    }

    pub fn default_template(&self, user_id: &str) -> Result<Option<Template>> {
        Ok(self
            .ctx
            .records
            .list_templates(Some(user_id))?
            .into_iter()
            .find(|t| t.is_default))
    }

    /// Look up a template, clearing the record if its container has vanished
    ///
    /// Only `ready` templates are checked against the hypervisor; a missing
    /// container removes the record and reports the template as absent.
    pub async fn resolve_template(&self, id: &str) -> Result<Option<Template>> {
        let Some(template) = self.ctx.records.get_template(id)? else {
            return Ok(None);
        };
        let (TemplateStatus::Ready, Some(vmid)) = (template.status, template.vmid) else {
            return Ok(Some(template));
        };

        let node = self.node_of(&template);
        match self.ctx.api.get_container_status(&node, vmid).await {
            Ok(_) => Ok(Some(template)),
            Err(e) if e.is_not_found() => {
                let stale = ProvisionError::StaleRecord {
                    template_id: template.id.clone(),
                    vmid,
                };
                warn!(error = %stale, "Clearing stale template record");
                self.ctx.records.delete_template(&template.id)?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parent, grandparent, ... starting at `parent_id`
    pub fn ancestor_chain(&self, parent_id: &str) -> Result<Vec<Template>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(parent_id.to_string());
        while let Some(id) = next {
            if !seen.insert(id.clone()) {
                return Err(ProvisionError::Validation(format!(
                    "template ancestry loops back to {}",
                    id
                )));
            }
            let template = self.get_template(&id)?;
            next = template.parent_template_id.clone();
            chain.push(template);
        }
        Ok(chain)
    }

    // ========================================================================
    // Create
    // ========================================================================

    /// Validate and persist a `pending` template without building it
    pub fn register(&self, request: &CreateTemplateRequest) -> Result<Template> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(ProvisionError::Validation("template name is required".into()));
        }

        let mut stacks: Vec<String> = Vec::new();
        for id in &request.tech_stacks {
            let id = id.trim();
            if !id.is_empty() && !stacks.iter().any(|s| s == id) {
                stacks.push(id.to_string());
            }
        }
        self.ctx.stacks.resolve(&stacks)?;

        let mut template = Template::new(request.user_id.clone(), name).with_tech_stacks(stacks);
        template.description = request.description.clone();
        template.os_template = request.os_template.clone();

        if let Some(parent_id) = &request.parent_template_id {
            let chain = self.ancestor_chain(parent_id)?;
            let parent = &chain[0];
            if parent.status != TemplateStatus::Ready || parent.vmid.is_none() {
                return Err(ProvisionError::InvalidState {
                    template_id: parent.id.clone(),
                    status: parent.status.to_string(),
                    expected: TemplateStatus::Ready.to_string(),
                });
            }
            template = template.with_parent(parent.id.clone());
            template.inherited_tech_stacks =
                self.ctx.stacks.resolve_ids(&parent.all_tech_stacks())?;
            template.os_template = parent.os_template.clone();
        }

        self.ctx.records.save_template(&template)?;
        info!(template_id = %template.id, name = %template.name, stacks = ?template.tech_stacks, "Template registered");
        Ok(template)
    }

    /// Register and build in one go
    pub async fn create_template(
        &self,
        request: CreateTemplateRequest,
        sink: &dyn ProgressSink,
    ) -> Result<Template> {
        sink.report("validate", 5, "Validating template");
        let template = self.register(&request)?;
        self.build(template, request.build, sink).await
    }

    /// Build a template that is still `pending`
    pub async fn build_template(
        &self,
        id: &str,
        options: BuildOptions,
        sink: &dyn ProgressSink,
    ) -> Result<Template> {
        let template = self.get_template(id)?;
        if template.status != TemplateStatus::Pending {
            return Err(invalid_state(&template, TemplateStatus::Pending));
        }
        self.build(template, options, sink).await
    }

    /// Start a fresh attempt for a template in `error`
    pub async fn retry_template(
        &self,
        id: &str,
        options: BuildOptions,
        sink: &dyn ProgressSink,
    ) -> Result<Template> {
        let mut template = self.get_template(id)?;
        if template.status != TemplateStatus::Error {
            return Err(invalid_state(&template, TemplateStatus::Error));
        }
        let resource = resource(&template);

        // a failed finalize leaves its container behind
        if let Some(vmid) = template.vmid {
            let node = self.node_of(&template);
            self.ctx.destroy(&node, vmid).await.step(&resource, "cleanup")?;
        }

        template.reset_for_retry()?;
        self.ctx.records.save_template(&template)?;
        info!(template_id = %template.id, "Retrying template build");
        self.build(template, options, sink).await
    }

    async fn build(
        &self,
        mut template: Template,
        options: BuildOptions,
        sink: &dyn ProgressSink,
    ) -> Result<Template> {
        let resource = resource(&template);
        template.transition(TemplateStatus::Creating)?;
        self.ctx.records.save_template(&template)?;
        info!(template_id = %template.id, name = %template.name, "Building template");

        let ip = match self.provision(&mut template, options, sink, &resource).await {
            Ok(ip) => ip,
            Err(e) => return Err(self.fail(template, e, sink, true).await),
        };

        if options.stop_at_staging {
            template.transition(TemplateStatus::Staging)?;
            template.staging_container_ip = Some(ip.clone());
            self.ctx.records.save_template(&template)?;
            info!(template_id = %template.id, ip = %ip, "Template staged for manual changes");
            sink.report(
                "staging",
                100,
                &format!("Container is running at {} and ready for changes", ip),
            );
            return Ok(template);
        }

        match self.seal(&mut template, &ip, sink, &resource).await {
            Ok(()) => Ok(template),
            Err(e) => Err(self.fail(template, e, sink, true).await),
        }
    }

    /// Create or clone, boot and install; returns the container address
    async fn provision(
        &self,
        template: &mut Template,
        options: BuildOptions,
        sink: &dyn ProgressSink,
        resource: &str,
    ) -> Result<String> {
        let nesting = self
            .ctx
            .stacks
            .requires_nesting(&template.tech_stacks)
            .step(resource, "validate")?;

        let parent = match &template.parent_template_id {
            Some(parent_id) => Some(self.get_template(parent_id).step(resource, "validate")?),
            None => None,
        };

        let vmid = match &parent {
            Some(parent) => {
                self.clone_parent(template, parent, nesting, options, sink, resource)
                    .await?
            }
            None => {
                self.create_fresh(template, nesting, options, sink, resource)
                    .await?
            }
        };
        let node = self.node_of(template);

        sink.report("start", 35, "Starting container");
        self.ctx.start(&node, vmid).await.step(resource, "start")?;

        sink.report("network", 45, "Waiting for network");
        let ip = self.ctx.wait_network(&node, vmid).await.step(resource, "network")?;

        sink.report("ssh", 50, &format!("Waiting for SSH on {}", ip));
        let target = self.ctx.wait_ssh(&ip).await.step(resource, "ssh")?;

        if parent.is_none() {
            sink.report("core", 55, "Installing core packages");
            self.ctx
                .run_script(vmid, &target, &core_packages_script(), sink)
                .await
                .step(resource, "core")?;
        }

        let inherited: HashSet<String> = self
            .ctx
            .stacks
            .resolve_ids(&template.inherited_tech_stacks)
            .step(resource, "stacks")?
            .into_iter()
            .collect();
        let pending: Vec<_> = self
            .ctx
            .stacks
            .resolve(&template.tech_stacks)
            .step(resource, "stacks")?
            .into_iter()
            .filter(|d| !inherited.contains(&d.id))
            .collect();
        if !pending.is_empty() {
            let ids: Vec<&str> = pending.iter().map(|d| d.id.as_str()).collect();
            sink.report("stacks", 65, &format!("Installing {}", ids.join(", ")));
            self.ctx
                .run_script(vmid, &target, &install_script_for(&pending), sink)
                .await
                .step(resource, "stacks")?;
        }

        Ok(ip)
    }

    async fn create_fresh(
        &self,
        template: &mut Template,
        nesting: bool,
        options: BuildOptions,
        sink: &dyn ProgressSink,
        resource: &str,
    ) -> Result<u32> {
        let node = self.ctx.node().to_string();
        let defaults = &self.ctx.settings.defaults;
        let os_template = template
            .os_template
            .clone()
            .unwrap_or_else(|| defaults.os_template.clone());

        sink.report("image", 15, &format!("Checking OS image {}", os_template));
        let ostemplate = self
            .ensure_base_image(&node, &os_template, sink)
            .await
            .step(resource, "image")?;

        sink.report("create", 20, "Creating container");
        let base = CreateContainerParams {
            ostemplate,
            hostname: hostname_for(&template.name, "burrow-template"),
            storage: defaults.storage.clone(),
            disk_gb: options.disk_gb.unwrap_or(defaults.disk_gb),
            memory_mb: defaults.memory_mb,
            swap_mb: defaults.swap_mb,
            cores: defaults.cores,
            net0: defaults.net0(),
            unprivileged: true,
            nesting,
            ssh_public_keys: self.ctx.settings.authorized_keys(),
            password: self.ctx.settings.root_password.clone(),
            description: Some(format!("Burrow template: {}", template.name)),
            tags: Some(template_tags(template)),
            ..Default::default()
        };
        let (vmid, upid) = self
            .ctx
            .allocator
            .allocate_with(VmidKind::Template, |vmid| {
                let api = self.ctx.api.clone();
                let node = node.clone();
                let params = CreateContainerParams {
                    vmid,
                    ..base.clone()
                };
                async move {
                    api.create_container(&node, &params)
                        .await
                        .map_err(ProvisionError::from)
                }
            })
            .await
            .step(resource, "create")?;

        self.record_container(template, vmid, &node, &defaults.storage)
            .step(resource, "create")?;
        self.ctx.allocator.release(vmid).await;
        info!(template_id = %template.id, vmid, nesting, "Container created");
        self.ctx
            .wait_task(&upid, self.ctx.timeouts.task)
            .await
            .step(resource, "create")?;
        Ok(vmid)
    }

    async fn clone_parent(
        &self,
        template: &mut Template,
        parent: &Template,
        nesting: bool,
        options: BuildOptions,
        sink: &dyn ProgressSink,
        resource: &str,
    ) -> Result<u32> {
        let parent_vmid = parent
            .vmid
            .ok_or_else(|| invalid_state(parent, TemplateStatus::Ready))
            .step(resource, "clone")?;
        let node = self.node_of(parent);
        let storage = self.ctx.settings.defaults.storage.clone();

        sink.report("clone", 20, &format!("Cloning template {}", parent.name));
        let base = CloneParams {
            hostname: hostname_for(&template.name, "burrow-template"),
            full: true,
            storage: Some(storage.clone()),
            description: Some(format!("Burrow template: {}", template.name)),
            ..Default::default()
        };
        let (vmid, upid) = self
            .ctx
            .allocator
            .allocate_with(VmidKind::Template, |vmid| {
                let api = self.ctx.api.clone();
                let node = node.clone();
                let params = CloneParams {
                    newid: vmid,
                    ..base.clone()
                };
                async move {
                    api.clone_container(&node, parent_vmid, &params)
                        .await
                        .map_err(ProvisionError::from)
                }
            })
            .await
            .step(resource, "clone")?;

        self.record_container(template, vmid, &node, &storage)
            .step(resource, "clone")?;
        self.ctx.allocator.release(vmid).await;
        info!(template_id = %template.id, vmid, parent_vmid, "Container cloned");
        self.ctx
            .wait_task(&upid, self.ctx.timeouts.task)
            .await
            .step(resource, "clone")?;

        sink.report("configure", 28, "Configuring clone");
        let config = self
            .ctx
            .api
            .get_container_config(&node, vmid)
            .await
            .step(resource, "configure")?;
        let mut updates = vec![("tags", template_tags(template))];
        if nesting && !config.nesting_enabled() {
            // the clone endpoint takes no feature flags
            updates.push(("features", features_with_nesting(&config)));
        }
        self.ctx
            .api
            .update_container_config(&node, vmid, &updates)
            .await
            .step(resource, "configure")?;

        if let Some(disk_gb) = options.disk_gb {
            if rootfs_size_gb(&config).map_or(true, |current| disk_gb > current) {
                sink.report("resize", 30, &format!("Growing root disk to {}G", disk_gb));
                let task = self
                    .ctx
                    .api
                    .resize_container(&node, vmid, "rootfs", &format!("{}G", disk_gb))
                    .await
                    .step(resource, "resize")?;
                if let Some(upid) = task {
                    self.ctx
                        .wait_task(&upid, self.ctx.timeouts.task)
                        .await
                        .step(resource, "resize")?;
                }
            }
        }
        Ok(vmid)
    }

    /// Volume id of the OS image, downloading it from the appliance catalog
    /// when template storage does not have it yet
    async fn ensure_base_image(
        &self,
        node: &str,
        os_template: &str,
        sink: &dyn ProgressSink,
    ) -> Result<String> {
        if os_template.contains(':') {
            return Ok(os_template.to_string());
        }
        let storage = &self.ctx.settings.defaults.template_storage;

        let present = self
            .ctx
            .api
            .list_storage_templates(node, storage)
            .await?
            .into_iter()
            .filter(|c| c.file_name().starts_with(os_template))
            .map(|c| c.volid)
            .max();
        if let Some(volid) = present {
            return Ok(volid);
        }

        let appliance = self
            .ctx
            .api
            .list_appliances(node)
            .await?
            .into_iter()
            .map(|a| a.template)
            .filter(|name| name.starts_with(os_template))
            .max()
            .ok_or_else(|| {
                ProvisionError::NotFound(format!("no appliance image matches {}", os_template))
            })?;

        sink.report("image", 15, &format!("Downloading {}", appliance));
        info!(node, storage = %storage, appliance = %appliance, "Downloading OS image");
        let upid = self
            .ctx
            .api
            .download_appliance(node, storage, &appliance)
            .await?;
        self.ctx.wait_task(&upid, self.ctx.timeouts.download).await?;
        Ok(format!("{}:vztmpl/{}", storage, appliance))
    }

    // ========================================================================
    // Finalize
    // ========================================================================

    /// Turn a staged container into a template
    ///
    /// A failure here marks the template `error` but keeps the container so
    /// manual changes are not lost; retry or delete cleans it up.
    pub async fn finalize_template(&self, id: &str, sink: &dyn ProgressSink) -> Result<Template> {
        let mut template = self.get_template(id)?;
        if template.status != TemplateStatus::Staging {
            return Err(invalid_state(&template, TemplateStatus::Staging));
        }
        let resource = resource(&template);
        info!(template_id = %template.id, "Finalizing staged template");

        let ip = match self.staged_address(&template, sink, &resource).await {
            Ok(ip) => ip,
            Err(e) => return Err(self.fail(template, e, sink, false).await),
        };
        match self.seal(&mut template, &ip, sink, &resource).await {
            Ok(()) => Ok(template),
            Err(e) => Err(self.fail(template, e, sink, false).await),
        }
    }

    /// Address of a staged container, restarting it if someone stopped it
    async fn staged_address(
        &self,
        template: &Template,
        sink: &dyn ProgressSink,
        resource: &str,
    ) -> Result<String> {
        let vmid = template
            .vmid
            .ok_or_else(|| invalid_state(template, TemplateStatus::Staging))?;
        let node = self.node_of(template);

        let status = self
            .ctx
            .api
            .get_container_status(&node, vmid)
            .await
            .step(resource, "finalize")?;
        if status.status == ContainerState::Running {
            if let Some(ip) = &template.staging_container_ip {
                return Ok(ip.clone());
            }
        } else {
            sink.report("start", 80, "Starting staged container");
            self.ctx.start(&node, vmid).await.step(resource, "start")?;
        }
        let ip = self.ctx.wait_network(&node, vmid).await.step(resource, "network")?;
        self.ctx.wait_ssh(&ip).await.step(resource, "ssh")?;
        Ok(ip)
    }

    /// Cleanup, shut down, convert, mark ready
    async fn seal(
        &self,
        template: &mut Template,
        ip: &str,
        sink: &dyn ProgressSink,
        resource: &str,
    ) -> Result<()> {
        let vmid = template
            .vmid
            .ok_or_else(|| invalid_state(template, TemplateStatus::Creating))?;
        let node = self.node_of(template);

        sink.report("cleanup", 88, "Cleaning up container");
        let target = self.ctx.settings.container_target(ip);
        self.ctx
            .run_script(vmid, &target, &cleanup_script(), sink)
            .await
            .step(resource, "cleanup")?;

        sink.report("shutdown", 92, "Shutting down container");
        self.ctx.shutdown(&node, vmid).await.step(resource, "shutdown")?;

        sink.report("convert", 96, "Converting to template");
        self.ctx
            .api
            .convert_to_template(&node, vmid)
            .await
            .step(resource, "convert")?;

        template.transition(TemplateStatus::Ready)?;
        template.staging_container_ip = None;
        template.error_message = None;
        self.ctx.records.save_template(template)?;
        info!(template_id = %template.id, vmid, "Template ready");
        sink.report("ready", 100, &format!("Template {} is ready", template.name));
        Ok(())
    }

    // ========================================================================
    // Delete / default
    // ========================================================================

    /// Remove a template and its container; refused while children exist
    pub async fn delete_template(&self, id: &str) -> Result<()> {
        let template = self.get_template(id)?;
        let resource = resource(&template);

        let children = self.ctx.records.child_templates(id)?;
        if !children.is_empty() {
            return Err(ProvisionError::HasChildren {
                template_id: id.to_string(),
                children: children.len(),
            });
        }
        if template.status == TemplateStatus::Creating {
            return Err(ProvisionError::InvalidState {
                template_id: id.to_string(),
                status: template.status.to_string(),
                expected: "not building".to_string(),
            });
        }

        if let Some(vmid) = template.vmid {
            let node = self.node_of(&template);
            self.ctx.destroy(&node, vmid).await.step(&resource, "delete")?;
        }
        self.ctx.records.delete_template(id)?;
        info!(template_id = %id, "Template deleted");
        Ok(())
    }

    /// Make `id` the user's only default template
    pub fn set_default_template(&self, user_id: &str, id: &str) -> Result<Template> {
        let template = self.get_template(id)?;
        if template.user_id != user_id {
            return Err(ProvisionError::NotFound(format!("template {}", id)));
        }
        if template.status != TemplateStatus::Ready {
            return Err(invalid_state(&template, TemplateStatus::Ready));
        }
        self.ctx.records.set_default_template(user_id, id)?;
        self.get_template(id)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn node_of(&self, template: &Template) -> String {
        template
            .node
            .clone()
            .unwrap_or_else(|| self.ctx.node().to_string())
    }

    /// Persist the claimed container so rollback and delete can find it
    fn record_container(
        &self,
        template: &mut Template,
        vmid: u32,
        node: &str,
        storage: &str,
    ) -> Result<()> {
        template.vmid = Some(vmid);
        template.node = Some(node.to_string());
        template.storage = Some(storage.to_string());
        self.ctx.records.save_template(template)?;
        Ok(())
    }

    /// Record the failure; returns the error for the caller to propagate
    async fn fail(
        &self,
        mut template: Template,
        err: ProvisionError,
        sink: &dyn ProgressSink,
        rollback: bool,
    ) -> ProvisionError {
        error!(template_id = %template.id, step = err.step().unwrap_or("-"), error = %err, "Template build failed");

        if rollback {
            if let Some(vmid) = template.vmid {
                sink.report("rollback", 100, &format!("Removing container {}", vmid));
                let node = self.node_of(&template);
                self.ctx.rollback(&node, vmid).await;
                self.ctx.allocator.release(vmid).await;
                template.vmid = None;
                template.node = None;
                template.storage = None;
            }
        }

        if let Err(e) = template.transition(TemplateStatus::Error) {
            warn!(template_id = %template.id, error = %e, "Unexpected status on failure");
            template.status = TemplateStatus::Error;
        }
        template.staging_container_ip = None;
        template.error_message = Some(err.to_string());
        if let Err(e) = self.ctx.records.save_template(&template) {
            error!(template_id = %template.id, error = %e, "Could not record template failure");
        }
        sink.report("error", 100, &err.to_string());
        err
    }
}

fn resource(template: &Template) -> String {
    format!("template {}", template.id)
}

fn invalid_state(template: &Template, expected: TemplateStatus) -> ProvisionError {
    ProvisionError::InvalidState {
        template_id: template.id.clone(),
        status: template.status.to_string(),
        expected: expected.to_string(),
    }
}

fn template_tags(template: &Template) -> String {
    sanitize_tags(["burrow", "template", template.name.as_str()])
}

/// `features` value with `nesting=1` added to whatever was set
fn features_with_nesting(config: &ContainerConfig) -> String {
    let mut features: Vec<(String, String)> = config
        .features()
        .into_iter()
        .filter(|(k, _)| k != "nesting")
        .collect();
    features.sort();
    features.push(("nesting".to_string(), "1".to_string()));
    features
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Current root disk size in whole GB, from `rootfs: vol,size=16G`
fn rootfs_size_gb(config: &ContainerConfig) -> Option<u32> {
    let rootfs = config.get("rootfs")?;
    let size = parse_property_string(&rootfs).remove("size")?;
    let size = size.trim();
    let units = [
        ("T", 1.0 / 1024.0),
        ("G", 1.0),
        ("M", 1024.0),
        ("K", 1024.0 * 1024.0),
    ];
    let (number, per_gb) = units
        .into_iter()
        .find_map(|(unit, per_gb)| size.strip_suffix(unit).map(|n| (n, per_gb)))?;
    let number: f64 = number.parse().ok()?;
    Some((number / per_gb).ceil() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_ip, Harness, StepLog};
    use burrow_foundation::{NoopProgress, RecordStore};
    use burrow_proxmox::{FakeContainer, HypervisorApi};
    use serde_json::json;
    use std::collections::HashMap;

    fn manager(harness: &Harness) -> TemplateManager {
        TemplateManager::new(harness.ctx.clone())
    }

    fn request(name: &str, stacks: &[&str]) -> CreateTemplateRequest {
        CreateTemplateRequest {
            user_id: "u1".into(),
            name: name.into(),
            tech_stacks: stacks.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_fresh_docker_template_enables_nesting() {
        let harness = Harness::new();
        let log = StepLog::default();

        let template = manager(&harness)
            .create_template(request("Docker Box", &["docker"]), &log)
            .await
            .unwrap();

        assert_eq!(template.status, TemplateStatus::Ready);
        let vmid = template.vmid.unwrap();
        assert_eq!(vmid, 500);

        let container = harness.api.container(vmid).unwrap();
        assert!(container.nesting_enabled());
        assert!(container.template);
        assert_eq!(container.state, ContainerState::Stopped);
        assert_eq!(
            container.config["tags"],
            json!("burrow;template;docker-box")
        );

        let stored = harness.storage.get_template(&template.id).unwrap().unwrap();
        assert_eq!(stored.status, TemplateStatus::Ready);
        assert!(stored.staging_container_ip.is_none());

        let scripts: Vec<String> = harness
            .executor
            .commands_for(&fake_ip(vmid))
            .into_iter()
            .filter_map(|c| c.script)
            .collect();
        assert_eq!(scripts.len(), 3);
        assert!(scripts[0].contains("openssh-server"));
        assert!(scripts[1].contains("get.docker.com"));
        assert!(scripts[2].contains("apt-get clean"));

        assert_eq!(log.last(), Some(("ready".to_string(), 100)));
        let steps = log.steps();
        let start = steps.iter().position(|s| s == "start").unwrap();
        let network = steps.iter().position(|s| s == "network").unwrap();
        assert!(start < network);
    }

    #[tokio::test]
    async fn test_plain_stack_does_not_enable_nesting() {
        let harness = Harness::new();
        let template = manager(&harness)
            .create_template(request("node", &["claude"]), &NoopProgress)
            .await
            .unwrap();
        let container = harness.api.container(template.vmid.unwrap()).unwrap();
        assert!(!container.nesting_enabled());
    }

    #[tokio::test]
    async fn test_failing_script_rolls_back() {
        let harness = Harness::new();
        harness
            .executor
            .fail_on("@anthropic-ai/claude-code", 1, "npm ERR! network timeout\n");
        let manager = manager(&harness);

        let err = manager
            .create_template(request("agent", &["claude"]), &NoopProgress)
            .await
            .unwrap_err();
        assert_eq!(err.step(), Some("stacks"));
        assert!(matches!(err.root(), ProvisionError::Provisioning { .. }));

        assert!(harness.api.container_ids().is_empty());
        let templates = manager.list_templates(Some("u1")).unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].status, TemplateStatus::Error);
        assert!(templates[0].vmid.is_none());
        let message = templates[0].error_message.as_deref().unwrap();
        assert!(message.contains("npm ERR!"));
    }

    #[tokio::test]
    async fn test_failed_create_task_rolls_back() {
        let harness = Harness::new();
        harness
            .api
            .fail_next_task("vzcreate", "unable to create CT 500 - storage full");

        let err = manager(&harness)
            .create_template(request("t", &[]), &NoopProgress)
            .await
            .unwrap_err();
        assert_eq!(err.step(), Some("create"));
        assert!(harness.api.container_ids().is_empty());
        let next = harness.ctx.allocator.peek(VmidKind::Template).await.unwrap();
        assert_eq!(next, 500);
    }

    #[tokio::test]
    async fn test_unknown_stack_is_rejected_before_anything_is_saved() {
        let harness = Harness::new();
        let manager = manager(&harness);
        let err = manager
            .create_template(request("t", &["cobol"]), &NoopProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Stack(_)));
        assert!(manager.list_templates(None).unwrap().is_empty());
        assert!(harness.api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_downloads_missing_image() {
        let harness = Harness::new();
        let manager = manager(&harness);
        harness.api.add_appliance("alpine-3.20-default_20240908_amd64.tar.xz");
        harness.api.add_appliance("alpine-3.19-default_20240207_amd64.tar.xz");

        let mut req = request("alpine", &[]);
        req.os_template = Some("alpine".into());
        let template = manager.create_template(req, &NoopProgress).await.unwrap();

        assert!(harness.api.calls().contains(&"download 0".to_string()));
        let container = harness.api.container(template.vmid.unwrap()).unwrap();
        assert_eq!(
            container.config["ostemplate"],
            json!("local:vztmpl/alpine-3.20-default_20240908_amd64.tar.xz")
        );
    }

    #[tokio::test]
    async fn test_staging_then_finalize() {
        let harness = Harness::new();
        let manager = manager(&harness);
        let mut req = request("staged", &["python"]);
        req.build.stop_at_staging = true;

        let staged = manager.create_template(req, &NoopProgress).await.unwrap();
        assert_eq!(staged.status, TemplateStatus::Staging);
        let vmid = staged.vmid.unwrap();
        assert_eq!(staged.staging_container_ip.as_deref(), Some(fake_ip(vmid).as_str()));
        assert_eq!(harness.api.container(vmid).unwrap().state, ContainerState::Running);

        let ready = manager.finalize_template(&staged.id, &NoopProgress).await.unwrap();
        assert_eq!(ready.status, TemplateStatus::Ready);
        assert!(ready.staging_container_ip.is_none());
        assert!(harness.api.container(vmid).unwrap().template);
    }

    #[tokio::test]
    async fn test_finalize_failure_keeps_container() {
        let harness = Harness::new();
        let manager = manager(&harness);
        let mut req = request("staged", &[]);
        req.build.stop_at_staging = true;
        let staged = manager.create_template(req, &NoopProgress).await.unwrap();
        let vmid = staged.vmid.unwrap();

        harness.executor.fail_on("apt-get clean", 2, "disk full");
        let err = manager
            .finalize_template(&staged.id, &NoopProgress)
            .await
            .unwrap_err();
        assert_eq!(err.step(), Some("cleanup"));

        let stored = manager.get_template(&staged.id).unwrap();
        assert_eq!(stored.status, TemplateStatus::Error);
        assert_eq!(stored.vmid, Some(vmid));
        assert!(harness.api.container(vmid).is_some());

        // retry clears the leftover container and builds again
        harness.executor.clear_rules();
        let retried = manager
            .retry_template(&staged.id, BuildOptions::default(), &NoopProgress)
            .await
            .unwrap();
        assert_eq!(retried.status, TemplateStatus::Ready);
        assert!(retried.error_message.is_none());
        assert_eq!(harness.api.container_ids(), vec![retried.vmid.unwrap()]);
        assert!(harness.api.container(retried.vmid.unwrap()).unwrap().template);
    }

    #[tokio::test]
    async fn test_finalize_requires_staging() {
        let harness = Harness::new();
        let manager = manager(&harness);
        let template = manager
            .create_template(request("t", &[]), &NoopProgress)
            .await
            .unwrap();
        let err = manager
            .finalize_template(&template.id, &NoopProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_clone_installs_only_new_stacks() {
        let harness = Harness::new();
        let manager = manager(&harness);
        let parent = manager
            .create_template(request("node", &["nodejs"]), &NoopProgress)
            .await
            .unwrap();

        let mut req = request("node-docker", &["claude", "docker"]);
        req.parent_template_id = Some(parent.id.clone());
        req.build.disk_gb = Some(32);
        let child = manager.create_template(req, &NoopProgress).await.unwrap();

        assert_eq!(child.status, TemplateStatus::Ready);
        assert_eq!(child.inherited_tech_stacks, vec!["nodejs"]);
        assert_eq!(child.all_tech_stacks(), vec!["nodejs", "claude", "docker"]);

        let child_vmid = child.vmid.unwrap();
        assert!(harness
            .api
            .calls()
            .contains(&format!("clone {}", parent.vmid.unwrap())));
        let container = harness.api.container(child_vmid).unwrap();
        assert!(container.nesting_enabled());
        assert_eq!(
            container.config["rootfs"],
            json!(format!("local-lvm:vm-{}-disk-0,size=32G", child_vmid))
        );

        let scripts: Vec<String> = harness
            .executor
            .commands_for(&fake_ip(child_vmid))
            .into_iter()
            .filter_map(|c| c.script)
            .collect();
        assert_eq!(scripts.len(), 2);
        assert!(!scripts[0].contains("openssh-server"));
        assert!(!scripts[0].contains("deb.nodesource.com"));
        assert!(scripts[0].contains("@anthropic-ai/claude-code"));
        assert!(scripts[0].contains("get.docker.com"));
    }

    #[tokio::test]
    async fn test_clone_skips_dependencies_of_inherited_stacks() {
        let harness = Harness::new();
        let manager = manager(&harness);
        let parent = manager
            .create_template(request("claude", &["claude"]), &NoopProgress)
            .await
            .unwrap();

        let mut req = request("claude-codex", &["codex"]);
        req.parent_template_id = Some(parent.id.clone());
        let child = manager.create_template(req, &NoopProgress).await.unwrap();

        assert_eq!(child.inherited_tech_stacks, vec!["nodejs", "claude"]);
        let scripts: Vec<String> = harness
            .executor
            .commands_for(&fake_ip(child.vmid.unwrap()))
            .into_iter()
            .filter_map(|c| c.script)
            .collect();
        assert!(scripts.iter().any(|s| s.contains("@openai/codex")));
        assert!(scripts.iter().all(|s| !s.contains("deb.nodesource.com")));
        assert!(scripts.iter().all(|s| !s.contains("@anthropic-ai/claude-code")));
    }

    #[tokio::test]
    async fn test_clone_requires_ready_parent() {
        let harness = Harness::new();
        let manager = manager(&harness);
        let mut parent_req = request("parent", &[]);
        parent_req.build.stop_at_staging = true;
        let parent = manager.create_template(parent_req, &NoopProgress).await.unwrap();

        let mut req = request("child", &[]);
        req.parent_template_id = Some(parent.id);
        let err = manager.create_template(req, &NoopProgress).await.unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_ancestry_cycle_is_rejected() {
        let harness = Harness::new();
        let mut a = Template::new("u1", "a");
        let mut b = Template::new("u1", "b");
        a.parent_template_id = Some(b.id.clone());
        b.parent_template_id = Some(a.id.clone());
        for t in [&mut a, &mut b] {
            t.status = TemplateStatus::Ready;
            t.vmid = Some(600);
        }
        harness.storage.save_template(&a).unwrap();
        harness.storage.save_template(&b).unwrap();

        let mut req = request("c", &[]);
        req.parent_template_id = Some(a.id.clone());
        let err = manager(&harness)
            .create_template(req, &NoopProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Validation(_)));
    }

    #[tokio::test]
    async fn test_delete_rejects_parent_with_children() {
        let harness = Harness::new();
        let manager = manager(&harness);
        let parent = manager
            .create_template(request("parent", &[]), &NoopProgress)
            .await
            .unwrap();
        let mut req = request("child", &[]);
        req.parent_template_id = Some(parent.id.clone());
        let child = manager.create_template(req, &NoopProgress).await.unwrap();

        let err = manager.delete_template(&parent.id).await.unwrap_err();
        assert!(matches!(err, ProvisionError::HasChildren { children: 1, .. }));

        manager.delete_template(&child.id).await.unwrap();
        assert!(harness.api.container(child.vmid.unwrap()).is_none());
        manager.delete_template(&parent.id).await.unwrap();
        assert!(manager.list_templates(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_container() {
        let harness = Harness::new();
        let manager = manager(&harness);
        let template = manager
            .create_template(request("t", &[]), &NoopProgress)
            .await
            .unwrap();
        let vmid = template.vmid.unwrap();
        harness
            .api
            .delete_container("pve", vmid, Default::default())
            .await
            .unwrap();

        manager.delete_template(&template.id).await.unwrap();
        assert!(manager.get_template(&template.id).is_err());
    }

    #[tokio::test]
    async fn test_resolve_clears_stale_record() {
        let harness = Harness::new();
        let manager = manager(&harness);
        let mut stale = Template::new("u1", "gone");
        stale.status = TemplateStatus::Ready;
        stale.vmid = Some(777);
        harness.storage.save_template(&stale).unwrap();

        assert!(manager.resolve_template(&stale.id).await.unwrap().is_none());
        assert!(harness.storage.get_template(&stale.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_keeps_live_template() {
        let harness = Harness::new();
        harness.api.insert_container(
            700,
            FakeContainer {
                node: "pve".into(),
                state: ContainerState::Stopped,
                template: true,
                config: HashMap::new(),
                interfaces: Vec::new(),
            },
        );
        let mut live = Template::new("u1", "live");
        live.status = TemplateStatus::Ready;
        live.vmid = Some(700);
        harness.storage.save_template(&live).unwrap();

        let resolved = manager(&harness).resolve_template(&live.id).await.unwrap();
        assert_eq!(resolved.unwrap().id, live.id);
    }

    #[tokio::test]
    async fn test_set_default_template() {
        let harness = Harness::new();
        let manager = manager(&harness);
        let first = manager
            .create_template(request("first", &[]), &NoopProgress)
            .await
            .unwrap();
        let second = manager
            .create_template(request("second", &[]), &NoopProgress)
            .await
            .unwrap();

        manager.set_default_template("u1", &first.id).unwrap();
        manager.set_default_template("u1", &second.id).unwrap();

        let default = manager.default_template("u1").unwrap().unwrap();
        assert_eq!(default.id, second.id);
        assert!(!manager.get_template(&first.id).unwrap().is_default);
        assert!(manager.set_default_template("someone-else", &first.id).is_err());
    }

    #[tokio::test]
    async fn test_retry_requires_error_state() {
        let harness = Harness::new();
        let manager = manager(&harness);
        let template = manager
            .create_template(request("t", &[]), &NoopProgress)
            .await
            .unwrap();
        let err = manager
            .retry_template(&template.id, BuildOptions::default(), &NoopProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidState { .. }));
    }

    #[test]
    fn test_features_with_nesting_keeps_others() {
        let config = ContainerConfig(HashMap::from([(
            "features".to_string(),
            json!("keyctl=1,nesting=0"),
        )]));
        assert_eq!(features_with_nesting(&config), "keyctl=1,nesting=1");
        assert_eq!(
            features_with_nesting(&ContainerConfig(HashMap::new())),
            "nesting=1"
        );
    }

    #[test]
    fn test_rootfs_size_gb() {
        let config = ContainerConfig(HashMap::from([(
            "rootfs".to_string(),
            json!("local-lvm:vm-500-disk-0,size=16G"),
        )]));
        assert_eq!(rootfs_size_gb(&config), Some(16));
        let config = ContainerConfig(HashMap::from([(
            "rootfs".to_string(),
            json!("local-lvm:vm-500-disk-0,size=512M"),
        )]));
        assert_eq!(rootfs_size_gb(&config), Some(1));
        assert_eq!(rootfs_size_gb(&ContainerConfig(HashMap::new())), None);
    }

    #[test]
    fn test_rootfs_size_gb_rejects_odd_units() {
        let size = |value: &str| {
            rootfs_size_gb(&ContainerConfig(HashMap::from([(
                "rootfs".to_string(),
                json!(format!("local-lvm:vm-500-disk-0,size={}", value)),
            )])))
        };
        assert_eq!(size("1T"), Some(1024));
        assert_eq!(size("16µ"), None);
        assert_eq!(size("G"), None);
        assert_eq!(size("16"), None);
    }
}

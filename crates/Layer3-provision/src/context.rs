//! Shared services and the container steps every workflow uses
//!
//! Built once at startup and handed to the template manager and the
//! workspace backend, so there is exactly one hypervisor client, one
//! executor, one store and one allocator per process.

use crate::allocator::VmidAllocator;
use crate::dhcp::HostDhcpTrigger;
use crate::error::{ProvisionError, Result};
use crate::settings::{ProvisionSettings, Timeouts};
use burrow_foundation::{ProgressSink, RecordStore};
use burrow_proxmox::{
    wait_for_network, wait_for_running, wait_for_task, ContainerState, DeleteOptions,
    DhcpTrigger, HypervisorApi, PollOptions, TaskStatus, Upid,
};
use burrow_ssh::{CommandOutput, CommandSpec, ExecOptions, RemoteExecutor, SshTarget};
use burrow_stack::{catalog, StackRegistry};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ProvisionContext {
    pub api: Arc<dyn HypervisorApi>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub records: Arc<dyn RecordStore>,
    pub allocator: Arc<VmidAllocator>,
    pub settings: ProvisionSettings,
    pub timeouts: Timeouts,
    pub stacks: &'static StackRegistry,
    dhcp: Option<Arc<dyn DhcpTrigger>>,
}

impl ProvisionContext {
    pub fn new(
        api: Arc<dyn HypervisorApi>,
        executor: Arc<dyn RemoteExecutor>,
        records: Arc<dyn RecordStore>,
        settings: ProvisionSettings,
    ) -> Self {
        let allocator = Arc::new(VmidAllocator::new(
            api.clone(),
            records.clone(),
            settings.vmid,
        ));
        let dhcp = settings.host_ssh.clone().map(|host| {
            let trigger = HostDhcpTrigger::new(executor.clone(), host, api.default_node());
            Arc::new(trigger) as Arc<dyn DhcpTrigger>
        });
        Self {
            api,
            executor,
            records,
            allocator,
            settings,
            timeouts: Timeouts::default(),
            stacks: catalog(),
            dhcp,
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_stacks(mut self, stacks: &'static StackRegistry) -> Self {
        self.stacks = stacks;
        self
    }

    pub fn with_dhcp_trigger(mut self, trigger: Arc<dyn DhcpTrigger>) -> Self {
        self.dhcp = Some(trigger);
        self
    }

    pub fn node(&self) -> &str {
        self.api.default_node()
    }

    // ========================================================================
    // Container steps
    // ========================================================================

    pub async fn wait_task(&self, upid: &Upid, options: PollOptions) -> Result<TaskStatus> {
        Ok(wait_for_task(self.api.as_ref(), upid, options).await?)
    }

    /// Start and wait until the hypervisor reports it running
    pub async fn start(&self, node: &str, vmid: u32) -> Result<()> {
        let upid = self.api.start_container(node, vmid).await?;
        self.wait_task(&upid, self.timeouts.task).await?;
        wait_for_running(self.api.as_ref(), node, vmid, self.timeouts.running).await?;
        Ok(())
    }

    /// IPv4 address of a running container
    pub async fn wait_network(&self, node: &str, vmid: u32) -> Result<String> {
        let ip = wait_for_network(
            self.api.as_ref(),
            node,
            vmid,
            &self.timeouts.network,
            self.dhcp.as_deref(),
        )
        .await?;
        Ok(ip.to_string())
    }

    /// Login target once `echo ready` answers
    pub async fn wait_ssh(&self, ip: &str) -> Result<SshTarget> {
        let target = self.settings.container_target(ip);
        self.executor.wait_for_ssh(&target, self.timeouts.ssh).await?;
        Ok(target)
    }

    /// Pipe a script to `bash -s`; non-zero exit is a provisioning failure
    pub async fn run_script(
        &self,
        vmid: u32,
        target: &SshTarget,
        script: &str,
        sink: &dyn ProgressSink,
    ) -> Result<CommandOutput> {
        let output = self
            .executor
            .exec(
                target,
                &CommandSpec::script(script),
                &ExecOptions::default(),
                Some(sink),
            )
            .await?;
        if !output.success() {
            return Err(ProvisionError::Provisioning {
                vmid,
                exit_code: output.exit_code,
                stderr: output.stderr_tail(20),
            });
        }
        Ok(output)
    }

    /// Graceful shutdown; the hypervisor force-stops once the budget passes
    pub async fn shutdown(&self, node: &str, vmid: u32) -> Result<()> {
        let upid = self
            .api
            .shutdown_container(node, vmid, self.timeouts.shutdown_secs, true)
            .await?;
        self.wait_task(&upid, self.timeouts.task).await?;
        Ok(())
    }

    /// Stop if running, then delete; a container that is already gone counts
    /// as deleted
    pub async fn destroy(&self, node: &str, vmid: u32) -> Result<()> {
        match self.api.get_container_status(node, vmid).await {
            Ok(status) if status.status == ContainerState::Running => {
                let stopped = match self.api.stop_container(node, vmid).await {
                    Ok(upid) => self.wait_task(&upid, self.timeouts.task).await.map(|_| ()),
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = stopped {
                    // delete is forced anyway
                    debug!(vmid, error = %e, "Stop before delete failed");
                }
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                info!(vmid, "Container already gone");
                return Ok(());
            }
            Err(e) => debug!(vmid, error = %e, "Status check before delete failed"),
        }

        let deleted = match self
            .api
            .delete_container(node, vmid, DeleteOptions::default())
            .await
        {
            Ok(upid) => self.wait_task(&upid, self.timeouts.task).await.map(|_| ()),
            Err(e) => Err(e.into()),
        };
        match deleted {
            Ok(()) => {
                info!(vmid, "Container deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!(vmid, "Container already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Best-effort destroy after a failed build; never fails
    pub async fn rollback(&self, node: &str, vmid: u32) {
        warn!(vmid, "Rolling back partially built container");
        if let Err(e) = self.destroy(node, vmid).await {
            warn!(vmid, error = %e, "Rollback failed, container may be left behind");
        }
    }
}

/// DNS-safe hostname from a display name
pub fn hostname_for(name: &str, fallback: &str) -> String {
    let mut label = String::with_capacity(name.len());
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        let c = if c.is_ascii_alphanumeric() { c } else { '-' };
        if c == '-' && (label.is_empty() || label.ends_with('-')) {
            continue;
        }
        label.push(c);
    }
    label.truncate(63);
    let label = label.trim_end_matches('-');
    if label.is_empty() {
        fallback.to_string()
    } else {
        label.to_string()
    }
}

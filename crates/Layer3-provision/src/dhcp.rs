//! DHCP nudge through the hypervisor host
//!
//! Some appliance images come up without running their DHCP client. The
//! node owning the container can reach into the guest with `pct exec` and
//! kick whichever client the image ships.

use async_trait::async_trait;
use burrow_proxmox::DhcpTrigger;
use burrow_ssh::{CommandSpec, ExecOptions, RemoteExecutor, SshTarget};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct HostDhcpTrigger {
    executor: Arc<dyn RemoteExecutor>,
    host: SshTarget,
    /// Node name of the machine behind `host`
    host_node: String,
}

impl HostDhcpTrigger {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        host: SshTarget,
        host_node: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            host,
            host_node: host_node.into(),
        }
    }

    /// Renew the lease on `interface` of `vmid`, which lives on `node`.
    ///
    /// `pct exec` only works on the owning node; other cluster nodes are
    /// reached from the host over the cluster's root SSH trust.
    pub fn command(&self, node: &str, vmid: u32, interface: &str) -> CommandSpec {
        let renew = format!(
            "dhclient {iface} 2>/dev/null || udhcpc -i {iface} -n -q 2>/dev/null || networkctl renew {iface}",
            iface = interface
        );
        if node == self.host_node {
            return CommandSpec::argv([
                "pct".to_string(),
                "exec".to_string(),
                vmid.to_string(),
                "--".to_string(),
                "sh".to_string(),
                "-c".to_string(),
                renew,
            ]);
        }
        CommandSpec::argv([
            "ssh".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "--".to_string(),
            node.to_string(),
            format!("pct exec {} -- sh -c '{}'", vmid, renew),
        ])
    }
}

#[async_trait]
impl DhcpTrigger for HostDhcpTrigger {
    async fn trigger(&self, node: &str, vmid: u32, interface: &str) {
        let spec = self.command(node, vmid, interface);
        match self
            .executor
            .exec(&self.host, &spec, &ExecOptions::default(), None)
            .await
        {
            Ok(output) if output.success() => {
                debug!(node, vmid, interface, "DHCP renewal requested")
            }
            Ok(output) => warn!(
                node,
                vmid,
                exit_code = output.exit_code,
                stderr = %output.stderr_tail(3),
                "DHCP renewal command failed"
            ),
            Err(e) => warn!(node, vmid, error = %e, "Could not reach hypervisor host for DHCP renewal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_ssh::{ScriptedExecutor, SshAuth};

    fn trigger(executor: &Arc<ScriptedExecutor>) -> HostDhcpTrigger {
        let host = SshTarget::new("pve.lan", SshAuth::Password("pw".into()));
        HostDhcpTrigger::new(executor.clone(), host, "pve")
    }

    #[tokio::test]
    async fn test_trigger_runs_pct_exec_on_host() {
        let executor = Arc::new(ScriptedExecutor::new());
        trigger(&executor).trigger("pve", 512, "eth0").await;

        let commands = executor.commands_for("pve.lan");
        assert_eq!(commands.len(), 1);
        assert!(commands[0].command_line.starts_with("pct exec 512 -- sh -c "));
        assert!(commands[0].contains("dhclient eth0"));
    }

    #[tokio::test]
    async fn test_trigger_hops_to_owning_node() {
        let executor = Arc::new(ScriptedExecutor::new());
        trigger(&executor).trigger("pve2", 613, "eth0").await;

        let commands = executor.commands_for("pve.lan");
        assert_eq!(commands.len(), 1);
        assert!(commands[0].command_line.starts_with("ssh "));
        assert!(commands[0].contains("BatchMode=yes"));
        assert!(commands[0].contains(" -- pve2 "));
        assert!(commands[0].contains("pct exec 613 -- sh -c"));
        assert!(commands[0].contains("dhclient eth0"));
    }

    #[tokio::test]
    async fn test_trigger_swallows_failures() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.refuse_connections(1);
        trigger(&executor).trigger("pve", 512, "eth0").await;
        assert_eq!(executor.commands().len(), 1);
    }
}

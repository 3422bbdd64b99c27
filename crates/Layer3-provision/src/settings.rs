//! Settings the orchestrator runs with, resolved once from `BurrowConfig`

use crate::error::{ProvisionError, Result};
use burrow_foundation::{BurrowConfig, ContainerDefaults, VmidRange};
use burrow_proxmox::{NetworkWaitOptions, PollOptions};
use burrow_ssh::{resolve_identity, IdentityOptions, ReadyWait, SshAuth, SshTarget};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Container defaults, VMID range and SSH identities
#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    pub defaults: ContainerDefaults,
    pub vmid: VmidRange,
    /// How to log into containers as root
    pub container_auth: SshAuth,
    /// Injected into fresh containers
    pub public_keys: Vec<String>,
    /// Root password for fresh containers when no key is available
    pub root_password: Option<String>,
    /// Hypervisor host shell, for nudging guest DHCP; present whenever the
    /// API host is known
    pub host_ssh: Option<SshTarget>,
}

impl ProvisionSettings {
    pub fn new(container_auth: SshAuth) -> Self {
        Self {
            defaults: ContainerDefaults::default(),
            vmid: VmidRange::default(),
            container_auth,
            public_keys: Vec::new(),
            root_password: None,
            host_ssh: None,
        }
    }

    pub fn from_config(config: &BurrowConfig) -> Result<Self> {
        let options = IdentityOptions {
            explicit_key: None,
            configured_key: config.ssh.private_key_path.as_ref().map(PathBuf::from),
            password: config.ssh.password.clone(),
        };
        let container_auth = resolve_identity(&options)
            .map_err(|e| ProvisionError::Configuration(e.to_string()))?;

        let mut public_keys = config.ssh.public_keys.clone();
        if public_keys.is_empty() {
            if let SshAuth::Key(path) = &container_auth {
                public_keys.extend(read_public_key(path));
            }
        }

        let root_password = match &container_auth {
            SshAuth::Password(password) => Some(password.clone()),
            SshAuth::Key(_) => None,
        };

        // Root unless configured otherwise
        let host_ssh = config.proxmox.host.as_ref().map(|host| {
            let target = SshTarget::new(host.clone(), container_auth.clone());
            match &config.ssh.host_user {
                Some(user) => target.with_username(user.clone()),
                None => target,
            }
        });

        Ok(Self {
            defaults: config.defaults.clone(),
            vmid: config.vmid,
            container_auth,
            public_keys,
            root_password,
            host_ssh,
        })
    }

    /// `ssh-public-keys` value, newline separated
    pub fn authorized_keys(&self) -> Option<String> {
        let keys: Vec<&str> = self
            .public_keys
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .collect();
        if keys.is_empty() {
            None
        } else {
            Some(keys.join("\n"))
        }
    }

    /// Login target for a container at `ip`
    pub fn container_target(&self, ip: &str) -> SshTarget {
        SshTarget::new(ip, self.container_auth.clone())
    }
}

fn read_public_key(private_key: &Path) -> Option<String> {
    let path = PathBuf::from(format!("{}.pub", private_key.display()));
    match std::fs::read_to_string(&path) {
        Ok(key) => Some(key.trim().to_string()),
        Err(e) => {
            debug!(path = %path.display(), "No public key next to private key: {}", e);
            None
        }
    }
}

/// Per-step time budgets
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub task: PollOptions,
    /// Appliance downloads
    pub download: PollOptions,
    pub running: PollOptions,
    pub network: NetworkWaitOptions,
    pub ssh: ReadyWait,
    /// Graceful shutdown before the hypervisor force-stops
    pub shutdown_secs: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            task: PollOptions::task(),
            download: PollOptions::task().with_timeout(Duration::from_secs(600)),
            running: PollOptions::running(),
            network: NetworkWaitOptions::default(),
            ssh: ReadyWait::default(),
            shutdown_secs: 60,
        }
    }
}

impl Timeouts {
    /// Millisecond budgets for driving an in-memory hypervisor
    pub fn fast() -> Self {
        let poll = PollOptions::new(Duration::from_millis(200), Duration::from_millis(1));
        Self {
            task: poll,
            download: poll,
            running: poll,
            network: NetworkWaitOptions {
                poll,
                interface: "eth0".to_string(),
                dhcp_trigger_after: Duration::from_millis(20),
            },
            ssh: ReadyWait::default()
                .with_timeout(Duration::from_millis(200))
                .with_interval(Duration::from_millis(1)),
            shutdown_secs: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorized_keys_skips_blank() {
        let mut settings = ProvisionSettings::new(SshAuth::Password("pw".into()));
        assert!(settings.authorized_keys().is_none());
        settings.public_keys = vec!["ssh-ed25519 AAAA a@b".into(), "  ".into()];
        assert_eq!(settings.authorized_keys().unwrap(), "ssh-ed25519 AAAA a@b");
    }

    #[test]
    fn test_from_config_reads_public_key() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("burrow_ed25519");
        std::fs::write(&key, "private").unwrap();
        std::fs::write(dir.path().join("burrow_ed25519.pub"), "ssh-ed25519 AAAA burrow\n").unwrap();

        let mut config = BurrowConfig::default();
        config.ssh.private_key_path = Some(key.display().to_string());
        config.proxmox.host = Some("pve.lan".into());
        config.ssh.host_user = Some("root".into());

        let settings = ProvisionSettings::from_config(&config).unwrap();
        assert_eq!(settings.container_auth, SshAuth::Key(key));
        assert_eq!(settings.public_keys, vec!["ssh-ed25519 AAAA burrow"]);
        assert!(settings.root_password.is_none());
        assert_eq!(settings.host_ssh.unwrap().host, "pve.lan");
    }

    #[test]
    fn test_host_ssh_defaults_to_root() {
        let mut config = BurrowConfig::default();
        config.ssh.password = Some("pw".into());
        config.proxmox.host = Some("pve.lan".into());

        let host = ProvisionSettings::from_config(&config).unwrap().host_ssh.unwrap();
        assert_eq!(host.host, "pve.lan");
        assert_eq!(host.username, "root");

        config.ssh.host_user = Some("ops".into());
        let host = ProvisionSettings::from_config(&config).unwrap().host_ssh.unwrap();
        assert_eq!(host.username, "ops");
    }
}

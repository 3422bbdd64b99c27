//! Burrow Config - unified settings
//!
//! Settings are layered, later layers win:
//! 1. global `config.json` (`~/.config/burrow/`)
//! 2. project `config.json` (`.burrow/`)
//! 3. key-value settings from the SQLite store
//! 4. `PROXMOX_*` environment variables

use super::store::ConfigStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Config file name
pub const BURROW_CONFIG_FILE: &str = "config.json";

// Key-value setting names (settings table)
pub const SETTING_PROXMOX_HOST: &str = "proxmox.host";
pub const SETTING_PROXMOX_PORT: &str = "proxmox.port";
pub const SETTING_PROXMOX_TOKEN_ID: &str = "proxmox.tokenId";
pub const SETTING_PROXMOX_TOKEN_SECRET: &str = "proxmox.tokenSecret";
pub const SETTING_PROXMOX_NODE: &str = "proxmox.node";
pub const SETTING_STORAGE: &str = "defaults.storage";
pub const SETTING_TEMPLATE_STORAGE: &str = "defaults.templateStorage";
pub const SETTING_MEMORY: &str = "defaults.memoryMb";
pub const SETTING_CORES: &str = "defaults.cores";
pub const SETTING_DISK: &str = "defaults.diskGb";
pub const SETTING_BRIDGE: &str = "defaults.bridge";
pub const SETTING_VLAN_TAG: &str = "defaults.vlanTag";
pub const SETTING_OS_TEMPLATE: &str = "defaults.osTemplate";
pub const SETTING_STARTING_VMID: &str = "vmid.starting";
pub const SETTING_VMID_RANGE_END: &str = "vmid.rangeEnd";

/// Whether `key` names a setting that is sealed at rest
pub fn is_secret_setting(key: &str) -> bool {
    key == SETTING_PROXMOX_TOKEN_SECRET
}

// ============================================================================
// Burrow Config
// ============================================================================

/// Burrow unified configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BurrowConfig {
    /// Version (for migrations)
    #[serde(default = "default_version")]
    pub version: u32,

    /// Hypervisor connection
    #[serde(default)]
    pub proxmox: ProxmoxSettings,

    /// Per-deployment container defaults
    #[serde(default)]
    pub defaults: ContainerDefaults,

    /// VMID range
    #[serde(default)]
    pub vmid: VmidRange,

    /// SSH access to containers and to the hypervisor host
    #[serde(default)]
    pub ssh: SshSettings,

    /// Directory holding the SQLite database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
}

impl BurrowConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Load / Save
    // ========================================================================

    /// Load global + project config, project wins
    pub fn load() -> Result<Self> {
        let mut config = Self::new();

        if let Ok(global) = ConfigStore::global() {
            if let Some(global_config) = global.read()? {
                config.merge(global_config);
            }
        }

        if let Ok(project) = ConfigStore::current_project() {
            if let Some(project_config) = project.read()? {
                config.merge(project_config);
            }
        }

        config.apply_env();
        Ok(config)
    }

    /// Load from a single config directory (`--config-dir`)
    pub fn load_from(store: &ConfigStore) -> Result<Self> {
        let mut config = store.read()?.unwrap_or_default();
        config.apply_env();
        Ok(config)
    }

    /// Database directory, defaulting to `~/.burrow`
    pub fn data_dir(&self) -> std::path::PathBuf {
        match &self.data_dir {
            Some(dir) => std::path::PathBuf::from(dir),
            None => dirs::home_dir()
                .unwrap_or_else(|| std::path::PathBuf::from("."))
                .join(".burrow"),
        }
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// Merge another config (other wins)
    pub fn merge(&mut self, other: BurrowConfig) {
        self.proxmox.merge(other.proxmox);
        self.defaults.merge(other.defaults);
        self.vmid.merge(other.vmid);
        self.ssh.merge(other.ssh);
        if other.data_dir.is_some() {
            self.data_dir = other.data_dir;
        }
    }

    /// Overlay key-value settings from the settings table
    pub fn apply_settings(&mut self, settings: &HashMap<String, String>) {
        for (key, value) in settings {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.as_str() {
                SETTING_PROXMOX_HOST => self.proxmox.host = Some(value.to_string()),
                SETTING_PROXMOX_PORT => set_parsed(&mut self.proxmox.port, key, value),
                SETTING_PROXMOX_TOKEN_ID => self.proxmox.token_id = Some(value.to_string()),
                SETTING_PROXMOX_TOKEN_SECRET => {
                    self.proxmox.token_secret = Some(value.to_string())
                }
                SETTING_PROXMOX_NODE => self.proxmox.node = Some(value.to_string()),
                SETTING_STORAGE => self.defaults.storage = value.to_string(),
                SETTING_TEMPLATE_STORAGE => self.defaults.template_storage = value.to_string(),
                SETTING_MEMORY => set_parsed(&mut self.defaults.memory_mb, key, value),
                SETTING_CORES => set_parsed(&mut self.defaults.cores, key, value),
                SETTING_DISK => set_parsed(&mut self.defaults.disk_gb, key, value),
                SETTING_BRIDGE => self.defaults.bridge = value.to_string(),
                SETTING_VLAN_TAG => match value.parse::<u16>() {
                    Ok(tag) => self.defaults.vlan_tag = Some(tag),
                    Err(_) => warn!(key = %key, value = %value, "ignoring invalid setting"),
                },
                SETTING_OS_TEMPLATE => self.defaults.os_template = value.to_string(),
                SETTING_STARTING_VMID => set_parsed(&mut self.vmid.starting_vmid, key, value),
                SETTING_VMID_RANGE_END => set_parsed(&mut self.vmid.range_end, key, value),
                _ => {}
            }
        }
    }

    /// Overlay `PROXMOX_*` environment variables
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("PROXMOX_HOST") {
            self.proxmox.host = Some(host);
        }
        if let Some(port) = lookup("PROXMOX_PORT") {
            set_parsed(&mut self.proxmox.port, "PROXMOX_PORT", &port);
        }
        if let Some(token_id) = lookup("PROXMOX_TOKEN_ID") {
            self.proxmox.token_id = Some(token_id);
        }
        if let Some(secret) = lookup("PROXMOX_TOKEN_SECRET") {
            self.proxmox.token_secret = Some(secret);
        }
        if let Some(node) = lookup("PROXMOX_NODE") {
            self.proxmox.node = Some(node);
        }
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, key: &str, value: &str) {
    match value.parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key = %key, value = %value, "ignoring invalid setting"),
    }
}

// ============================================================================
// Proxmox Settings
// ============================================================================

/// Hypervisor connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    /// API token id, `user@realm!name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,

    #[serde(default, skip_serializing)]
    pub token_secret: Option<String>,

    /// Node templates and workspaces are built on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

impl Default for ProxmoxSettings {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            token_id: None,
            token_secret: None,
            node: None,
        }
    }
}

impl ProxmoxSettings {
    fn merge(&mut self, other: ProxmoxSettings) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port != default_port() {
            self.port = other.port;
        }
        if other.token_id.is_some() {
            self.token_id = other.token_id;
        }
        if other.token_secret.is_some() {
            self.token_secret = other.token_secret;
        }
        if other.node.is_some() {
            self.node = other.node;
        }
    }

    /// Resolve complete credentials, naming every missing field
    pub fn credentials(&self) -> Result<ProxmoxCredentials> {
        let mut missing = Vec::new();
        let host = non_empty(&self.host);
        let token_id = non_empty(&self.token_id);
        let token_secret = non_empty(&self.token_secret);
        let node = non_empty(&self.node);
        if host.is_none() {
            missing.push("host");
        }
        if token_id.is_none() {
            missing.push("tokenId");
        }
        if token_secret.is_none() {
            missing.push("tokenSecret");
        }
        if node.is_none() {
            missing.push("node");
        }

        match (host, token_id, token_secret, node) {
            (Some(host), Some(token_id), Some(token_secret), Some(node)) => {
                Ok(ProxmoxCredentials {
                    host,
                    port: self.port,
                    token_id,
                    token_secret,
                    node,
                })
            }
            _ => Err(Error::Config(format!(
                "missing Proxmox settings: {}",
                missing.join(", ")
            ))),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// Complete hypervisor credentials
#[derive(Clone)]
pub struct ProxmoxCredentials {
    pub host: String,
    pub port: u16,
    pub token_id: String,
    pub token_secret: String,
    pub node: String,
}

impl std::fmt::Debug for ProxmoxCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxmoxCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("token_id", &self.token_id)
            .field("token_secret", &"***")
            .field("node", &self.node)
            .finish()
    }
}

// ============================================================================
// Container Defaults
// ============================================================================

/// Per-deployment defaults for new containers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDefaults {
    /// Storage for container root filesystems
    #[serde(default = "default_storage")]
    pub storage: String,

    /// Storage holding OS appliance images (`vztmpl` content)
    #[serde(default = "default_template_storage")]
    pub template_storage: String,

    #[serde(default = "default_memory")]
    pub memory_mb: u32,

    #[serde(default = "default_swap")]
    pub swap_mb: u32,

    #[serde(default = "default_cores")]
    pub cores: u32,

    #[serde(default = "default_disk")]
    pub disk_gb: u32,

    #[serde(default = "default_bridge")]
    pub bridge: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_tag: Option<u16>,

    /// Appliance prefix, e.g. `debian-12-standard`
    #[serde(default = "default_os_template")]
    pub os_template: String,
}

impl Default for ContainerDefaults {
    fn default() -> Self {
        Self {
            storage: default_storage(),
            template_storage: default_template_storage(),
            memory_mb: default_memory(),
            swap_mb: default_swap(),
            cores: default_cores(),
            disk_gb: default_disk(),
            bridge: default_bridge(),
            vlan_tag: None,
            os_template: default_os_template(),
        }
    }
}

impl ContainerDefaults {
    fn merge(&mut self, other: ContainerDefaults) {
        let base = ContainerDefaults::default();
        if other.storage != base.storage {
            self.storage = other.storage;
        }
        if other.template_storage != base.template_storage {
            self.template_storage = other.template_storage;
        }
        if other.memory_mb != base.memory_mb {
            self.memory_mb = other.memory_mb;
        }
        if other.swap_mb != base.swap_mb {
            self.swap_mb = other.swap_mb;
        }
        if other.cores != base.cores {
            self.cores = other.cores;
        }
        if other.disk_gb != base.disk_gb {
            self.disk_gb = other.disk_gb;
        }
        if other.bridge != base.bridge {
            self.bridge = other.bridge;
        }
        if other.vlan_tag.is_some() {
            self.vlan_tag = other.vlan_tag;
        }
        if other.os_template != base.os_template {
            self.os_template = other.os_template;
        }
    }

    /// `net0` value for a DHCP interface on the configured bridge
    pub fn net0(&self) -> String {
        let mut net = format!("name=eth0,bridge={},ip=dhcp", self.bridge);
        if let Some(tag) = self.vlan_tag {
            net.push_str(&format!(",tag={}", tag));
        }
        net
    }
}

// ============================================================================
// VMID Range
// ============================================================================

/// Numeric id range reserved for Burrow containers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmidRange {
    /// First id, reserved for templates
    #[serde(default = "default_starting_vmid")]
    pub starting_vmid: u32,

    /// Inclusive ceiling
    #[serde(default = "default_range_end")]
    pub range_end: u32,
}

impl Default for VmidRange {
    fn default() -> Self {
        Self {
            starting_vmid: default_starting_vmid(),
            range_end: default_range_end(),
        }
    }
}

impl VmidRange {
    fn merge(&mut self, other: VmidRange) {
        if other.starting_vmid != default_starting_vmid() {
            self.starting_vmid = other.starting_vmid;
        }
        if other.range_end != default_range_end() {
            self.range_end = other.range_end;
        }
    }

    pub fn template_floor(&self) -> u32 {
        self.starting_vmid
    }

    pub fn workspace_floor(&self) -> u32 {
        self.starting_vmid.saturating_add(1)
    }
}

// ============================================================================
// SSH Settings
// ============================================================================

/// SSH access settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshSettings {
    /// Private key used to reach containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,

    /// Public keys injected into fresh containers; read from
    /// `<private_key_path>.pub` when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub public_keys: Vec<String>,

    /// Password fallback when no key is found
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// SSH user on the hypervisor host (used for the DHCP trigger)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_user: Option<String>,
}

impl SshSettings {
    fn merge(&mut self, other: SshSettings) {
        if other.private_key_path.is_some() {
            self.private_key_path = other.private_key_path;
        }
        if !other.public_keys.is_empty() {
            self.public_keys = other.public_keys;
        }
        if other.password.is_some() {
            self.password = other.password;
        }
        if other.host_user.is_some() {
            self.host_user = other.host_user;
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_version() -> u32 {
    1
}

fn default_port() -> u16 {
    8006
}

fn default_storage() -> String {
    "local-lvm".to_string()
}

fn default_template_storage() -> String {
    "local".to_string()
}

fn default_memory() -> u32 {
    2048
}

fn default_swap() -> u32 {
    512
}

fn default_cores() -> u32 {
    2
}

fn default_disk() -> u32 {
    16
}

fn default_bridge() -> String {
    "vmbr0".to_string()
}

fn default_os_template() -> String {
    "debian-12-standard".to_string()
}

fn default_starting_vmid() -> u32 {
    500
}

fn default_range_end() -> u32 {
    999
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BurrowConfig::default();
        assert_eq!(config.proxmox.port, 8006);
        assert_eq!(config.defaults.storage, "local-lvm");
        assert_eq!(config.vmid.template_floor(), 500);
        assert_eq!(config.vmid.workspace_floor(), 501);
    }

    #[test]
    fn test_credentials_missing_fields() {
        let settings = ProxmoxSettings {
            host: Some("pve.lan".into()),
            ..Default::default()
        };
        let err = settings.credentials().unwrap_err().to_string();
        assert!(err.contains("tokenId"));
        assert!(err.contains("tokenSecret"));
        assert!(err.contains("node"));
        assert!(!err.contains("host"));
    }

    #[test]
    fn test_credentials_complete() {
        let settings = ProxmoxSettings {
            host: Some("pve.lan".into()),
            port: 8006,
            token_id: Some("root@pam!burrow".into()),
            token_secret: Some("secret".into()),
            node: Some("pve".into()),
        };
        let creds = settings.credentials().unwrap();
        assert_eq!(creds.node, "pve");
        assert!(!format!("{:?}", creds).contains("secret\""));
    }

    #[test]
    fn test_apply_settings() {
        let mut config = BurrowConfig::default();
        let mut kv = HashMap::new();
        kv.insert(SETTING_STARTING_VMID.to_string(), "700".to_string());
        kv.insert(SETTING_VLAN_TAG.to_string(), "20".to_string());
        kv.insert(SETTING_CORES.to_string(), "not-a-number".to_string());
        config.apply_settings(&kv);

        assert_eq!(config.vmid.starting_vmid, 700);
        assert_eq!(config.defaults.vlan_tag, Some(20));
        assert_eq!(config.defaults.cores, 2);
        assert_eq!(config.defaults.net0(), "name=eth0,bridge=vmbr0,ip=dhcp,tag=20");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BurrowConfig::default();
        config.apply_env_from(|name| match name {
            "PROXMOX_HOST" => Some("10.0.0.2".into()),
            "PROXMOX_PORT" => Some("8443".into()),
            _ => None,
        });
        assert_eq!(config.proxmox.host.as_deref(), Some("10.0.0.2"));
        assert_eq!(config.proxmox.port, 8443);
    }

    #[test]
    fn test_merge_project_wins() {
        let mut global = BurrowConfig::default();
        global.proxmox.node = Some("pve1".into());
        global.defaults.cores = 4;

        let mut project = BurrowConfig::default();
        project.proxmox.node = Some("pve2".into());

        global.merge(project);
        assert_eq!(global.proxmox.node.as_deref(), Some("pve2"));
        assert_eq!(global.defaults.cores, 4);
    }

    #[test]
    fn test_load_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        let mut config = BurrowConfig::default();
        config.vmid.range_end = 1200;
        std::fs::write(store.path(), serde_json::to_string(&config).unwrap()).unwrap();

        let loaded = BurrowConfig::load_from(&store).unwrap();
        assert_eq!(loaded.vmid.range_end, 1200);
    }

    #[test]
    fn test_load_from_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        std::fs::write(store.path(), "{\"vmid\": {\"rangeEnd\": \"lots\"}}").unwrap();

        assert!(BurrowConfig::load_from(&store).is_err());
    }

    #[test]
    fn test_load_from_empty_dir_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = BurrowConfig::load_from(&ConfigStore::new(dir.path())).unwrap();
        assert_eq!(loaded.vmid.starting_vmid, 500);
    }
}

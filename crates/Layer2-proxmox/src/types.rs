//! Request and response types for the Proxmox REST surface

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;

// ============================================================================
// Lenient field decoders
// ============================================================================

/// Proxmox is inconsistent about numbers vs numeric strings
fn de_u32_lenient<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    match &value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| serde::de::Error::custom(format!("invalid id: {}", value))),
        serde_json::Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid id: {}", s))),
        _ => Err(serde::de::Error::custom(format!("invalid id: {}", value))),
    }
}

/// `1`, `"1"`, `true` are all truthy; missing is false
fn de_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Bool(b)) => b,
        Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0) != 0,
        Some(serde_json::Value::String(s)) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    })
}

fn flag(value: bool) -> String {
    let v = if value { "1" } else { "0" };
    v.to_string()
}

// ============================================================================
// Nodes
// ============================================================================

/// Entry of `GET /nodes`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node: String,
    #[serde(default)]
    pub status: Option<String>,
}

impl NodeInfo {
    pub fn is_online(&self) -> bool {
        self.status.as_deref().map_or(true, |s| s == "online")
    }
}

// ============================================================================
// Containers
// ============================================================================

/// Power state of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Stopped,
    #[serde(other)]
    Unknown,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        }
    }
}

/// Entry of `GET /nodes/{node}/lxc`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSummary {
    #[serde(deserialize_with = "de_u32_lenient")]
    pub vmid: u32,
    #[serde(default)]
    pub name: Option<String>,
    pub status: ContainerState,
    #[serde(default, deserialize_with = "de_flag")]
    pub template: bool,
}

/// `GET /nodes/{node}/lxc/{vmid}/status/current`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub status: ContainerState,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub uptime: Option<u64>,
    #[serde(default, deserialize_with = "de_flag")]
    pub template: bool,
}

/// Raw container configuration (`GET .../config`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerConfig(pub HashMap<String, serde_json::Value>);

impl ContainerConfig {
    /// Value as a string, numbers stringified
    pub fn get(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// `features` option split into `key=value` pairs
    pub fn features(&self) -> HashMap<String, String> {
        self.get("features")
            .map(|f| parse_property_string(&f))
            .unwrap_or_default()
    }

    pub fn nesting_enabled(&self) -> bool {
        self.features().get("nesting").map(String::as_str) == Some("1")
    }

    /// Static IPv4 of the `netN` entry whose `name` is `interface`
    ///
    /// `None` for `dhcp`, `manual`, or no such interface.
    pub fn static_ipv4(&self, interface: &str) -> Option<Ipv4Addr> {
        let mut keys: Vec<&String> = self
            .0
            .keys()
            .filter(|k| k.starts_with("net") && k[3..].parse::<u32>().is_ok())
            .collect();
        keys.sort();

        keys.into_iter()
            .filter_map(|k| self.get(k))
            .map(|v| parse_property_string(&v))
            .find(|props| props.get("name").map(String::as_str) == Some(interface))
            .and_then(|props| props.get("ip").and_then(|ip| parse_cidr_ipv4(ip)))
    }
}

/// Parse `a=1,b=2` option strings
pub fn parse_property_string(value: &str) -> HashMap<String, String> {
    value
        .split(',')
        .filter_map(|part| {
            let (k, v) = part.split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

/// `10.0.0.5/24` or `10.0.0.5` to an address; `dhcp`/`manual` give `None`
pub fn parse_cidr_ipv4(value: &str) -> Option<Ipv4Addr> {
    let addr = value.split('/').next()?.trim();
    addr.parse().ok()
}

/// Entry of `GET .../interfaces`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    #[serde(default)]
    pub hwaddr: Option<String>,
    /// IPv4 with prefix, e.g. `10.0.0.5/24`
    #[serde(default)]
    pub inet: Option<String>,
    #[serde(default)]
    pub inet6: Option<String>,
}

impl NetworkInterface {
    /// Usable (non-loopback, non-link-local) IPv4
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.inet
            .as_deref()
            .and_then(parse_cidr_ipv4)
            .filter(|ip| !ip.is_loopback() && !ip.is_link_local() && !ip.is_unspecified())
    }
}

/// Parameters for `POST /nodes/{node}/lxc`
#[derive(Debug, Clone, Default)]
pub struct CreateContainerParams {
    pub vmid: u32,
    /// Volume id, e.g. `local:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst`
    pub ostemplate: String,
    pub hostname: String,
    pub storage: String,
    /// Root filesystem size in GB
    pub disk_gb: u32,
    pub memory_mb: u32,
    pub swap_mb: u32,
    pub cores: u32,
    pub net0: String,
    pub unprivileged: bool,
    pub nesting: bool,
    /// Newline separated authorized keys
    pub ssh_public_keys: Option<String>,
    pub password: Option<String>,
    pub start: bool,
    pub onboot: bool,
    pub description: Option<String>,
    /// `;` separated, already sanitized
    pub tags: Option<String>,
}

impl CreateContainerParams {
    pub fn to_form(&self) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("vmid", self.vmid.to_string()),
            ("ostemplate", self.ostemplate.clone()),
            ("hostname", self.hostname.clone()),
            ("storage", self.storage.clone()),
            ("rootfs", format!("{}:{}", self.storage, self.disk_gb)),
            ("memory", self.memory_mb.to_string()),
            ("swap", self.swap_mb.to_string()),
            ("cores", self.cores.to_string()),
            ("net0", self.net0.clone()),
            ("unprivileged", flag(self.unprivileged)),
            ("start", flag(self.start)),
            ("onboot", flag(self.onboot)),
        ];
        if self.nesting {
            form.push(("features", "nesting=1".to_string()));
        }
        if let Some(keys) = self.ssh_public_keys.as_ref().filter(|k| !k.trim().is_empty()) {
            form.push(("ssh-public-keys", keys.clone()));
        }
        if let Some(password) = &self.password {
            form.push(("password", password.clone()));
        }
        if let Some(description) = &self.description {
            form.push(("description", description.clone()));
        }
        if let Some(tags) = self.tags.as_ref().filter(|t| !t.is_empty()) {
            form.push(("tags", tags.clone()));
        }
        form
    }
}

/// Parameters for `POST /nodes/{node}/lxc/{vmid}/clone`
#[derive(Debug, Clone, Default)]
pub struct CloneParams {
    pub newid: u32,
    pub hostname: String,
    pub full: bool,
    /// Target storage, only honoured for full clones
    pub storage: Option<String>,
    pub description: Option<String>,
}

impl CloneParams {
    pub fn to_form(&self) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("newid", self.newid.to_string()),
            ("hostname", self.hostname.clone()),
            ("full", flag(self.full)),
        ];
        if let Some(storage) = self.storage.as_ref().filter(|_| self.full) {
            form.push(("storage", storage.clone()));
        }
        if let Some(description) = &self.description {
            form.push(("description", description.clone()));
        }
        form
    }
}

/// Query for `DELETE /nodes/{node}/lxc/{vmid}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Also remove from backup jobs, replication, HA
    pub purge: bool,
    /// Destroy even if running
    pub force: bool,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self {
            purge: true,
            force: true,
        }
    }
}

impl DeleteOptions {
    pub fn to_query(&self) -> Vec<(&'static str, String)> {
        vec![("purge", flag(self.purge)), ("force", flag(self.force))]
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Task lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Stopped,
    #[serde(other)]
    Unknown,
}

/// `GET /nodes/{node}/tasks/{upid}/status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub status: TaskState,
    /// Present once stopped; only `OK` means success
    #[serde(default)]
    pub exitstatus: Option<String>,
    #[serde(default, rename = "type")]
    pub task_type: Option<String>,
}

impl TaskStatus {
    pub fn running() -> Self {
        Self {
            status: TaskState::Running,
            exitstatus: None,
            task_type: None,
        }
    }

    pub fn stopped(exitstatus: impl Into<String>) -> Self {
        Self {
            status: TaskState::Stopped,
            exitstatus: Some(exitstatus.into()),
            task_type: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status == TaskState::Stopped
    }

    pub fn is_success(&self) -> bool {
        self.is_finished() && self.exitstatus.as_deref() == Some("OK")
    }
}

// ============================================================================
// Storage and appliances
// ============================================================================

/// Entry of `GET /nodes/{node}/storage/{storage}/content`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageContent {
    pub volid: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl StorageContent {
    /// File part of the volume id (`local:vztmpl/<file>`)
    pub fn file_name(&self) -> &str {
        self.volid.rsplit('/').next().unwrap_or(&self.volid)
    }
}

/// Entry of `GET /nodes/{node}/aplinfo`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appliance {
    /// Download file name, e.g. `debian-12-standard_12.7-1_amd64.tar.zst`
    pub template: String,
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub headline: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_container_summary_lenient_vmid() {
        let list: Vec<ContainerSummary> = serde_json::from_value(json!([
            {"vmid": 500, "name": "tpl", "status": "stopped", "template": 1},
            {"vmid": "501", "status": "running"},
            {"vmid": 502, "status": "paused"}
        ]))
        .unwrap();
        assert_eq!(list[0].vmid, 500);
        assert!(list[0].template);
        assert_eq!(list[1].vmid, 501);
        assert!(!list[1].template);
        assert_eq!(list[2].status, ContainerState::Unknown);
    }

    #[test]
    fn test_static_ipv4_from_config() {
        let config: ContainerConfig = serde_json::from_value(json!({
            "net0": "name=eth0,bridge=vmbr0,hwaddr=BC:24:11:00:00:01,ip=192.168.10.40/24,gw=192.168.10.1",
            "net1": "name=eth1,bridge=vmbr1,ip=dhcp",
            "memory": 2048
        }))
        .unwrap();
        assert_eq!(
            config.static_ipv4("eth0"),
            Some(Ipv4Addr::new(192, 168, 10, 40))
        );
        assert_eq!(config.static_ipv4("eth1"), None);
        assert_eq!(config.static_ipv4("eth2"), None);
        assert_eq!(config.get("memory").as_deref(), Some("2048"));
    }

    #[test]
    fn test_nesting_feature() {
        let config: ContainerConfig =
            serde_json::from_value(json!({"features": "keyctl=1,nesting=1"})).unwrap();
        assert!(config.nesting_enabled());
        assert!(!ContainerConfig::default().nesting_enabled());
    }

    #[test]
    fn test_interface_ipv4_filters() {
        let iface = |inet: &str| NetworkInterface {
            name: "eth0".into(),
            hwaddr: None,
            inet: Some(inet.into()),
            inet6: None,
        };
        assert_eq!(iface("10.0.0.5/24").ipv4(), Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(iface("127.0.0.1/8").ipv4(), None);
        assert_eq!(iface("169.254.3.3/16").ipv4(), None);
    }

    #[test]
    fn test_create_form_parameters() {
        let params = CreateContainerParams {
            vmid: 500,
            ostemplate: "local:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst".into(),
            hostname: "tpl-base".into(),
            storage: "local-lvm".into(),
            disk_gb: 16,
            memory_mb: 2048,
            swap_mb: 512,
            cores: 2,
            net0: "name=eth0,bridge=vmbr0,ip=dhcp".into(),
            unprivileged: true,
            nesting: true,
            ssh_public_keys: Some("ssh-ed25519 AAAA test".into()),
            tags: Some("burrow;template".into()),
            ..Default::default()
        };
        let form: HashMap<_, _> = params.to_form().into_iter().collect();
        assert_eq!(form["rootfs"], "local-lvm:16");
        assert_eq!(form["features"], "nesting=1");
        assert_eq!(form["unprivileged"], "1");
        assert_eq!(form["ssh-public-keys"], "ssh-ed25519 AAAA test");
        assert_eq!(form["tags"], "burrow;template");
        assert!(!form.contains_key("password"));
    }

    #[test]
    fn test_clone_form_storage_only_when_full() {
        let mut params = CloneParams {
            newid: 601,
            hostname: "ws".into(),
            full: false,
            storage: Some("local-lvm".into()),
            description: None,
        };
        assert!(!params.to_form().iter().any(|(k, _)| *k == "storage"));
        params.full = true;
        assert!(params.to_form().iter().any(|(k, _)| *k == "storage"));
    }

    #[test]
    fn test_task_status_success() {
        assert!(TaskStatus::stopped("OK").is_success());
        assert!(!TaskStatus::stopped("").is_success());
        assert!(!TaskStatus::stopped("command 'lxc-start' failed").is_success());
        assert!(!TaskStatus::running().is_finished());
    }
}

//! In-memory hypervisor for tests
//!
//! Mutations apply immediately and hand back a UPID whose status is
//! `stopped`/`OK` unless a script says otherwise. Failures can be injected
//! per operation.

use crate::api::HypervisorApi;
use crate::error::{ProxmoxError, Result};
use crate::types::{
    parse_property_string, Appliance, CloneParams, ContainerConfig, ContainerState,
    ContainerStatus, ContainerSummary, CreateContainerParams, DeleteOptions, NetworkInterface,
    NodeInfo, StorageContent, TaskStatus,
};
use crate::upid::Upid;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// A container held by [`FakeHypervisor`]
#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub node: String,
    pub state: ContainerState,
    pub template: bool,
    pub config: HashMap<String, Value>,
    pub interfaces: Vec<NetworkInterface>,
}

impl FakeContainer {
    pub fn nesting_enabled(&self) -> bool {
        ContainerConfig(self.config.clone()).nesting_enabled()
    }
}

#[derive(Default)]
struct State {
    containers: BTreeMap<u32, FakeContainer>,
    /// Taken on the hypervisor but missing from inventory listings
    hidden_ids: BTreeSet<u32>,
    tasks: HashMap<String, VecDeque<Result<TaskStatus>>>,
    task_polls: HashMap<String, usize>,
    storage_templates: Vec<StorageContent>,
    appliances: Vec<Appliance>,
    failures: HashMap<String, ProxmoxError>,
    task_failures: HashMap<String, String>,
    preset_interfaces: HashMap<u32, Vec<NetworkInterface>>,
    list_fails: bool,
    auto_network: bool,
    calls: Vec<String>,
    counter: u64,
}

/// In-memory [`HypervisorApi`]
pub struct FakeHypervisor {
    node: String,
    state: Mutex<State>,
}

fn http_500(path: String, message: String) -> ProxmoxError {
    ProxmoxError::Http {
        method: "POST".to_string(),
        path,
        status: 500,
        message,
    }
}

impl FakeHypervisor {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            state: Mutex::new(State {
                auto_network: true,
                ..Default::default()
            }),
        }
    }

    // ========================================================================
    // Setup
    // ========================================================================

    /// Statuses returned, in order, for one task; the last one repeats
    pub fn script_task(&self, upid: &Upid, statuses: Vec<Result<TaskStatus>>) {
        self.state
            .lock()
            .tasks
            .insert(upid.to_string(), statuses.into());
    }

    /// Next call of `op` fails with `error`
    pub fn fail_next(&self, op: &str, error: ProxmoxError) {
        self.state.lock().failures.insert(op.to_string(), error);
    }

    /// Next task of `task_type` (`vzcreate`, `vzstart`, ...) stops with `exitstatus`
    pub fn fail_next_task(&self, task_type: &str, exitstatus: &str) {
        self.state
            .lock()
            .task_failures
            .insert(task_type.to_string(), exitstatus.to_string());
    }

    /// Make listing containers fail
    pub fn set_list_fails(&self, fails: bool) {
        self.state.lock().list_fails = fails;
    }

    /// Started containers get an `eth0` address (default on)
    pub fn set_auto_network(&self, enabled: bool) {
        self.state.lock().auto_network = enabled;
    }

    /// Id the hypervisor will reject as taken without listing it
    pub fn hide_taken_id(&self, vmid: u32) {
        self.state.lock().hidden_ids.insert(vmid);
    }

    pub fn insert_container(&self, vmid: u32, container: FakeContainer) {
        self.state.lock().containers.insert(vmid, container);
    }

    pub fn set_interfaces(&self, vmid: u32, interfaces: Vec<NetworkInterface>) {
        let mut state = self.state.lock();
        if let Some(container) = state.containers.get_mut(&vmid) {
            container.interfaces = interfaces.clone();
        }
        state.preset_interfaces.insert(vmid, interfaces);
    }

    pub fn add_storage_template(&self, volid: &str) {
        self.state.lock().storage_templates.push(StorageContent {
            volid: volid.to_string(),
            content: Some("vztmpl".to_string()),
            format: Some("tzst".to_string()),
            size: None,
        });
    }

    pub fn add_appliance(&self, template: &str) {
        self.state.lock().appliances.push(Appliance {
            template: template.to_string(),
            package: None,
            os: None,
            version: None,
            section: Some("system".to_string()),
            headline: None,
        });
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn container(&self, vmid: u32) -> Option<FakeContainer> {
        self.state.lock().containers.get(&vmid).cloned()
    }

    pub fn container_ids(&self) -> Vec<u32> {
        self.state.lock().containers.keys().copied().collect()
    }

    pub fn task_polls(&self, upid: &Upid) -> usize {
        self.state
            .lock()
            .task_polls
            .get(upid.as_str())
            .copied()
            .unwrap_or(0)
    }

    /// Every call, e.g. `create 500`, `start 500`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn begin(&self, state: &mut State, op: &str, vmid: u32) -> Result<()> {
        state.calls.push(format!("{} {}", op, vmid));
        match state.failures.remove(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn task(&self, state: &mut State, node: &str, op: &str, vmid: u32) -> Upid {
        state.counter += 1;
        let raw = format!(
            "UPID:{}:{:08X}:00000000:65000000:{}:{}:root@pam:",
            node, state.counter, op, vmid
        );
        let upid = match Upid::parse(&raw) {
            Ok(upid) => upid,
            Err(e) => panic!("fake produced invalid UPID {}: {}", raw, e),
        };
        if let Some(exitstatus) = state.task_failures.remove(op) {
            state
                .tasks
                .insert(raw, VecDeque::from(vec![Ok(TaskStatus::stopped(exitstatus))]));
        }
        upid
    }

    fn missing(vmid: u32, node: &str) -> ProxmoxError {
        http_500(
            format!("/nodes/{}/lxc/{}", node, vmid),
            format!(
                "Configuration file 'nodes/{}/lxc/{}.conf' does not exist",
                node, vmid
            ),
        )
    }

    fn exists(vmid: u32, node: &str) -> ProxmoxError {
        http_500(
            format!("/nodes/{}/lxc", node),
            format!("unable to create CT {} - CT {} already exists on node '{}'", vmid, vmid, node),
        )
    }

    fn bring_up(state: &mut State, vmid: u32) {
        let auto = state.auto_network;
        let preset = state.preset_interfaces.get(&vmid).cloned();
        if let Some(container) = state.containers.get_mut(&vmid) {
            container.state = ContainerState::Running;
            container.interfaces = match preset {
                Some(interfaces) => interfaces,
                None if auto => vec![NetworkInterface {
                    name: "eth0".to_string(),
                    hwaddr: None,
                    inet: Some(format!("10.20.{}.{}/24", vmid / 256, vmid % 256)),
                    inet6: None,
                }],
                None => Vec::new(),
            };
        }
    }

    fn bring_down(state: &mut State, vmid: u32) {
        if let Some(container) = state.containers.get_mut(&vmid) {
            container.state = ContainerState::Stopped;
            container.interfaces.clear();
        }
    }
}

#[async_trait]
impl HypervisorApi for FakeHypervisor {
    fn default_node(&self) -> &str {
        &self.node
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        Ok(vec![NodeInfo {
            node: self.node.clone(),
            status: Some("online".to_string()),
        }])
    }

    async fn list_containers(&self, node: &str) -> Result<Vec<ContainerSummary>> {
        let state = self.state.lock();
        if state.list_fails {
            return Err(ProxmoxError::Network("inventory unavailable".to_string()));
        }
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| c.node == node)
            .map(|(vmid, c)| ContainerSummary {
                vmid: *vmid,
                name: c
                    .config
                    .get("hostname")
                    .and_then(|h| h.as_str())
                    .map(String::from),
                status: c.state,
                template: c.template,
            })
            .collect())
    }

    async fn get_container_status(&self, node: &str, vmid: u32) -> Result<ContainerStatus> {
        let state = self.state.lock();
        let container = state
            .containers
            .get(&vmid)
            .ok_or_else(|| Self::missing(vmid, node))?;
        Ok(ContainerStatus {
            status: container.state,
            name: None,
            uptime: None,
            template: container.template,
        })
    }

    async fn create_container(&self, node: &str, params: &CreateContainerParams) -> Result<Upid> {
        let mut state = self.state.lock();
        self.begin(&mut state, "create", params.vmid)?;
        if state.containers.contains_key(&params.vmid) || state.hidden_ids.contains(&params.vmid) {
            return Err(Self::exists(params.vmid, node));
        }

        let config = params
            .to_form()
            .into_iter()
            .map(|(k, v)| (k.to_string(), Value::String(v)))
            .collect();
        state.containers.insert(
            params.vmid,
            FakeContainer {
                node: node.to_string(),
                state: ContainerState::Stopped,
                template: false,
                config,
                interfaces: Vec::new(),
            },
        );
        if params.start {
            Self::bring_up(&mut state, params.vmid);
        }
        Ok(self.task(&mut state, node, "vzcreate", params.vmid))
    }

    async fn clone_container(&self, node: &str, vmid: u32, params: &CloneParams) -> Result<Upid> {
        let mut state = self.state.lock();
        self.begin(&mut state, "clone", vmid)?;
        let source = state
            .containers
            .get(&vmid)
            .cloned()
            .ok_or_else(|| Self::missing(vmid, node))?;
        if state.containers.contains_key(&params.newid) || state.hidden_ids.contains(&params.newid)
        {
            return Err(Self::exists(params.newid, node));
        }

        let mut config = source.config;
        config.insert(
            "hostname".to_string(),
            Value::String(params.hostname.clone()),
        );
        state.containers.insert(
            params.newid,
            FakeContainer {
                node: node.to_string(),
                state: ContainerState::Stopped,
                template: false,
                config,
                interfaces: Vec::new(),
            },
        );
        Ok(self.task(&mut state, node, "vzclone", params.newid))
    }

    async fn delete_container(
        &self,
        node: &str,
        vmid: u32,
        options: DeleteOptions,
    ) -> Result<Upid> {
        let mut state = self.state.lock();
        self.begin(&mut state, "delete", vmid)?;
        let running = match state.containers.get(&vmid) {
            Some(c) => c.state == ContainerState::Running,
            None => return Err(Self::missing(vmid, node)),
        };
        if running && !options.force {
            return Err(http_500(
                format!("/nodes/{}/lxc/{}", node, vmid),
                format!("CT {} is running - destroy failed", vmid),
            ));
        }
        state.containers.remove(&vmid);
        Ok(self.task(&mut state, node, "vzdestroy", vmid))
    }

    async fn start_container(&self, node: &str, vmid: u32) -> Result<Upid> {
        let mut state = self.state.lock();
        self.begin(&mut state, "start", vmid)?;
        if !state.containers.contains_key(&vmid) {
            return Err(Self::missing(vmid, node));
        }
        Self::bring_up(&mut state, vmid);
        Ok(self.task(&mut state, node, "vzstart", vmid))
    }

    async fn stop_container(&self, node: &str, vmid: u32) -> Result<Upid> {
        let mut state = self.state.lock();
        self.begin(&mut state, "stop", vmid)?;
        if !state.containers.contains_key(&vmid) {
            return Err(Self::missing(vmid, node));
        }
        Self::bring_down(&mut state, vmid);
        Ok(self.task(&mut state, node, "vzstop", vmid))
    }

    async fn shutdown_container(
        &self,
        node: &str,
        vmid: u32,
        _timeout_secs: u32,
        _force_stop: bool,
    ) -> Result<Upid> {
        let mut state = self.state.lock();
        self.begin(&mut state, "shutdown", vmid)?;
        if !state.containers.contains_key(&vmid) {
            return Err(Self::missing(vmid, node));
        }
        Self::bring_down(&mut state, vmid);
        Ok(self.task(&mut state, node, "vzshutdown", vmid))
    }

    async fn convert_to_template(&self, node: &str, vmid: u32) -> Result<()> {
        let mut state = self.state.lock();
        self.begin(&mut state, "template", vmid)?;
        let container = state
            .containers
            .get_mut(&vmid)
            .ok_or_else(|| Self::missing(vmid, node))?;
        if container.state == ContainerState::Running {
            return Err(http_500(
                format!("/nodes/{}/lxc/{}/template", node, vmid),
                "you can't convert a running container to a template".to_string(),
            ));
        }
        container.template = true;
        Ok(())
    }

    async fn get_container_config(&self, node: &str, vmid: u32) -> Result<ContainerConfig> {
        let state = self.state.lock();
        state
            .containers
            .get(&vmid)
            .map(|c| ContainerConfig(c.config.clone()))
            .ok_or_else(|| Self::missing(vmid, node))
    }

    async fn update_container_config(
        &self,
        node: &str,
        vmid: u32,
        params: &[(&str, String)],
    ) -> Result<()> {
        let mut state = self.state.lock();
        self.begin(&mut state, "config", vmid)?;
        let container = state
            .containers
            .get_mut(&vmid)
            .ok_or_else(|| Self::missing(vmid, node))?;
        for (key, value) in params {
            container
                .config
                .insert(key.to_string(), Value::String(value.clone()));
        }
        Ok(())
    }

    async fn resize_container(
        &self,
        node: &str,
        vmid: u32,
        disk: &str,
        size: &str,
    ) -> Result<Option<Upid>> {
        let mut state = self.state.lock();
        self.begin(&mut state, "resize", vmid)?;
        let container = state
            .containers
            .get_mut(&vmid)
            .ok_or_else(|| Self::missing(vmid, node))?;
        let current = container
            .config
            .get(disk)
            .and_then(|v| v.as_str())
            .map(parse_property_string)
            .unwrap_or_default();
        let volume = current
            .keys()
            .find(|k| k.contains(':'))
            .cloned()
            .unwrap_or_else(|| format!("local-lvm:vm-{}-disk-0", vmid));
        container.config.insert(
            disk.to_string(),
            Value::String(format!("{},size={}", volume, size.trim_start_matches('+'))),
        );
        Ok(None)
    }

    async fn get_interfaces(&self, _node: &str, vmid: u32) -> Vec<NetworkInterface> {
        let state = self.state.lock();
        state
            .containers
            .get(&vmid)
            .filter(|c| c.state == ContainerState::Running)
            .map(|c| c.interfaces.clone())
            .unwrap_or_default()
    }

    async fn get_task_status(&self, upid: &Upid) -> Result<TaskStatus> {
        let mut state = self.state.lock();
        *state.task_polls.entry(upid.to_string()).or_insert(0) += 1;
        match state.tasks.get_mut(upid.as_str()) {
            Some(queue) if queue.len() > 1 => queue
                .pop_front()
                .unwrap_or_else(|| Ok(TaskStatus::stopped("OK"))),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| Ok(TaskStatus::stopped("OK"))),
            None => Ok(TaskStatus::stopped("OK")),
        }
    }

    async fn list_storage_templates(
        &self,
        _node: &str,
        storage: &str,
    ) -> Result<Vec<StorageContent>> {
        let prefix = format!("{}:", storage);
        Ok(self
            .state
            .lock()
            .storage_templates
            .iter()
            .filter(|t| t.volid.starts_with(&prefix))
            .cloned()
            .collect())
    }

    async fn list_appliances(&self, _node: &str) -> Result<Vec<Appliance>> {
        Ok(self.state.lock().appliances.clone())
    }

    async fn download_appliance(&self, node: &str, storage: &str, template: &str) -> Result<Upid> {
        let mut state = self.state.lock();
        self.begin(&mut state, "download", 0)?;
        state.storage_templates.push(StorageContent {
            volid: format!("{}:vztmpl/{}", storage, template),
            content: Some("vztmpl".to_string()),
            format: None,
            size: None,
        });
        Ok(self.task(&mut state, node, "download", 0))
    }
}

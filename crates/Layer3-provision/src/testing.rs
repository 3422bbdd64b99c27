//! Shared fixtures for in-crate tests

use crate::context::ProvisionContext;
use crate::settings::{ProvisionSettings, Timeouts};
use burrow_foundation::{ProgressSink, Storage};
use burrow_proxmox::FakeHypervisor;
use burrow_ssh::{ScriptedExecutor, SshAuth};
use std::sync::Arc;

pub const DEBIAN_VOLID: &str = "local:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst";

pub struct Harness {
    pub api: Arc<FakeHypervisor>,
    pub executor: Arc<ScriptedExecutor>,
    pub storage: Arc<Storage>,
    pub ctx: Arc<ProvisionContext>,
}

impl Harness {
    pub fn new() -> Self {
        let api = Arc::new(FakeHypervisor::new("pve"));
        api.add_storage_template(DEBIAN_VOLID);
        let executor = Arc::new(ScriptedExecutor::new());
        let storage = Arc::new(Storage::in_memory().unwrap());

        let mut settings = ProvisionSettings::new(SshAuth::Password("pw".into()));
        settings.public_keys = vec!["ssh-ed25519 AAAAC3Nza test@burrow".into()];

        let ctx = ProvisionContext::new(api.clone(), executor.clone(), storage.clone(), settings)
            .with_timeouts(Timeouts::fast());
        Self {
            api,
            executor,
            storage,
            ctx: Arc::new(ctx),
        }
    }
}

/// Address the fake hands to a started container
pub fn fake_ip(vmid: u32) -> String {
    format!("10.20.{}.{}", vmid / 256, vmid % 256)
}

/// Records step names in order
#[derive(Default)]
pub struct StepLog(pub parking_lot::Mutex<Vec<(String, u8)>>);

impl StepLog {
    pub fn steps(&self) -> Vec<String> {
        self.0.lock().iter().map(|(s, _)| s.clone()).collect()
    }

    pub fn last(&self) -> Option<(String, u8)> {
        self.0.lock().last().cloned()
    }
}

impl ProgressSink for StepLog {
    fn progress(&self, event: burrow_foundation::ProgressEvent) {
        self.0.lock().push((event.step, event.progress));
    }
}

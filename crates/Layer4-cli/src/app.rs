//! Object graph, composed once per invocation

use anyhow::{bail, Context};
use burrow_foundation::{BurrowConfig, ConfigStore, RecordStore, SettingsStore, Storage};
use burrow_provision::{ProvisionContext, ProvisionSettings, ProxmoxBackend, TemplateManager};
use burrow_proxmox::ProxmoxClient;
use burrow_ssh::SshExecutor;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::debug;

pub struct App {
    pub config: BurrowConfig,
    pub storage: Arc<Storage>,
    pub user: String,
    pub json: bool,
    /// Echo remote command output while building
    pub verbose: bool,
    context: OnceLock<Arc<ProvisionContext>>,
}

impl App {
    /// Config files, then the settings table, then the environment
    pub fn load(
        config_dir: Option<&Path>,
        user: Option<String>,
        json: bool,
        verbose: bool,
    ) -> anyhow::Result<Self> {
        let mut config = match config_dir {
            Some(dir) => BurrowConfig::load_from(&ConfigStore::new(dir))?,
            None => BurrowConfig::load()?,
        };

        let data_dir = config.data_dir();
        let storage = Storage::new(&data_dir)
            .with_context(|| format!("opening database in {}", data_dir.display()))?;
        config.apply_settings(&storage.all_settings()?);
        config.apply_env();
        debug!(data_dir = %data_dir.display(), "Configuration loaded");

        let user = user
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "local".to_string());

        Ok(Self {
            config,
            storage: Arc::new(storage),
            user,
            json,
            verbose,
            context: OnceLock::new(),
        })
    }

    /// Hypervisor client, SSH executor and store; fails fast on missing credentials
    pub fn context(&self) -> anyhow::Result<Arc<ProvisionContext>> {
        if let Some(ctx) = self.context.get() {
            return Ok(ctx.clone());
        }
        let client = ProxmoxClient::from_config(&self.config)?;
        let settings = ProvisionSettings::from_config(&self.config)?;
        let ctx = Arc::new(ProvisionContext::new(
            Arc::new(client),
            Arc::new(SshExecutor::new()),
            self.storage.clone(),
            settings,
        ));
        Ok(self.context.get_or_init(|| ctx).clone())
    }

    pub fn templates(&self) -> anyhow::Result<Arc<TemplateManager>> {
        Ok(Arc::new(TemplateManager::new(self.context()?)))
    }

    pub fn workspaces(&self) -> anyhow::Result<ProxmoxBackend> {
        Ok(ProxmoxBackend::new(self.templates()?))
    }

    /// Full template id from an unambiguous prefix
    pub fn template_id(&self, prefix: &str) -> anyhow::Result<String> {
        let ids = self
            .storage
            .list_templates(None)?
            .into_iter()
            .map(|t| t.id);
        unique(prefix, "template", ids)
    }

    /// Full workspace id from an unambiguous prefix
    pub fn workspace_id(&self, prefix: &str) -> anyhow::Result<String> {
        let ids = self
            .storage
            .list_workspaces()?
            .into_iter()
            .map(|w| w.id);
        unique(prefix, "workspace", ids)
    }
}

/// The single id starting with `prefix`; an exact match always wins
fn unique(prefix: &str, kind: &str, ids: impl Iterator<Item = String>) -> anyhow::Result<String> {
    let ids: Vec<String> = ids.filter(|id| id.starts_with(prefix)).collect();
    if ids.iter().any(|id| id == prefix) {
        return Ok(prefix.to_string());
    }
    match ids.as_slice() {
        [id] => Ok(id.clone()),
        [] => bail!("no {} matches '{}'", kind, prefix),
        _ => bail!("'{}' matches {} {}s, use more characters", prefix, ids.len(), kind),
    }
}

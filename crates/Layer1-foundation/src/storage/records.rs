//! Persisted records and the store traits the orchestrator depends on

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// Backend discriminator stored on workspace rows
pub const BACKEND_PROXMOX: &str = "proxmox";

// ============================================================================
// Template
// ============================================================================

/// Build state of a template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateStatus {
    Pending,
    Creating,
    Staging,
    Ready,
    Error,
}

impl TemplateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Staging => "staging",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }

    /// A build is underway (or paused at staging)
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Pending | Self::Creating | Self::Staging)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Creating => 1,
            Self::Staging => 2,
            Self::Ready => 3,
            Self::Error => 4,
        }
    }

    /// Forward-only transitions; `error` from any in-progress state;
    /// `error -> pending` starts a fresh attempt.
    pub fn can_transition_to(&self, next: TemplateStatus) -> bool {
        match (self, next) {
            (Self::Error, Self::Pending) => true,
            (Self::Error, _) => false,
            (current, Self::Error) => current.is_in_progress(),
            (current, next) => next.rank() > current.rank(),
        }
    }
}

impl std::fmt::Display for TemplateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TemplateStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "creating" => Ok(Self::Creating),
            "staging" => Ok(Self::Staging),
            "ready" => Ok(Self::Ready),
            "error" => Ok(Self::Error),
            other => Err(Error::Validation(format!("unknown template status: {}", other))),
        }
    }
}

/// A reusable container blueprint and its build state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Appliance the fresh build starts from; `None` means the configured default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_template_id: Option<String>,
    /// Stacks installed by this template itself
    #[serde(default)]
    pub tech_stacks: Vec<String>,
    /// Stacks of the whole ancestor chain, frozen at creation
    #[serde(default)]
    pub inherited_tech_stacks: Vec<String>,
    pub status: TemplateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vmid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_container_ip: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Template {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            name: name.into(),
            description: None,
            os_template: None,
            parent_template_id: None,
            tech_stacks: Vec::new(),
            inherited_tech_stacks: Vec::new(),
            status: TemplateStatus::Pending,
            vmid: None,
            node: None,
            storage: None,
            staging_container_ip: None,
            is_default: false,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_tech_stacks(mut self, stacks: Vec<String>) -> Self {
        self.tech_stacks = stacks;
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_template_id = Some(parent_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Every stack present in the finished container (inherited first)
    pub fn all_tech_stacks(&self) -> Vec<String> {
        let mut all = self.inherited_tech_stacks.clone();
        for stack in &self.tech_stacks {
            if !all.contains(stack) {
                all.push(stack.clone());
            }
        }
        all
    }

    /// Move to `next`, refusing transitions the state machine forbids
    pub fn transition(&mut self, next: TemplateStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::Validation(format!(
                "template {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Reset an errored template for a fresh attempt
    pub fn reset_for_retry(&mut self) -> Result<()> {
        self.transition(TemplateStatus::Pending)?;
        self.vmid = None;
        self.node = None;
        self.storage = None;
        self.staging_container_ip = None;
        self.error_message = None;
        Ok(())
    }
}

// ============================================================================
// Workspace
// ============================================================================

/// A running workspace container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRecord {
    pub id: String,
    pub user_id: String,
    pub name: String,
    /// Backend-specific container id (the VMID for Proxmox)
    pub container_id: String,
    pub container_backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WorkspaceRecord {
    /// VMID when this workspace lives on Proxmox
    pub fn vmid(&self) -> Option<u32> {
        if self.container_backend != BACKEND_PROXMOX {
            return None;
        }
        self.container_id.trim().parse().ok()
    }
}

// ============================================================================
// Store traits
// ============================================================================

/// Key-value settings
pub trait SettingsStore: Send + Sync {
    fn get_setting(&self, key: &str) -> Result<Option<String>>;
    fn set_setting(&self, key: &str, value: &str) -> Result<()>;
    fn all_settings(&self) -> Result<HashMap<String, String>>;
}

/// Template and workspace tables
pub trait RecordStore: Send + Sync {
    fn get_template(&self, id: &str) -> Result<Option<Template>>;
    fn list_templates(&self, user_id: Option<&str>) -> Result<Vec<Template>>;
    /// Insert or replace
    fn save_template(&self, template: &Template) -> Result<()>;
    fn delete_template(&self, id: &str) -> Result<()>;
    fn child_templates(&self, parent_id: &str) -> Result<Vec<Template>>;
    /// Clear the flag on every other template of the user, then set it on `id`
    fn set_default_template(&self, user_id: &str, id: &str) -> Result<()>;

    fn get_workspace(&self, id: &str) -> Result<Option<WorkspaceRecord>>;
    fn list_workspaces(&self) -> Result<Vec<WorkspaceRecord>>;
    fn save_workspace(&self, workspace: &WorkspaceRecord) -> Result<()>;
    fn delete_workspace(&self, id: &str) -> Result<()>;

    /// VMIDs referenced by any local record
    fn recorded_vmids(&self) -> Result<BTreeSet<u32>> {
        let mut vmids: BTreeSet<u32> = self
            .list_templates(None)?
            .into_iter()
            .filter_map(|t| t.vmid)
            .collect();
        vmids.extend(self.list_workspaces()?.iter().filter_map(|w| w.vmid()));
        Ok(vmids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use TemplateStatus::*;
        assert!(Pending.can_transition_to(Creating));
        assert!(Creating.can_transition_to(Staging));
        assert!(Creating.can_transition_to(Ready));
        assert!(Staging.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Creating));
        assert!(!Staging.can_transition_to(Creating));
        assert!(Creating.can_transition_to(Error));
        assert!(Staging.can_transition_to(Error));
        assert!(!Ready.can_transition_to(Error));
        assert!(Error.can_transition_to(Pending));
        assert!(!Error.can_transition_to(Ready));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("staging".parse::<TemplateStatus>().unwrap(), TemplateStatus::Staging);
        assert!("bogus".parse::<TemplateStatus>().is_err());
    }

    #[test]
    fn test_reset_for_retry() {
        let mut template = Template::new("u1", "base");
        template.transition(TemplateStatus::Creating).unwrap();
        template.vmid = Some(510);
        template.transition(TemplateStatus::Error).unwrap();
        template.error_message = Some("boom".into());

        template.reset_for_retry().unwrap();
        assert_eq!(template.status, TemplateStatus::Pending);
        assert!(template.vmid.is_none());
        assert!(template.error_message.is_none());
    }

    #[test]
    fn test_all_tech_stacks_dedup() {
        let mut template = Template::new("u1", "t")
            .with_tech_stacks(vec!["claude".into(), "nodejs".into()]);
        template.inherited_tech_stacks = vec!["nodejs".into()];
        assert_eq!(template.all_tech_stacks(), vec!["nodejs", "claude"]);
    }

    #[test]
    fn test_workspace_vmid_only_for_proxmox() {
        let mut ws = WorkspaceRecord {
            id: "w".into(),
            user_id: "u".into(),
            name: "ws".into(),
            container_id: "612".into(),
            container_backend: BACKEND_PROXMOX.into(),
            template_id: None,
            node: None,
            created_at: Utc::now(),
        };
        assert_eq!(ws.vmid(), Some(612));
        ws.container_backend = "docker".into();
        assert_eq!(ws.vmid(), None);
    }

    #[test]
    fn test_template_serializes_camel_case() {
        let template = Template::new("u1", "t");
        let json = serde_json::to_value(&template).unwrap();
        assert!(json.get("inheritedTechStacks").is_some());
        assert_eq!(json["status"], "pending");
    }
}

//! Storage module for Burrow
//!
//! - `db`: SQLite - settings, template and workspace records
//! - `records`: record types and the store traits the orchestrator uses
//! - `secret`: sealing of sensitive settings

mod db;
mod records;
mod secret;

// SQLite Storage
pub use db::Storage;

// Records
pub use records::{
    RecordStore, SettingsStore, Template, TemplateStatus, WorkspaceRecord, BACKEND_PROXMOX,
};

// Secrets
pub use secret::{SecretBox, SECRET_KEY_FILE};

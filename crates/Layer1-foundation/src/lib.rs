//! # burrow-foundation
//!
//! Foundation layer for Burrow:
//! - Error: shared error type
//! - Config: layered settings (JSON files, settings table, environment)
//! - Storage: SQLite (settings, templates, workspaces), sealed secret settings
//! - Progress: milestone and output events for long-running workflows
//! - Strings: container tag sanitization
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Layer4-cli                                             │
//! │                     │                                   │
//! │                     ▼                                   │
//! │  Layer3-provision (allocator, templates, workspaces)    │
//! │          ┌──────────┼──────────┐                        │
//! │          ▼          ▼          ▼                        │
//! │   Layer2-proxmox  Layer2-ssh  Layer2-stack              │
//! │          └──────────┼──────────┘                        │
//! │                     ▼                                   │
//! │  Layer1-foundation (this crate)                         │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod progress;
pub mod storage;
pub mod strings;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config
// ============================================================================
pub use config::{
    BurrowConfig, ConfigStore, ContainerDefaults, ProxmoxCredentials, ProxmoxSettings, SshSettings,
    VmidRange, BURROW_CONFIG_FILE,
};

// ============================================================================
// Storage
// ============================================================================
pub use storage::{
    RecordStore, SecretBox, SettingsStore, Storage, Template, TemplateStatus, WorkspaceRecord,
    BACKEND_PROXMOX,
};

// ============================================================================
// Progress
// ============================================================================
pub use progress::{
    BuildEvent, ChannelProgress, FnProgress, NoopProgress, OutputEvent, ProgressEvent,
    ProgressSink, StreamKind, TracingProgress,
};

// ============================================================================
// Strings
// ============================================================================
pub use strings::{sanitize_tag, sanitize_tags};

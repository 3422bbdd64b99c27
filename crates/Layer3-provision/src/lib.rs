//! # burrow-provision
//!
//! Template and workspace orchestration on top of the Proxmox, SSH and
//! stack layers.
//!
//! ## Features
//! - VMID allocation against live inventory and local records, serialized
//!   in-process and retried when the hypervisor reports an id as taken
//! - Template lifecycle: fresh or cloned builds, staging, finalize, retry,
//!   rollback on failure, parent/child inheritance
//! - `ContainerBackend` trait with the Proxmox workspace implementation

pub mod allocator;
pub mod backend;
pub mod context;
pub mod dhcp;
pub mod error;
pub mod manager;
pub mod settings;

#[cfg(test)]
mod testing;

pub use allocator::{first_free, VmidAllocator, VmidKind, MAX_ALLOCATION_ATTEMPTS};
pub use backend::{ContainerBackend, CreateWorkspaceRequest, ProxmoxBackend, WorkspaceInfo};
pub use context::{hostname_for, ProvisionContext};
pub use dhcp::HostDhcpTrigger;
pub use error::{ProvisionError, Result, StepContext};
pub use manager::{BuildOptions, CreateTemplateRequest, TemplateManager};
pub use settings::{ProvisionSettings, Timeouts};

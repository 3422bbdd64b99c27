//! # burrow-proxmox
//!
//! Proxmox VE layer for Burrow.
//!
//! ## Features
//! - Typed REST client (API token auth, `{"data": ...}` envelope)
//! - `HypervisorApi` trait so orchestration can run against a fake
//! - UPID parsing; task status is always queried on the owning node
//! - Pollers for task completion, running state, and network acquisition

pub mod api;
pub mod client;
pub mod error;
pub mod poller;
pub mod types;
pub mod upid;

#[cfg(any(test, feature = "test-utils"))]
pub mod fake;

pub use api::HypervisorApi;
pub use client::ProxmoxClient;
pub use error::{ProxmoxError, Result};
pub use poller::{
    wait_for_network, wait_for_running, wait_for_task, DhcpTrigger, NetworkWaitOptions,
    PollOptions,
};
pub use types::{
    Appliance, CloneParams, ContainerConfig, ContainerState, ContainerStatus, ContainerSummary,
    CreateContainerParams, DeleteOptions, NetworkInterface, NodeInfo, StorageContent, TaskState,
    TaskStatus,
};
pub use upid::Upid;

#[cfg(any(test, feature = "test-utils"))]
pub use fake::{FakeContainer, FakeHypervisor};

//! HypervisorApi trait - the seam between orchestration and the REST client
//!
//! [`crate::ProxmoxClient`] is the production implementation. Orchestration
//! code takes `Arc<dyn HypervisorApi>` so tests can substitute an in-memory
//! hypervisor.
//!
//! Asynchronous mutations return a [`Upid`]; completion is the poller's job.
//! Config updates and template conversion run synchronously on the
//! hypervisor and return unit.

use crate::error::Result;
use crate::types::{
    Appliance, CloneParams, ContainerConfig, ContainerStatus, ContainerSummary,
    CreateContainerParams, DeleteOptions, NetworkInterface, NodeInfo, StorageContent, TaskStatus,
};
use crate::upid::Upid;
use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::warn;

#[async_trait]
pub trait HypervisorApi: Send + Sync {
    /// Node used when a caller has no better information
    fn default_node(&self) -> &str;

    // ========================================================================
    // Inventory
    // ========================================================================

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;

    async fn list_containers(&self, node: &str) -> Result<Vec<ContainerSummary>>;

    async fn get_container_status(&self, node: &str, vmid: u32) -> Result<ContainerStatus>;

    // ========================================================================
    // Lifecycle
    // ========================================================================

    async fn create_container(&self, node: &str, params: &CreateContainerParams) -> Result<Upid>;

    async fn clone_container(&self, node: &str, vmid: u32, params: &CloneParams) -> Result<Upid>;

    async fn delete_container(&self, node: &str, vmid: u32, options: DeleteOptions)
        -> Result<Upid>;

    async fn start_container(&self, node: &str, vmid: u32) -> Result<Upid>;

    /// Hard stop
    async fn stop_container(&self, node: &str, vmid: u32) -> Result<Upid>;

    /// Graceful shutdown; `force_stop` kills the container once `timeout_secs` passes
    async fn shutdown_container(
        &self,
        node: &str,
        vmid: u32,
        timeout_secs: u32,
        force_stop: bool,
    ) -> Result<Upid>;

    /// Convert a stopped container into a template
    async fn convert_to_template(&self, node: &str, vmid: u32) -> Result<()>;

    // ========================================================================
    // Configuration
    // ========================================================================

    async fn get_container_config(&self, node: &str, vmid: u32) -> Result<ContainerConfig>;

    async fn update_container_config(
        &self,
        node: &str,
        vmid: u32,
        params: &[(&str, String)],
    ) -> Result<()>;

    /// Grow a disk; `size` is absolute (`32G`) or relative (`+8G`).
    /// Older hypervisors finish synchronously and return no task.
    async fn resize_container(
        &self,
        node: &str,
        vmid: u32,
        disk: &str,
        size: &str,
    ) -> Result<Option<Upid>>;

    /// Interfaces reported by the running container.
    /// Best effort: empty when the endpoint is unavailable.
    async fn get_interfaces(&self, node: &str, vmid: u32) -> Vec<NetworkInterface>;

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Queried on the node that owns the task
    async fn get_task_status(&self, upid: &Upid) -> Result<TaskStatus>;

    // ========================================================================
    // Images
    // ========================================================================

    /// OS images in a storage (`content=vztmpl`)
    async fn list_storage_templates(&self, node: &str, storage: &str)
        -> Result<Vec<StorageContent>>;

    /// Downloadable appliance catalog
    async fn list_appliances(&self, node: &str) -> Result<Vec<Appliance>>;

    async fn download_appliance(&self, node: &str, storage: &str, template: &str)
        -> Result<Upid>;

    // ========================================================================
    // Derived queries
    // ========================================================================

    /// OS images in `storage` across every online node, deduplicated by volume id
    async fn list_all_templates(&self, storage: &str) -> Result<Vec<StorageContent>> {
        let mut seen = BTreeSet::new();
        let mut all = Vec::new();
        for node in self.list_nodes().await?.into_iter().filter(|n| n.is_online()) {
            match self.list_storage_templates(&node.node, storage).await {
                Ok(items) => {
                    for item in items {
                        if seen.insert(item.volid.clone()) {
                            all.push(item);
                        }
                    }
                }
                Err(e) => warn!(node = %node.node, storage = %storage, "Skipping node: {}", e),
            }
        }
        Ok(all)
    }

    /// Every VMID in use anywhere in the cluster
    async fn all_container_ids(&self) -> Result<BTreeSet<u32>> {
        let mut ids = BTreeSet::new();
        for node in self.list_nodes().await? {
            for container in self.list_containers(&node.node).await? {
                ids.insert(container.vmid);
            }
        }
        Ok(ids)
    }

    /// Smallest id in `start..=end` absent from live inventory.
    /// Local records are not consulted; the allocator does that.
    async fn next_free_vmid(&self, start: u32, end: u32) -> Result<Option<u32>> {
        let used = self.all_container_ids().await?;
        Ok((start..=end).find(|id| !used.contains(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeHypervisor;

    async fn create(api: &FakeHypervisor, vmid: u32) {
        api.create_container(
            "pve",
            &CreateContainerParams {
                vmid,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_next_free_vmid_scans_inventory() {
        let api = FakeHypervisor::new("pve");
        for vmid in [500, 501, 503] {
            create(&api, vmid).await;
        }

        assert_eq!(api.next_free_vmid(500, 999).await.unwrap(), Some(502));
        assert_eq!(api.next_free_vmid(500, 501).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_all_container_ids_propagates_failure() {
        let api = FakeHypervisor::new("pve");
        api.set_list_fails(true);
        assert!(api.all_container_ids().await.is_err());
    }

    #[tokio::test]
    async fn test_list_all_templates_dedups() {
        let api = FakeHypervisor::new("pve");
        api.add_storage_template("local:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst");
        api.add_storage_template("local:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst");
        api.add_storage_template("nfs:vztmpl/alpine-3.20-default_20240908_amd64.tar.xz");

        let templates = api.list_all_templates("local").await.unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(
            templates[0].file_name(),
            "debian-12-standard_12.7-1_amd64.tar.zst"
        );
    }
}

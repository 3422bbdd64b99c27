//! VMID allocator
//!
//! An id is in use if the hypervisor lists it, any local record references
//! it, or this process has reserved it. Allocation is serialized through one
//! async mutex. A claimed id stays reserved until the caller has recorded it
//! locally or rolled the container back, since the hypervisor only lists a
//! container once its create task has progressed. Other writers to the id
//! namespace are caught when the hypervisor answers "already exists"; the id
//! is then excluded and allocation runs again.

use crate::error::{ProvisionError, Result};
use burrow_foundation::{RecordStore, VmidRange};
use burrow_proxmox::HypervisorApi;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Attempts before an "already exists" rejection is surfaced
pub const MAX_ALLOCATION_ATTEMPTS: u32 = 5;

/// What the id is for; decides the scan floor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmidKind {
    Template,
    Workspace,
}

/// Smallest id in `floor..=ceiling` not in `used`
pub fn first_free(used: &BTreeSet<u32>, floor: u32, ceiling: u32) -> Result<u32> {
    (floor..=ceiling)
        .find(|id| !used.contains(id))
        .ok_or(ProvisionError::RangeExhausted { floor, ceiling })
}

pub struct VmidAllocator {
    api: Arc<dyn HypervisorApi>,
    records: Arc<dyn RecordStore>,
    range: VmidRange,
    /// Claimed ids not yet visible in records; guarded by the allocation lock
    reserved: Mutex<BTreeSet<u32>>,
}

impl VmidAllocator {
    pub fn new(
        api: Arc<dyn HypervisorApi>,
        records: Arc<dyn RecordStore>,
        range: VmidRange,
    ) -> Self {
        Self {
            api,
            records,
            range,
            reserved: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn range(&self) -> VmidRange {
        self.range
    }

    pub fn floor(&self, kind: VmidKind) -> u32 {
        match kind {
            VmidKind::Template => self.range.template_floor(),
            VmidKind::Workspace => self.range.workspace_floor(),
        }
    }

    /// Live inventory (best effort) plus every locally recorded id
    pub async fn used_ids(&self) -> Result<BTreeSet<u32>> {
        let mut used = match self.api.all_container_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Live inventory unavailable, using local records only");
                BTreeSet::new()
            }
        };
        used.extend(self.records.recorded_vmids()?);
        Ok(used)
    }

    /// The id the next allocation would pick; reserves nothing
    pub async fn peek(&self, kind: VmidKind) -> Result<u32> {
        let reserved = self.reserved.lock().await;
        let mut used = self.used_ids().await?;
        used.extend(reserved.iter().copied());
        first_free(&used, self.floor(kind), self.range.range_end)
    }

    /// Allocate an id and hand it to `submit`, re-allocating while the
    /// hypervisor rejects the id as taken.
    ///
    /// On success the id stays reserved; call [`release`](Self::release)
    /// once it is recorded locally or the container is rolled back.
    pub async fn allocate_with<T, F, Fut>(&self, kind: VmidKind, mut submit: F) -> Result<(u32, T)>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut reserved = self.reserved.lock().await;
        let floor = self.floor(kind);
        let mut rejected = BTreeSet::new();
        let mut last_error = None;

        for attempt in 1..=MAX_ALLOCATION_ATTEMPTS {
            let mut used = self.used_ids().await?;
            used.extend(rejected.iter().copied());
            used.extend(reserved.iter().copied());
            let vmid = first_free(&used, floor, self.range.range_end)?;
            debug!(vmid, attempt, kind = ?kind, "Allocated VMID");

            match submit(vmid).await {
                Ok(value) => {
                    info!(vmid, kind = ?kind, "VMID claimed");
                    reserved.insert(vmid);
                    return Ok((vmid, value));
                }
                Err(e) if e.is_already_exists() => {
                    warn!(vmid, attempt, "VMID taken on the hypervisor, allocating again");
                    rejected.insert(vmid);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(ProvisionError::RangeExhausted {
            floor,
            ceiling: self.range.range_end,
        }))
    }

    /// Drop the reservation on `vmid`
    pub async fn release(&self, vmid: u32) {
        if self.reserved.lock().await.remove(&vmid) {
            debug!(vmid, "VMID reservation released");
        }
    }
}

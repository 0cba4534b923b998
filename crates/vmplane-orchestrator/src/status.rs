//! Observed VM status: the in-memory snapshot cache and the change event.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use vmplane_core::VmId;
use vmplane_hypervisor::DomainState;
use vmplane_store::VmStatus;

/// Map a hypervisor state to the canonical VM status.
#[must_use]
pub const fn canonical_status(state: DomainState) -> VmStatus {
    match state {
        DomainState::Running => VmStatus::Running,
        DomainState::Paused => VmStatus::Suspended,
        DomainState::Shutoff => VmStatus::Stopped,
        DomainState::Crashed => VmStatus::Crashed,
        _ => VmStatus::Unknown,
    }
}

/// The last observation of one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// VM observed.
    pub vm_id: VmId,
    /// Canonical status derived from the observation.
    pub status: VmStatus,
    /// Raw hypervisor state, `None` when the domain was not found.
    pub state: Option<DomainState>,
    /// Raw reason code.
    pub reason: i32,
    /// When the observation was made.
    pub observed_at: DateTime<Utc>,
}

/// Published when reconciliation changes a persisted status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChangeEvent {
    /// VM whose status changed.
    pub vm_id: VmId,
    /// VM name.
    pub name: String,
    /// Persisted status before the change.
    pub old_status: VmStatus,
    /// Persisted status after the change.
    pub new_status: VmStatus,
    /// Raw hypervisor state, `None` when the domain was not found.
    pub state: Option<DomainState>,
    /// Raw reason code.
    pub reason: i32,
    /// When the change was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Per-VM snapshots owned by one poller.
#[derive(Debug, Default)]
pub struct StatusCache {
    snapshots: RwLock<HashMap<VmId, StatusSnapshot>>,
}

impl StatusCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The last snapshot for a VM.
    #[must_use]
    pub fn get(&self, vm_id: &VmId) -> Option<StatusSnapshot> {
        self.snapshots.read().get(vm_id).cloned()
    }

    /// Store a snapshot, returning the previous one.
    pub fn insert(&self, snapshot: StatusSnapshot) -> Option<StatusSnapshot> {
        self.snapshots.write().insert(snapshot.vm_id, snapshot)
    }

    /// Forget a VM.
    pub fn remove(&self, vm_id: &VmId) -> Option<StatusSnapshot> {
        self.snapshots.write().remove(vm_id)
    }

    /// Keep only VMs for which `keep` returns true.
    pub fn retain<F>(&self, mut keep: F)
    where
        F: FnMut(&VmId) -> bool,
    {
        self.snapshots.write().retain(|id, _| keep(id));
    }

    /// Number of cached VMs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.read().is_empty()
    }
}

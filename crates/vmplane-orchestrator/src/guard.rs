//! Execution guards keyed by backup job and by VM.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use vmplane_core::{BackupJobId, VmId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum GuardKey {
    Job(BackupJobId),
    Vm(VmId),
}

/// Set of held execution guards.
///
/// A guard is released when its [`GuardToken`] is dropped, so every exit
/// path of the holder, including unwinding, frees it.
#[derive(Debug, Clone, Default)]
pub struct ExecutionGuard {
    held: Arc<Mutex<HashSet<GuardKey>>>,
}

/// Proof that a guard is held. Dropping it releases the guard.
#[derive(Debug)]
#[must_use = "the guard is released as soon as the token is dropped"]
pub struct GuardToken {
    held: Arc<Mutex<HashSet<GuardKey>>>,
    key: GuardKey,
}

impl Drop for GuardToken {
    fn drop(&mut self) {
        self.held.lock().remove(&self.key);
    }
}

impl ExecutionGuard {
    /// Create an empty guard set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn try_acquire(&self, key: GuardKey) -> Option<GuardToken> {
        self.held.lock().insert(key).then(|| GuardToken {
            held: Arc::clone(&self.held),
            key,
        })
    }

    /// Take the guard for one job, or `None` if it is already held.
    pub fn try_job(&self, job_id: BackupJobId) -> Option<GuardToken> {
        self.try_acquire(GuardKey::Job(job_id))
    }

    /// Take the guard for one VM's disk, or `None` if it is already held.
    pub fn try_vm(&self, vm_id: VmId) -> Option<GuardToken> {
        self.try_acquire(GuardKey::Vm(vm_id))
    }

    /// Whether a job's guard is held.
    #[must_use]
    pub fn holds_job(&self, job_id: &BackupJobId) -> bool {
        self.held.lock().contains(&GuardKey::Job(*job_id))
    }

    /// Whether a VM's guard is held.
    #[must_use]
    pub fn holds_vm(&self, vm_id: &VmId) -> bool {
        self.held.lock().contains(&GuardKey::Vm(*vm_id))
    }
}

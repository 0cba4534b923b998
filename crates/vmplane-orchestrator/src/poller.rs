//! Bounded-parallel polling of every VM that has a hypervisor domain.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};
use vmplane_core::VmId;
use vmplane_store::Store;

use crate::reconciler::{ReconcileOutcome, StatusReconciler};
use crate::{OrchestratorError, Result};

/// Counters for one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// VMs reconciled without error.
    pub checked: usize,
    /// VMs whose persisted status changed.
    pub updated: usize,
    /// VMs whose check failed.
    pub failed: usize,
}

/// Runs reconciliation across all VMs with a fixed in-flight limit.
pub struct DomainStatePoller {
    store: Arc<dyn Store>,
    reconciler: Arc<StatusReconciler>,
    concurrency: usize,
}

impl DomainStatePoller {
    /// Create a poller. `concurrency` is clamped to at least one.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, reconciler: Arc<StatusReconciler>, concurrency: usize) -> Self {
        Self {
            store,
            reconciler,
            concurrency: concurrency.max(1),
        }
    }

    /// The reconciler driven by this poller.
    #[must_use]
    pub fn reconciler(&self) -> &Arc<StatusReconciler> {
        &self.reconciler
    }

    /// Run one poll cycle.
    ///
    /// Per-VM failures are logged and counted. Cache entries for VMs no
    /// longer in the store are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error only if the VM list cannot be read.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let vms = self.store.list_all_vms()?;
        let known: HashSet<VmId> = vms.iter().map(|vm| vm.vm_id).collect();

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for vm in vms.into_iter().filter(|vm| vm.domain_ref().is_some()) {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| OrchestratorError::Internal(format!("poller semaphore: {e}")))?;
            let reconciler = Arc::clone(&self.reconciler);
            tasks.spawn(async move {
                let _permit = permit;
                let result = reconciler.reconcile_vm(&vm).await;
                (vm.vm_id, result)
            });
        }

        let mut report = CycleReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => {
                    report.checked += 1;
                    if matches!(outcome, ReconcileOutcome::Updated { .. }) {
                        report.updated += 1;
                    }
                }
                Ok((vm_id, Err(e))) => {
                    report.failed += 1;
                    warn!(vm_id = %vm_id, error = %e, "status check failed");
                }
                Err(e) => {
                    report.failed += 1;
                    error!(error = %e, "status check task aborted");
                }
            }
        }

        self.reconciler.cache().retain(|id| known.contains(id));

        debug!(
            checked = report.checked,
            updated = report.updated,
            failed = report.failed,
            "poll cycle complete"
        );
        Ok(report)
    }
}

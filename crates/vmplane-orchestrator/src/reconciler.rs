//! Per-VM status reconciliation against the hypervisor.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument};
use vmplane_events::{EventHub, Topic, KIND_STATUS_CHANGED};
use vmplane_hypervisor::HypervisorControl;
use vmplane_store::{Store, VmRecord, VmStatus};

use crate::domain::observe_state;
use crate::status::{canonical_status, StatusCache, StatusChangeEvent, StatusSnapshot};
use crate::Result;

/// Result of reconciling one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Persisted status already matches, or the VM has no domain.
    Unchanged,
    /// Persisted status was rewritten.
    Updated {
        /// Status before.
        old: VmStatus,
        /// Status after.
        new: VmStatus,
    },
    /// Persisted status is transitional and was left alone.
    SkippedTransitional,
}

/// Brings persisted VM status in line with live hypervisor state.
pub struct StatusReconciler {
    store: Arc<dyn Store>,
    hypervisor: Arc<dyn HypervisorControl>,
    hub: Arc<EventHub>,
    cache: Arc<StatusCache>,
    call_timeout: Duration,
}

impl StatusReconciler {
    /// Create a reconciler.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        hypervisor: Arc<dyn HypervisorControl>,
        hub: Arc<EventHub>,
        cache: Arc<StatusCache>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            hypervisor,
            hub,
            cache,
            call_timeout,
        }
    }

    /// The snapshot cache this reconciler refreshes.
    #[must_use]
    pub fn cache(&self) -> &Arc<StatusCache> {
        &self.cache
    }

    /// Reconcile one VM: fetch, compare, persist, broadcast.
    ///
    /// A missing domain counts as `stopped`. The snapshot is refreshed on
    /// every successful observation, whether or not a change was written.
    ///
    /// # Errors
    ///
    /// Returns the hypervisor or store error that stopped this VM's check.
    #[instrument(skip(self, vm), fields(vm_id = %vm.vm_id))]
    pub async fn reconcile_vm(&self, vm: &VmRecord) -> Result<ReconcileOutcome> {
        let Some(domain_ref) = vm.domain_ref() else {
            return Ok(ReconcileOutcome::Unchanged);
        };

        let observation =
            observe_state(self.hypervisor.as_ref(), domain_ref, self.call_timeout).await?;
        let observed = observation.map_or(VmStatus::Stopped, |info| canonical_status(info.state));
        let snapshot = StatusSnapshot {
            vm_id: vm.vm_id,
            status: observed,
            state: observation.map(|info| info.state),
            reason: observation.map_or(0, |info| info.reason),
            observed_at: Utc::now(),
        };

        let previous = self
            .cache
            .get(&vm.vm_id)
            .map_or(vm.status, |cached| cached.status);
        if previous != observed {
            debug!(from = %previous, to = %observed, "observed status moved");
        }

        // Re-read so a status written by a concurrent user operation is honored.
        let Some(current) = self.store.get_vm(&vm.vm_id)? else {
            self.cache.remove(&vm.vm_id);
            return Ok(ReconcileOutcome::Unchanged);
        };

        let outcome = if current.status.is_transitional() {
            debug!(persisted = %current.status, observed = %observed, "skipping transitional VM");
            ReconcileOutcome::SkippedTransitional
        } else if current.status == observed {
            ReconcileOutcome::Unchanged
        } else {
            self.store.update_vm_status(&vm.vm_id, observed)?;
            info!(old = %current.status, new = %observed, "VM status reconciled");

            let event = StatusChangeEvent {
                vm_id: vm.vm_id,
                name: current.name.clone(),
                old_status: current.status,
                new_status: observed,
                state: snapshot.state,
                reason: snapshot.reason,
                timestamp: snapshot.observed_at,
            };
            self.hub.publish(Topic::Global, KIND_STATUS_CHANGED, &event);

            ReconcileOutcome::Updated {
                old: current.status,
                new: observed,
            }
        };

        self.cache.insert(snapshot);
        Ok(outcome)
    }
}

//! Time-bounded hypervisor calls shared by the coordinators.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use vmplane_hypervisor::{Domain, DomainStateInfo, DomainStats, HypervisorControl, HypervisorError};

use crate::Result;

/// Await a hypervisor call, failing with `Timeout` after `limit`.
pub(crate) async fn bounded<T, F>(limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = vmplane_hypervisor::Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(HypervisorError::Timeout(limit).into()),
    }
}

/// Look up a domain within `limit`.
pub(crate) async fn lookup(
    hypervisor: &dyn HypervisorControl,
    identity: &str,
    limit: Duration,
) -> Result<Arc<dyn Domain>> {
    bounded(limit, hypervisor.lookup_by_identity(identity)).await
}

/// Fetch a domain's state, or `None` if the domain does not exist.
pub(crate) async fn observe_state(
    hypervisor: &dyn HypervisorControl,
    identity: &str,
    limit: Duration,
) -> Result<Option<DomainStateInfo>> {
    let result = async {
        let domain = lookup(hypervisor, identity, limit).await?;
        bounded(limit, domain.state()).await
    }
    .await;

    match result {
        Ok(info) => Ok(Some(info)),
        Err(crate::OrchestratorError::Hypervisor(e)) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Fetch a domain's counters.
pub(crate) async fn sample_stats(
    hypervisor: &dyn HypervisorControl,
    identity: &str,
    limit: Duration,
) -> Result<DomainStats> {
    let domain = lookup(hypervisor, identity, limit).await?;
    bounded(limit, domain.stats()).await
}

#[cfg(test)]
mod tests {
    use vmplane_hypervisor::{DomainState, MockHypervisor};

    use super::*;
    use crate::ErrorKind;

    #[tokio::test]
    async fn observe_running_and_missing() {
        let hv = MockHypervisor::new();
        hv.set_state("web-01", DomainState::Running, 1);

        let info = observe_state(&hv, "web-01", Duration::from_secs(1)).await.unwrap();
        assert_eq!(info.unwrap().state, DomainState::Running);

        let missing = observe_state(&hv, "ghost", Duration::from_secs(1)).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out() {
        let hv = MockHypervisor::new();
        hv.define("slow", DomainState::Running);
        hv.set_delay(Some(Duration::from_secs(60)));

        let err = observe_state(&hv, "slow", Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Upstream);
        assert!(err.is_retriable());
    }
}

//! Metric providers resolved by name for alert evaluation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use vmplane_core::VmId;
use vmplane_store::{Store, VmStatus};

use crate::stats::{StatsCache, StatsSample};
use crate::{OrchestratorError, Result};

/// CPU usage in percent.
pub const CPU_USAGE: &str = "cpu_usage";
/// Memory usage in percent.
pub const MEMORY_USAGE: &str = "memory_usage";
/// Cumulative received bytes.
pub const NETWORK_IN: &str = "network_in";
/// Cumulative transmitted bytes.
pub const NETWORK_OUT: &str = "network_out";
/// Received bytes per second.
pub const NETWORK_IN_RATE: &str = "network_in_rate";
/// Transmitted bytes per second.
pub const NETWORK_OUT_RATE: &str = "network_out_rate";
/// 1 when the VM is running, 0 otherwise.
pub const STATUS: &str = "status";

/// Supplies the current value of one metric for a VM.
#[async_trait]
pub trait MetricProvider: Send + Sync {
    /// Current value for `vm_id`.
    ///
    /// # Errors
    ///
    /// Returns an error when no value is available for this VM.
    async fn value(&self, vm_id: &VmId) -> Result<f64>;
}

/// Which field of the latest stats sample to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsField {
    /// Derived CPU percent.
    CpuPercent,
    /// Memory percent.
    MemoryPercent,
    /// Cumulative rx bytes.
    RxBytes,
    /// Cumulative tx bytes.
    TxBytes,
    /// rx bytes per second.
    RxRate,
    /// tx bytes per second.
    TxRate,
}

impl StatsField {
    #[allow(clippy::cast_precision_loss)]
    fn extract(self, sample: &StatsSample) -> Option<f64> {
        match self {
            Self::CpuPercent => sample.cpu_percent,
            Self::MemoryPercent => sample.memory_percent,
            Self::RxBytes => Some(sample.stats.net_rx_bytes as f64),
            Self::TxBytes => Some(sample.stats.net_tx_bytes as f64),
            Self::RxRate => sample.rx_rate,
            Self::TxRate => sample.tx_rate,
        }
    }
}

/// Reads a field of the stats cache.
pub struct StatsMetric {
    cache: Arc<StatsCache>,
    field: StatsField,
}

impl StatsMetric {
    /// Create a provider for one field.
    #[must_use]
    pub fn new(cache: Arc<StatsCache>, field: StatsField) -> Self {
        Self { cache, field }
    }
}

#[async_trait]
impl MetricProvider for StatsMetric {
    async fn value(&self, vm_id: &VmId) -> Result<f64> {
        self.cache
            .get(vm_id)
            .and_then(|sample| self.field.extract(&sample))
            .ok_or_else(|| OrchestratorError::not_found("metric sample", vm_id))
    }
}

/// Binary up/down from the persisted VM status.
pub struct VmRunningMetric {
    store: Arc<dyn Store>,
}

impl VmRunningMetric {
    /// Create the provider.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MetricProvider for VmRunningMetric {
    async fn value(&self, vm_id: &VmId) -> Result<f64> {
        let vm = self
            .store
            .get_vm(vm_id)?
            .ok_or_else(|| OrchestratorError::not_found("vm", vm_id))?;
        Ok(if vm.status == VmStatus::Running { 1.0 } else { 0.0 })
    }
}

/// Metric providers keyed by metric name.
#[derive(Default)]
pub struct MetricRegistry {
    providers: HashMap<String, Arc<dyn MetricProvider>>,
}

impl MetricRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the stock providers.
    #[must_use]
    pub fn with_defaults(stats: &Arc<StatsCache>, store: Arc<dyn Store>) -> Self {
        let mut registry = Self::new();
        for (name, field) in [
            (CPU_USAGE, StatsField::CpuPercent),
            (MEMORY_USAGE, StatsField::MemoryPercent),
            (NETWORK_IN, StatsField::RxBytes),
            (NETWORK_OUT, StatsField::TxBytes),
            (NETWORK_IN_RATE, StatsField::RxRate),
            (NETWORK_OUT_RATE, StatsField::TxRate),
        ] {
            registry.register(name, Arc::new(StatsMetric::new(Arc::clone(stats), field)));
        }
        registry.register(STATUS, Arc::new(VmRunningMetric::new(store)));
        registry
    }

    /// Add or replace a provider.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn MetricProvider>) {
        self.providers.insert(name.into(), provider);
    }

    /// Whether a metric name is known.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Resolve a metric for a VM.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown metric name, or the provider's error.
    pub async fn value(&self, name: &str, vm_id: &VmId) -> Result<f64> {
        let provider = self
            .providers
            .get(name)
            .ok_or_else(|| OrchestratorError::not_found("metric", name))?;
        provider.value(vm_id).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use tempfile::TempDir;
    use vmplane_core::OwnerId;
    use vmplane_hypervisor::DomainStats;
    use vmplane_store::{RocksStore, VmRecord};

    use super::*;
    use crate::ErrorKind;

    #[tokio::test]
    async fn stats_backed_metrics() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let stats = Arc::new(StatsCache::new());
        let registry = MetricRegistry::with_defaults(&stats, store);
        let vm = VmId::from_bytes([4; 32]);

        let err = registry.value(CPU_USAGE, &vm).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let t0 = Utc::now();
        let mut counters = DomainStats {
            cpu_time_ns: 0,
            vcpus: 1,
            memory_used_kib: 900,
            memory_total_kib: 1000,
            net_rx_bytes: 100,
            net_tx_bytes: 50,
        };
        stats.record(vm, counters, t0);
        assert!((registry.value(MEMORY_USAGE, &vm).await.unwrap() - 90.0).abs() < 1e-9);
        assert!((registry.value(NETWORK_IN, &vm).await.unwrap() - 100.0).abs() < 1e-9);
        assert!(registry.value(CPU_USAGE, &vm).await.is_err());

        counters.cpu_time_ns = 1_000_000_000;
        stats.record(vm, counters, t0 + Duration::seconds(2));
        assert!((registry.value(CPU_USAGE, &vm).await.unwrap() - 50.0).abs() < 1e-9);
        assert!(registry.value(NETWORK_OUT_RATE, &vm).await.unwrap().abs() < 1e-9);
    }

    #[tokio::test]
    async fn status_metric_and_unknown_names() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let owner = OwnerId::from_bytes([2; 32]);
        let now = Utc::now();
        let vm = VmRecord {
            vm_id: VmId::generate_deterministic(&owner, "up", 0),
            owner_id: owner,
            name: "up".to_string(),
            status: VmStatus::Running,
            hypervisor_ref: None,
            vcpus: 1,
            memory_mb: 256,
            disk_path: "/dev/null".to_string(),
            created_at: now,
            updated_at: now,
        };
        store.put_vm(&vm).unwrap();

        let registry = MetricRegistry::with_defaults(&Arc::new(StatsCache::new()), store.clone());
        assert!(registry.contains(STATUS));
        assert!((registry.value(STATUS, &vm.vm_id).await.unwrap() - 1.0).abs() < f64::EPSILON);

        store.update_vm_status(&vm.vm_id, VmStatus::Crashed).unwrap();
        assert!(registry.value(STATUS, &vm.vm_id).await.unwrap().abs() < f64::EPSILON);

        let err = registry.value("disk_iops", &vm.vm_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}

//! Latest resource sample per VM, with rates derived from the previous one.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use vmplane_core::VmId;
use vmplane_hypervisor::DomainStats;

/// One stats sample plus derived values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSample {
    /// Raw counters.
    pub stats: DomainStats,
    /// When the counters were read.
    pub sampled_at: DateTime<Utc>,
    /// CPU usage in percent of all vCPUs since the previous sample.
    pub cpu_percent: Option<f64>,
    /// Memory used in percent of the current allocation.
    pub memory_percent: Option<f64>,
    /// Received bytes per second since the previous sample.
    pub rx_rate: Option<f64>,
    /// Transmitted bytes per second since the previous sample.
    pub tx_rate: Option<f64>,
}

#[allow(clippy::cast_precision_loss)]
fn per_second(current: u64, previous: u64, elapsed_secs: f64) -> Option<f64> {
    (current >= previous).then(|| (current - previous) as f64 / elapsed_secs)
}

impl StatsSample {
    /// Build a sample, deriving rates against `previous` when possible.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn derive(stats: DomainStats, at: DateTime<Utc>, previous: Option<&Self>) -> Self {
        let memory_percent = (stats.memory_total_kib > 0).then(|| {
            (stats.memory_used_kib as f64 / stats.memory_total_kib as f64 * 100.0).clamp(0.0, 100.0)
        });

        let mut sample = Self {
            stats,
            sampled_at: at,
            cpu_percent: None,
            memory_percent,
            rx_rate: None,
            tx_rate: None,
        };

        let Some(previous) = previous else {
            return sample;
        };
        let elapsed_ns = (at - previous.sampled_at).num_nanoseconds().unwrap_or(0);
        if elapsed_ns <= 0 {
            return sample;
        }
        let elapsed_ns = elapsed_ns as f64;
        let elapsed_secs = elapsed_ns / 1e9;

        if stats.vcpus > 0 && stats.cpu_time_ns >= previous.stats.cpu_time_ns {
            let used = (stats.cpu_time_ns - previous.stats.cpu_time_ns) as f64;
            let capacity = elapsed_ns * f64::from(stats.vcpus);
            sample.cpu_percent = Some((used / capacity * 100.0).clamp(0.0, 100.0));
        }
        sample.rx_rate = per_second(stats.net_rx_bytes, previous.stats.net_rx_bytes, elapsed_secs);
        sample.tx_rate = per_second(stats.net_tx_bytes, previous.stats.net_tx_bytes, elapsed_secs);
        sample
    }
}

/// Latest sample per VM.
#[derive(Debug, Default)]
pub struct StatsCache {
    samples: RwLock<HashMap<VmId, StatsSample>>,
}

impl StatsCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record fresh counters for a VM and return the derived sample.
    pub fn record(&self, vm_id: VmId, stats: DomainStats, at: DateTime<Utc>) -> StatsSample {
        let mut samples = self.samples.write();
        let sample = StatsSample::derive(stats, at, samples.get(&vm_id));
        samples.insert(vm_id, sample);
        sample
    }

    /// Latest sample for a VM.
    #[must_use]
    pub fn get(&self, vm_id: &VmId) -> Option<StatsSample> {
        self.samples.read().get(vm_id).copied()
    }

    /// Drop a VM's sample.
    pub fn remove(&self, vm_id: &VmId) -> Option<StatsSample> {
        self.samples.write().remove(vm_id)
    }

    /// Keep only VMs for which `keep` returns true. Returns how many were dropped.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&VmId) -> bool,
    {
        let mut samples = self.samples.write();
        let before = samples.len();
        samples.retain(|id, _| keep(id));
        before - samples.len()
    }

    /// Number of VMs with a sample.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.read().len()
    }

    /// Whether no samples are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.read().is_empty()
    }
}

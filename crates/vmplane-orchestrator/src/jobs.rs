//! Periodic maintenance jobs and the scheduler that ticks them.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use vmplane_core::VmId;
use vmplane_hypervisor::HypervisorControl;
use vmplane_store::{Store, VmStatus};

use crate::domain::sample_stats;
use crate::install::InstallProgressTracker;
use crate::lifecycle::{Coordinator, LoopSet};
use crate::poller::DomainStatePoller;
use crate::stats::StatsCache;
use crate::status::StatusCache;
use crate::{OrchestratorError, Result};

/// A unit of work run on a fixed interval.
#[async_trait]
pub trait PeriodicJob: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Time between runs.
    fn interval(&self) -> Duration;

    /// Run once.
    ///
    /// # Errors
    ///
    /// Errors are logged by the scheduler; the next tick runs regardless.
    async fn run(&self) -> Result<()>;
}

/// Runs every registered job on its own task.
#[derive(Default)]
pub struct JobScheduler {
    jobs: Mutex<Vec<Arc<dyn PeriodicJob>>>,
    loops: LoopSet,
}

impl JobScheduler {
    /// Create a scheduler with no jobs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job. Jobs registered after `start` run from the next start.
    pub fn register(&self, job: Arc<dyn PeriodicJob>) {
        self.jobs.lock().push(job);
    }

    /// Names of the registered jobs.
    #[must_use]
    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.lock().iter().map(|job| job.name()).collect()
    }
}

#[async_trait]
impl Coordinator for JobScheduler {
    fn name(&self) -> &'static str {
        "job_scheduler"
    }

    fn start(self: Arc<Self>) {
        let Some(token) = self.loops.begin() else {
            debug!("job scheduler already running");
            return;
        };
        let jobs = self.jobs.lock().clone();
        for job in jobs {
            let name = job.name();
            self.loops
                .spawn_periodic(name, job.interval(), token.clone(), move || {
                    let job = Arc::clone(&job);
                    async move {
                        if let Err(e) = job.run().await {
                            warn!(job = name, error = %e, kind = %e.kind(), "job run failed");
                        }
                    }
                });
        }
        info!(jobs = self.jobs.lock().len(), "job scheduler started");
    }

    async fn stop(&self) {
        self.loops.shutdown().await;
        info!("job scheduler stopped");
    }
}

/// One domain state poll cycle per tick.
pub struct StatusSyncJob {
    poller: Arc<DomainStatePoller>,
    interval: Duration,
}

impl StatusSyncJob {
    /// Wrap a poller.
    #[must_use]
    pub fn new(poller: Arc<DomainStatePoller>, interval: Duration) -> Self {
        Self { poller, interval }
    }
}

#[async_trait]
impl PeriodicJob for StatusSyncJob {
    fn name(&self) -> &'static str {
        "status_sync"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<()> {
        let report = self.poller.run_cycle().await?;
        if report.updated > 0 || report.failed > 0 {
            info!(
                checked = report.checked,
                updated = report.updated,
                failed = report.failed,
                "status sync complete"
            );
        } else {
            debug!(checked = report.checked, "status sync complete");
        }
        Ok(())
    }
}

/// Samples counters of running VMs into the stats cache.
pub struct StatsCollectionJob {
    store: Arc<dyn Store>,
    hypervisor: Arc<dyn HypervisorControl>,
    stats: Arc<StatsCache>,
    interval: Duration,
    concurrency: usize,
    call_timeout: Duration,
}

impl StatsCollectionJob {
    /// Create the job. `concurrency` is clamped to at least one.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        hypervisor: Arc<dyn HypervisorControl>,
        stats: Arc<StatsCache>,
        interval: Duration,
        concurrency: usize,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            hypervisor,
            stats,
            interval,
            concurrency: concurrency.max(1),
            call_timeout,
        }
    }

    /// Sample every running VM once. Returns how many samples were recorded.
    ///
    /// Samples of VMs that were not refreshed, because they stopped or the
    /// read failed, are dropped so alert rules never see frozen values.
    ///
    /// # Errors
    ///
    /// Returns an error only if the running VMs cannot be listed.
    pub async fn collect(&self) -> Result<usize> {
        let targets: Vec<(VmId, String)> = self
            .store
            .list_vms_by_status(VmStatus::Running)?
            .into_iter()
            .filter_map(|vm| vm.domain_ref().map(|r| (vm.vm_id, r.to_string())))
            .collect();

        let results: Vec<(VmId, Result<_>)> = stream::iter(targets)
            .map(|(vm_id, domain_ref)| async move {
                let sampled =
                    sample_stats(self.hypervisor.as_ref(), &domain_ref, self.call_timeout).await;
                (vm_id, sampled)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut refreshed = HashSet::new();
        for (vm_id, sampled) in results {
            match sampled {
                Ok(counters) => {
                    self.stats.record(vm_id, counters, Utc::now());
                    refreshed.insert(vm_id);
                }
                Err(e) => debug!(vm_id = %vm_id, error = %e, "stats sample failed"),
            }
        }

        // A sample not refreshed this tick no longer describes the VM.
        let dropped = self.stats.retain(|vm_id| refreshed.contains(vm_id));
        if dropped > 0 {
            debug!(dropped, "dropped stale stats samples");
        }
        Ok(refreshed.len())
    }
}

#[async_trait]
impl PeriodicJob for StatsCollectionJob {
    fn name(&self) -> &'static str {
        "stats_collection"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<()> {
        let recorded = self.collect().await?;
        debug!(recorded, "stats collection complete");
        Ok(())
    }
}

/// Removes stale files from the upload staging directory.
pub struct UploadCleanupJob {
    dir: PathBuf,
    max_age: Duration,
    interval: Duration,
}

impl UploadCleanupJob {
    /// Create the job.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration, interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_age,
            interval,
        }
    }

    /// Remove regular files last modified more than `max_age` before `now`.
    /// A missing directory counts as clean.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the directory cannot be listed.
    pub async fn sweep_at(&self, now: SystemTime) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(OrchestratorError::io(
                    format!("read upload dir {}", self.dir.display()),
                    e,
                ))
            }
        };

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    return Err(OrchestratorError::io(
                        format!("read upload dir {}", self.dir.display()),
                        e,
                    ))
                }
            };
            let path = entry.path();
            let modified = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta.modified(),
                Ok(_) => continue,
                Err(e) => Err(e),
            };
            let stale = match modified {
                Ok(at) => now.duration_since(at).is_ok_and(|age| age > self.max_age),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "upload metadata unavailable");
                    false
                }
            };
            if !stale {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "removed stale upload");
                    removed += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove stale upload"),
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl PeriodicJob for UploadCleanupJob {
    fn name(&self) -> &'static str {
        "upload_cleanup"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<()> {
        let removed = self.sweep_at(SystemTime::now()).await?;
        if removed > 0 {
            info!(removed, dir = %self.dir.display(), "stale uploads removed");
        }
        Ok(())
    }
}

/// Drops in-memory state for VMs that no longer exist.
pub struct ResourceCleanupJob {
    store: Arc<dyn Store>,
    stats: Arc<StatsCache>,
    status: Arc<StatusCache>,
    installs: Arc<InstallProgressTracker>,
    interval: Duration,
}

impl ResourceCleanupJob {
    /// Create the job.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        stats: Arc<StatsCache>,
        status: Arc<StatusCache>,
        installs: Arc<InstallProgressTracker>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            stats,
            status,
            installs,
            interval,
        }
    }
}

#[async_trait]
impl PeriodicJob for ResourceCleanupJob {
    fn name(&self) -> &'static str {
        "resource_cleanup"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<()> {
        let known: HashSet<VmId> = self
            .store
            .list_all_vms()?
            .into_iter()
            .map(|vm| vm.vm_id)
            .collect();

        let stats = self.stats.retain(|id| known.contains(id));
        let installs = self.installs.retain(|id| known.contains(id));
        self.status.retain(|id| known.contains(id));
        if stats + installs > 0 {
            info!(stats, installs, "dropped state of deleted vms");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;
    use vmplane_core::OwnerId;
    use vmplane_events::EventHub;
    use vmplane_hypervisor::{DomainState, DomainStats, MockHypervisor};
    use vmplane_store::{RocksStore, VmRecord};

    use super::*;

    fn vm(store: &RocksStore, name: &str, status: VmStatus) -> VmRecord {
        let owner = OwnerId::from_bytes([9; 32]);
        let now = Utc::now();
        let record = VmRecord {
            vm_id: VmId::generate_deterministic(&owner, name, 0),
            owner_id: owner,
            name: name.to_string(),
            status,
            hypervisor_ref: Some(name.to_string()),
            vcpus: 2,
            memory_mb: 1024,
            disk_path: format!("/var/lib/vmplane/disks/{name}.qcow2"),
            created_at: now,
            updated_at: now,
        };
        store.put_vm(&record).unwrap();
        record
    }

    struct CountingJob {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl PeriodicJob for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(30)
        }

        async fn run(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(OrchestratorError::Internal("boom".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_ticks_each_job_and_survives_errors() {
        let scheduler = Arc::new(JobScheduler::new());
        let ok = Arc::new(CountingJob {
            runs: AtomicUsize::new(0),
            fail: false,
        });
        let failing = Arc::new(CountingJob {
            runs: AtomicUsize::new(0),
            fail: true,
        });
        scheduler.register(ok.clone());
        scheduler.register(failing.clone());
        assert_eq!(scheduler.job_names(), vec!["counting", "counting"]);

        Coordinator::start(Arc::clone(&scheduler));
        tokio::time::sleep(Duration::from_secs(65)).await;
        scheduler.stop().await;

        assert_eq!(ok.runs.load(Ordering::SeqCst), 3);
        assert_eq!(failing.runs.load(Ordering::SeqCst), 3);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ok.runs.load(Ordering::SeqCst), 3);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn stats_job_samples_running_vms_only() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let hv = MockHypervisor::new();
        let running = vm(&store, "web-01", VmStatus::Running);
        let stopped = vm(&store, "db-01", VmStatus::Stopped);
        hv.define("web-01", DomainState::Running);
        hv.define("db-01", DomainState::Shutoff);
        hv.set_stats(
            "web-01",
            DomainStats {
                cpu_time_ns: 5_000,
                vcpus: 2,
                memory_used_kib: 512,
                memory_total_kib: 1024,
                net_rx_bytes: 10,
                net_tx_bytes: 20,
            },
        );

        let stats = Arc::new(StatsCache::new());
        let job = StatsCollectionJob::new(
            store.clone(),
            Arc::new(hv.clone()),
            Arc::clone(&stats),
            Duration::from_secs(30),
            4,
            Duration::from_secs(1),
        );
        assert_eq!(job.collect().await.unwrap(), 1);
        let sample = stats.get(&running.vm_id).unwrap();
        assert_eq!(sample.stats.net_tx_bytes, 20);
        assert!(stats.get(&stopped.vm_id).is_none());

        hv.fail_calls_for("web-01");
        assert_eq!(job.collect().await.unwrap(), 0);
        assert!(stats.is_empty());
    }

    #[tokio::test]
    async fn stats_job_drops_samples_of_stopped_vms() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let hv = MockHypervisor::new();
        let record = vm(&store, "web-01", VmStatus::Running);
        hv.define("web-01", DomainState::Running);
        hv.set_stats("web-01", DomainStats::default());

        let stats = Arc::new(StatsCache::new());
        let job = StatsCollectionJob::new(
            store.clone(),
            Arc::new(hv.clone()),
            Arc::clone(&stats),
            Duration::from_secs(30),
            4,
            Duration::from_secs(1),
        );
        assert_eq!(job.collect().await.unwrap(), 1);
        assert!(stats.get(&record.vm_id).is_some());

        store.update_vm_status(&record.vm_id, VmStatus::Stopped).unwrap();
        assert_eq!(job.collect().await.unwrap(), 0);
        assert!(stats.get(&record.vm_id).is_none());
    }

    #[tokio::test]
    async fn upload_cleanup_removes_only_stale_files() {
        let dir = TempDir::new().unwrap();
        let staged = dir.path().join("image.iso.part");
        std::fs::write(&staged, b"partial").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let job = UploadCleanupJob::new(
            dir.path(),
            Duration::from_secs(3600),
            Duration::from_secs(60),
        );
        assert_eq!(job.sweep_at(SystemTime::now()).await.unwrap(), 0);
        assert!(staged.exists());

        let later = SystemTime::now() + Duration::from_secs(7200);
        assert_eq!(job.sweep_at(later).await.unwrap(), 1);
        assert!(!staged.exists());
        assert!(dir.path().join("nested").exists());

        let missing = UploadCleanupJob::new(
            dir.path().join("absent"),
            Duration::from_secs(1),
            Duration::from_secs(60),
        );
        assert_eq!(missing.sweep_at(later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn resource_cleanup_drops_deleted_vms() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let kept = vm(&store, "keep", VmStatus::Running);
        let gone = VmId::from_bytes([7; 32]);

        let stats = Arc::new(StatsCache::new());
        stats.record(kept.vm_id, DomainStats::default(), Utc::now());
        stats.record(gone, DomainStats::default(), Utc::now());

        let installs = Arc::new(InstallProgressTracker::new(
            Arc::new(MockHypervisor::new()),
            Arc::new(EventHub::new(8)),
            Duration::from_secs(1200),
            Duration::from_secs(1),
            Duration::from_secs(5),
        ));
        installs.track(gone, "gone");
        installs.track(kept.vm_id, "keep");

        let job = ResourceCleanupJob::new(
            store,
            Arc::clone(&stats),
            Arc::new(StatusCache::new()),
            Arc::clone(&installs),
            Duration::from_secs(300),
        );
        job.run().await.unwrap();

        assert!(stats.get(&gone).is_none());
        assert!(stats.get(&kept.vm_id).is_some());
        assert!(installs.get(&gone).is_none());
        assert!(installs.get(&kept.vm_id).is_some());
    }
}

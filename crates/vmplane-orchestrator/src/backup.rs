//! Backup orchestration: scheduling, execution, restore and retention.
//!
//! Jobs move `pending -> running -> {completed, failed}`. Two loops drive
//! them: the dispatch loop picks up due pending jobs and materializes jobs
//! from enabled schedules, and the retention loop deletes expired backups.
//! Executions run on a bounded worker pool that `stop()` drains.
//!
//! A backup is a byte copy of the VM's disk image. No pause or
//! guest quiescing happens first, so a copy of a live VM is crash-consistent
//! at best.

use std::collections::HashSet;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};
use vmplane_core::{BackupJobId, BackupScheduleId, VmId};
use vmplane_store::{BackupJob, BackupSchedule, BackupStatus, Store, VmRecord};

use crate::config::BackupConfig;
use crate::guard::ExecutionGuard;
use crate::lifecycle::{Coordinator, LoopSet};
use crate::schedule::CronSchedule;
use crate::{ErrorKind, OrchestratorError, Result};

/// Progress after the job is marked running.
pub const PROGRESS_STARTED: u8 = 10;
/// Progress after the VM is resolved.
pub const PROGRESS_VM_RESOLVED: u8 = 20;
/// Progress after source and destination are prepared.
pub const PROGRESS_PREPARED: u8 = 30;
/// Progress after the copy finished.
pub const PROGRESS_COPIED: u8 = 80;
/// Progress of a completed job.
pub const PROGRESS_DONE: u8 = 100;

/// Counters for one dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Due pending jobs handed to the worker pool.
    pub dispatched: usize,
    /// Jobs created from schedules.
    pub materialized: usize,
    /// Schedules that could not be processed.
    pub failed: usize,
}

/// Counters for one retention cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Expired jobs removed.
    pub deleted: usize,
    /// Expired jobs left for the next cycle.
    pub failed: usize,
}

/// Runs backup jobs and their schedules.
pub struct BackupOrchestrator {
    store: Arc<dyn Store>,
    config: BackupConfig,
    guard: ExecutionGuard,
    queued: Mutex<HashSet<BackupJobId>>,
    workers: Arc<Semaphore>,
    loops: LoopSet,
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != IoErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl BackupOrchestrator {
    /// Create an orchestrator.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: BackupConfig) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            store,
            config,
            guard: ExecutionGuard::new(),
            queued: Mutex::new(HashSet::new()),
            workers,
            loops: LoopSet::new(),
        }
    }

    /// The execution guards held by running backups and restores.
    #[must_use]
    pub fn guard(&self) -> &ExecutionGuard {
        &self.guard
    }

    /// Where the backup of `job_id` for `vm_id` is written.
    #[must_use]
    pub fn backup_path(&self, vm_id: &VmId, job_id: &BackupJobId, disk: &Path) -> PathBuf {
        let ext = disk
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty())
            .unwrap_or("img");
        self.config
            .backup_dir
            .join(vm_id.to_hex())
            .join(format!("{job_id}.{ext}"))
    }

    fn require_vm(&self, vm_id: &VmId) -> Result<VmRecord> {
        self.store
            .get_vm(vm_id)?
            .ok_or_else(|| OrchestratorError::not_found("vm", vm_id))
    }

    fn require_job(&self, job_id: &BackupJobId) -> Result<BackupJob> {
        self.store
            .get_backup_job(job_id)?
            .ok_or_else(|| OrchestratorError::not_found("backup job", job_id))
    }

    fn require_schedule(&self, schedule_id: &BackupScheduleId) -> Result<BackupSchedule> {
        self.store
            .get_backup_schedule(schedule_id)?
            .ok_or_else(|| OrchestratorError::not_found("backup schedule", schedule_id))
    }

    fn checkpoint(&self, job: &mut BackupJob, progress: u8) -> Result<()> {
        job.progress = progress;
        job.updated_at = Utc::now();
        self.store.put_backup_job(job)?;
        Ok(())
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Execute one pending job.
    ///
    /// Holds the job's guard and the VM's guard for the whole run. On failure
    /// the job is persisted as `failed` with the error message; there is no
    /// retry within the call.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if either guard is held, `NotFound` for a missing job,
    /// `InvalidState` if the job is not pending, or the error that failed it.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn execute_backup(&self, job_id: BackupJobId) -> Result<BackupJob> {
        let _job_guard = self
            .guard
            .try_job(job_id)
            .ok_or_else(|| OrchestratorError::AlreadyRunning(format!("backup job {job_id}")))?;

        let mut job = self.require_job(&job_id)?;
        if job.status != BackupStatus::Pending {
            return Err(OrchestratorError::InvalidState(format!(
                "backup job {job_id} is {:?}, expected pending",
                job.status
            )));
        }

        let _vm_guard = self.guard.try_vm(job.vm_id).ok_or_else(|| {
            OrchestratorError::AlreadyRunning(format!("disk operation on vm {}", job.vm_id))
        })?;

        let now = Utc::now();
        job.status = BackupStatus::Running;
        job.started_at = Some(now);
        self.checkpoint(&mut job, PROGRESS_STARTED)?;
        info!(vm_id = %job.vm_id, "backup started");

        match self.run_copy(&mut job).await {
            Ok(size) => {
                info!(vm_id = %job.vm_id, bytes = size, "backup completed");
                Ok(job)
            }
            Err(e) => {
                job.status = BackupStatus::Failed;
                job.completed_at = None;
                job.error_message = Some(e.to_string());
                job.updated_at = Utc::now();
                if let Err(store_err) = self.store.put_backup_job(&job) {
                    error!(error = %store_err, "failed to record backup failure");
                }
                warn!(vm_id = %job.vm_id, error = %e, "backup failed");
                Err(e)
            }
        }
    }

    async fn run_copy(&self, job: &mut BackupJob) -> Result<u64> {
        let size = self.copy_disk(job).await?;
        job.status = BackupStatus::Completed;
        job.file_size = Some(size);
        job.completed_at = Some(Utc::now());
        if let Err(e) = self.checkpoint(job, PROGRESS_DONE) {
            job.progress = PROGRESS_COPIED;
            return Err(e);
        }
        Ok(size)
    }

    async fn copy_disk(&self, job: &mut BackupJob) -> Result<u64> {
        let vm = self.require_vm(&job.vm_id)?;
        self.checkpoint(job, PROGRESS_VM_RESOLVED)?;

        if vm.status.is_live() {
            warn!(
                vm_id = %vm.vm_id,
                status = %vm.status,
                "copying disk of a live VM without quiescing; backup is crash-inconsistent"
            );
        }

        let source = PathBuf::from(&vm.disk_path);
        tokio::fs::metadata(&source)
            .await
            .map_err(|e| OrchestratorError::io(format!("disk image {}", source.display()), e))?;

        let dest = self.backup_path(&job.vm_id, &job.id, &source);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                OrchestratorError::io(format!("backup directory {}", parent.display()), e)
            })?;
        }
        job.file_path = Some(dest.display().to_string());
        self.checkpoint(job, PROGRESS_PREPARED)?;

        let size = match tokio::fs::copy(&source, &dest).await {
            Ok(size) => size,
            Err(e) => {
                if let Err(cleanup) = remove_if_present(&dest).await {
                    debug!(error = %cleanup, "could not remove partial backup");
                }
                return Err(OrchestratorError::io(
                    format!("copy {} to {}", source.display(), dest.display()),
                    e,
                ));
            }
        };
        self.checkpoint(job, PROGRESS_COPIED)?;
        Ok(size)
    }

    /// Hand a job to the worker pool. Returns false if it is already queued.
    pub fn dispatch(self: &Arc<Self>, job_id: BackupJobId) -> bool {
        if !self.queued.lock().insert(job_id) {
            return false;
        }

        let this = Arc::clone(self);
        self.loops.spawn(async move {
            let permit = Arc::clone(&this.workers).acquire_owned().await;
            this.queued.lock().remove(&job_id);
            let Ok(_permit) = permit else {
                error!(job_id = %job_id, "backup worker pool closed");
                return;
            };

            match this.execute_backup(job_id).await {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyRunning => {
                    info!(job_id = %job_id, reason = %e, "backup deferred");
                }
                Err(e) if e.kind() == ErrorKind::InvalidState => {
                    debug!(job_id = %job_id, reason = %e, "backup no longer pending");
                }
                Err(e) => error!(job_id = %job_id, error = %e, "backup execution failed"),
            }
        });
        true
    }

    // =========================================================================
    // Restore and manual operations
    // =========================================================================

    /// Copy a completed backup back onto its VM's disk.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the backup is not completed or has no file, or the
    /// VM is running, paused or mid-transition. `AlreadyRunning` if a backup
    /// or restore of the same VM is in progress.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn restore_backup(&self, job_id: BackupJobId) -> Result<()> {
        let job = self.require_job(&job_id)?;
        if job.status != BackupStatus::Completed {
            return Err(OrchestratorError::InvalidState(format!(
                "backup job {job_id} is {:?}, only completed backups can be restored",
                job.status
            )));
        }
        let file = job.file_path.as_deref().ok_or_else(|| {
            OrchestratorError::InvalidState(format!("backup job {job_id} has no file"))
        })?;

        let vm = self.require_vm(&job.vm_id)?;
        if vm.status.is_live() || vm.status.is_transitional() {
            return Err(OrchestratorError::InvalidState(format!(
                "vm {} is {}, stop it before restoring",
                vm.vm_id, vm.status
            )));
        }

        let _vm_guard = self.guard.try_vm(vm.vm_id).ok_or_else(|| {
            OrchestratorError::AlreadyRunning(format!("disk operation on vm {}", vm.vm_id))
        })?;

        let bytes = tokio::fs::copy(file, &vm.disk_path)
            .await
            .map_err(|e| OrchestratorError::io(format!("restore {file} to {}", vm.disk_path), e))?;
        info!(vm_id = %vm.vm_id, bytes, "backup restored");
        Ok(())
    }

    /// Create a pending job for a VM and dispatch it immediately.
    ///
    /// `retention_days` sets `expires_at`; `None` keeps the backup forever.
    ///
    /// # Errors
    ///
    /// `NotFound` if the VM does not exist, or a store error.
    pub fn create_backup(
        self: &Arc<Self>,
        vm_id: VmId,
        name: Option<String>,
        retention_days: Option<u32>,
    ) -> Result<BackupJob> {
        let vm = self.require_vm(&vm_id)?;
        let now = Utc::now();
        let name = name.unwrap_or_else(|| format!("{}-{}", vm.name, now.format("%Y%m%d-%H%M%S")));

        let mut job = BackupJob::pending(vm_id, name, now);
        job.expires_at = retention_days.map(|days| now + ChronoDuration::days(i64::from(days)));
        self.store.put_backup_job(&job)?;
        info!(job_id = %job.id, vm_id = %vm_id, "backup created");

        self.dispatch(job.id);
        Ok(job)
    }

    /// Delete a backup's file and record.
    ///
    /// A record left `running` with no execution behind it can be deleted.
    ///
    /// # Errors
    ///
    /// `InvalidState` while the job is executing, `NotFound` for a missing
    /// one, `Io` if the file exists but cannot be removed.
    pub async fn delete_backup(&self, job_id: BackupJobId) -> Result<()> {
        let job = self.require_job(&job_id)?;
        if self.guard.holds_job(&job_id) {
            return Err(OrchestratorError::InvalidState(format!(
                "backup job {job_id} is running"
            )));
        }

        if let Some(path) = &job.file_path {
            remove_if_present(Path::new(path))
                .await
                .map_err(|e| OrchestratorError::io(format!("remove {path}"), e))?;
        }
        self.store.delete_backup_job(&job_id)?;
        info!(job_id = %job_id, "backup deleted");
        Ok(())
    }

    // =========================================================================
    // Schedules
    // =========================================================================

    /// Create an enabled schedule and compute its first run.
    ///
    /// A `retention_days` of zero keeps materialized backups forever.
    ///
    /// # Errors
    ///
    /// `Config` for a malformed cron expression, `NotFound` for a missing VM.
    pub fn create_schedule(
        &self,
        vm_id: VmId,
        cron_expr: &str,
        retention_days: u32,
    ) -> Result<BackupSchedule> {
        let cron = CronSchedule::parse(cron_expr)?;
        self.require_vm(&vm_id)?;

        let now = Utc::now();
        let schedule = BackupSchedule {
            id: BackupScheduleId::generate(),
            vm_id,
            cron_expr: cron.expr().to_string(),
            retention_days,
            enabled: true,
            last_run_at: None,
            next_run_at: cron.next_after(now),
            created_at: now,
            updated_at: now,
        };
        self.store.put_backup_schedule(&schedule)?;
        info!(schedule_id = %schedule.id, vm_id = %vm_id, cron = %schedule.cron_expr, "backup schedule created");
        Ok(schedule)
    }

    /// Enable or disable a schedule. Re-enabling recomputes the next run.
    ///
    /// # Errors
    ///
    /// `NotFound` for a missing schedule, `Config` if its stored expression
    /// no longer parses.
    pub fn set_schedule_enabled(
        &self,
        schedule_id: BackupScheduleId,
        enabled: bool,
    ) -> Result<BackupSchedule> {
        let mut schedule = self.require_schedule(&schedule_id)?;
        let now = Utc::now();
        if enabled && !schedule.enabled {
            schedule.next_run_at = CronSchedule::parse(&schedule.cron_expr)?.next_after(now);
        }
        schedule.enabled = enabled;
        schedule.updated_at = now;
        self.store.put_backup_schedule(&schedule)?;
        Ok(schedule)
    }

    /// Delete a schedule. Jobs it already created are kept.
    ///
    /// # Errors
    ///
    /// `NotFound` for a missing schedule.
    pub fn delete_schedule(&self, schedule_id: BackupScheduleId) -> Result<()> {
        self.store.delete_backup_schedule(&schedule_id)?;
        Ok(())
    }

    fn materialize(&self, schedule: &BackupSchedule, now: DateTime<Utc>) -> Result<BackupJob> {
        let cron = CronSchedule::parse(&schedule.cron_expr)?;
        let vm = self.require_vm(&schedule.vm_id)?;

        let mut job = BackupJob::pending(
            vm.vm_id,
            format!("{}-{}", vm.name, now.format("%Y%m%d-%H%M%S")),
            now,
        );
        job.schedule_id = Some(schedule.id);
        job.expires_at = (schedule.retention_days > 0)
            .then(|| now + ChronoDuration::days(i64::from(schedule.retention_days)));
        self.store.put_backup_job(&job)?;

        let mut advanced = schedule.clone();
        advanced.last_run_at = Some(now);
        advanced.next_run_at = cron.next_after(now);
        advanced.updated_at = now;
        self.store.put_backup_schedule(&advanced)?;

        Ok(job)
    }

    // =========================================================================
    // Loops
    // =========================================================================

    /// One dispatch cycle at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if pending jobs or schedules cannot be listed.
    pub fn dispatch_due(self: &Arc<Self>, now: DateTime<Utc>) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();

        for job in self.store.list_backup_jobs_by_status(BackupStatus::Pending)? {
            if job.scheduled_at <= now && !self.guard.holds_job(&job.id) && self.dispatch(job.id) {
                report.dispatched += 1;
            }
        }

        for schedule in self.store.list_backup_schedules()? {
            if !schedule.enabled {
                continue;
            }
            match schedule.next_run_at {
                Some(due) if due <= now => match self.materialize(&schedule, now) {
                    Ok(job) => {
                        info!(schedule_id = %schedule.id, job_id = %job.id, "scheduled backup created");
                        report.materialized += 1;
                        if self.dispatch(job.id) {
                            report.dispatched += 1;
                        }
                    }
                    Err(e) => {
                        report.failed += 1;
                        warn!(schedule_id = %schedule.id, error = %e, "failed to run backup schedule");
                    }
                },
                Some(_) => {}
                None => {
                    if let Err(e) = self.initialize_next_run(&schedule, now) {
                        report.failed += 1;
                        warn!(schedule_id = %schedule.id, error = %e, "backup schedule has no next run");
                    }
                }
            }
        }

        debug!(
            dispatched = report.dispatched,
            materialized = report.materialized,
            failed = report.failed,
            "backup dispatch cycle complete"
        );
        Ok(report)
    }

    fn initialize_next_run(&self, schedule: &BackupSchedule, now: DateTime<Utc>) -> Result<()> {
        let mut schedule = schedule.clone();
        schedule.next_run_at = CronSchedule::parse(&schedule.cron_expr)?.next_after(now);
        schedule.updated_at = now;
        self.store.put_backup_schedule(&schedule)?;
        Ok(())
    }

    /// Mark jobs persisted as `running` with no execution in this process as
    /// failed. Returns how many were recovered.
    ///
    /// # Errors
    ///
    /// Returns an error if running jobs cannot be listed.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let mut recovered = 0;
        for mut job in self.store.list_backup_jobs_by_status(BackupStatus::Running)? {
            if self.guard.holds_job(&job.id) {
                continue;
            }
            job.status = BackupStatus::Failed;
            job.error_message = Some("interrupted before completion".to_string());
            job.updated_at = Utc::now();
            match self.store.put_backup_job(&job) {
                Ok(()) => {
                    recovered += 1;
                    warn!(job_id = %job.id, vm_id = %job.vm_id, progress = job.progress, "interrupted backup marked failed");
                }
                Err(e) => error!(job_id = %job.id, error = %e, "failed to recover interrupted backup"),
            }
        }
        Ok(recovered)
    }

    /// One retention cycle at `now`.
    ///
    /// An already-missing file counts as deleted. A file that cannot be
    /// removed leaves the job for the next cycle.
    ///
    /// # Errors
    ///
    /// Returns an error if completed jobs cannot be listed.
    pub async fn run_retention(&self, now: DateTime<Utc>) -> Result<RetentionReport> {
        let mut report = RetentionReport::default();

        let expired = self
            .store
            .list_backup_jobs_by_status(BackupStatus::Completed)?
            .into_iter()
            .filter(|job| job.is_expired(now));

        for job in expired {
            if let Some(path) = &job.file_path {
                if let Err(e) = remove_if_present(Path::new(path)).await {
                    report.failed += 1;
                    warn!(job_id = %job.id, path = %path, error = %e, "failed to delete expired backup file");
                    continue;
                }
            }
            match self.store.delete_backup_job(&job.id) {
                Ok(()) => {
                    report.deleted += 1;
                    info!(job_id = %job.id, vm_id = %job.vm_id, "expired backup removed");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(job_id = %job.id, error = %e, "failed to delete expired backup record");
                }
            }
        }

        debug!(deleted = report.deleted, failed = report.failed, "retention cycle complete");
        Ok(report)
    }
}

#[async_trait]
impl Coordinator for BackupOrchestrator {
    fn name(&self) -> &'static str {
        "backup_orchestrator"
    }

    fn start(self: Arc<Self>) {
        let Some(token) = self.loops.begin() else {
            debug!("backup orchestrator already running");
            return;
        };

        if let Err(e) = self.recover_interrupted() {
            error!(error = %e, "failed to scan for interrupted backups");
        }

        let this = Arc::clone(&self);
        self.loops.spawn_periodic(
            "backup_dispatch",
            self.config.dispatch_interval(),
            token.clone(),
            move || {
                let this = Arc::clone(&this);
                async move {
                    if let Err(e) = this.dispatch_due(Utc::now()) {
                        error!(error = %e, "backup dispatch cycle failed");
                    }
                }
            },
        );

        let this = Arc::clone(&self);
        self.loops.spawn_periodic(
            "backup_retention",
            self.config.retention_interval(),
            token,
            move || {
                let this = Arc::clone(&this);
                async move {
                    if let Err(e) = this.run_retention(Utc::now()).await {
                        error!(error = %e, "backup retention cycle failed");
                    }
                }
            },
        );

        info!(
            workers = self.config.max_concurrent,
            backup_dir = %self.config.backup_dir.display(),
            "backup orchestrator started"
        );
    }

    async fn stop(&self) {
        self.loops.shutdown().await;
        info!("backup orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use vmplane_core::{AlertHistoryId, AlertRuleId, OwnerId};
    use vmplane_store::{
        AlertHistoryRecord, AlertRule, Result as StoreResult, RocksStore, StoreError, VmStatus,
    };

    use super::*;

    struct Fixture {
        dir: TempDir,
        store: Arc<RocksStore>,
        backups: Arc<BackupOrchestrator>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path().join("db")).unwrap());
        let config = BackupConfig {
            backup_dir: dir.path().join("backups"),
            ..BackupConfig::default()
        };
        let backups = Arc::new(BackupOrchestrator::new(store.clone(), config));
        Fixture {
            dir,
            store,
            backups,
        }
    }

    impl Fixture {
        fn vm(&self, name: &str, status: VmStatus, contents: &[u8]) -> VmRecord {
            let disk = self.dir.path().join(format!("{name}.qcow2"));
            std::fs::write(&disk, contents).unwrap();
            let owner = OwnerId::from_bytes([5; 32]);
            let now = Utc::now();
            let vm = VmRecord {
                vm_id: VmId::generate_deterministic(&owner, name, 0),
                owner_id: owner,
                name: name.to_string(),
                status,
                hypervisor_ref: Some(name.to_string()),
                vcpus: 1,
                memory_mb: 512,
                disk_path: disk.display().to_string(),
                created_at: now,
                updated_at: now,
            };
            self.store.put_vm(&vm).unwrap();
            vm
        }

        fn pending(&self, vm: &VmRecord) -> BackupJob {
            let job = BackupJob::pending(vm.vm_id, "manual", Utc::now());
            self.store.put_backup_job(&job).unwrap();
            job
        }
    }

    #[tokio::test]
    async fn execute_copies_disk() {
        let f = fixture();
        let vm = f.vm("web", VmStatus::Stopped, b"disk-bytes");
        let job = f.pending(&vm);

        let done = f.backups.execute_backup(job.id).await.unwrap();
        assert_eq!(done.status, BackupStatus::Completed);
        assert_eq!(done.progress, PROGRESS_DONE);
        assert_eq!(done.file_size, Some(10));
        assert!(done.completed_at.is_some());

        let path = PathBuf::from(done.file_path.unwrap());
        assert_eq!(path, f.backups.backup_path(&vm.vm_id, &job.id, Path::new(&vm.disk_path)));
        assert!(path.to_string_lossy().ends_with(".qcow2"));
        assert_eq!(std::fs::read(path).unwrap(), b"disk-bytes");
        assert!(!f.backups.guard().holds_job(&job.id));
        assert!(!f.backups.guard().holds_vm(&vm.vm_id));
    }

    #[tokio::test]
    async fn execute_rejects_non_pending() {
        let f = fixture();
        let vm = f.vm("web", VmStatus::Stopped, b"x");
        let job = f.pending(&vm);
        f.backups.execute_backup(job.id).await.unwrap();

        let err = f.backups.execute_backup(job.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let err = f.backups.execute_backup(BackupJobId::generate()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn missing_disk_fails_job() {
        let f = fixture();
        let vm = f.vm("web", VmStatus::Stopped, b"x");
        std::fs::remove_file(&vm.disk_path).unwrap();
        let job = f.pending(&vm);

        let err = f.backups.execute_backup(job.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);

        let stored = f.store.get_backup_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, BackupStatus::Failed);
        assert!(stored.error_message.unwrap().contains("disk image"));
        assert_eq!(stored.progress, PROGRESS_VM_RESOLVED);
    }

    #[tokio::test]
    async fn second_job_for_busy_vm_stays_pending() {
        let f = fixture();
        let vm = f.vm("web", VmStatus::Stopped, b"x");
        let job = f.pending(&vm);

        let _held = f.backups.guard().try_vm(vm.vm_id).unwrap();
        let err = f.backups.execute_backup(job.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyRunning);
        let stored = f.store.get_backup_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, BackupStatus::Pending);
    }

    #[tokio::test]
    async fn restore_requires_stopped_vm_and_completed_backup() {
        let f = fixture();
        let vm = f.vm("db", VmStatus::Stopped, b"original");
        let job = f.pending(&vm);

        let err = f.backups.restore_backup(job.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        f.backups.execute_backup(job.id).await.unwrap();
        std::fs::write(&vm.disk_path, b"corrupted").unwrap();

        f.store.update_vm_status(&vm.vm_id, VmStatus::Running).unwrap();
        let err = f.backups.restore_backup(job.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        f.store.update_vm_status(&vm.vm_id, VmStatus::Stopped).unwrap();
        f.backups.restore_backup(job.id).await.unwrap();
        assert_eq!(std::fs::read(&vm.disk_path).unwrap(), b"original");
    }

    #[tokio::test]
    async fn create_backup_dispatches_and_stop_drains() {
        let f = fixture();
        let vm = f.vm("app", VmStatus::Running, b"live-disk");

        let job = f.backups.create_backup(vm.vm_id, None, Some(7)).unwrap();
        assert!(job.name.starts_with("app-"));
        assert!(job.expires_at.is_some());

        f.backups.stop().await;
        let stored = f.store.get_backup_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, BackupStatus::Completed);
    }

    #[tokio::test]
    async fn create_backup_for_unknown_vm() {
        let f = fixture();
        let ghost = VmId::from_bytes([0xAB; 32]);
        let err = f.backups.create_backup(ghost, None, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn dispatch_materializes_due_schedule() {
        let f = fixture();
        let vm = f.vm("cron", VmStatus::Stopped, b"x");
        let schedule = f.backups.create_schedule(vm.vm_id, "0 2 * * *", 3).unwrap();
        let due = schedule.next_run_at.unwrap();

        let early = f.backups.dispatch_due(due - ChronoDuration::seconds(1)).unwrap();
        assert_eq!(early.materialized, 0);

        let report = f.backups.dispatch_due(due).unwrap();
        assert_eq!(report.materialized, 1);
        assert_eq!(report.dispatched, 1);
        f.backups.stop().await;

        let jobs = f.store.list_backup_jobs_by_vm(&vm.vm_id).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].schedule_id, Some(schedule.id));
        assert_eq!(jobs[0].expires_at, Some(due + ChronoDuration::days(3)));
        assert_eq!(jobs[0].status, BackupStatus::Completed);

        let advanced = f.store.get_backup_schedule(&schedule.id).unwrap().unwrap();
        assert_eq!(advanced.last_run_at, Some(due));
        assert_eq!(advanced.next_run_at, Some(due + ChronoDuration::days(1)));
    }

    #[tokio::test]
    async fn disabled_schedule_is_skipped() {
        let f = fixture();
        let vm = f.vm("cron", VmStatus::Stopped, b"x");
        let schedule = f.backups.create_schedule(vm.vm_id, "*/5 * * * *", 1).unwrap();
        f.backups.set_schedule_enabled(schedule.id, false).unwrap();

        let far = Utc::now() + ChronoDuration::days(1);
        let report = f.backups.dispatch_due(far).unwrap();
        assert_eq!(report.materialized, 0);

        let enabled = f.backups.set_schedule_enabled(schedule.id, true).unwrap();
        assert!(enabled.next_run_at.unwrap() > Utc::now());

        f.backups.delete_schedule(schedule.id).unwrap();
        assert_eq!(
            f.backups.delete_schedule(schedule.id).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn malformed_cron_rejected() {
        let f = fixture();
        let vm = f.vm("cron", VmStatus::Stopped, b"x");
        let err = f.backups.create_schedule(vm.vm_id, "every tuesday", 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn delete_backup_removes_file_and_record() {
        let f = fixture();
        let vm = f.vm("web", VmStatus::Stopped, b"x");
        let job = f.pending(&vm);
        let done = f.backups.execute_backup(job.id).await.unwrap();
        let path = PathBuf::from(done.file_path.unwrap());

        f.backups.delete_backup(job.id).await.unwrap();
        assert!(!path.exists());
        assert!(f.store.get_backup_job(&job.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_is_refused_only_while_executing() {
        let f = fixture();
        let vm = f.vm("web", VmStatus::Stopped, b"x");
        let mut job = f.pending(&vm);
        job.status = BackupStatus::Running;
        f.store.put_backup_job(&job).unwrap();

        let held = f.backups.guard().try_job(job.id).unwrap();
        let err = f.backups.delete_backup(job.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        // Nothing is executing it any more.
        drop(held);
        f.backups.delete_backup(job.id).await.unwrap();
        assert!(f.store.get_backup_job(&job.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn start_fails_jobs_left_running() {
        let f = fixture();
        let vm = f.vm("web", VmStatus::Stopped, b"x");
        let mut stale = f.pending(&vm);
        stale.status = BackupStatus::Running;
        stale.progress = PROGRESS_PREPARED;
        f.store.put_backup_job(&stale).unwrap();

        Coordinator::start(Arc::clone(&f.backups));
        f.backups.stop().await;

        let stored = f.store.get_backup_job(&stale.id).unwrap().unwrap();
        assert_eq!(stored.status, BackupStatus::Failed);
        assert!(stored.error_message.unwrap().contains("interrupted"));
        assert!(f
            .store
            .list_backup_jobs_by_status(BackupStatus::Running)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn recovery_skips_executing_jobs() {
        let f = fixture();
        let vm = f.vm("web", VmStatus::Stopped, b"x");
        let mut live = f.pending(&vm);
        live.status = BackupStatus::Running;
        f.store.put_backup_job(&live).unwrap();

        let _held = f.backups.guard().try_job(live.id).unwrap();
        assert_eq!(f.backups.recover_interrupted().unwrap(), 0);
        let stored = f.store.get_backup_job(&live.id).unwrap().unwrap();
        assert_eq!(stored.status, BackupStatus::Running);
    }

    /// Rejects every write of a completed backup job.
    struct RejectCompleted(Arc<RocksStore>);

    impl Store for RejectCompleted {
        fn put_vm(&self, vm: &VmRecord) -> StoreResult<()> {
            self.0.put_vm(vm)
        }
        fn get_vm(&self, vm_id: &VmId) -> StoreResult<Option<VmRecord>> {
            self.0.get_vm(vm_id)
        }
        fn delete_vm(&self, vm_id: &VmId) -> StoreResult<()> {
            self.0.delete_vm(vm_id)
        }
        fn list_all_vms(&self) -> StoreResult<Vec<VmRecord>> {
            self.0.list_all_vms()
        }
        fn list_vms_by_status(&self, status: VmStatus) -> StoreResult<Vec<VmRecord>> {
            self.0.list_vms_by_status(status)
        }
        fn update_vm_status(&self, vm_id: &VmId, status: VmStatus) -> StoreResult<()> {
            self.0.update_vm_status(vm_id, status)
        }
        fn put_backup_job(&self, job: &BackupJob) -> StoreResult<()> {
            if job.status == BackupStatus::Completed {
                return Err(StoreError::Database("disk full".to_string()));
            }
            self.0.put_backup_job(job)
        }
        fn get_backup_job(&self, job_id: &BackupJobId) -> StoreResult<Option<BackupJob>> {
            self.0.get_backup_job(job_id)
        }
        fn delete_backup_job(&self, job_id: &BackupJobId) -> StoreResult<()> {
            self.0.delete_backup_job(job_id)
        }
        fn list_backup_jobs_by_status(&self, status: BackupStatus) -> StoreResult<Vec<BackupJob>> {
            self.0.list_backup_jobs_by_status(status)
        }
        fn list_backup_jobs_by_vm(&self, vm_id: &VmId) -> StoreResult<Vec<BackupJob>> {
            self.0.list_backup_jobs_by_vm(vm_id)
        }
        fn put_backup_schedule(&self, schedule: &BackupSchedule) -> StoreResult<()> {
            self.0.put_backup_schedule(schedule)
        }
        fn get_backup_schedule(
            &self,
            schedule_id: &BackupScheduleId,
        ) -> StoreResult<Option<BackupSchedule>> {
            self.0.get_backup_schedule(schedule_id)
        }
        fn delete_backup_schedule(&self, schedule_id: &BackupScheduleId) -> StoreResult<()> {
            self.0.delete_backup_schedule(schedule_id)
        }
        fn list_backup_schedules(&self) -> StoreResult<Vec<BackupSchedule>> {
            self.0.list_backup_schedules()
        }
        fn put_alert_rule(&self, rule: &AlertRule) -> StoreResult<()> {
            self.0.put_alert_rule(rule)
        }
        fn get_alert_rule(&self, rule_id: &AlertRuleId) -> StoreResult<Option<AlertRule>> {
            self.0.get_alert_rule(rule_id)
        }
        fn delete_alert_rule(&self, rule_id: &AlertRuleId) -> StoreResult<()> {
            self.0.delete_alert_rule(rule_id)
        }
        fn list_alert_rules(&self) -> StoreResult<Vec<AlertRule>> {
            self.0.list_alert_rules()
        }
        fn put_alert_history(&self, record: &AlertHistoryRecord) -> StoreResult<()> {
            self.0.put_alert_history(record)
        }
        fn get_alert_history(
            &self,
            history_id: &AlertHistoryId,
        ) -> StoreResult<Option<AlertHistoryRecord>> {
            self.0.get_alert_history(history_id)
        }
        fn list_alert_history_by_rule(
            &self,
            rule_id: &AlertRuleId,
        ) -> StoreResult<Vec<AlertHistoryRecord>> {
            self.0.list_alert_history_by_rule(rule_id)
        }
    }

    #[tokio::test]
    async fn failed_completion_write_fails_job() {
        let f = fixture();
        let vm = f.vm("web", VmStatus::Stopped, b"disk-bytes");
        let job = f.pending(&vm);

        let backups = BackupOrchestrator::new(
            Arc::new(RejectCompleted(Arc::clone(&f.store))),
            BackupConfig {
                backup_dir: f.dir.path().join("backups"),
                ..BackupConfig::default()
            },
        );
        let err = backups.execute_backup(job.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);

        let stored = f.store.get_backup_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, BackupStatus::Failed);
        assert_eq!(stored.progress, PROGRESS_COPIED);
        assert!(stored.completed_at.is_none());
        assert!(stored.error_message.unwrap().contains("disk full"));
        assert!(!backups.guard().holds_job(&job.id));
    }
}

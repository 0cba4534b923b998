//! `RocksDB` storage layer for vmplane.
//!
//! This crate is the persistence collaborator of the orchestration core. It
//! stores VMs, backup jobs and schedules, alert rules and alert history using
//! `RocksDB` with column families for indexing.
//!
//! # Architecture
//!
//! The storage uses the following column families:
//!
//! - `vms`: Primary VM records, keyed by `vm_id`
//! - `vms_by_status`: Index for listing VMs by status
//! - `backup_jobs`: Backup job records, keyed by `job_id`
//! - `backup_jobs_by_status`: Index for listing jobs by status
//! - `backup_jobs_by_vm`: Index for listing jobs of a VM
//! - `backup_schedules`: Backup schedules
//! - `alert_rules`: Alert rules
//! - `alert_history`: Fired alert occurrences
//! - `alert_history_by_rule`: Index for listing occurrences of a rule
//!
//! # Example
//!
//! ```no_run
//! use vmplane_store::{RocksStore, Store, VmStatus};
//!
//! let store = RocksStore::open("/tmp/vmplane-db").unwrap();
//!
//! // List running VMs
//! let running = store.list_vms_by_status(VmStatus::Running).unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;
pub mod types;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;
pub use types::{
    AlertHistoryRecord, AlertRule, AlertScope, AlertStatus, BackupJob, BackupSchedule,
    BackupStatus, Comparison, Severity, UnknownComparison, VmRecord, VmStatus,
};

use vmplane_core::{AlertHistoryId, AlertRuleId, BackupJobId, BackupScheduleId, VmId};

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer so that coordinators only call
/// per-entity operations and never embed query logic.
pub trait Store: Send + Sync {
    // =========================================================================
    // VM Operations
    // =========================================================================

    /// Insert or update a VM record.
    ///
    /// This also maintains the status index.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_vm(&self, vm: &VmRecord) -> Result<()>;

    /// Get a VM by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_vm(&self, vm_id: &VmId) -> Result<Option<VmRecord>>;

    /// Delete a VM by ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the VM doesn't exist.
    fn delete_vm(&self, vm_id: &VmId) -> Result<()>;

    /// List all VMs in the database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_all_vms(&self) -> Result<Vec<VmRecord>>;

    /// List all VMs with a given status.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_vms_by_status(&self, status: VmStatus) -> Result<Vec<VmRecord>>;

    /// Update a VM's status and bump `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the VM doesn't exist.
    fn update_vm_status(&self, vm_id: &VmId, status: VmStatus) -> Result<()>;

    // =========================================================================
    // Backup Job Operations
    // =========================================================================

    /// Insert or update a backup job.
    ///
    /// This also maintains the status and VM indexes.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_backup_job(&self, job: &BackupJob) -> Result<()>;

    /// Get a backup job by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_backup_job(&self, job_id: &BackupJobId) -> Result<Option<BackupJob>>;

    /// Delete a backup job by ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the job doesn't exist.
    fn delete_backup_job(&self, job_id: &BackupJobId) -> Result<()>;

    /// List all backup jobs with a given status.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_backup_jobs_by_status(&self, status: BackupStatus) -> Result<Vec<BackupJob>>;

    /// List all backup jobs of a VM.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_backup_jobs_by_vm(&self, vm_id: &VmId) -> Result<Vec<BackupJob>>;

    // =========================================================================
    // Backup Schedule Operations
    // =========================================================================

    /// Insert or update a backup schedule.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_backup_schedule(&self, schedule: &BackupSchedule) -> Result<()>;

    /// Get a backup schedule by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_backup_schedule(&self, schedule_id: &BackupScheduleId)
        -> Result<Option<BackupSchedule>>;

    /// Delete a backup schedule by ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the schedule doesn't exist.
    fn delete_backup_schedule(&self, schedule_id: &BackupScheduleId) -> Result<()>;

    /// List all backup schedules.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_backup_schedules(&self) -> Result<Vec<BackupSchedule>>;

    // =========================================================================
    // Alert Rule Operations
    // =========================================================================

    /// Insert or update an alert rule.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_alert_rule(&self, rule: &AlertRule) -> Result<()>;

    /// Get an alert rule by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_alert_rule(&self, rule_id: &AlertRuleId) -> Result<Option<AlertRule>>;

    /// Delete an alert rule by ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the rule doesn't exist.
    fn delete_alert_rule(&self, rule_id: &AlertRuleId) -> Result<()>;

    /// List all alert rules.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_alert_rules(&self) -> Result<Vec<AlertRule>>;

    /// List enabled alert rules.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_enabled_alert_rules(&self) -> Result<Vec<AlertRule>> {
        Ok(self
            .list_alert_rules()?
            .into_iter()
            .filter(|rule| rule.enabled)
            .collect())
    }

    // =========================================================================
    // Alert History Operations
    // =========================================================================

    /// Insert or update an alert history record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_alert_history(&self, record: &AlertHistoryRecord) -> Result<()>;

    /// Get an alert history record by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_alert_history(&self, history_id: &AlertHistoryId)
        -> Result<Option<AlertHistoryRecord>>;

    /// List the history of a rule.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_alert_history_by_rule(&self, rule_id: &AlertRuleId) -> Result<Vec<AlertHistoryRecord>>;
}

//! Database schema definitions and column families.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Primary VM records, keyed by `vm_id`.
    pub const VMS: &str = "vms";

    /// Index: VMs by status, keyed by `status || vm_id`.
    pub const VMS_BY_STATUS: &str = "vms_by_status";

    /// Primary backup job records, keyed by `job_id`.
    pub const BACKUP_JOBS: &str = "backup_jobs";

    /// Index: backup jobs by status, keyed by `status || job_id`.
    pub const BACKUP_JOBS_BY_STATUS: &str = "backup_jobs_by_status";

    /// Index: backup jobs by VM, keyed by `vm_id || job_id`.
    pub const BACKUP_JOBS_BY_VM: &str = "backup_jobs_by_vm";

    /// Backup schedules, keyed by `schedule_id`.
    pub const BACKUP_SCHEDULES: &str = "backup_schedules";

    /// Alert rules, keyed by `rule_id`.
    pub const ALERT_RULES: &str = "alert_rules";

    /// Fired alert occurrences, keyed by `history_id`.
    pub const ALERT_HISTORY: &str = "alert_history";

    /// Index: alert history by rule, keyed by `rule_id || history_id`.
    pub const ALERT_HISTORY_BY_RULE: &str = "alert_history_by_rule";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::VMS,
        cf::VMS_BY_STATUS,
        cf::BACKUP_JOBS,
        cf::BACKUP_JOBS_BY_STATUS,
        cf::BACKUP_JOBS_BY_VM,
        cf::BACKUP_SCHEDULES,
        cf::ALERT_RULES,
        cf::ALERT_HISTORY,
        cf::ALERT_HISTORY_BY_RULE,
    ]
}

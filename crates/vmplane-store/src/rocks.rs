//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use vmplane_core::{AlertHistoryId, AlertRuleId, BackupJobId, BackupScheduleId, VmId};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::types::{
    AlertHistoryRecord, AlertRule, BackupJob, BackupSchedule, BackupStatus, VmRecord, VmStatus,
};
use crate::Store;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)?;
        tracing::debug!("opened rocksdb store");

        Ok(Self { db: Arc::new(db) })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Point lookup of a CBOR value.
    fn get_value<T: serde::de::DeserializeOwned>(
        &self,
        cf_name: &str,
        key: &[u8],
    ) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    /// Write a CBOR value under a single key.
    fn put_value<T: serde::Serialize>(
        &self,
        cf_name: &str,
        key: &[u8],
        value: &T,
    ) -> Result<()> {
        let cf = self.cf(cf_name)?;
        self.db.put_cf(&cf, key, Self::serialize(value)?)?;
        Ok(())
    }

    /// Delete a single key, failing with `NotFound` when absent.
    fn delete_existing(&self, cf_name: &str, key: &[u8]) -> Result<()> {
        let cf = self.cf(cf_name)?;
        if self.db.get_pinned_cf(&cf, key)?.is_none() {
            return Err(StoreError::NotFound);
        }
        self.db.delete_cf(&cf, key)?;
        Ok(())
    }

    /// Decode every value of a column family.
    fn scan_values<T: serde::de::DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let mut values = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            values.push(Self::deserialize(&value)?);
        }
        Ok(values)
    }

    /// Collect every index key starting with `prefix`.
    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<Box<[u8]>>> {
        let cf = self.cf(cf_name)?;
        let mut found = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        for item in iter {
            let (key, _) = item?;

            // Stop if we're past the prefix
            if !key.starts_with(prefix) {
                break;
            }
            found.push(key);
        }

        Ok(found)
    }

    /// Resolve backup jobs referenced by an index prefix.
    fn jobs_from_index<F>(
        &self,
        cf_name: &str,
        prefix: &[u8],
        extract: F,
    ) -> Result<Vec<BackupJob>>
    where
        F: Fn(&[u8]) -> Option<BackupJobId>,
    {
        let mut jobs = Vec::new();
        for key in self.scan_prefix(cf_name, prefix)? {
            let Some(job_id) = extract(&key[..]) else {
                tracing::warn!(cf = cf_name, "skipping malformed index key");
                continue;
            };
            if let Some(job) = self.get_backup_job(&job_id)? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }
}

impl Store for RocksStore {
    // =========================================================================
    // VM Operations
    // =========================================================================

    fn put_vm(&self, vm: &VmRecord) -> Result<()> {
        let cf_vms = self.cf(cf::VMS)?;
        let cf_by_status = self.cf(cf::VMS_BY_STATUS)?;

        let vm_key = keys::vm_key(&vm.vm_id);
        let value = Self::serialize(vm)?;

        let old_status = self.get_vm(&vm.vm_id)?.map(|old| old.status);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_vms, &vm_key, &value);

        if let Some(old) = old_status.filter(|old| *old != vm.status) {
            batch.delete_cf(&cf_by_status, keys::status_vm_key(old.as_u8(), &vm.vm_id));
        }
        batch.put_cf(
            &cf_by_status,
            keys::status_vm_key(vm.status.as_u8(), &vm.vm_id),
            [],
        );

        self.db.write(batch)?;
        Ok(())
    }

    fn get_vm(&self, vm_id: &VmId) -> Result<Option<VmRecord>> {
        self.get_value(cf::VMS, &keys::vm_key(vm_id))
    }

    fn delete_vm(&self, vm_id: &VmId) -> Result<()> {
        let cf_vms = self.cf(cf::VMS)?;
        let cf_by_status = self.cf(cf::VMS_BY_STATUS)?;

        let vm = self.get_vm(vm_id)?.ok_or(StoreError::NotFound)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_vms, keys::vm_key(vm_id));
        batch.delete_cf(&cf_by_status, keys::status_vm_key(vm.status.as_u8(), vm_id));

        self.db.write(batch)?;
        Ok(())
    }

    fn list_all_vms(&self) -> Result<Vec<VmRecord>> {
        self.scan_values(cf::VMS)
    }

    fn list_vms_by_status(&self, status: VmStatus) -> Result<Vec<VmRecord>> {
        let prefix = keys::status_prefix(status.as_u8());

        let mut vms = Vec::new();
        for key in self.scan_prefix(cf::VMS_BY_STATUS, &prefix)? {
            let Some(vm_id) = keys::extract_vm_id_from_status_key(&key) else {
                tracing::warn!(cf = cf::VMS_BY_STATUS, "skipping malformed index key");
                continue;
            };
            if let Some(vm) = self.get_vm(&vm_id)? {
                vms.push(vm);
            }
        }

        Ok(vms)
    }

    fn update_vm_status(&self, vm_id: &VmId, status: VmStatus) -> Result<()> {
        let mut vm = self.get_vm(vm_id)?.ok_or(StoreError::NotFound)?;
        vm.status = status;
        vm.updated_at = chrono::Utc::now();
        self.put_vm(&vm)
    }

    // =========================================================================
    // Backup Job Operations
    // =========================================================================

    fn put_backup_job(&self, job: &BackupJob) -> Result<()> {
        let cf_jobs = self.cf(cf::BACKUP_JOBS)?;
        let cf_by_status = self.cf(cf::BACKUP_JOBS_BY_STATUS)?;
        let cf_by_vm = self.cf(cf::BACKUP_JOBS_BY_VM)?;

        let value = Self::serialize(job)?;
        let old_status = self.get_backup_job(&job.id)?.map(|old| old.status);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_jobs, keys::backup_job_key(&job.id), &value);
        batch.put_cf(&cf_by_vm, keys::vm_job_key(&job.vm_id, &job.id), []);

        if let Some(old) = old_status.filter(|old| *old != job.status) {
            batch.delete_cf(&cf_by_status, keys::status_job_key(old.as_u8(), &job.id));
        }
        batch.put_cf(
            &cf_by_status,
            keys::status_job_key(job.status.as_u8(), &job.id),
            [],
        );

        self.db.write(batch)?;
        Ok(())
    }

    fn get_backup_job(&self, job_id: &BackupJobId) -> Result<Option<BackupJob>> {
        self.get_value(cf::BACKUP_JOBS, &keys::backup_job_key(job_id))
    }

    fn delete_backup_job(&self, job_id: &BackupJobId) -> Result<()> {
        let cf_jobs = self.cf(cf::BACKUP_JOBS)?;
        let cf_by_status = self.cf(cf::BACKUP_JOBS_BY_STATUS)?;
        let cf_by_vm = self.cf(cf::BACKUP_JOBS_BY_VM)?;

        let job = self.get_backup_job(job_id)?.ok_or(StoreError::NotFound)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_jobs, keys::backup_job_key(job_id));
        batch.delete_cf(&cf_by_status, keys::status_job_key(job.status.as_u8(), job_id));
        batch.delete_cf(&cf_by_vm, keys::vm_job_key(&job.vm_id, job_id));

        self.db.write(batch)?;
        Ok(())
    }

    fn list_backup_jobs_by_status(&self, status: BackupStatus) -> Result<Vec<BackupJob>> {
        self.jobs_from_index(
            cf::BACKUP_JOBS_BY_STATUS,
            &keys::status_prefix(status.as_u8()),
            keys::extract_job_id_from_status_key,
        )
    }

    fn list_backup_jobs_by_vm(&self, vm_id: &VmId) -> Result<Vec<BackupJob>> {
        self.jobs_from_index(
            cf::BACKUP_JOBS_BY_VM,
            &keys::vm_prefix(vm_id),
            keys::extract_job_id_from_vm_job_key,
        )
    }

    // =========================================================================
    // Backup Schedule Operations
    // =========================================================================

    fn put_backup_schedule(&self, schedule: &BackupSchedule) -> Result<()> {
        self.put_value(
            cf::BACKUP_SCHEDULES,
            &keys::backup_schedule_key(&schedule.id),
            schedule,
        )
    }

    fn get_backup_schedule(
        &self,
        schedule_id: &BackupScheduleId,
    ) -> Result<Option<BackupSchedule>> {
        self.get_value(cf::BACKUP_SCHEDULES, &keys::backup_schedule_key(schedule_id))
    }

    fn delete_backup_schedule(&self, schedule_id: &BackupScheduleId) -> Result<()> {
        self.delete_existing(cf::BACKUP_SCHEDULES, &keys::backup_schedule_key(schedule_id))
    }

    fn list_backup_schedules(&self) -> Result<Vec<BackupSchedule>> {
        self.scan_values(cf::BACKUP_SCHEDULES)
    }

    // =========================================================================
    // Alert Rule Operations
    // =========================================================================

    fn put_alert_rule(&self, rule: &AlertRule) -> Result<()> {
        self.put_value(cf::ALERT_RULES, &keys::alert_rule_key(&rule.id), rule)
    }

    fn get_alert_rule(&self, rule_id: &AlertRuleId) -> Result<Option<AlertRule>> {
        self.get_value(cf::ALERT_RULES, &keys::alert_rule_key(rule_id))
    }

    fn delete_alert_rule(&self, rule_id: &AlertRuleId) -> Result<()> {
        self.delete_existing(cf::ALERT_RULES, &keys::alert_rule_key(rule_id))
    }

    fn list_alert_rules(&self) -> Result<Vec<AlertRule>> {
        self.scan_values(cf::ALERT_RULES)
    }

    // =========================================================================
    // Alert History Operations
    // =========================================================================

    fn put_alert_history(&self, record: &AlertHistoryRecord) -> Result<()> {
        let cf_history = self.cf(cf::ALERT_HISTORY)?;
        let cf_by_rule = self.cf(cf::ALERT_HISTORY_BY_RULE)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_history,
            keys::alert_history_key(&record.id),
            Self::serialize(record)?,
        );
        batch.put_cf(
            &cf_by_rule,
            keys::rule_history_key(&record.rule_id, &record.id),
            [],
        );

        self.db.write(batch)?;
        Ok(())
    }

    fn get_alert_history(
        &self,
        history_id: &AlertHistoryId,
    ) -> Result<Option<AlertHistoryRecord>> {
        self.get_value(cf::ALERT_HISTORY, &keys::alert_history_key(history_id))
    }

    fn list_alert_history_by_rule(
        &self,
        rule_id: &AlertRuleId,
    ) -> Result<Vec<AlertHistoryRecord>> {
        let prefix = keys::rule_prefix(rule_id);

        let mut records = Vec::new();
        for key in self.scan_prefix(cf::ALERT_HISTORY_BY_RULE, &prefix)? {
            let Some(history_id) = keys::extract_history_id_from_rule_key(&key) else {
                continue;
            };
            if let Some(record) = self.get_alert_history(&history_id)? {
                records.push(record);
            }
        }

        Ok(records)
    }
}

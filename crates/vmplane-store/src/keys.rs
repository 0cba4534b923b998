//! Key encoding utilities for `RocksDB`.
//!
//! Index keys are fixed-width concatenations so that prefix scans over the
//! leading component return every entry for it.

use vmplane_core::{AlertHistoryId, AlertRuleId, BackupJobId, BackupScheduleId, VmId};

/// Encode a VM key (just the VM ID bytes).
#[must_use]
pub fn vm_key(vm_id: &VmId) -> Vec<u8> {
    vm_id.as_bytes().to_vec()
}

/// Encode a status-VM index key: `status || vm_id`.
#[must_use]
pub fn status_vm_key(status: u8, vm_id: &VmId) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(status);
    key.extend_from_slice(vm_id.as_bytes());
    key
}

/// Encode a status prefix for scanning any status-led index.
#[must_use]
pub fn status_prefix(status: u8) -> Vec<u8> {
    vec![status]
}

/// Extract the VM ID from a status-VM key.
#[must_use]
pub fn extract_vm_id_from_status_key(key: &[u8]) -> Option<VmId> {
    let bytes: [u8; 32] = key.get(1..33)?.try_into().ok()?;
    Some(VmId::from_bytes(bytes))
}

/// Encode a backup job key.
#[must_use]
pub fn backup_job_key(job_id: &BackupJobId) -> Vec<u8> {
    job_id.as_bytes().to_vec()
}

/// Encode a status-job index key: `status || job_id`.
#[must_use]
pub fn status_job_key(status: u8, job_id: &BackupJobId) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(status);
    key.extend_from_slice(job_id.as_bytes());
    key
}

/// Extract the job ID from a status-job key.
#[must_use]
pub fn extract_job_id_from_status_key(key: &[u8]) -> Option<BackupJobId> {
    uuid_at(key, 1).map(BackupJobId::from_uuid)
}

/// Encode a VM-job index key: `vm_id || job_id`.
#[must_use]
pub fn vm_job_key(vm_id: &VmId, job_id: &BackupJobId) -> Vec<u8> {
    let mut key = Vec::with_capacity(48);
    key.extend_from_slice(vm_id.as_bytes());
    key.extend_from_slice(job_id.as_bytes());
    key
}

/// Encode a VM prefix for scanning all jobs of a VM.
#[must_use]
pub fn vm_prefix(vm_id: &VmId) -> Vec<u8> {
    vm_id.as_bytes().to_vec()
}

/// Extract the job ID from a VM-job key.
#[must_use]
pub fn extract_job_id_from_vm_job_key(key: &[u8]) -> Option<BackupJobId> {
    uuid_at(key, 32).map(BackupJobId::from_uuid)
}

/// Encode a backup schedule key.
#[must_use]
pub fn backup_schedule_key(schedule_id: &BackupScheduleId) -> Vec<u8> {
    schedule_id.as_bytes().to_vec()
}

/// Encode an alert rule key.
#[must_use]
pub fn alert_rule_key(rule_id: &AlertRuleId) -> Vec<u8> {
    rule_id.as_bytes().to_vec()
}

/// Encode an alert history key.
#[must_use]
pub fn alert_history_key(history_id: &AlertHistoryId) -> Vec<u8> {
    history_id.as_bytes().to_vec()
}

/// Encode a rule-history index key: `rule_id || history_id`.
#[must_use]
pub fn rule_history_key(rule_id: &AlertRuleId, history_id: &AlertHistoryId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(rule_id.as_bytes());
    key.extend_from_slice(history_id.as_bytes());
    key
}

/// Encode a rule prefix for scanning all history of a rule.
#[must_use]
pub fn rule_prefix(rule_id: &AlertRuleId) -> Vec<u8> {
    rule_id.as_bytes().to_vec()
}

/// Extract the history ID from a rule-history key.
#[must_use]
pub fn extract_history_id_from_rule_key(key: &[u8]) -> Option<AlertHistoryId> {
    uuid_at(key, 16).map(AlertHistoryId::from_uuid)
}

fn uuid_at(key: &[u8], offset: usize) -> Option<uuid::Uuid> {
    let bytes: [u8; 16] = key.get(offset..offset + 16)?.try_into().ok()?;
    Some(uuid::Uuid::from_bytes(bytes))
}

//! Shared fixtures for the orchestrator integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;
use vmplane_core::{OwnerId, VmId};
use vmplane_hypervisor::{DomainState, MockHypervisor};
use vmplane_store::{RocksStore, Store, VmRecord, VmStatus};

/// A scratch directory holding a store, disk images and backups.
pub struct Env {
    pub dir: TempDir,
    pub store: Arc<RocksStore>,
    pub hv: MockHypervisor,
}

impl Env {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path().join("db")).unwrap());
        std::fs::create_dir_all(dir.path().join("disks")).unwrap();
        Self {
            dir,
            store,
            hv: MockHypervisor::new(),
        }
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.dir.path().join("backups")
    }

    pub fn disk(&self, name: &str) -> PathBuf {
        self.dir.path().join("disks").join(format!("{name}.qcow2"))
    }

    /// Persist a VM with a disk image on disk and, if `state` is set, a
    /// matching domain in the mock hypervisor.
    pub fn vm(&self, name: &str, status: VmStatus, state: Option<DomainState>) -> VmRecord {
        let disk = self.disk(name);
        std::fs::write(&disk, format!("disk image of {name}")).unwrap();
        let record = vm_record(name, status, &disk);
        self.store.put_vm(&record).unwrap();
        if let Some(state) = state {
            self.hv.define(name, state);
        }
        record
    }
}

pub fn owner() -> OwnerId {
    OwnerId::from_bytes([42; 32])
}

pub fn vm_record(name: &str, status: VmStatus, disk: &Path) -> VmRecord {
    let now = Utc::now();
    VmRecord {
        vm_id: VmId::generate_deterministic(&owner(), name, 0),
        owner_id: owner(),
        name: name.to_string(),
        status,
        hypervisor_ref: Some(name.to_string()),
        vcpus: 2,
        memory_mb: 2048,
        disk_path: disk.display().to_string(),
        created_at: now,
        updated_at: now,
    }
}

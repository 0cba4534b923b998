//! Core types and utilities for vmplane.
//!
//! This crate provides the foundational types used throughout the vmplane platform:
//!
//! - **Identifiers**: Strongly-typed IDs for owners, VMs, backups, and alert rules
//! - **Parse errors**: [`IdError`] for malformed identifiers
//!
//! # Example
//!
//! ```
//! use vmplane_core::{BackupJobId, OwnerId, VmId};
//!
//! // Parse an owner ID from hex
//! let owner_id = OwnerId::from_hex(
//!     "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
//! ).unwrap();
//!
//! // Generate a VM ID
//! let vm_id = VmId::generate(&owner_id, "web-01");
//!
//! // Generate a backup job ID
//! let job_id = BackupJobId::generate();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod ids;

pub use ids::{
    AlertHistoryId, AlertRuleId, BackupJobId, BackupScheduleId, IdError, OwnerId, VmId,
};

//! Domain types stored in the database.
//!
//! These types represent the persisted state of VMs, backups, and alerting.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vmplane_core::{
    AlertHistoryId, AlertRuleId, BackupJobId, BackupScheduleId, OwnerId, VmId,
};

// =============================================================================
// VMs
// =============================================================================

/// A VM record stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    /// Unique identifier for the VM.
    pub vm_id: VmId,
    /// Owner of the VM.
    pub owner_id: OwnerId,
    /// Human-readable name.
    pub name: String,
    /// Last persisted lifecycle status.
    pub status: VmStatus,
    /// Name or UUID of the domain in the hypervisor, if defined.
    #[serde(default)]
    pub hypervisor_ref: Option<String>,
    /// Allocated virtual CPUs.
    pub vcpus: u32,
    /// Allocated memory in megabytes.
    pub memory_mb: u64,
    /// Path of the primary disk image.
    pub disk_path: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl VmRecord {
    /// The hypervisor reference, if set and non-empty.
    #[must_use]
    pub fn domain_ref(&self) -> Option<&str> {
        self.hypervisor_ref.as_deref().filter(|r| !r.is_empty())
    }
}

/// Lifecycle status of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum VmStatus {
    /// The VM is being defined.
    Creating = 1,
    /// A start operation is in flight.
    Starting = 2,
    /// The domain is running.
    Running = 3,
    /// A stop operation is in flight.
    Stopping = 4,
    /// The domain is shut off or not defined.
    Stopped = 5,
    /// The domain is paused.
    Suspended = 6,
    /// The domain crashed.
    Crashed = 7,
    /// The hypervisor reported a state with no canonical mapping.
    Unknown = 8,
}

impl VmStatus {
    /// Convert the status to its numeric representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Try to convert a numeric value to a `VmStatus`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Creating),
            2 => Some(Self::Starting),
            3 => Some(Self::Running),
            4 => Some(Self::Stopping),
            5 => Some(Self::Stopped),
            6 => Some(Self::Suspended),
            7 => Some(Self::Crashed),
            8 => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Whether the status marks an in-flight user operation.
    ///
    /// Reconciliation never overwrites a transitional status.
    #[must_use]
    pub const fn is_transitional(self) -> bool {
        matches!(self, Self::Creating | Self::Starting | Self::Stopping)
    }

    /// Whether the domain holds live guest state (running or paused).
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Running | Self::Suspended)
    }

    /// The lowercase name used in events and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Suspended => "suspended",
            Self::Crashed => "crashed",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Backups
// =============================================================================

/// A single backup execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    /// Unique identifier for the job.
    pub id: BackupJobId,
    /// VM whose disk is backed up.
    pub vm_id: VmId,
    /// Schedule that materialized this job, if any.
    #[serde(default)]
    pub schedule_id: Option<BackupScheduleId>,
    /// Display name.
    pub name: String,
    /// Current status.
    pub status: BackupStatus,
    /// Progress in percent, updated at checkpoints.
    pub progress: u8,
    /// Path of the backup file once known.
    #[serde(default)]
    pub file_path: Option<String>,
    /// Size of the backup file in bytes after completion.
    #[serde(default)]
    pub file_size: Option<u64>,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Earliest time the job may run.
    pub scheduled_at: DateTime<Utc>,
    /// When execution began.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When execution completed successfully.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// When the retention loop may delete the backup.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl BackupJob {
    /// Create a new pending job scheduled at `scheduled_at`.
    #[must_use]
    pub fn pending(vm_id: VmId, name: impl Into<String>, scheduled_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: BackupJobId::generate(),
            vm_id,
            schedule_id: None,
            name: name.into(),
            status: BackupStatus::Pending,
            progress: 0,
            file_path: None,
            file_size: None,
            error_message: None,
            scheduled_at,
            started_at: None,
            completed_at: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the job is completed and past its expiry at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == BackupStatus::Completed && self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Status of a backup job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum BackupStatus {
    /// Waiting for `scheduled_at` to elapse.
    Pending = 1,
    /// Copy in progress.
    Running = 2,
    /// Backup file written.
    Completed = 3,
    /// Execution stopped with an error.
    Failed = 4,
}

impl BackupStatus {
    /// Convert the status to its numeric representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A recurring backup schedule for one VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSchedule {
    /// Unique identifier for the schedule.
    pub id: BackupScheduleId,
    /// VM to back up.
    pub vm_id: VmId,
    /// Cron expression (5, 6 or 7 fields).
    pub cron_expr: String,
    /// Days a materialized backup is kept.
    pub retention_days: u32,
    /// Whether the dispatch loop considers this schedule.
    pub enabled: bool,
    /// Last time a job was materialized.
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Next time a job is due.
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Alerting
// =============================================================================

/// An alert rule evaluated against per-VM metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    /// Unique identifier for the rule.
    pub id: AlertRuleId,
    /// Display name.
    pub name: String,
    /// Metric name resolved through the metric provider registry.
    pub metric: String,
    /// Comparison applied as `value <op> threshold`.
    pub condition: Comparison,
    /// Threshold value.
    pub threshold: f64,
    /// Severity attached to fired alerts.
    pub severity: Severity,
    /// Minutes the condition must hold before firing.
    pub duration_minutes: u32,
    /// VMs the rule applies to.
    pub scope: AlertScope,
    /// Notification channel names.
    #[serde(default)]
    pub channels: Vec<String>,
    /// Whether the evaluator loads this rule.
    pub enabled: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Comparison operator of an alert rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparison {
    /// `>`
    #[serde(rename = ">")]
    GreaterThan,
    /// `>=`
    #[serde(rename = ">=")]
    GreaterOrEqual,
    /// `<`
    #[serde(rename = "<")]
    LessThan,
    /// `<=`
    #[serde(rename = "<=")]
    LessOrEqual,
    /// `==`
    #[serde(rename = "==", alias = "=")]
    Equal,
    /// `!=`
    #[serde(rename = "!=")]
    NotEqual,
}

impl Comparison {
    /// Evaluate `value <op> threshold`.
    ///
    /// Equality uses an `f64::EPSILON` tolerance.
    #[must_use]
    pub fn evaluate(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThan => value > threshold,
            Self::GreaterOrEqual => value >= threshold,
            Self::LessThan => value < threshold,
            Self::LessOrEqual => value <= threshold,
            Self::Equal => (value - threshold).abs() < f64::EPSILON,
            Self::NotEqual => (value - threshold).abs() >= f64::EPSILON,
        }
    }

    /// The operator symbol.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::GreaterThan => ">",
            Self::GreaterOrEqual => ">=",
            Self::LessThan => "<",
            Self::LessOrEqual => "<=",
            Self::Equal => "==",
            Self::NotEqual => "!=",
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Comparison {
    type Err = UnknownComparison;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">" => Ok(Self::GreaterThan),
            ">=" => Ok(Self::GreaterOrEqual),
            "<" => Ok(Self::LessThan),
            "<=" => Ok(Self::LessOrEqual),
            "==" | "=" => Ok(Self::Equal),
            "!=" => Ok(Self::NotEqual),
            other => Err(UnknownComparison(other.to_string())),
        }
    }
}

/// Returned when parsing an unsupported comparison operator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown comparison operator: {0}")]
pub struct UnknownComparison(pub String);

/// Severity of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational.
    Info,
    /// Needs attention.
    #[default]
    Warning,
    /// Needs immediate action.
    Critical,
}

/// Which VMs an alert rule targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "vm_ids", rename_all = "snake_case")]
pub enum AlertScope {
    /// Every known VM.
    Global,
    /// An explicit list of VMs.
    Vms(Vec<VmId>),
}

/// A persisted occurrence of a fired alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertHistoryRecord {
    /// Unique identifier for the occurrence.
    pub id: AlertHistoryId,
    /// Rule that fired.
    pub rule_id: AlertRuleId,
    /// VM the rule fired for.
    pub vm_id: VmId,
    /// Metric name.
    pub metric: String,
    /// Observed value at firing time.
    pub value: f64,
    /// Rule threshold at firing time.
    pub threshold: f64,
    /// Rule severity at firing time.
    pub severity: Severity,
    /// Firing or resolved.
    pub status: AlertStatus,
    /// Human-readable summary.
    pub message: String,
    /// When the alert fired.
    pub fired_at: DateTime<Utc>,
    /// When the condition cleared.
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Status of an alert occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    /// Condition still held at last evaluation.
    Firing,
    /// Condition cleared.
    Resolved,
}

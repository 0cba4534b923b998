//! Orchestrator configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::{OrchestratorError, Result};

/// Top-level configuration for every coordinator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// RocksDB data directory.
    pub data_dir: PathBuf,
    /// Hypervisor connection settings.
    pub hypervisor: HypervisorConfig,
    /// Domain state poller.
    pub poller: PollerConfig,
    /// Backup orchestrator.
    pub backup: BackupConfig,
    /// Alert evaluator.
    pub alert: AlertConfig,
    /// Install progress tracker.
    pub install: InstallConfig,
    /// Periodic maintenance jobs.
    pub jobs: JobSchedulerConfig,
    /// Event hub.
    pub hub: EventHubConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/vmplane/data"),
            hypervisor: HypervisorConfig::default(),
            poller: PollerConfig::default(),
            backup: BackupConfig::default(),
            alert: AlertConfig::default(),
            install: InstallConfig::default(),
            jobs: JobSchedulerConfig::default(),
            hub: EventHubConfig::default(),
        }
    }
}

/// Hypervisor connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Connection URI.
    pub uri: String,
    /// `virsh` binary.
    pub virsh_binary: String,
    /// Upper bound for one `virsh` invocation.
    pub command_timeout_secs: u64,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".to_string(),
            virsh_binary: "virsh".to_string(),
            command_timeout_secs: 30,
        }
    }
}

/// Domain state poller settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Seconds between poll cycles.
    pub interval_secs: u64,
    /// Maximum reconciliations in flight.
    pub concurrency: usize,
    /// Timeout applied to each hypervisor call.
    pub call_timeout_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            concurrency: 10,
            call_timeout_secs: 30,
        }
    }
}

impl PollerConfig {
    /// Poll interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Per-call timeout.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Backup orchestrator settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Root directory for backup files.
    pub backup_dir: PathBuf,
    /// Seconds between dispatch scans.
    pub dispatch_interval_secs: u64,
    /// Seconds between retention sweeps.
    pub retention_interval_secs: u64,
    /// Maximum concurrent backup executions.
    pub max_concurrent: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("/var/lib/vmplane/backups"),
            dispatch_interval_secs: 60,
            retention_interval_secs: 3600,
            max_concurrent: 4,
        }
    }
}

impl BackupConfig {
    /// Dispatch interval.
    #[must_use]
    pub const fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs)
    }

    /// Retention interval.
    #[must_use]
    pub const fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs)
    }
}

/// Alert evaluator settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Seconds between evaluation cycles.
    pub interval_secs: u64,
    /// Target of the `webhook` channel, if any.
    pub webhook_url: Option<String>,
    /// Timeout for one webhook request.
    pub webhook_timeout_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            webhook_url: None,
            webhook_timeout_secs: 10,
        }
    }
}

impl AlertConfig {
    /// Evaluation interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Webhook request timeout.
    #[must_use]
    pub const fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }
}

/// Install progress tracker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Assumed length of a guest OS install.
    pub assumed_duration_secs: u64,
    /// Seconds between evaluation ticks.
    pub tick_interval_secs: u64,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            assumed_duration_secs: 20 * 60,
            tick_interval_secs: 5,
        }
    }
}

impl InstallConfig {
    /// Tick interval.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// Assumed install length.
    #[must_use]
    pub const fn assumed_duration(&self) -> Duration {
        Duration::from_secs(self.assumed_duration_secs)
    }
}

/// Periodic maintenance job settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobSchedulerConfig {
    /// Seconds between stats samples.
    pub stats_interval_secs: u64,
    /// Concurrent stats calls.
    pub stats_concurrency: usize,
    /// Upload staging directory.
    pub upload_dir: PathBuf,
    /// Seconds between upload cleanups.
    pub upload_cleanup_interval_secs: u64,
    /// Age after which staged uploads are removed.
    pub upload_max_age_secs: u64,
    /// Seconds between in-memory resource cleanups.
    pub resource_cleanup_interval_secs: u64,
}

impl Default for JobSchedulerConfig {
    fn default() -> Self {
        Self {
            stats_interval_secs: 30,
            stats_concurrency: 10,
            upload_dir: PathBuf::from("/var/lib/vmplane/uploads"),
            upload_cleanup_interval_secs: 3600,
            upload_max_age_secs: 24 * 3600,
            resource_cleanup_interval_secs: 300,
        }
    }
}

impl JobSchedulerConfig {
    /// Stats sampling interval.
    #[must_use]
    pub const fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    /// Upload cleanup interval.
    #[must_use]
    pub const fn upload_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.upload_cleanup_interval_secs)
    }

    /// Staged upload max age.
    #[must_use]
    pub const fn upload_max_age(&self) -> Duration {
        Duration::from_secs(self.upload_max_age_secs)
    }

    /// Resource cleanup interval.
    #[must_use]
    pub const fn resource_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.resource_cleanup_interval_secs)
    }
}

/// Event hub settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventHubConfig {
    /// Outbound buffer capacity.
    pub capacity: usize,
}

impl Default for EventHubConfig {
    fn default() -> Self {
        Self {
            capacity: vmplane_events::DEFAULT_CAPACITY,
        }
    }
}

fn set_parsed<T: FromStr>(value: Option<String>, target: &mut T) {
    if let Some(parsed) = value.and_then(|v| v.trim().parse().ok()) {
        *target = parsed;
    }
}

impl OrchestratorConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables keep their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    #[must_use]
    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        set_parsed(get("VMPLANE_DATA_DIR"), &mut config.data_dir);

        set_parsed(get("VMPLANE_LIBVIRT_URI"), &mut config.hypervisor.uri);
        set_parsed(get("VMPLANE_VIRSH_BINARY"), &mut config.hypervisor.virsh_binary);
        set_parsed(
            get("VMPLANE_HYPERVISOR_TIMEOUT_SECS"),
            &mut config.hypervisor.command_timeout_secs,
        );

        set_parsed(get("VMPLANE_POLL_INTERVAL_SECS"), &mut config.poller.interval_secs);
        set_parsed(get("VMPLANE_POLL_CONCURRENCY"), &mut config.poller.concurrency);
        set_parsed(get("VMPLANE_POLL_TIMEOUT_SECS"), &mut config.poller.call_timeout_secs);

        set_parsed(get("VMPLANE_BACKUP_DIR"), &mut config.backup.backup_dir);
        set_parsed(
            get("VMPLANE_BACKUP_DISPATCH_SECS"),
            &mut config.backup.dispatch_interval_secs,
        );
        set_parsed(
            get("VMPLANE_BACKUP_RETENTION_SECS"),
            &mut config.backup.retention_interval_secs,
        );
        set_parsed(get("VMPLANE_BACKUP_WORKERS"), &mut config.backup.max_concurrent);

        set_parsed(get("VMPLANE_ALERT_INTERVAL_SECS"), &mut config.alert.interval_secs);
        if let Some(url) = get("VMPLANE_ALERT_WEBHOOK_URL").filter(|u| !u.trim().is_empty()) {
            config.alert.webhook_url = Some(url.trim().to_string());
        }
        set_parsed(
            get("VMPLANE_ALERT_WEBHOOK_TIMEOUT_SECS"),
            &mut config.alert.webhook_timeout_secs,
        );

        set_parsed(
            get("VMPLANE_INSTALL_DURATION_SECS"),
            &mut config.install.assumed_duration_secs,
        );
        set_parsed(get("VMPLANE_INSTALL_TICK_SECS"), &mut config.install.tick_interval_secs);

        set_parsed(get("VMPLANE_STATS_INTERVAL_SECS"), &mut config.jobs.stats_interval_secs);
        set_parsed(get("VMPLANE_STATS_CONCURRENCY"), &mut config.jobs.stats_concurrency);
        set_parsed(get("VMPLANE_UPLOAD_DIR"), &mut config.jobs.upload_dir);
        set_parsed(
            get("VMPLANE_UPLOAD_CLEANUP_SECS"),
            &mut config.jobs.upload_cleanup_interval_secs,
        );
        set_parsed(get("VMPLANE_UPLOAD_MAX_AGE_SECS"), &mut config.jobs.upload_max_age_secs);
        set_parsed(
            get("VMPLANE_RESOURCE_CLEANUP_SECS"),
            &mut config.jobs.resource_cleanup_interval_secs,
        );

        set_parsed(get("VMPLANE_HUB_CAPACITY"), &mut config.hub.capacity);

        config
    }

    /// Reject zero intervals, concurrency limits and capacities.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("hypervisor.command_timeout_secs", self.hypervisor.command_timeout_secs),
            ("poller.interval_secs", self.poller.interval_secs),
            ("poller.call_timeout_secs", self.poller.call_timeout_secs),
            ("backup.dispatch_interval_secs", self.backup.dispatch_interval_secs),
            ("backup.retention_interval_secs", self.backup.retention_interval_secs),
            ("alert.interval_secs", self.alert.interval_secs),
            ("alert.webhook_timeout_secs", self.alert.webhook_timeout_secs),
            ("install.assumed_duration_secs", self.install.assumed_duration_secs),
            ("install.tick_interval_secs", self.install.tick_interval_secs),
            ("jobs.stats_interval_secs", self.jobs.stats_interval_secs),
            ("jobs.upload_cleanup_interval_secs", self.jobs.upload_cleanup_interval_secs),
            ("jobs.upload_max_age_secs", self.jobs.upload_max_age_secs),
            ("jobs.resource_cleanup_interval_secs", self.jobs.resource_cleanup_interval_secs),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(OrchestratorError::Config(format!("{name} must be greater than zero")));
        }

        let counts = [
            ("poller.concurrency", self.poller.concurrency),
            ("backup.max_concurrent", self.backup.max_concurrent),
            ("jobs.stats_concurrency", self.jobs.stats_concurrency),
            ("hub.capacity", self.hub.capacity),
        ];
        if let Some((name, _)) = counts.iter().find(|(_, v)| *v == 0) {
            return Err(OrchestratorError::Config(format!("{name} must be greater than zero")));
        }

        if let Some(url) = &self.alert.webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(OrchestratorError::Config(format!(
                    "alert.webhook_url must be an http(s) URL, got {url}"
                )));
            }
        }

        Ok(())
    }
}

//! Guest OS install progress, estimated from elapsed install time.
//!
//! Per VM: `pending -> installing -> {completed, failed}`, with
//! `installing <-> paused` following the domain's pause state. Percent is
//! the share of the assumed install duration spent installing, held at 95
//! until completion is signalled. Nothing in the hypervisor reports install
//! completion, so the reliable path is an explicit `mark_completed` or
//! `mark_failed`; the probe hook exists for guest-agent style detection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vmplane_core::VmId;
use vmplane_events::{EventHub, Topic, KIND_INSTALL_PROGRESS};
use vmplane_hypervisor::{DomainState, HypervisorControl};

use crate::domain::observe_state;
use crate::lifecycle::{Coordinator, LoopSet};
use crate::{OrchestratorError, Result};

/// Highest percent reported before completion is signalled.
pub const MAX_ESTIMATED_PERCENT: u8 = 95;

/// Install state of one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    /// Tracked, domain not yet seen running.
    Pending,
    /// Domain running the installer.
    Installing,
    /// Domain paused mid-install.
    Paused,
    /// Install finished.
    Completed,
    /// Install failed.
    Failed,
}

impl InstallStatus {
    /// Whether no further transitions happen.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    const fn step(self) -> &'static str {
        match self {
            Self::Pending => "waiting for the domain to start",
            Self::Installing => "installing guest operating system",
            Self::Paused => "installation paused",
            Self::Completed => "installation complete",
            Self::Failed => "installation failed",
        }
    }
}

/// Snapshot broadcast to subscribers of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallProgress {
    /// VM being installed.
    pub vm_id: VmId,
    /// Current state.
    pub status: InstallStatus,
    /// Estimated percent, 0 to 100.
    pub percent: u8,
    /// Human-readable step.
    pub step: String,
    /// When the domain was first seen installing.
    pub started_at: Option<DateTime<Utc>>,
    /// When the snapshot last changed.
    pub updated_at: DateTime<Utc>,
    /// When the install reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Decides whether an install has finished on its own.
#[async_trait]
pub trait CompletionProbe: Send + Sync {
    /// Whether the install on `domain_ref` is done.
    async fn is_complete(&self, vm_id: &VmId, domain_ref: &str) -> bool;
}

/// A probe that never reports completion.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverComplete;

#[async_trait]
impl CompletionProbe for NeverComplete {
    async fn is_complete(&self, _vm_id: &VmId, _domain_ref: &str) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
struct Entry {
    domain_ref: String,
    status: InstallStatus,
    started_at: Option<DateTime<Utc>>,
    active_since: Option<DateTime<Utc>>,
    accumulated: ChronoDuration,
    percent: u8,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl Entry {
    fn new(domain_ref: String, now: DateTime<Utc>) -> Self {
        Self {
            domain_ref,
            status: InstallStatus::Pending,
            started_at: None,
            active_since: None,
            accumulated: ChronoDuration::zero(),
            percent: 0,
            updated_at: now,
            finished_at: None,
            error: None,
        }
    }

    fn installing_time(&self, now: DateTime<Utc>) -> ChronoDuration {
        let running = self
            .active_since
            .map_or_else(ChronoDuration::zero, |since| (now - since).max(ChronoDuration::zero()));
        self.accumulated + running
    }

    fn resume(&mut self, now: DateTime<Utc>) {
        self.status = InstallStatus::Installing;
        self.started_at.get_or_insert(now);
        self.active_since = Some(now);
        self.updated_at = now;
    }

    fn pause(&mut self, now: DateTime<Utc>) {
        self.accumulated = self.installing_time(now);
        self.active_since = None;
        self.status = InstallStatus::Paused;
        self.updated_at = now;
    }

    fn finish(&mut self, status: InstallStatus, error: Option<String>, now: DateTime<Utc>) {
        self.accumulated = self.installing_time(now);
        self.active_since = None;
        self.status = status;
        self.error = error;
        self.finished_at = Some(now);
        self.updated_at = now;
        if status == InstallStatus::Completed {
            self.percent = 100;
        }
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn refresh_percent(&mut self, assumed: Duration, now: DateTime<Utc>) {
        if self.status.is_terminal() {
            return;
        }
        let elapsed_ms = self.installing_time(now).num_milliseconds().max(0) as f64;
        let assumed_ms = (assumed.as_millis() as f64).max(1.0);
        let estimate = (elapsed_ms / assumed_ms * 100.0).clamp(0.0, f64::from(MAX_ESTIMATED_PERCENT));
        self.percent = estimate.floor() as u8;
    }

    fn snapshot(&self, vm_id: VmId) -> InstallProgress {
        InstallProgress {
            vm_id,
            status: self.status,
            percent: self.percent,
            step: self.status.step().to_string(),
            started_at: self.started_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
            error: self.error.clone(),
        }
    }
}

/// Tracks install progress for VMs and broadcasts it per VM.
pub struct InstallProgressTracker {
    hypervisor: Arc<dyn HypervisorControl>,
    hub: Arc<EventHub>,
    probe: Arc<dyn CompletionProbe>,
    entries: Mutex<HashMap<VmId, Entry>>,
    assumed_duration: Duration,
    call_timeout: Duration,
    tick_interval: Duration,
    loops: LoopSet,
}

impl InstallProgressTracker {
    /// Create a tracker using the [`NeverComplete`] probe.
    #[must_use]
    pub fn new(
        hypervisor: Arc<dyn HypervisorControl>,
        hub: Arc<EventHub>,
        assumed_duration: Duration,
        call_timeout: Duration,
        tick_interval: Duration,
    ) -> Self {
        Self {
            hypervisor,
            hub,
            probe: Arc::new(NeverComplete),
            entries: Mutex::new(HashMap::new()),
            assumed_duration,
            call_timeout,
            tick_interval,
            loops: LoopSet::new(),
        }
    }

    /// Replace the completion probe.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn CompletionProbe>) -> Self {
        self.probe = probe;
        self
    }

    fn broadcast(&self, progress: &InstallProgress) {
        self.hub
            .publish(Topic::Vm(progress.vm_id), KIND_INSTALL_PROGRESS, progress);
    }

    /// Start tracking a VM's install. Tracking an already tracked VM
    /// returns its current snapshot.
    pub fn track(&self, vm_id: VmId, domain_ref: impl Into<String>) -> InstallProgress {
        let snapshot = {
            let mut entries = self.entries.lock();
            entries
                .entry(vm_id)
                .or_insert_with(|| Entry::new(domain_ref.into(), Utc::now()))
                .snapshot(vm_id)
        };
        info!(vm_id = %vm_id, "install tracking started");
        self.broadcast(&snapshot);
        snapshot
    }

    /// Stop tracking a VM, returning its last snapshot.
    pub fn untrack(&self, vm_id: &VmId) -> Option<InstallProgress> {
        self.entries
            .lock()
            .remove(vm_id)
            .map(|entry| entry.snapshot(*vm_id))
    }

    /// Current snapshot for a VM.
    #[must_use]
    pub fn get(&self, vm_id: &VmId) -> Option<InstallProgress> {
        self.entries.lock().get(vm_id).map(|entry| entry.snapshot(*vm_id))
    }

    /// Number of tracked VMs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop entries for VMs `keep` rejects. Returns how many were dropped.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&VmId) -> bool,
    {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|id, _| keep(id));
        before - entries.len()
    }

    fn finish(
        &self,
        vm_id: &VmId,
        status: InstallStatus,
        error: Option<String>,
    ) -> Result<InstallProgress> {
        let snapshot = {
            let mut entries = self.entries.lock();
            let entry = entries
                .get_mut(vm_id)
                .ok_or_else(|| OrchestratorError::not_found("install", vm_id))?;
            if entry.status.is_terminal() {
                return Err(OrchestratorError::InvalidState(format!(
                    "install of vm {vm_id} already {:?}",
                    entry.status
                )));
            }
            entry.finish(status, error, Utc::now());
            entry.snapshot(*vm_id)
        };
        self.broadcast(&snapshot);
        Ok(snapshot)
    }

    /// Mark an install as finished.
    ///
    /// # Errors
    ///
    /// `NotFound` if the VM is not tracked, `InvalidState` if it already
    /// finished.
    pub fn mark_completed(&self, vm_id: &VmId) -> Result<InstallProgress> {
        let snapshot = self.finish(vm_id, InstallStatus::Completed, None)?;
        info!(vm_id = %vm_id, "install completed");
        Ok(snapshot)
    }

    /// Mark an install as failed.
    ///
    /// # Errors
    ///
    /// `NotFound` if the VM is not tracked, `InvalidState` if it already
    /// finished.
    pub fn mark_failed(&self, vm_id: &VmId, reason: impl Into<String>) -> Result<InstallProgress> {
        let reason = reason.into();
        let snapshot = self.finish(vm_id, InstallStatus::Failed, Some(reason.clone()))?;
        warn!(vm_id = %vm_id, reason = %reason, "install failed");
        Ok(snapshot)
    }

    /// Evaluate every tracked VM as of `now` and broadcast each snapshot.
    ///
    /// Returns the number of snapshots broadcast.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> usize {
        let targets: Vec<(VmId, String, InstallStatus)> = self
            .entries
            .lock()
            .iter()
            .map(|(id, entry)| (*id, entry.domain_ref.clone(), entry.status))
            .collect();

        let mut broadcast = 0;
        for (vm_id, domain_ref, status) in targets {
            let observed = if status.is_terminal() {
                None
            } else {
                match observe_state(self.hypervisor.as_ref(), &domain_ref, self.call_timeout).await {
                    Ok(info) => info.map(|i| i.state),
                    Err(e) => {
                        warn!(vm_id = %vm_id, error = %e, "install state lookup failed");
                        None
                    }
                }
            };
            let complete = observed == Some(DomainState::Running)
                && self.probe.is_complete(&vm_id, &domain_ref).await;

            let snapshot = {
                let mut entries = self.entries.lock();
                let Some(entry) = entries.get_mut(&vm_id) else {
                    continue;
                };
                if !entry.status.is_terminal() {
                    match (entry.status, observed) {
                        (InstallStatus::Installing, Some(DomainState::Paused)) => entry.pause(now),
                        (
                            InstallStatus::Pending | InstallStatus::Paused,
                            Some(DomainState::Running),
                        ) => entry.resume(now),
                        _ => {}
                    }
                    if complete {
                        entry.finish(InstallStatus::Completed, None, now);
                    } else {
                        entry.refresh_percent(self.assumed_duration, now);
                    }
                }
                entry.snapshot(vm_id)
            };

            if complete {
                info!(vm_id = %vm_id, "install completion detected");
            }
            self.broadcast(&snapshot);
            broadcast += 1;
        }

        debug!(tracked = broadcast, "install progress tick complete");
        broadcast
    }
}

#[async_trait]
impl Coordinator for InstallProgressTracker {
    fn name(&self) -> &'static str {
        "install_progress"
    }

    fn start(self: Arc<Self>) {
        let Some(token) = self.loops.begin() else {
            debug!("install progress tracker already running");
            return;
        };
        let this = Arc::clone(&self);
        self.loops
            .spawn_periodic("install_progress", self.tick_interval, token, move || {
                let this = Arc::clone(&this);
                async move {
                    let evaluated = this.tick_at(Utc::now()).await;
                    if evaluated == 0 {
                        debug!("no installs tracked");
                    }
                }
            });
        info!("install progress tracker started");
    }

    async fn stop(&self) {
        self.loops.shutdown().await;
        if !self.is_empty() {
            debug!(tracked = self.len(), "install progress tracker stopped with live entries");
        }
        info!("install progress tracker stopped");
    }
}

//! Background orchestration for vmplane.
//!
//! The hypervisor never pushes state changes, so everything here is driven
//! by periodic loops that keep persisted state honest and run long jobs:
//!
//! - [`DomainStatePoller`] and [`StatusReconciler`] fold observed domain
//!   state into persisted VM status, leaving user-initiated transitions
//!   alone.
//! - [`BackupOrchestrator`] dispatches due backups to a bounded worker pool
//!   under per-job and per-VM execution guards, and expires old backups.
//! - [`AlertEvaluator`] evaluates threshold rules with a duration window
//!   and fans alerts out to notification channels.
//! - [`InstallProgressTracker`] estimates guest install progress.
//! - [`JobScheduler`] ticks maintenance jobs: status sync, stats sampling,
//!   upload and resource cleanup.
//!
//! All of them implement [`Coordinator`] and are wired together by
//! [`Orchestrator`].
//!
//! ```text
//!               ┌──────────────┐
//!               │ Orchestrator │
//!               └──────┬───────┘
//!   ┌─────────┬────────┼──────────┬───────────┐
//!   ▼         ▼        ▼          ▼           ▼
//! EventHub  Backups  Alerts   Installs   JobScheduler
//!   ▲                  │          │      (status sync,
//!   └──────────────────┴──────────┘       stats, cleanup)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vmplane_hypervisor::{VirshConfig, VirshControl};
//! use vmplane_orchestrator::{LogNotifier, NotifierRegistry, Orchestrator, OrchestratorConfig};
//! use vmplane_store::RocksStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OrchestratorConfig::from_env();
//! let store = Arc::new(RocksStore::open(&config.data_dir)?);
//! let hypervisor = Arc::new(VirshControl::new(VirshConfig::default()));
//!
//! let mut notifiers = NotifierRegistry::new();
//! notifiers.register(Arc::new(LogNotifier));
//!
//! let orchestrator = Orchestrator::new(config, store, hypervisor, notifiers)?;
//! orchestrator.start();
//! tokio::signal::ctrl_c().await?;
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod alert;
pub mod backup;
pub mod config;
mod domain;
pub mod error;
pub mod guard;
pub mod install;
pub mod jobs;
pub mod lifecycle;
pub mod metrics;
pub mod notifier;
pub mod orchestrator;
pub mod poller;
pub mod reconciler;
pub mod schedule;
pub mod stats;
pub mod status;

pub use alert::AlertEvaluator;
pub use backup::BackupOrchestrator;
pub use config::OrchestratorConfig;
pub use error::{ErrorKind, OrchestratorError, Result};
pub use guard::{ExecutionGuard, GuardToken};
pub use install::{CompletionProbe, InstallProgress, InstallProgressTracker, InstallStatus, NeverComplete};
pub use jobs::{JobScheduler, PeriodicJob};
pub use lifecycle::Coordinator;
pub use metrics::{MetricProvider, MetricRegistry};
pub use notifier::{
    AlertNotification, EventHubNotifier, LogNotifier, Notifier, NotifierRegistry, WebhookNotifier,
};
pub use orchestrator::Orchestrator;
pub use poller::DomainStatePoller;
pub use reconciler::{ReconcileOutcome, StatusReconciler};
pub use schedule::CronSchedule;
pub use stats::{StatsCache, StatsSample};
pub use status::{StatusCache, StatusChangeEvent, StatusSnapshot};

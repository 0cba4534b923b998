//! Wiring of every coordinator around one store, hypervisor and hub.

use std::sync::Arc;

use tracing::info;
use vmplane_events::EventHub;
use vmplane_hypervisor::HypervisorControl;
use vmplane_store::Store;

use crate::alert::AlertEvaluator;
use crate::backup::BackupOrchestrator;
use crate::config::OrchestratorConfig;
use crate::install::InstallProgressTracker;
use crate::jobs::{
    JobScheduler, ResourceCleanupJob, StatsCollectionJob, StatusSyncJob, UploadCleanupJob,
};
use crate::lifecycle::Coordinator;
use crate::metrics::MetricRegistry;
use crate::notifier::{EventHubNotifier, NotifierRegistry};
use crate::poller::DomainStatePoller;
use crate::reconciler::StatusReconciler;
use crate::stats::StatsCache;
use crate::status::StatusCache;
use crate::Result;

/// Owns the background subsystem and its start/stop order.
pub struct Orchestrator {
    config: OrchestratorConfig,
    hub: Arc<EventHub>,
    stats: Arc<StatsCache>,
    poller: Arc<DomainStatePoller>,
    backups: Arc<BackupOrchestrator>,
    alerts: Arc<AlertEvaluator>,
    installs: Arc<InstallProgressTracker>,
    jobs: Arc<JobScheduler>,
}

impl Orchestrator {
    /// Build every component. The `event_hub` notification channel is
    /// added to `notifiers`.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the configuration is invalid.
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn Store>,
        hypervisor: Arc<dyn HypervisorControl>,
        mut notifiers: NotifierRegistry,
    ) -> Result<Self> {
        config.validate()?;

        let hub = Arc::new(EventHub::new(config.hub.capacity));
        notifiers.register(Arc::new(EventHubNotifier::new(Arc::clone(&hub))));

        let call_timeout = config.poller.call_timeout();
        let status = Arc::new(StatusCache::new());
        let stats = Arc::new(StatsCache::new());

        let reconciler = Arc::new(StatusReconciler::new(
            Arc::clone(&store),
            Arc::clone(&hypervisor),
            Arc::clone(&hub),
            Arc::clone(&status),
            call_timeout,
        ));
        let poller = Arc::new(DomainStatePoller::new(
            Arc::clone(&store),
            reconciler,
            config.poller.concurrency,
        ));

        let backups = Arc::new(BackupOrchestrator::new(
            Arc::clone(&store),
            config.backup.clone(),
        ));

        let metrics = Arc::new(MetricRegistry::with_defaults(&stats, Arc::clone(&store)));
        let alerts = Arc::new(AlertEvaluator::new(
            Arc::clone(&store),
            metrics,
            Arc::new(notifiers),
            config.alert.interval(),
        ));

        let installs = Arc::new(InstallProgressTracker::new(
            Arc::clone(&hypervisor),
            Arc::clone(&hub),
            config.install.assumed_duration(),
            call_timeout,
            config.install.tick_interval(),
        ));

        let jobs = Arc::new(JobScheduler::new());
        jobs.register(Arc::new(StatusSyncJob::new(
            Arc::clone(&poller),
            config.poller.interval(),
        )));
        jobs.register(Arc::new(StatsCollectionJob::new(
            Arc::clone(&store),
            Arc::clone(&hypervisor),
            Arc::clone(&stats),
            config.jobs.stats_interval(),
            config.jobs.stats_concurrency,
            call_timeout,
        )));
        jobs.register(Arc::new(UploadCleanupJob::new(
            config.jobs.upload_dir.clone(),
            config.jobs.upload_max_age(),
            config.jobs.upload_cleanup_interval(),
        )));
        jobs.register(Arc::new(ResourceCleanupJob::new(
            Arc::clone(&store),
            Arc::clone(&stats),
            Arc::clone(poller.reconciler().cache()),
            Arc::clone(&installs),
            config.jobs.resource_cleanup_interval(),
        )));

        Ok(Self {
            config,
            hub,
            stats,
            poller,
            backups,
            alerts,
            installs,
            jobs,
        })
    }

    fn coordinators(&self) -> [Arc<dyn Coordinator>; 5] {
        [
            Arc::clone(&self.hub) as Arc<dyn Coordinator>,
            Arc::clone(&self.backups) as Arc<dyn Coordinator>,
            Arc::clone(&self.alerts) as Arc<dyn Coordinator>,
            Arc::clone(&self.installs) as Arc<dyn Coordinator>,
            Arc::clone(&self.jobs) as Arc<dyn Coordinator>,
        ]
    }

    /// Start the hub, then every loop.
    pub fn start(&self) {
        for coordinator in self.coordinators() {
            info!(coordinator = coordinator.name(), "starting");
            coordinator.start();
        }
        info!("orchestrator started");
    }

    /// Stop every loop in reverse start order, hub last.
    pub async fn shutdown(&self) {
        for coordinator in self.coordinators().into_iter().rev() {
            info!(coordinator = coordinator.name(), "stopping");
            coordinator.stop().await;
        }
        info!("orchestrator stopped");
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Event hub for subscriber registration.
    #[must_use]
    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// Latest stats samples.
    #[must_use]
    pub fn stats(&self) -> &Arc<StatsCache> {
        &self.stats
    }

    /// Latest observed domain states.
    #[must_use]
    pub fn status_cache(&self) -> &Arc<StatusCache> {
        self.poller.reconciler().cache()
    }

    /// Domain state poller, for on-demand cycles.
    #[must_use]
    pub fn poller(&self) -> &Arc<DomainStatePoller> {
        &self.poller
    }

    /// Backup operations.
    #[must_use]
    pub fn backups(&self) -> &Arc<BackupOrchestrator> {
        &self.backups
    }

    /// Alert evaluator.
    #[must_use]
    pub fn alerts(&self) -> &Arc<AlertEvaluator> {
        &self.alerts
    }

    /// Install progress tracking.
    #[must_use]
    pub fn installs(&self) -> &Arc<InstallProgressTracker> {
        &self.installs
    }

    /// Periodic job scheduler.
    #[must_use]
    pub fn jobs(&self) -> &Arc<JobScheduler> {
        &self.jobs
    }
}

//! vmplane orchestrator - background VM orchestration daemon
//!
//! Runs status reconciliation, backups, alert evaluation, install tracking
//! and maintenance jobs against the local hypervisor until interrupted.
//!
//! # Configuration
//!
//! All settings come from `VMPLANE_*` environment variables, see
//! [`OrchestratorConfig::from_env`]. Set `VMPLANE_ALERT_WEBHOOK_URL` to
//! deliver alerts to a webhook in addition to the log.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vmplane_hypervisor::{VirshConfig, VirshControl};
use vmplane_orchestrator::{
    LogNotifier, NotifierRegistry, Orchestrator, OrchestratorConfig, WebhookNotifier,
};
use vmplane_store::RocksStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vmplane=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting vmplane orchestrator");

    let config = OrchestratorConfig::from_env();
    config.validate()?;

    tracing::info!(
        data_dir = %config.data_dir.display(),
        libvirt_uri = %config.hypervisor.uri,
        backup_dir = %config.backup.backup_dir.display(),
        poll_interval_secs = config.poller.interval_secs,
        webhook = config.alert.webhook_url.is_some(),
        "Orchestrator configuration loaded"
    );

    tracing::info!(path = %config.data_dir.display(), "Opening RocksDB store");
    let store = Arc::new(RocksStore::open(&config.data_dir)?);

    let hypervisor = Arc::new(VirshControl::new(VirshConfig {
        binary: config.hypervisor.virsh_binary.clone(),
        uri: config.hypervisor.uri.clone(),
        timeout: std::time::Duration::from_secs(config.hypervisor.command_timeout_secs),
    }));
    tracing::info!(uri = %hypervisor.uri(), "Hypervisor control initialized");

    let mut notifiers = NotifierRegistry::new();
    notifiers.register(Arc::new(LogNotifier));
    if let Some(url) = &config.alert.webhook_url {
        let webhook = WebhookNotifier::new(url.clone(), config.alert.webhook_timeout())?;
        notifiers.register(Arc::new(webhook));
        tracing::info!(url = %url, "Webhook alert channel enabled");
    }

    let orchestrator = Orchestrator::new(config, store, hypervisor, notifiers)?;
    orchestrator.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    orchestrator.shutdown().await;

    Ok(())
}

//! Start/stop contract shared by every background coordinator.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use vmplane_events::EventHub;

/// A component owning one or more background loops.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Spawn the loops. A no-op when already running.
    fn start(self: Arc<Self>);

    /// Signal the loops to exit and wait until they have.
    ///
    /// Safe to call more than once, and before `start`.
    async fn stop(&self);
}

/// The tasks of one coordinator run, with a shared shutdown signal.
#[derive(Default)]
pub struct LoopSet {
    token: Mutex<Option<CancellationToken>>,
    tracker: TaskTracker,
}

impl LoopSet {
    /// Create an idle loop set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a run. Returns `None` if one is already active.
    pub fn begin(&self) -> Option<CancellationToken> {
        let mut token = self.token.lock();
        if token.is_some() {
            return None;
        }
        self.tracker.reopen();
        let fresh = CancellationToken::new();
        *token = Some(fresh.clone());
        Some(fresh)
    }

    /// Whether a run is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.token.lock().is_some()
    }

    /// Track a one-off task so `shutdown` waits for it.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    /// Run `tick` every `period` until `token` is cancelled.
    ///
    /// The first tick fires immediately. Cancellation is observed between
    /// ticks; a tick in progress runs to completion.
    pub fn spawn_periodic<F, Fut>(
        &self,
        name: &'static str,
        period: Duration,
        token: CancellationToken,
        mut tick: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.tracker.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(task = name, period_secs = period.as_secs(), "periodic task started");

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }

            info!(task = name, "periodic task stopped");
        });
    }

    /// Cancel the active run and wait for every tracked task to finish.
    pub async fn shutdown(&self) {
        let token = self.token.lock().take();
        if let Some(token) = token {
            token.cancel();
        }
        self.tracker.close();
        self.tracker.wait().await;
        debug!("loop set drained");
    }
}

#[async_trait]
impl Coordinator for EventHub {
    fn name(&self) -> &'static str {
        "event_hub"
    }

    fn start(self: Arc<Self>) {
        EventHub::start(&self);
    }

    async fn stop(&self) {
        EventHub::stop(self).await;
    }
}

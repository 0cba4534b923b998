//! Publish/subscribe hub with a bounded outbound queue.
//!
//! Publishers never block: [`EventHub::broadcast`] enqueues onto a bounded
//! queue and drops the newest message when the queue is full. A dispatcher
//! task drains the queue and fans each message out to the subscribers of its
//! topic. A subscriber whose write fails is removed from the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::envelope::HubEnvelope;
use crate::subscriber::{HubMessage, Subscriber, SubscriberId, Topic};

/// Default capacity of the outbound queue.
pub const DEFAULT_CAPACITY: usize = 1024;

type Registry = RwLock<HashMap<SubscriberId, Registration>>;

struct Registration {
    topic: Topic,
    subscriber: Arc<dyn Subscriber>,
}

struct Dispatcher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Subscriber registry plus the dispatcher that feeds it.
///
/// Designed to be shared via `Arc<EventHub>`.
pub struct EventHub {
    registry: Arc<Registry>,
    queue: mpsc::Sender<HubMessage>,
    idle_receiver: Arc<Mutex<Option<mpsc::Receiver<HubMessage>>>>,
    dispatcher: Mutex<Option<Dispatcher>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl EventHub {
    /// Create a hub whose outbound queue holds `capacity` messages.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (queue, receiver) = mpsc::channel(capacity.max(1));
        Self {
            registry: Arc::new(RwLock::new(HashMap::new())),
            queue,
            idle_receiver: Arc::new(Mutex::new(Some(receiver))),
            dispatcher: Mutex::new(None),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a subscriber for `topic`.
    pub fn register(&self, topic: Topic, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let id = SubscriberId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry
            .write()
            .insert(id, Registration { topic, subscriber });
        debug!(subscriber = %id, ?topic, "subscriber registered");
        id
    }

    /// Remove a subscriber. Returns false if it was not registered.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let removed = self.registry.write().remove(&id).is_some();
        if removed {
            debug!(subscriber = %id, "subscriber unregistered");
        }
        removed
    }

    /// Broadcast to global subscribers.
    ///
    /// Returns false if the message was dropped because the queue is full.
    pub fn broadcast(&self, payload: Bytes) -> bool {
        self.broadcast_to(Topic::Global, payload)
    }

    /// Broadcast to the subscribers of `topic`.
    ///
    /// Returns false if the message was dropped because the queue is full.
    pub fn broadcast_to(&self, topic: Topic, payload: Bytes) -> bool {
        match self.queue.try_send(HubMessage { topic, payload }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(?topic, dropped, "event hub queue full, dropping broadcast");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!(?topic, "event hub queue closed, dropping broadcast");
                false
            }
        }
    }

    /// Wrap `data` in a [`HubEnvelope`] of `kind` and broadcast it to `topic`.
    ///
    /// Encoding failures are logged and reported as a dropped message.
    pub fn publish<T: Serialize>(&self, topic: Topic, kind: &str, data: &T) -> bool {
        match HubEnvelope::encode(kind, data) {
            Ok(bytes) => self.broadcast_to(topic, bytes),
            Err(e) => {
                error!(kind, error = %e, "failed to encode hub envelope");
                false
            }
        }
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.registry.read().len()
    }

    /// Number of broadcasts dropped because the queue was full.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Whether the dispatcher task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.dispatcher.lock().is_some()
    }

    /// Start the dispatcher task. No-op if already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() {
            return;
        }
        let Some(receiver) = self.idle_receiver.lock().take() else {
            warn!("event hub receiver unavailable, not starting");
            return;
        };

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(dispatch_loop(
            Arc::clone(&self.registry),
            receiver,
            cancel.clone(),
            Arc::clone(&self.idle_receiver),
        ));
        *dispatcher = Some(Dispatcher { cancel, handle });
        info!("event hub started");
    }

    /// Stop the dispatcher after draining queued messages.
    ///
    /// Returns once the task has exited. Safe to call more than once.
    pub async fn stop(&self) {
        let dispatcher = self.dispatcher.lock().take();
        let Some(dispatcher) = dispatcher else {
            return;
        };

        dispatcher.cancel.cancel();
        if let Err(e) = dispatcher.handle.await {
            error!(error = %e, "event hub dispatcher panicked");
        }
        info!("event hub stopped");
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

async fn dispatch_loop(
    registry: Arc<Registry>,
    mut receiver: mpsc::Receiver<HubMessage>,
    cancel: CancellationToken,
    idle_receiver: Arc<Mutex<Option<mpsc::Receiver<HubMessage>>>>,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            message = receiver.recv() => match message {
                Some(message) => deliver(&registry, &message),
                None => break,
            },
        }
    }

    // Drain what was queued before the stop.
    while let Ok(message) = receiver.try_recv() {
        deliver(&registry, &message);
    }

    *idle_receiver.lock() = Some(receiver);
}

fn deliver(registry: &Registry, message: &HubMessage) {
    let targets: Vec<(SubscriberId, Arc<dyn Subscriber>)> = registry
        .read()
        .iter()
        .filter(|(_, reg)| reg.topic == message.topic)
        .map(|(id, reg)| (*id, Arc::clone(&reg.subscriber)))
        .collect();

    let mut failed = Vec::new();
    for (id, subscriber) in targets {
        if let Err(e) = subscriber.deliver(message) {
            warn!(subscriber = %id, error = %e, "removing subscriber after failed write");
            failed.push(id);
        }
    }

    if !failed.is_empty() {
        let mut registry = registry.write();
        for id in failed {
            registry.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::ChannelSubscriber;
    use vmplane_core::VmId;

    fn channel(hub: &EventHub, topic: Topic) -> (SubscriberId, mpsc::Receiver<Bytes>) {
        let (sub, rx) = ChannelSubscriber::new(16);
        (hub.register(topic, Arc::new(sub)), rx)
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_never_blocks() {
        let hub = EventHub::new(2);
        // Not started, so nothing drains the queue.
        assert!(hub.broadcast(Bytes::from_static(b"1")));
        assert!(hub.broadcast(Bytes::from_static(b"2")));
        for _ in 0..8 {
            assert!(!hub.broadcast(Bytes::from_static(b"x")));
        }
        assert_eq!(hub.dropped_count(), 8);

        hub.start();
        hub.stop().await;
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn every_subscriber_gets_identical_bytes() {
        let hub = EventHub::default();
        hub.start();

        let mut receivers: Vec<_> = (0..3).map(|_| channel(&hub, Topic::Global).1).collect();
        let payload = Bytes::from_static(br#"{"kind":"vm.status_changed"}"#);
        assert!(hub.broadcast(payload.clone()));

        for rx in &mut receivers {
            assert_eq!(rx.recv().await.unwrap(), payload);
        }
        hub.stop().await;
    }

    #[tokio::test]
    async fn failed_subscriber_is_removed() {
        let hub = EventHub::default();
        hub.start();

        let (_, rx_closed) = channel(&hub, Topic::Global);
        drop(rx_closed);
        let (_, mut rx_live) = channel(&hub, Topic::Global);
        assert_eq!(hub.subscriber_count(), 2);

        hub.broadcast(Bytes::from_static(b"ping"));
        assert_eq!(rx_live.recv().await.unwrap(), Bytes::from_static(b"ping"));

        hub.stop().await;
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn topics_are_routed() {
        let hub = EventHub::default();
        let vm_a = VmId::from_bytes([1u8; 32]);
        let vm_b = VmId::from_bytes([2u8; 32]);
        let (_, mut global) = channel(&hub, Topic::Global);
        let (_, mut a) = channel(&hub, Topic::Vm(vm_a));
        let (_, mut b) = channel(&hub, Topic::Vm(vm_b));

        hub.start();
        hub.broadcast_to(Topic::Vm(vm_a), Bytes::from_static(b"progress-a"));
        hub.broadcast(Bytes::from_static(b"global"));
        hub.stop().await;

        assert_eq!(a.try_recv().unwrap(), Bytes::from_static(b"progress-a"));
        assert!(a.try_recv().is_err());
        assert!(b.try_recv().is_err());
        assert_eq!(global.try_recv().unwrap(), Bytes::from_static(b"global"));
        assert!(global.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_drains_queued_messages() {
        let hub = EventHub::default();
        let (_, mut rx) = channel(&hub, Topic::Global);

        for i in 0..5u8 {
            hub.broadcast(Bytes::from(vec![i]));
        }
        hub.start();
        hub.stop().await;

        for i in 0..5u8 {
            assert_eq!(rx.try_recv().unwrap(), Bytes::from(vec![i]));
        }
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_restartable() {
        let hub = EventHub::default();
        hub.stop().await;

        hub.start();
        hub.start();
        assert!(hub.is_running());
        hub.stop().await;
        hub.stop().await;
        assert!(!hub.is_running());

        let (_, mut rx) = channel(&hub, Topic::Global);
        hub.start();
        hub.broadcast(Bytes::from_static(b"again"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"again"));
        hub.stop().await;
    }

    #[tokio::test]
    async fn unregister_stops_delivery() {
        let hub = EventHub::default();
        let (id, mut rx) = channel(&hub, Topic::Global);
        assert!(hub.unregister(id));
        assert!(!hub.unregister(id));

        hub.start();
        hub.broadcast(Bytes::from_static(b"nobody"));
        hub.stop().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_wraps_in_envelope() {
        let hub = EventHub::default();
        let (_, mut rx) = channel(&hub, Topic::Global);
        hub.start();
        assert!(hub.publish(Topic::Global, "alert.fired", &serde_json::json!({"rule": "cpu"})));
        hub.stop().await;

        let bytes = rx.try_recv().unwrap();
        let envelope: HubEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(envelope.kind, "alert.fired");
        assert_eq!(envelope.data["rule"], "cpu");
    }
}

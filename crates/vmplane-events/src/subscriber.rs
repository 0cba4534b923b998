//! Subscriber endpoints and routing topics.

use std::fmt;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use vmplane_core::VmId;

use crate::{EventHubError, Result};

/// Which stream of messages a subscriber receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Platform-wide events (status changes, alerts).
    Global,
    /// Events about one VM (install progress).
    Vm(VmId),
}

/// Handle returned by registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A message routed through the hub.
#[derive(Debug, Clone)]
pub struct HubMessage {
    /// Routing topic.
    pub topic: Topic,
    /// Encoded payload, shared between subscribers.
    pub payload: Bytes,
}

/// An outbound endpoint registered with the hub.
///
/// `deliver` must not block. Returning an error removes the subscriber.
pub trait Subscriber: Send + Sync {
    /// Hand a message to the endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint can no longer accept messages.
    fn deliver(&self, message: &HubMessage) -> Result<()>;
}

/// A subscriber backed by a bounded channel.
///
/// A closed or full channel counts as a failed write.
pub struct ChannelSubscriber {
    sender: mpsc::Sender<Bytes>,
}

impl ChannelSubscriber {
    /// Create a subscriber and the receiver its messages arrive on.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Wrap an existing sender.
    #[must_use]
    pub fn from_sender(sender: mpsc::Sender<Bytes>) -> Self {
        Self { sender }
    }
}

impl Subscriber for ChannelSubscriber {
    fn deliver(&self, message: &HubMessage) -> Result<()> {
        self.sender
            .try_send(message.payload.clone())
            .map_err(|e| match e {
                TrySendError::Full(_) => EventHubError::Full,
                TrySendError::Closed(_) => EventHubError::Closed,
            })
    }
}

//! Event hub for vmplane.
//!
//! The hub fans out state changes to live observers such as a WebSocket
//! layer. It is used for global status-change and alert delivery and for
//! per-VM install progress.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use vmplane_events::{ChannelSubscriber, EventHub, Topic};
//!
//! # async fn example() {
//! let hub = EventHub::default();
//! let (subscriber, mut rx) = ChannelSubscriber::new(64);
//! hub.register(Topic::Global, Arc::new(subscriber));
//!
//! hub.start();
//! hub.broadcast(bytes::Bytes::from_static(b"hello"));
//! assert_eq!(rx.recv().await.unwrap(), "hello");
//! hub.stop().await;
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod envelope;
pub mod error;
pub mod hub;
pub mod subscriber;

pub use envelope::{HubEnvelope, KIND_ALERT_FIRED, KIND_INSTALL_PROGRESS, KIND_STATUS_CHANGED};
pub use error::{EventHubError, Result};
pub use hub::{EventHub, DEFAULT_CAPACITY};
pub use subscriber::{ChannelSubscriber, HubMessage, Subscriber, SubscriberId, Topic};

//! Error types for the event hub.

use thiserror::Error;

/// Errors raised while delivering or encoding hub messages.
#[derive(Error, Debug)]
pub enum EventHubError {
    /// The subscriber's receiving side is gone.
    #[error("subscriber closed")]
    Closed,

    /// The subscriber's outbound buffer is full.
    #[error("subscriber buffer full")]
    Full,

    /// The message payload could not be encoded.
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A specialized Result type for event hub operations.
pub type Result<T> = std::result::Result<T, EventHubError>;

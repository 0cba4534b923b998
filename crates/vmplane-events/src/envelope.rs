//! JSON envelope shared by every hub publisher.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Event kind for persisted VM status transitions.
pub const KIND_STATUS_CHANGED: &str = "vm.status_changed";

/// Event kind for install progress snapshots.
pub const KIND_INSTALL_PROGRESS: &str = "vm.install_progress";

/// Event kind for fired alerts.
pub const KIND_ALERT_FIRED: &str = "alert.fired";

/// A typed message as seen by subscribers: `{kind, data, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubEnvelope {
    /// Dot-separated event kind, e.g. `"vm.status_changed"`.
    pub kind: String,
    /// Event-specific payload.
    pub data: serde_json::Value,
    /// When the envelope was created (UTC).
    pub timestamp: DateTime<Utc>,
}

impl HubEnvelope {
    /// Wrap a serializable payload.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` cannot be represented as JSON.
    pub fn new<T: Serialize>(kind: impl Into<String>, data: &T) -> Result<Self> {
        Ok(Self {
            kind: kind.into(),
            data: serde_json::to_value(data)?,
            timestamp: Utc::now(),
        })
    }

    /// Encode to the bytes handed to subscribers.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Wrap and encode in one step.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode<T: Serialize>(kind: impl Into<String>, data: &T) -> Result<Bytes> {
        Self::new(kind, data)?.to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape() {
        let bytes = HubEnvelope::encode(KIND_ALERT_FIRED, &serde_json::json!({"value": 91.5}))
            .unwrap();
        let decoded: HubEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.kind, "alert.fired");
        assert_eq!(decoded.data["value"], 91.5);

        let raw: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(raw.get("timestamp").is_some());
    }
}

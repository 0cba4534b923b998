//! Alert notification channels.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use vmplane_core::{AlertHistoryId, AlertRuleId, VmId};
use vmplane_events::{EventHub, Topic, KIND_ALERT_FIRED};
use vmplane_store::{Comparison, Severity};

use crate::{OrchestratorError, Result};

/// Name of the tracing channel.
pub const CHANNEL_LOG: &str = "log";
/// Name of the webhook channel.
pub const CHANNEL_WEBHOOK: &str = "webhook";
/// Name of the event hub channel.
pub const CHANNEL_EVENT_HUB: &str = "event_hub";

/// Payload handed to every channel when an alert fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertNotification {
    /// Persisted occurrence.
    pub history_id: AlertHistoryId,
    /// Rule that fired.
    pub rule_id: AlertRuleId,
    /// Rule name.
    pub rule_name: String,
    /// VM the rule fired for.
    pub vm_id: VmId,
    /// Metric name.
    pub metric: String,
    /// Observed value.
    pub value: f64,
    /// Comparison operator.
    pub condition: Comparison,
    /// Rule threshold.
    pub threshold: f64,
    /// Severity.
    pub severity: Severity,
    /// Human-readable summary.
    pub message: String,
    /// When the alert fired.
    pub fired_at: DateTime<Utc>,
}

/// One notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Channel name rules refer to.
    fn channel(&self) -> &str;

    /// Deliver one alert.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery failed. Callers log it and move on.
    async fn send_alert(&self, alert: &AlertNotification) -> Result<()>;
}

/// Writes alerts to the tracing log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn channel(&self) -> &str {
        CHANNEL_LOG
    }

    async fn send_alert(&self, alert: &AlertNotification) -> Result<()> {
        warn!(
            rule = %alert.rule_name,
            vm_id = %alert.vm_id,
            metric = %alert.metric,
            value = alert.value,
            threshold = alert.threshold,
            severity = ?alert.severity,
            "ALERT: {}",
            alert.message
        );
        Ok(())
    }
}

/// POSTs alerts as JSON to a fixed URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    /// Create a webhook channel with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OrchestratorError::Config(format!("webhook client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    fn failure(&self, message: impl Into<String>) -> OrchestratorError {
        OrchestratorError::Notification {
            channel: CHANNEL_WEBHOOK.to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn channel(&self) -> &str {
        CHANNEL_WEBHOOK
    }

    async fn send_alert(&self, alert: &AlertNotification) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| self.failure(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.failure(format!("{} returned HTTP {}", self.url, status.as_u16())));
        }
        info!(url = %self.url, rule = %alert.rule_name, "alert webhook delivered");
        Ok(())
    }
}

/// Publishes alerts to global event hub subscribers.
pub struct EventHubNotifier {
    hub: Arc<EventHub>,
}

impl EventHubNotifier {
    /// Create the channel.
    #[must_use]
    pub fn new(hub: Arc<EventHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Notifier for EventHubNotifier {
    fn channel(&self) -> &str {
        CHANNEL_EVENT_HUB
    }

    async fn send_alert(&self, alert: &AlertNotification) -> Result<()> {
        if self.hub.publish(Topic::Global, KIND_ALERT_FIRED, alert) {
            Ok(())
        } else {
            Err(OrchestratorError::Notification {
                channel: CHANNEL_EVENT_HUB.to_string(),
                message: "event hub dropped the alert".to_string(),
            })
        }
    }
}

/// Notification channels keyed by name.
#[derive(Default, Clone)]
pub struct NotifierRegistry {
    channels: HashMap<String, Arc<dyn Notifier>>,
}

impl NotifierRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a channel under its own name.
    pub fn register(&mut self, notifier: Arc<dyn Notifier>) {
        self.channels.insert(notifier.channel().to_string(), notifier);
    }

    /// Look up a channel.
    #[must_use]
    pub fn get(&self, channel: &str) -> Option<Arc<dyn Notifier>> {
        self.channels.get(channel).cloned()
    }

    /// Registered channel names, sorted.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::ErrorKind;

    fn alert() -> AlertNotification {
        AlertNotification {
            history_id: AlertHistoryId::generate(),
            rule_id: AlertRuleId::generate(),
            rule_name: "high cpu".to_string(),
            vm_id: VmId::from_bytes([1; 32]),
            metric: "cpu_usage".to_string(),
            value: 93.5,
            condition: Comparison::GreaterThan,
            threshold: 80.0,
            severity: Severity::Critical,
            message: "cpu_usage 93.50 > 80.00".to_string(),
            fired_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn webhook_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/alerts"))
            .and(body_partial_json(serde_json::json!({
                "rule_name": "high cpu",
                "severity": "critical",
                "condition": ">"
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier =
            WebhookNotifier::new(format!("{}/hooks/alerts", server.uri()), Duration::from_secs(5))
                .unwrap();
        notifier.send_alert(&alert()).await.unwrap();
    }

    #[tokio::test]
    async fn webhook_error_status_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = notifier.send_alert(&alert()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Upstream);
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn event_hub_channel_publishes() {
        let hub = Arc::new(EventHub::new(8));
        let (sub, mut rx) = vmplane_events::ChannelSubscriber::new(4);
        hub.register(Topic::Global, Arc::new(sub));
        hub.start();

        EventHubNotifier::new(Arc::clone(&hub))
            .send_alert(&alert())
            .await
            .unwrap();
        let payload = rx.recv().await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(json["kind"], "alert.fired");
        assert_eq!(json["data"]["metric"], "cpu_usage");
        hub.stop().await;
    }

    #[test]
    fn registry_keys_by_channel() {
        let mut registry = NotifierRegistry::new();
        registry.register(Arc::new(LogNotifier));
        registry.register(Arc::new(EventHubNotifier::new(Arc::new(EventHub::new(1)))));
        assert_eq!(registry.channels(), vec!["event_hub", "log"]);
        assert!(registry.get("log").is_some());
        assert!(registry.get("sms").is_none());
    }
}

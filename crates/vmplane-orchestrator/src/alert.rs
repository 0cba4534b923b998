//! Alert rule evaluation with a per-(rule, VM) debounce window.
//!
//! A pair fires once its condition has held for the rule's duration,
//! measured from the first tick it was seen true. Any false tick resets the
//! window. After firing the window restarts, so a condition that stays true
//! fires again one duration later. Both the debounce map and the record of
//! open (firing) alerts live in memory and are lost on restart.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use vmplane_core::{AlertHistoryId, AlertRuleId, VmId};
use vmplane_store::{AlertHistoryRecord, AlertRule, AlertScope, AlertStatus, Store};

use crate::lifecycle::{Coordinator, LoopSet};
use crate::metrics::MetricRegistry;
use crate::notifier::{AlertNotification, NotifierRegistry};
use crate::Result;

type PairKey = (AlertRuleId, VmId);

/// Counters for one evaluation cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Enabled rules loaded.
    pub rules: usize,
    /// (rule, VM) pairs considered.
    pub pairs: usize,
    /// Alerts fired.
    pub fired: usize,
    /// Open alerts resolved.
    pub resolved: usize,
    /// Pairs skipped because the metric could not be read.
    pub failed: usize,
}

/// Periodically evaluates alert rules.
pub struct AlertEvaluator {
    store: Arc<dyn Store>,
    metrics: Arc<MetricRegistry>,
    notifiers: Arc<NotifierRegistry>,
    debounce: Mutex<HashMap<PairKey, DateTime<Utc>>>,
    open: Mutex<HashMap<PairKey, Vec<AlertHistoryId>>>,
    interval: Duration,
    loops: LoopSet,
}

impl AlertEvaluator {
    /// Create an evaluator ticking every `interval`.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        metrics: Arc<MetricRegistry>,
        notifiers: Arc<NotifierRegistry>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            metrics,
            notifiers,
            debounce: Mutex::new(HashMap::new()),
            open: Mutex::new(HashMap::new()),
            interval,
            loops: LoopSet::new(),
        }
    }

    /// When the pair's current window started, if one is open.
    #[must_use]
    pub fn debounce_started(&self, rule_id: &AlertRuleId, vm_id: &VmId) -> Option<DateTime<Utc>> {
        self.debounce.lock().get(&(*rule_id, *vm_id)).copied()
    }

    /// Advance the debounce state of a pair. Returns true when it fires.
    fn step(&self, key: PairKey, condition: bool, window: ChronoDuration, now: DateTime<Utc>) -> bool {
        let mut debounce = self.debounce.lock();
        if !condition {
            debounce.remove(&key);
            return false;
        }
        match debounce.get(&key) {
            None => {
                debounce.insert(key, now);
                false
            }
            Some(first) if now - *first >= window => {
                debounce.remove(&key);
                true
            }
            Some(_) => false,
        }
    }

    fn targets(rule: &AlertRule, all_vms: &[VmId]) -> Vec<VmId> {
        match &rule.scope {
            AlertScope::Global => all_vms.to_vec(),
            AlertScope::Vms(ids) => ids.clone(),
        }
    }

    /// Run one evaluation cycle as of `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule list, or the VM list needed by a global
    /// rule, cannot be read.
    pub async fn evaluate_at(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let rules = self.store.list_enabled_alert_rules()?;
        let mut report = CycleReport {
            rules: rules.len(),
            ..CycleReport::default()
        };

        let all_vms: Vec<VmId> = if rules.iter().any(|r| r.scope == AlertScope::Global) {
            self.store.list_all_vms()?.into_iter().map(|vm| vm.vm_id).collect()
        } else {
            Vec::new()
        };

        let mut live_keys = HashSet::new();
        for rule in &rules {
            let window = ChronoDuration::minutes(i64::from(rule.duration_minutes));
            for vm_id in Self::targets(rule, &all_vms) {
                report.pairs += 1;
                let key = (rule.id, vm_id);
                live_keys.insert(key);

                let value = match self.metrics.value(&rule.metric, &vm_id).await {
                    Ok(value) => value,
                    Err(e) => {
                        report.failed += 1;
                        debug!(rule = %rule.name, vm_id = %vm_id, error = %e, "metric unavailable");
                        continue;
                    }
                };

                let condition = rule.condition.evaluate(value, rule.threshold);
                if self.step(key, condition, window, now) {
                    self.fire(rule, vm_id, value, now).await;
                    report.fired += 1;
                } else if !condition {
                    report.resolved += self.resolve(key, now);
                }
            }
        }

        self.debounce.lock().retain(|key, _| live_keys.contains(key));
        self.open.lock().retain(|key, _| live_keys.contains(key));

        debug!(
            rules = report.rules,
            pairs = report.pairs,
            fired = report.fired,
            resolved = report.resolved,
            failed = report.failed,
            "alert evaluation complete"
        );
        Ok(report)
    }

    async fn fire(&self, rule: &AlertRule, vm_id: VmId, value: f64, now: DateTime<Utc>) {
        let message = format!(
            "{} {:.2} {} {:.2} for {} min",
            rule.metric, value, rule.condition, rule.threshold, rule.duration_minutes
        );
        let record = AlertHistoryRecord {
            id: AlertHistoryId::generate(),
            rule_id: rule.id,
            vm_id,
            metric: rule.metric.clone(),
            value,
            threshold: rule.threshold,
            severity: rule.severity,
            status: AlertStatus::Firing,
            message: message.clone(),
            fired_at: now,
            resolved_at: None,
        };

        match self.store.put_alert_history(&record) {
            Ok(()) => self
                .open
                .lock()
                .entry((rule.id, vm_id))
                .or_default()
                .push(record.id),
            Err(e) => error!(rule = %rule.name, vm_id = %vm_id, error = %e, "failed to record alert"),
        }
        info!(rule = %rule.name, vm_id = %vm_id, value, "alert fired");

        let notification = AlertNotification {
            history_id: record.id,
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            vm_id,
            metric: rule.metric.clone(),
            value,
            condition: rule.condition,
            threshold: rule.threshold,
            severity: rule.severity,
            message,
            fired_at: now,
        };

        for channel in &rule.channels {
            let Some(notifier) = self.notifiers.get(channel) else {
                warn!(channel = %channel, rule = %rule.name, "unknown notification channel");
                continue;
            };
            if let Err(e) = notifier.send_alert(&notification).await {
                warn!(channel = %channel, rule = %rule.name, error = %e, "alert notification failed");
            }
        }
    }

    fn resolve(&self, key: PairKey, now: DateTime<Utc>) -> usize {
        let Some(ids) = self.open.lock().remove(&key) else {
            return 0;
        };

        let mut resolved = 0;
        for id in ids {
            let record = match self.store.get_alert_history(&id) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(history_id = %id, error = %e, "failed to load open alert");
                    continue;
                }
            };
            let record = AlertHistoryRecord {
                status: AlertStatus::Resolved,
                resolved_at: Some(now),
                ..record
            };
            match self.store.put_alert_history(&record) {
                Ok(()) => resolved += 1,
                Err(e) => warn!(history_id = %id, error = %e, "failed to resolve alert"),
            }
        }
        if resolved > 0 {
            info!(rule_id = %key.0, vm_id = %key.1, resolved, "alert resolved");
        }
        resolved
    }
}

#[async_trait]
impl Coordinator for AlertEvaluator {
    fn name(&self) -> &'static str {
        "alert_evaluator"
    }

    fn start(self: Arc<Self>) {
        let Some(token) = self.loops.begin() else {
            debug!("alert evaluator already running");
            return;
        };

        let this = Arc::clone(&self);
        self.loops
            .spawn_periodic("alert_evaluation", self.interval, token, move || {
                let this = Arc::clone(&this);
                async move {
                    if let Err(e) = this.evaluate_at(Utc::now()).await {
                        error!(error = %e, "alert evaluation cycle failed");
                    }
                }
            });
        info!(interval_secs = self.interval.as_secs(), "alert evaluator started");
    }

    async fn stop(&self) {
        self.loops.shutdown().await;
        info!("alert evaluator stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;
    use vmplane_store::{Comparison, RocksStore, Severity};

    use super::*;
    use crate::metrics::MetricProvider;
    use crate::notifier::Notifier;
    use crate::OrchestratorError;

    struct Fixed(Mutex<f64>);

    #[async_trait]
    impl MetricProvider for Fixed {
        async fn value(&self, _vm_id: &VmId) -> Result<f64> {
            Ok(*self.0.lock())
        }
    }

    struct Broken;

    #[async_trait]
    impl MetricProvider for Broken {
        async fn value(&self, vm_id: &VmId) -> Result<f64> {
            Err(OrchestratorError::not_found("metric sample", vm_id))
        }
    }

    #[derive(Default)]
    struct Counting {
        name: &'static str,
        sent: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for Counting {
        fn channel(&self) -> &str {
            self.name
        }

        async fn send_alert(&self, _alert: &AlertNotification) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(OrchestratorError::Notification {
                    channel: self.name.to_string(),
                    message: "down".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<RocksStore>,
        cpu: Arc<Fixed>,
        ok: Arc<Counting>,
        bad: Arc<Counting>,
        evaluator: AlertEvaluator,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let cpu = Arc::new(Fixed(Mutex::new(0.0)));
        let mut metrics = MetricRegistry::new();
        metrics.register("cpu_usage", cpu.clone());
        metrics.register("broken", Arc::new(Broken));

        let ok = Arc::new(Counting {
            name: "ok",
            ..Counting::default()
        });
        let bad = Arc::new(Counting {
            name: "bad",
            fail: true,
            ..Counting::default()
        });
        let mut notifiers = NotifierRegistry::new();
        notifiers.register(ok.clone());
        notifiers.register(bad.clone());

        let evaluator = AlertEvaluator::new(
            store.clone(),
            Arc::new(metrics),
            Arc::new(notifiers),
            Duration::from_secs(60),
        );
        Fixture {
            _dir: dir,
            store,
            cpu,
            ok,
            bad,
            evaluator,
        }
    }

    fn rule(metric: &str, vm: VmId, channels: &[&str]) -> AlertRule {
        let now = Utc::now();
        AlertRule {
            id: AlertRuleId::generate(),
            name: "high cpu".to_string(),
            metric: metric.to_string(),
            condition: Comparison::GreaterThan,
            threshold: 80.0,
            severity: Severity::Critical,
            duration_minutes: 5,
            scope: AlertScope::Vms(vec![vm]),
            channels: channels.iter().map(|c| (*c).to_string()).collect(),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn minute(base: DateTime<Utc>, n: i64) -> DateTime<Utc> {
        base + ChronoDuration::minutes(n)
    }

    #[tokio::test]
    async fn fires_once_after_sustained_window() {
        let f = fixture();
        let vm = VmId::from_bytes([1; 32]);
        let rule = rule("cpu_usage", vm, &["ok"]);
        f.store.put_alert_rule(&rule).unwrap();
        *f.cpu.0.lock() = 85.0;

        let t0 = Utc::now();
        let mut fired_at = Vec::new();
        for tick in 0..6 {
            let report = f.evaluator.evaluate_at(minute(t0, tick)).await.unwrap();
            if report.fired > 0 {
                fired_at.push(tick);
            }
        }
        assert_eq!(fired_at, vec![5]);
        assert_eq!(f.ok.sent.load(Ordering::SeqCst), 1);

        let history = f.store.list_alert_history_by_rule(&rule.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, AlertStatus::Firing);
        assert_eq!(history[0].fired_at, minute(t0, 5));
    }

    #[tokio::test]
    async fn dip_resets_window() {
        let f = fixture();
        let vm = VmId::from_bytes([2; 32]);
        let rule = rule("cpu_usage", vm, &["ok"]);
        f.store.put_alert_rule(&rule).unwrap();

        let t0 = Utc::now();
        let samples = [85.0, 85.0, 85.0, 50.0, 85.0, 85.0, 85.0, 85.0, 85.0, 85.0];
        let mut fired_at = Vec::new();
        for (tick, sample) in samples.iter().enumerate() {
            *f.cpu.0.lock() = *sample;
            let tick = i64::try_from(tick).unwrap();
            if f.evaluator.evaluate_at(minute(t0, tick)).await.unwrap().fired > 0 {
                fired_at.push(tick);
            }
            if tick == 3 {
                assert!(f.evaluator.debounce_started(&rule.id, &vm).is_none());
            }
        }
        assert_eq!(fired_at, vec![9]);
    }

    #[tokio::test]
    async fn channel_failure_does_not_block_others() {
        let f = fixture();
        let vm = VmId::from_bytes([3; 32]);
        let mut rule = rule("cpu_usage", vm, &["bad", "missing", "ok"]);
        rule.duration_minutes = 1;
        f.store.put_alert_rule(&rule).unwrap();
        *f.cpu.0.lock() = 99.0;

        let t0 = Utc::now();
        f.evaluator.evaluate_at(t0).await.unwrap();
        let report = f.evaluator.evaluate_at(minute(t0, 1)).await.unwrap();
        assert_eq!(report.fired, 1);
        assert_eq!(f.bad.sent.load(Ordering::SeqCst), 1);
        assert_eq!(f.ok.sent.load(Ordering::SeqCst), 1);
        assert_eq!(f.store.list_alert_history_by_rule(&rule.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn clearing_condition_resolves_open_alert() {
        let f = fixture();
        let vm = VmId::from_bytes([4; 32]);
        let mut rule = rule("cpu_usage", vm, &[]);
        rule.duration_minutes = 0;
        f.store.put_alert_rule(&rule).unwrap();
        *f.cpu.0.lock() = 90.0;

        let t0 = Utc::now();
        f.evaluator.evaluate_at(t0).await.unwrap();
        assert_eq!(f.evaluator.evaluate_at(minute(t0, 1)).await.unwrap().fired, 1);

        *f.cpu.0.lock() = 10.0;
        let report = f.evaluator.evaluate_at(minute(t0, 2)).await.unwrap();
        assert_eq!(report.resolved, 1);

        let history = f.store.list_alert_history_by_rule(&rule.id).unwrap();
        assert_eq!(history[0].status, AlertStatus::Resolved);
        assert_eq!(history[0].resolved_at, Some(minute(t0, 2)));
    }

    #[tokio::test]
    async fn metric_failure_skips_pair_only() {
        let f = fixture();
        let vm = VmId::from_bytes([5; 32]);
        f.store.put_alert_rule(&rule("broken", vm, &[])).unwrap();
        f.store.put_alert_rule(&rule("unknown_metric", vm, &[])).unwrap();
        f.store.put_alert_rule(&rule("cpu_usage", vm, &[])).unwrap();

        let report = f.evaluator.evaluate_at(Utc::now()).await.unwrap();
        assert_eq!(report.rules, 3);
        assert_eq!(report.pairs, 3);
        assert_eq!(report.failed, 2);
    }

    #[tokio::test]
    async fn disabled_rules_are_ignored() {
        let f = fixture();
        let vm = VmId::from_bytes([6; 32]);
        let mut disabled = rule("cpu_usage", vm, &[]);
        disabled.enabled = false;
        f.store.put_alert_rule(&disabled).unwrap();

        let report = f.evaluator.evaluate_at(Utc::now()).await.unwrap();
        assert_eq!(report, CycleReport::default());
    }
}

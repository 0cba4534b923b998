//! In-memory hypervisor for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::types::{DomainState, DomainStateInfo, DomainStats};
use crate::{Domain, HypervisorControl, HypervisorError, Result};

/// A mock hypervisor that keeps domains in memory.
///
/// Domains removed after lookup report `DomainNotFound` on their next call,
/// like a real domain that was undefined underneath a handle.
#[derive(Clone, Default)]
pub struct MockHypervisor {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    domains: Mutex<HashMap<String, MockDomainData>>,
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    lookups: AtomicUsize,
}

#[derive(Clone)]
struct MockDomainData {
    state: DomainStateInfo,
    stats: DomainStats,
    xml: String,
}

impl MockDomainData {
    fn new(identity: &str, state: DomainState) -> Self {
        Self {
            state: DomainStateInfo::new(state, 0),
            stats: DomainStats::default(),
            xml: format!("<domain type='kvm'><name>{identity}</name></domain>"),
        }
    }
}

impl MockHypervisor {
    /// Create a new mock hypervisor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a domain in the given state.
    pub fn define(&self, identity: &str, state: DomainState) {
        self.inner
            .domains
            .lock()
            .insert(identity.to_string(), MockDomainData::new(identity, state));
    }

    /// Set the state of a domain, defining it if needed.
    pub fn set_state(&self, identity: &str, state: DomainState, reason: i32) {
        self.inner
            .domains
            .lock()
            .entry(identity.to_string())
            .or_insert_with(|| MockDomainData::new(identity, state))
            .state = DomainStateInfo::new(state, reason);
    }

    /// Set the counters reported by a domain.
    pub fn set_stats(&self, identity: &str, stats: DomainStats) {
        if let Some(domain) = self.inner.domains.lock().get_mut(identity) {
            domain.stats = stats;
        }
    }

    /// Undefine a domain.
    pub fn remove_domain(&self, identity: &str) {
        self.inner.domains.lock().remove(identity);
    }

    /// Make every call about `identity` fail with a connection error.
    pub fn fail_calls_for(&self, identity: &str) {
        self.inner.failing.lock().insert(identity.to_string());
    }

    /// Clear injected failures.
    pub fn clear_failures(&self) {
        self.inner.failing.lock().clear();
    }

    /// Delay every call by `delay`, for timeout tests.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.inner.delay.lock() = delay;
    }

    /// Number of `lookup_by_identity` calls so far.
    #[must_use]
    pub fn lookup_count(&self) -> usize {
        self.inner.lookups.load(Ordering::SeqCst)
    }

    /// Number of defined domains.
    #[must_use]
    pub fn domain_count(&self) -> usize {
        self.inner.domains.lock().len()
    }
}

impl Inner {
    async fn call(&self, identity: &str) -> Result<MockDomainData> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(identity) {
            return Err(HypervisorError::Connection(format!(
                "injected failure for {identity}"
            )));
        }
        self.domains
            .lock()
            .get(identity)
            .cloned()
            .ok_or_else(|| HypervisorError::DomainNotFound(identity.to_string()))
    }
}

#[async_trait]
impl HypervisorControl for MockHypervisor {
    async fn lookup_by_identity(&self, identity: &str) -> Result<Arc<dyn Domain>> {
        self.inner.lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.call(identity).await?;
        Ok(Arc::new(MockDomain {
            identity: identity.to_string(),
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MockDomain {
    identity: String,
    inner: Arc<Inner>,
}

#[async_trait]
impl Domain for MockDomain {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn state(&self) -> Result<DomainStateInfo> {
        Ok(self.inner.call(&self.identity).await?.state)
    }

    async fn xml_description(&self) -> Result<String> {
        Ok(self.inner.call(&self.identity).await?.xml)
    }

    async fn stats(&self) -> Result<DomainStats> {
        Ok(self.inner.call(&self.identity).await?.stats)
    }
}

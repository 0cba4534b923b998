//! Hypervisor control interface for vmplane.
//!
//! The orchestration core consumes the hypervisor read-mostly: it looks up
//! domains by identity and asks for their state, XML description and
//! resource counters. This crate provides:
//!
//! - The [`HypervisorControl`] and [`Domain`] traits
//! - State and reason code tables ([`DomainState`])
//! - [`VirshControl`], an implementation that drives `virsh`
//! - `MockHypervisor` for tests (feature `test-utils`)
//!
//! # Example
//!
//! ```no_run
//! use vmplane_hypervisor::{HypervisorControl, VirshConfig, VirshControl};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let control = VirshControl::new(VirshConfig::default());
//! let domain = control.lookup_by_identity("web-01").await?;
//! let info = domain.state().await?;
//! println!("state: {:?}, reason: {}", info.state, info.reason);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use std::sync::Arc;

use async_trait::async_trait;

pub mod error;
pub mod types;
pub mod virsh;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use error::{HypervisorError, Result};
pub use types::{DomainState, DomainStateInfo, DomainStats};
pub use virsh::{VirshConfig, VirshControl};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockHypervisor;

/// A handle on one hypervisor domain.
#[async_trait]
pub trait Domain: Send + Sync {
    /// The identity this domain was looked up by.
    fn identity(&self) -> &str;

    /// Fetch the current state and reason code.
    ///
    /// # Errors
    ///
    /// Returns `DomainNotFound` if the domain disappeared, or an upstream error.
    async fn state(&self) -> Result<DomainStateInfo>;

    /// Fetch the domain's XML description.
    ///
    /// # Errors
    ///
    /// Returns an error if the description cannot be retrieved.
    async fn xml_description(&self) -> Result<String>;

    /// Fetch cumulative resource counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the counters cannot be retrieved or parsed.
    async fn stats(&self) -> Result<DomainStats>;
}

/// The shared control-plane connection.
#[async_trait]
pub trait HypervisorControl: Send + Sync {
    /// Look up a domain by name or UUID.
    ///
    /// # Errors
    ///
    /// Returns `HypervisorError::DomainNotFound` when no domain matches.
    async fn lookup_by_identity(&self, identity: &str) -> Result<Arc<dyn Domain>>;
}

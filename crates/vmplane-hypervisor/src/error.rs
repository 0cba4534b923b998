//! Error types for the hypervisor crate.

use thiserror::Error;

/// Errors that can occur when talking to the hypervisor.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// No domain matches the given identity.
    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    /// The control connection could not be used.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A control command ran but reported failure.
    #[error("Command failed: {0}")]
    Command(String),

    /// The call did not finish within the configured timeout.
    #[error("Timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// The hypervisor answered with output we could not interpret.
    #[error("Parse error: {0}")]
    Parse(String),
}

impl HypervisorError {
    /// Check if this error is retriable.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    /// Whether the domain does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::DomainNotFound(_))
    }
}

/// A specialized Result type for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;

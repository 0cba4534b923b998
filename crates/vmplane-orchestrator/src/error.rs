//! Error types for the orchestrator crate.

use std::fmt;

use thiserror::Error;
use vmplane_hypervisor::HypervisorError;
use vmplane_store::StoreError;

/// Errors returned by the orchestration coordinators.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity, e.g. `"backup job"`.
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// The execution guard for this work is already held.
    #[error("already running: {0}")]
    AlreadyRunning(String),

    /// The operation is illegal for the entity's current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A filesystem operation failed.
    #[error("I/O error: {context}: {source}")]
    Io {
        /// What was being done.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The hypervisor control plane failed.
    #[error("hypervisor error: {0}")]
    Hypervisor(#[from] HypervisorError),

    /// A notification channel failed to deliver.
    #[error("notification via {channel} failed: {message}")]
    Notification {
        /// Channel name.
        channel: String,
        /// Failure detail.
        message: String,
    },

    /// Malformed configuration, cron expression or duration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The persistence collaborator failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable error kinds surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Entity missing.
    NotFound,
    /// Guard already held.
    AlreadyRunning,
    /// Illegal lifecycle transition.
    InvalidState,
    /// Filesystem failure.
    Io,
    /// Control plane or notification endpoint failure.
    Upstream,
    /// Bad configuration.
    Config,
    /// Store or serialization fault.
    Internal,
}

impl ErrorKind {
    /// Short machine-readable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyRunning => "already_running",
            Self::InvalidState => "invalid_state",
            Self::Io => "io",
            Self::Upstream => "upstream",
            Self::Config => "config",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl OrchestratorError {
    /// Build a `NotFound` error.
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Build an `Io` error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// The stable kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Io { .. } => ErrorKind::Io,
            Self::Hypervisor(e) if e.is_not_found() => ErrorKind::NotFound,
            Self::Hypervisor(_) | Self::Notification { .. } => ErrorKind::Upstream,
            Self::Config(_) => ErrorKind::Config,
            Self::Store(e) if e.is_not_found() => ErrorKind::NotFound,
            Self::Store(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error is retriable.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Io { .. } | Self::Notification { .. } => true,
            Self::Hypervisor(e) => e.is_retriable(),
            Self::Store(e) => matches!(e, StoreError::Database(_)),
            _ => false,
        }
    }
}

/// A specialized Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

//! Error types for the build configuration controller
//!
//! Errors are structured with fields to aid debugging in production. The
//! taxonomy follows how each failure is handled: invalid configuration is
//! recovered locally, store failures are retried, and propagation timeouts are
//! surfaced to the caller as a distinct outcome.

use std::time::Duration;

use thiserror::Error;

/// Main error type for build configuration operations
#[derive(Debug, Error)]
pub enum Error {
    /// Raw configuration could not be compiled into a policy
    #[error("invalid config at {field}: {message}")]
    InvalidConfig {
        /// Field path of the offending value (e.g. "registries.blockedRegistries[1]")
        field: String,
        /// Description of what's invalid
        message: String,
    },

    /// The configuration store could not be read or written
    #[error("config store unavailable [{operation}]: {message}")]
    StoreUnavailable {
        /// Store operation that failed (get, apply, watch)
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// A configuration version did not become active on every replica in time
    #[error("timed out after {waited:?} waiting for generation {generation} (missing: {missing:?})")]
    Timeout {
        /// Store generation that was awaited
        generation: i64,
        /// How long the caller waited
        waited: Duration,
        /// Replicas that had not acknowledged the generation
        missing: Vec<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "webhook", "watcher", "tracker")
        context: String,
    },
}

impl Error {
    /// Create an invalid-config error for a specific field path
    pub fn invalid_config_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Create a store-unavailable error for the given operation
    pub fn store_unavailable(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a propagation timeout error
    pub fn timeout(generation: i64, waited: Duration, missing: Vec<String>) -> Self {
        Self::Timeout {
            generation,
            waited,
            missing,
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Only store failures are retried. Invalid configuration waits for the
    /// next admin edit, a timeout is the caller's decision, and internal
    /// errors such as a poisoned lock do not heal by waiting.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::InvalidConfig { .. } => false,
            Error::StoreUnavailable { .. } => true,
            Error::Timeout { .. } => false,
            Error::Internal { .. } => false,
        }
    }
}

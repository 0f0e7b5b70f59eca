//! Error types for the cache engine

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error returned by source fetch functions
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur in the cache engine
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Read Path
    // =========================================================================
    /// The source of record failed; propagated to the caller as-is
    #[error("Source fetch failed: {0}")]
    Source(#[source] BoxError),

    /// Shared store timed out or refused the connection
    #[error("Backend unavailable during {operation}: {reason}")]
    BackendUnavailable {
        operation: &'static str,
        reason: String,
    },

    /// Waiter gave up on the stampede guard with no fallback permitted
    #[error("Timed out after {waited:?} waiting for fill of key {key}")]
    LockTimeout { key: String, waited: Duration },

    /// Entry in the shared store could not be decoded
    #[error("Malformed entry for key {key}: {reason}")]
    MalformedEntry { key: String, reason: String },

    /// Caller cancelled the lookup
    #[error("Lookup cancelled for key {key}")]
    Cancelled { key: String },

    // =========================================================================
    // Invalidation
    // =========================================================================
    /// Tag invalidation requested while tag versioning is off
    #[error("Tag versioning is disabled")]
    TagVersioningDisabled,

    /// Event bus publish or subscribe failed
    #[error("Event bus error: {0}")]
    EventBus(String),

    // =========================================================================
    // Configuration
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// YAML configuration could not be parsed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // =========================================================================
    // Infrastructure
    // =========================================================================
    /// Value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics rendering failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap any source failure
    pub fn from_source<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Source(err.into())
    }

    /// Build a backend failure for the named operation
    pub fn backend(operation: &'static str, reason: impl Into<String>) -> Self {
        Error::BackendUnavailable {
            operation,
            reason: reason.into(),
        }
    }

    /// True for failures of the optimization layers, which callers recover from locally
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::BackendUnavailable { .. } | Error::MalformedEntry { .. } | Error::EventBus(_)
        )
    }
}

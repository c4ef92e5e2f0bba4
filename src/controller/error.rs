//! Error types for the controller.
//!
//! Defines custom error types with classification for retry behavior.

use thiserror::Error;

use crate::client::ClientError;
use crate::controller::validation::ValidationError;
use crate::resources::TranslateError;

/// Error type for controller operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The declaration itself is invalid. Never retried.
    #[error("Invalid input: {0}")]
    Input(String),

    /// Optimistic concurrency conflict. Retried immediately after a re-read.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Transient cluster failure (unreachable, overloaded, timed out).
    #[error("Transient error: {0}")]
    Transient(String),

    /// The object does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Failure retrying cannot fix, e.g. a write denied by policy.
    #[error("Irrecoverable error: {0}")]
    Irrecoverable(String),

    /// The pass was cancelled because the instance is being deleted.
    #[error("Reconciliation cancelled")]
    Cancelled,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Whether the error consumes the retry budget and backs off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Whether the pass should be re-run at once without touching the retry budget.
    pub fn is_immediate_retry(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::Cancelled)
    }

    /// Short machine-readable reason for events and conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Input(_) => "InvalidSpec",
            Error::Conflict(_) => "Conflict",
            Error::Transient(_) => "ClusterUnavailable",
            Error::NotFound(_) => "NotFound",
            Error::Irrecoverable(_) => "ApplyFailed",
            Error::Cancelled => "Cancelled",
            Error::Serialization(_) => "SerializationFailed",
        }
    }
}

impl From<ClientError> for Error {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::NotFound(m) => Error::NotFound(m),
            ClientError::Conflict(m) => Error::Conflict(m),
            // A create racing a stale read backs off like an outage.
            ClientError::AlreadyExists(m) | ClientError::Unavailable(m) => Error::Transient(m),
            ClientError::Forbidden(m) | ClientError::Invalid(m) => Error::Irrecoverable(m),
        }
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Input(err.to_string())
    }
}

impl From<TranslateError> for Error {
    fn from(err: TranslateError) -> Self {
        Error::Input(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Transient("cluster call timed out".to_string())
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for the SAN volume driver
//!
//! Every failure that crosses the driver boundary is one of these variants.
//! Backend transport failures are described by
//! [`ClientError`](crate::backends::http::ClientError) and are converted here
//! before they reach the host.

use thiserror::Error;

/// Unified error type for the driver core
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Config file parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    // =========================================================================
    // Resource Errors
    // =========================================================================
    #[error("Resource not found: {kind}/{name}")]
    NotFound { kind: String, name: String },

    #[error("Snapshot {snapshot} is busy: {reason}")]
    SnapshotBusy { snapshot: String, reason: String },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Backend API failure: {backend} - {operation}: {reason}")]
    BackendApi {
        backend: String,
        operation: String,
        reason: String,
    },

    #[error("Operation not supported by {backend}: {operation}")]
    NotSupported { backend: String, operation: String },

    // =========================================================================
    // Request Errors
    // =========================================================================
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid reference to existing resource {reference}: {reason}")]
    ManageExistingInvalidReference { reference: String, reason: String },

    #[error("Volume type mismatch while managing existing volume: {reason}")]
    ManageExistingTypeMismatch { reason: String },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the host should treat a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// The operation may succeed later without configuration changes
    /// (for instance once dependent clones are removed).
    RetryLater,
    /// The operation failed and must not be retried automatically
    Fail,
}

impl Error {
    /// Build a backend failure for `operation`
    pub fn backend(
        backend: impl Into<String>,
        operation: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Error::BackendApi {
            backend: backend.into(),
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Build an unsupported-operation error
    pub fn not_supported(backend: impl Into<String>, operation: impl Into<String>) -> Self {
        Error::NotSupported {
            backend: backend.into(),
            operation: operation.into(),
        }
    }

    /// Determine what the host should do with this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::SnapshotBusy { .. } => ErrorAction::RetryLater,
            _ => ErrorAction::Fail,
        }
    }

    /// Check if this error is retryable by the user
    pub fn is_retryable(&self) -> bool {
        matches!(self.action(), ErrorAction::RetryLater)
    }

    /// Check if this error reports a missing resource
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

/// Result type alias for the driver core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::SnapshotBusy {
            snapshot: "snap-1".into(),
            reason: "clone point".into(),
        };
        assert_eq!(err.action(), ErrorAction::RetryLater);
        assert!(err.is_retryable());

        let err = Error::backend("lefthand", "create_volume", "HTTP 500");
        assert_eq!(err.action(), ErrorAction::Fail);
        assert!(!err.is_retryable());

        let err = Error::InvalidConfiguration("api version 1.0".into());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::backend("datera", "extend_volume", "HTTP 409");
        assert_eq!(
            err.to_string(),
            "Backend API failure: datera - extend_volume: HTTP 409"
        );

        let err = Error::not_supported("datera", "replication_enable");
        assert!(!err.is_not_found());
        assert_eq!(
            err.to_string(),
            "Operation not supported by datera: replication_enable"
        );
    }
}

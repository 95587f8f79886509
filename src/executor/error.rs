//! Failure taxonomy shared by both transports.

use serde::Serialize;
use thiserror::Error;

/// Marker a backend uses when a label is already taken.
pub const DUPLICATE_MARKER: &str = "duplicate";

/// Errors raised by a transport executor against one backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutorError {
    /// Connection could not be established.
    #[error("Backend '{backend}' is unreachable: {reason}")]
    Unreachable { backend: String, reason: String },

    /// Login refused, session expired, or a login page came back instead of data.
    #[error("Authentication with '{backend}' failed: {reason}")]
    AuthenticationFailure { backend: String, reason: String },

    /// The remote call did not finish in time.
    #[error("Backend '{backend}' timed out after {seconds}s")]
    Timeout { backend: String, seconds: u64 },

    /// The backend answered but refused the operation.
    #[error("Backend '{backend}' rejected the request: {reason}")]
    BackendRejected { backend: String, reason: String },

    /// Something the operation depends on does not exist on the backend.
    #[error("{what} not found on '{backend}'")]
    NotFound { backend: String, what: String },
}

impl ExecutorError {
    /// Name of the backend that produced this error.
    pub fn backend(&self) -> &str {
        match self {
            ExecutorError::Unreachable { backend, .. }
            | ExecutorError::AuthenticationFailure { backend, .. }
            | ExecutorError::Timeout { backend, .. }
            | ExecutorError::BackendRejected { backend, .. }
            | ExecutorError::NotFound { backend, .. } => backend,
        }
    }

    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutorError::Unreachable { .. }
                | ExecutorError::Timeout { .. }
                | ExecutorError::AuthenticationFailure { .. }
        )
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, ExecutorError::AuthenticationFailure { .. })
    }

    /// A rejection caused by a label collision.
    pub fn is_duplicate(&self) -> bool {
        match self {
            ExecutorError::BackendRejected { reason, .. } => {
                reason.to_lowercase().contains(DUPLICATE_MARKER)
            }
            _ => false,
        }
    }

    /// Serializable projection surfaced to callers.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ExecutorError::Unreachable { .. } => ErrorCategory::Unreachable,
            ExecutorError::AuthenticationFailure { .. } => ErrorCategory::AuthenticationFailure,
            ExecutorError::Timeout { .. } => ErrorCategory::Timeout,
            ExecutorError::BackendRejected { reason, .. } => {
                ErrorCategory::BackendRejected(reason.clone())
            }
            ExecutorError::NotFound { .. } => ErrorCategory::NotFound,
        }
    }
}

/// Error category attached to results handed to collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "category", content = "reason", rename_all = "snake_case")]
pub enum ErrorCategory {
    Unreachable,
    Timeout,
    AuthenticationFailure,
    BackendRejected(String),
    NotFound,
    /// Malformed descriptor; only that backend is skipped.
    ConfigurationInvalid(String),
    /// Selection produced no backend to work with.
    NoEligibleBackend,
}

impl ErrorCategory {
    /// Higher is more informative to an operator.
    pub fn specificity(&self) -> u8 {
        match self {
            ErrorCategory::BackendRejected(_) => 6,
            ErrorCategory::AuthenticationFailure => 5,
            ErrorCategory::NotFound => 4,
            ErrorCategory::Timeout => 3,
            ErrorCategory::Unreachable => 2,
            ErrorCategory::ConfigurationInvalid(_) => 1,
            ErrorCategory::NoEligibleBackend => 0,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Unreachable => write!(f, "unreachable"),
            ErrorCategory::Timeout => write!(f, "timeout"),
            ErrorCategory::AuthenticationFailure => write!(f, "authentication failure"),
            ErrorCategory::BackendRejected(reason) => write!(f, "rejected: {}", reason),
            ErrorCategory::NotFound => write!(f, "not found"),
            ErrorCategory::ConfigurationInvalid(reason) => {
                write!(f, "configuration invalid: {}", reason)
            }
            ErrorCategory::NoEligibleBackend => write!(f, "no eligible backend"),
        }
    }
}

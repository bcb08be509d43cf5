//! Error types for the nodenet operator
//!
//! Errors are structured with fields to aid debugging in production. Store
//! errors carry a [`StoreErrorKind`] so callers can tell idempotent outcomes
//! (NotFound on delete) from transient ones (Conflict, Unavailable, Timeout)
//! and from requests the API server will never accept (Rejected).

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Classification of a failed store operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// The object does not exist
    NotFound,
    /// Optimistic concurrency check failed or the object already exists
    Conflict,
    /// The store could not serve the request (transport, 5xx, throttling)
    Unavailable,
    /// The per-call timeout elapsed before the store answered
    Timeout,
    /// The request itself is unacceptable (400, 403, 422); resending it fails again
    Rejected,
}

impl std::fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::Conflict => write!(f, "conflict"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Timeout => write!(f, "timeout"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// Main error type for nodenet operations
#[derive(Debug, Error)]
pub enum Error {
    /// A store (API server) operation failed
    #[error("store {kind} during {operation}: {message}")]
    Store {
        /// Failure classification
        kind: StoreErrorKind,
        /// Operation that failed (e.g., "delete enactment n1.bridge1")
        operation: String,
        /// Underlying cause
        message: String,
    },

    /// Invalid policy content (e.g., a malformed node selector)
    #[error("validation error for {policy}: {message}")]
    Validation {
        /// Name of the policy with invalid configuration
        policy: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.nodeSelector")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "agent", "leader-election")
        context: String,
    },
}

impl Error {
    /// Create a store error
    pub fn store(
        kind: StoreErrorKind,
        operation: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Store {
            kind,
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a NotFound store error
    pub fn not_found(operation: impl Into<String>) -> Self {
        Self::store(StoreErrorKind::NotFound, operation, "object does not exist")
    }

    /// Create a Conflict store error
    pub fn conflict(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::store(StoreErrorKind::Conflict, operation, msg)
    }

    /// Create an Unavailable store error
    pub fn unavailable(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::store(StoreErrorKind::Unavailable, operation, msg)
    }

    /// Create a validation error for a policy
    pub fn validation_for(policy: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            policy: policy.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a policy with a field path
    pub fn validation_for_field(
        policy: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            policy: policy.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// The store error classification, if this is a store error
    pub fn store_kind(&self) -> Option<StoreErrorKind> {
        match self {
            Error::Store { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// True if this is a NotFound store error
    pub fn is_not_found(&self) -> bool {
        self.store_kind() == Some(StoreErrorKind::NotFound)
    }

    /// True if this is a Conflict store error
    pub fn is_conflict(&self) -> bool {
        self.store_kind() == Some(StoreErrorKind::Conflict)
    }

    /// True if the API server refused the request as invalid or forbidden
    pub fn is_rejected(&self) -> bool {
        self.store_kind() == Some(StoreErrorKind::Rejected)
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a spec change, and so does
    /// a request the API server rejected. Other store errors are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Store { kind, .. } => *kind != StoreErrorKind::Rejected,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        classify_kube_error("kubernetes request", err)
    }
}

/// Classify a kube-rs error into a store error for the given operation
pub fn classify_kube_error(operation: impl Into<String>, err: kube::Error) -> Error {
    let kind = match &err {
        kube::Error::Api(ae) if ae.code == 404 => StoreErrorKind::NotFound,
        kube::Error::Api(ae) if ae.code == 409 => StoreErrorKind::Conflict,
        kube::Error::Api(ae) if matches!(ae.code, 400 | 403 | 422) => StoreErrorKind::Rejected,
        _ => StoreErrorKind::Unavailable,
    };
    Error::store(kind, operation, err.to_string())
}

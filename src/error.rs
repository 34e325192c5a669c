//! Error types for the Netorch control plane

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// How the worker pool treats a failed reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The object vanished; nothing left to do.
    NotFound,
    /// Stale version token; requeue with backoff.
    Conflict,
    /// Store unreachable or timed out; requeue with backoff.
    Transient,
    /// Desired state is self-contradictory; wait for input to change.
    Permanent,
    /// Programming-level bug; abort this object only.
    Invariant,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::NotFound => write!(f, "not_found"),
            ErrorClass::Conflict => write!(f, "conflict"),
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Permanent => write!(f, "permanent"),
            ErrorClass::Invariant => write!(f, "invariant"),
        }
    }
}

/// Errors that can occur in the control plane
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error that did not map onto a store outcome
    #[error("Kubernetes API error: {0}")]
    Kube(#[source] kube::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Store Outcomes
    // =========================================================================
    /// Object does not exist
    #[error("{key} not found")]
    NotFound { key: String },

    /// Version token mismatch on write
    #[error("Conflict writing {key}: object has been modified")]
    Conflict { key: String },

    /// Create of an existing object
    #[error("{key} already exists")]
    AlreadyExists { key: String },

    /// Store unreachable, timeout, or watch stream failure
    #[error("Transient store error: {0}")]
    Transient(String),

    // =========================================================================
    // Reconcile Outcomes
    // =========================================================================
    /// Desired state is invalid; recorded as a status condition
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Internal invariant broken
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Attempt to add a second controller owner
    #[error("{child} is already controlled by {owner}")]
    AlreadyControlled { child: String, owner: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(key: impl std::fmt::Display) -> Self {
        Error::NotFound {
            key: key.to_string(),
        }
    }

    pub fn conflict(key: impl std::fmt::Display) -> Self {
        Error::Conflict {
            key: key.to_string(),
        }
    }

    pub fn already_exists(key: impl std::fmt::Display) -> Self {
        Error::AlreadyExists {
            key: key.to_string(),
        }
    }

    /// Classify this error for the worker pool's retry policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::NotFound { .. } => ErrorClass::NotFound,
            Error::Conflict { .. } | Error::AlreadyExists { .. } => ErrorClass::Conflict,
            Error::Kube(_) | Error::Io(_) | Error::Transient(_) => ErrorClass::Transient,
            Error::Validation(_) | Error::AlreadyControlled { .. } | Error::Config(_) => {
                ErrorClass::Permanent
            }
            Error::Serialization(_) | Error::Invariant(_) | Error::Internal(_) => {
                ErrorClass::Invariant
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => Error::NotFound {
                key: resp.message,
            },
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Error::AlreadyExists { key: resp.message }
            }
            kube::Error::Api(resp) if resp.code == 409 => Error::Conflict { key: resp.message },
            kube::Error::Api(resp) if resp.code == 422 || resp.code == 400 => {
                Error::Validation(resp.message)
            }
            other => Error::Kube(other),
        }
    }
}

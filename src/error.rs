//! Error types for the Ballista operator
//!
//! Errors are classified at the point they enter the crate: every
//! `kube::Error` is mapped by HTTP status into the variant that decides how
//! the dispatcher reacts (treat as satisfied, retry, back off, or surface in
//! status and stop).

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Ballista operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error that is not one of the classified cases
    ///
    /// Connection failures, 5xx and 429 responses end up here and are
    /// retried with backoff.
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[source]
        source: kube::Error,
    },

    /// The object vanished concurrently
    #[error("not found: {0}")]
    NotFound(String),

    /// A create raced with an earlier create of the same name
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic-concurrency write rejected (resourceVersion or uid mismatch)
    #[error("version conflict: {0}")]
    Conflict(String),

    /// Availability failure that is expected to clear on its own
    #[error("transient error: {0}")]
    Transient(String),

    /// The declared spec is structurally invalid
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.executor.instances")
        field: Option<String>,
    },

    /// A create/delete was rejected by the API server as fundamentally invalid
    #[error("{action} rejected for {cluster}: {message}")]
    PermanentAction {
        /// Name of the cluster the action was issued for
        cluster: String,
        /// The action that was rejected (e.g., "create pod demo-scheduler")
        action: String,
        /// API server message
        message: String,
    },

    /// The child index could not answer a query
    #[error("observation failed: {0}")]
    Observation(String),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "index")
        context: String,
    },
}

/// Coarse classification that drives the dispatcher's reaction to an error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Treated as already satisfied
    NotFound,
    /// Re-read and retry, then requeue
    Conflict,
    /// Requeue with exponential backoff
    Transient,
    /// Surface in status, wait for a spec change
    Validation,
    /// Surface in status, retry a bounded number of times
    PermanentAction,
    /// Drive the cluster to Unknown and requeue
    Observation,
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) => match ae.code {
                404 => Self::NotFound(ae.message),
                409 if ae.reason == "AlreadyExists" => Self::AlreadyExists(ae.message),
                409 => Self::Conflict(ae.message),
                400 | 422 => Self::PermanentAction {
                    cluster: UNKNOWN_CONTEXT.to_string(),
                    action: UNKNOWN_CONTEXT.to_string(),
                    message: ae.message,
                },
                _ => Self::Kube {
                    source: kube::Error::Api(ae),
                },
            },
            other => Self::Kube { source: other },
        }
    }
}

impl Error {
    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a permanent action error
    pub fn permanent_action(
        cluster: impl Into<String>,
        action: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::PermanentAction {
            cluster: cluster.into(),
            action: action.into(),
            message: msg.into(),
        }
    }

    /// Create an observation error
    pub fn observation(msg: impl Into<String>) -> Self {
        Self::Observation(msg.into())
    }

    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Attach cluster and action context to a permanent action error
    ///
    /// Other variants pass through unchanged.
    pub fn for_action(self, cluster: &str, action: &str) -> Self {
        match self {
            Self::PermanentAction { message, .. } => Self::PermanentAction {
                cluster: cluster.to_string(),
                action: action.to_string(),
                message,
            },
            other => other,
        }
    }

    /// Classify this error for the dispatcher
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound(_) => ErrorClass::NotFound,
            Self::AlreadyExists(_) | Self::Conflict(_) => ErrorClass::Conflict,
            Self::Kube { .. } | Self::Transient(_) | Self::Internal { .. } => {
                ErrorClass::Transient
            }
            Self::Validation { .. } => ErrorClass::Validation,
            Self::PermanentAction { .. } => ErrorClass::PermanentAction,
            Self::Observation(_) => ErrorClass::Observation,
        }
    }

    /// Check if this error is worth retrying without user intervention
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Conflict | ErrorClass::Transient | ErrorClass::Observation
        )
    }

    /// Check if this error is an optimistic-concurrency conflict
    ///
    /// `AlreadyExists` shares the conflict class but is not a version
    /// conflict: retrying the same create cannot succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Check if the target object no longer exists
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

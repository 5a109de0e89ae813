//! Error types for the vsync syncer
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the context needed to tell which object, kind or
//! component failed, and the Kubernetes variants can be classified into the
//! handful of API outcomes the reconcile loop treats specially.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for vsync operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid configuration or object shape
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "namespaceMode.targetNamespace")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// An object could not be translated between clusters
    #[error("translation error for {kind} {object}: {message}")]
    Translation {
        /// Kind of the object being translated
        kind: String,
        /// `namespace/name` of the object
        object: String,
        /// Description of what failed
        message: String,
    },

    /// The read cache is not usable yet
    #[error("cache error [{kind}]: {message}")]
    Cache {
        /// Kind whose cache failed
        kind: String,
        /// Description of what failed
        message: String,
    },

    /// Startup failure that must abort the process
    #[error("setup error: {message}")]
    Setup {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "engine", "queue", "sweeper")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error pointing at a specific field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a translation error for an object
    pub fn translation(
        kind: impl Into<String>,
        object: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Translation {
            kind: kind.into(),
            object: object.into(),
            message: msg.into(),
        }
    }

    /// Create a cache error for a kind
    pub fn cache(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Cache {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create a fatal setup error
    pub fn setup(msg: impl Into<String>) -> Self {
        Self::Setup {
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

    /// HTTP status code of the API response, if this is an API error
    pub fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => Some(ae.code),
            _ => None,
        }
    }

    /// The object does not exist (404)
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// A write lost an optimistic-concurrency race (409 Conflict)
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409 && ae.reason != "AlreadyExists"
        )
    }

    /// A create raced with another create (409 AlreadyExists)
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409 && ae.reason == "AlreadyExists"
        )
    }

    /// The API server refused the write (403 Forbidden or 422 admission rejection)
    pub fn is_forbidden(&self) -> bool {
        matches!(self.api_code(), Some(403) | Some(422))
    }

    /// Check if this error is retryable
    ///
    /// Validation, serialization and translation errors are not retryable
    /// (they need a config or object change). Kubernetes errors depend on
    /// the status code: conflicts are retried, other 4xx responses are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 409 => true,
                kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Translation { .. } => false,
            Error::Cache { .. } => true,
            Error::Setup { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            Error::Cache { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

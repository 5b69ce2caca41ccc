//! Error taxonomy for the gateway
//!
//! Every failure that can reach a caller is one of these variants. Each
//! variant maps to a stable machine-readable kind (see [`Error::kind`]) and an
//! HTTP status, so the UI can branch on the kind without parsing messages.
//!
//! Composite operations (scale, restart) record which sub-step failed in the
//! `step` field of the variants that carry one.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for gateway operations
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Malformed input. The caller's fault; retrying the same request won't help.
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The offending field, when one can be named (e.g. "server_url")
        field: Option<String>,
    },

    /// No descriptor exists for the requested cluster
    #[error("cluster not found: {cluster}")]
    ClusterNotFound {
        /// Cluster id as supplied by the caller
        cluster: String,
    },

    /// Transport or health-probe failure talking to a cluster
    #[error("cluster {cluster} unreachable: {message}")]
    ClusterUnreachable {
        /// Cluster id or "default"
        cluster: String,
        /// Underlying transport failure
        message: String,
        /// Sub-step of a composite operation, if any
        step: Option<String>,
    },

    /// Concurrent modification upstream that survived one retry
    #[error("conflict during {step}: {message}")]
    Conflict {
        /// Upstream conflict message
        message: String,
        /// Sub-step of the composite operation that conflicted
        step: String,
    },

    /// An applied document could not be parsed
    #[error("manifest parse error: {message}")]
    ManifestParse {
        /// Parser message, including location when available
        message: String,
        /// Zero-based index of the offending document in a multi-document payload
        document: Option<usize>,
    },

    /// Missing or invalid caller token
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Opaque passthrough of a cluster-reported failure
    #[error("upstream error {code} ({reason}): {message}")]
    Upstream {
        /// HTTP status reported by the cluster
        code: u16,
        /// Kubernetes Status reason (NotFound, Forbidden, ...)
        reason: String,
        /// Kubernetes Status message
        message: String,
        /// Sub-step of a composite operation, if any
        step: Option<String>,
    },

    /// The caller-supplied deadline expired before the operation completed
    #[error("deadline exceeded after {elapsed_ms}ms during {operation}")]
    DeadlineExceeded {
        /// Operation that was in flight
        operation: String,
        /// Deadline that expired, in milliseconds
        elapsed_ms: u64,
        /// Sub-step of a composite operation, if any
        step: Option<String>,
    },

    /// Storage failures and broken invariants
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g. "credential_store", "session_registry")
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

    /// Create a validation error naming the offending field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a cluster-not-found error
    pub fn cluster_not_found(cluster: impl Into<String>) -> Self {
        Self::ClusterNotFound {
            cluster: cluster.into(),
        }
    }

    /// Create a cluster-unreachable error
    pub fn unreachable(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ClusterUnreachable {
            cluster: cluster.into(),
            message: msg.into(),
            step: None,
        }
    }

    /// Create a conflict error for the given sub-step
    pub fn conflict(step: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            message: msg.into(),
            step: step.into(),
        }
    }

    /// Create a manifest parse error
    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::ManifestParse {
            message: msg.into(),
            document: None,
        }
    }

    /// Create a manifest parse error pointing at a specific document
    pub fn manifest_at(document: usize, msg: impl Into<String>) -> Self {
        Self::ManifestParse {
            message: msg.into(),
            document: Some(document),
        }
    }

    /// Create an authentication error
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create an upstream passthrough error
    pub fn upstream(code: u16, reason: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Upstream {
            code,
            reason: reason.into(),
            message: msg.into(),
            step: None,
        }
    }

    /// Create a deadline error
    pub fn deadline(operation: impl Into<String>, elapsed: std::time::Duration) -> Self {
        Self::DeadlineExceeded {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis() as u64,
            step: None,
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context about where it occurred
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Attach the failing sub-step of a composite operation.
    ///
    /// Only variants that carry a step are changed; a conflict keeps the step
    /// it was raised with.
    pub fn at_step(mut self, step: &str) -> Self {
        if let Self::Upstream { step: slot, .. }
        | Self::ClusterUnreachable { step: slot, .. }
        | Self::DeadlineExceeded { step: slot, .. } = &mut self
        {
            slot.get_or_insert_with(|| step.to_string());
        }
        self
    }

    /// Stable machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::ClusterNotFound { .. } => "cluster_not_found",
            Self::ClusterUnreachable { .. } => "cluster_unreachable",
            Self::Conflict { .. } => "conflict",
            Self::ManifestParse { .. } => "manifest_parse_error",
            Self::Authentication(_) => "authentication_error",
            Self::Upstream { .. } => "upstream_error",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// HTTP status code this error maps to
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } | Self::ManifestParse { .. } => 400,
            Self::Authentication(_) => 401,
            Self::ClusterNotFound { .. } => 404,
            Self::Conflict { .. } => 409,
            Self::ClusterUnreachable { .. } => 503,
            Self::DeadlineExceeded { .. } => 504,
            Self::Upstream { code, .. } if (400..600).contains(code) => *code,
            Self::Upstream { .. } => 502,
            Self::Internal { .. } => 500,
        }
    }

    /// Sub-step of a composite operation that failed, if recorded
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::Conflict { step, .. } => Some(step),
            Self::Upstream { step, .. }
            | Self::ClusterUnreachable { step, .. }
            | Self::DeadlineExceeded { step, .. } => step.as_deref(),
            _ => None,
        }
    }

    /// Whether a caller may reasonably retry (with backoff)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ClusterUnreachable { .. } | Self::Conflict { .. } | Self::DeadlineExceeded { .. }
        )
    }
}

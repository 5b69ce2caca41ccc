//! Common types for kubegate: the error taxonomy, telemetry setup, metrics,
//! and Kubernetes client construction.

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod metrics;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace used when a namespaced request doesn't name one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Annotation whose change on a pod template triggers a rolling restart
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Default listen port for the gateway HTTP server
pub const DEFAULT_PORT: u16 = 8080;

//! Upstream Kubernetes API seam
//!
//! Everything above this module talks to a cluster through [`ClusterApi`],
//! which speaks in untyped JSON objects and [`UpstreamFailure`]s. The kube-rs
//! implementation is [`KubeClusterApi`]; tests substitute the automocked
//! version.

mod client;
mod kinds;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

pub use self::kinds::ResourceKind;
pub use self::client::{KubeClientFactory, KubeClusterApi};

use crate::credentials::Credential;
use crate::error::Error;
use kubegate_common::DEFAULT_NAMESPACE;

/// Failure reported by an upstream call, before classification
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamFailure {
    /// The API server answered with a Status
    #[error("{reason} ({code}): {message}")]
    Status {
        /// HTTP status code
        code: u16,
        /// Status reason, e.g. `Conflict` or `NotFound`
        reason: String,
        /// Status message
        message: String,
    },
    /// The request never got an answer
    #[error("transport error: {0}")]
    Transport(String),
    /// Discovery could not resolve a manifest's kind
    #[error("unknown resource kind: {0}")]
    UnknownKind(String),
    /// The response could not be decoded
    #[error("decode error: {0}")]
    Decode(String),
}

impl UpstreamFailure {
    /// Optimistic concurrency conflict on a write
    pub fn is_conflict(&self) -> bool {
        matches!(self, UpstreamFailure::Status { code: 409, reason, .. } if reason == "Conflict")
    }

    /// Transport-level failure that counts against the client's health
    pub fn is_transport(&self) -> bool {
        matches!(self, UpstreamFailure::Transport(_))
    }

    /// Map to the gateway taxonomy, tagging the cluster and sub-step
    pub fn into_error(self, cluster: &str, step: Option<&str>) -> Error {
        let error = match self {
            UpstreamFailure::Status {
                code,
                reason,
                message,
            } => {
                if code == 409 && reason == "Conflict" {
                    return Error::conflict(step.unwrap_or("write"), message);
                }
                Error::upstream(code, reason, message)
            }
            UpstreamFailure::Transport(message) => Error::unreachable(cluster, message),
            UpstreamFailure::UnknownKind(kind) => {
                Error::validation(format!("unknown resource kind: {}", kind))
            }
            UpstreamFailure::Decode(message) => Error::upstream(502, "BadGateway", message),
        };
        match step {
            Some(step) => error.at_step(step),
            None => error,
        }
    }
}

/// Where a resource call is aimed: one kind, optionally one namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceScope {
    /// Resource kind
    pub kind: ResourceKind,
    /// Namespace; always None for cluster-scoped kinds
    pub namespace: Option<String>,
}

impl ResourceScope {
    /// Scope a kind to a namespace, defaulting namespaced kinds to `default`
    pub fn new(kind: ResourceKind, namespace: Option<&str>) -> Self {
        let namespace = if kind.is_namespaced() {
            Some(
                namespace
                    .map(str::trim)
                    .filter(|ns| !ns.is_empty())
                    .unwrap_or(DEFAULT_NAMESPACE)
                    .to_string(),
            )
        } else {
            None
        };
        Self { kind, namespace }
    }

    /// Scope a kind across every namespace
    pub fn all_namespaces(kind: ResourceKind) -> Self {
        Self {
            kind,
            namespace: None,
        }
    }
}

/// One page request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    /// Maximum items in the page; 0 asks for everything
    pub limit: u32,
    /// Continue token from the previous page
    pub continue_token: Option<String>,
}

/// One page of raw objects
#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    /// Objects in the page
    pub items: Vec<Value>,
    /// Token for the next page, None on the last page
    pub continue_token: Option<String>,
    /// Items left after this page, when the server reports it
    pub remaining: Option<i64>,
}

/// Pod log request
#[derive(Debug, Clone, Default)]
pub struct LogRequest {
    /// Container; the pod's only container when None
    pub container: Option<String>,
    /// Lines from the end
    pub tail_lines: Option<i64>,
    /// Previous terminated container instance
    pub previous: bool,
}

/// Pod exec request
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Container
    pub container: Option<String>,
    /// Command and arguments
    pub command: Vec<String>,
    /// Allocate a terminal
    pub tty: bool,
    /// Attach stdin
    pub stdin: bool,
}

/// Which output stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// A chunk of upstream output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    /// Source stream
    pub stream: OutputStream,
    /// Bytes, at most one read's worth
    pub data: Vec<u8>,
}

/// How an upstream process ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitStatus {
    /// Zero exit or clean close
    pub success: bool,
    /// Exit code if reported
    pub code: Option<i32>,
    /// Failure message if reported
    pub message: Option<String>,
}

impl ExitStatus {
    /// Clean exit with no details
    pub fn clean() -> Self {
        Self {
            success: true,
            code: Some(0),
            message: None,
        }
    }
}

/// Writable half of an interactive upstream channel
#[async_trait]
pub trait ShellInput: Send {
    /// Write bytes to the process's stdin
    async fn write(&mut self, data: Vec<u8>) -> Result<(), String>;

    /// Resize the terminal
    async fn resize(&mut self, width: u16, height: u16);

    /// Half-close: stdin EOF
    async fn close(&mut self);
}

/// An open interactive upstream channel
pub struct ShellStream {
    /// Input half
    pub input: Box<dyn ShellInput>,
    /// Output chunks; closes when the upstream stops producing output
    pub output: mpsc::Receiver<ShellOutput>,
    /// Resolves once the upstream process has ended
    pub exit: BoxFuture<'static, ExitStatus>,
}

/// Operations the gateway performs against one cluster
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// API server git version
    async fn server_version(&self) -> Result<String, UpstreamFailure>;

    /// List one page of objects
    async fn list(
        &self,
        scope: &ResourceScope,
        page: &PageRequest,
    ) -> Result<ObjectPage, UpstreamFailure>;

    /// Get one object
    async fn get(&self, scope: &ResourceScope, name: &str) -> Result<Value, UpstreamFailure>;

    /// Create an object
    async fn create(&self, scope: &ResourceScope, object: Value) -> Result<Value, UpstreamFailure>;

    /// Replace an object; the object's resourceVersion is the precondition
    async fn replace(
        &self,
        scope: &ResourceScope,
        name: &str,
        object: Value,
    ) -> Result<Value, UpstreamFailure>;

    /// Delete an object
    async fn delete(&self, scope: &ResourceScope, name: &str) -> Result<(), UpstreamFailure>;

    /// Create an arbitrary manifest object, resolving its kind through discovery
    async fn create_manifest_object(
        &self,
        object: Value,
        default_namespace: &str,
    ) -> Result<Value, UpstreamFailure>;

    /// Fetch pod logs
    async fn logs(
        &self,
        namespace: &str,
        pod: &str,
        request: &LogRequest,
    ) -> Result<String, UpstreamFailure>;

    /// Start a process in a pod container
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        request: &ExecRequest,
    ) -> Result<ShellStream, UpstreamFailure>;
}

/// Which cluster a client should be built for
#[derive(Debug, Clone)]
pub enum ConnectTarget {
    /// The gateway's own default cluster
    Default,
    /// An explicit server and credential
    Cluster {
        /// API server URL
        server_url: String,
        /// Credential
        credential: Credential,
    },
}

/// Builds [`ClusterApi`] handles
///
/// Construction is local (config and TLS setup); reachability is established
/// separately by probing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Build a client for a target
    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn ClusterApi>, Error>;
}

/// Fetch the server version within a timeout, rendering failures as text
pub async fn probe_version(api: &dyn ClusterApi, timeout: Duration) -> Result<String, String> {
    match tokio::time::timeout(timeout, api.server_version()).await {
        Ok(Ok(version)) => Ok(version),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("probe timed out after {}s", timeout.as_secs())),
    }
}

//! Cluster descriptors and the credential store
//!
//! A descriptor is the gateway's record of how to reach one cluster. The
//! credential half of it is kept apart from everything that gets serialized
//! back to callers: [`ClusterDescriptor`] has no credential field at all, and
//! the credential only travels inside [`StoredCluster`] on its way to the
//! client pool.

mod memory;
mod sqlite;
mod store;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize, Serializer};

pub use memory::MemoryRepository;
pub use sqlite::SqliteRepository;
pub use store::{CredentialStore, DEFAULT_PROBE_TIMEOUT};

use crate::error::Result;

/// Store-assigned cluster identifier
pub type ClusterId = i64;

/// Key under which the pool and session registry track a cluster
///
/// `Default` is the gateway's own configured cluster, used when a request
/// carries no `cluster_id`. It has no descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterKey {
    /// The configured default cluster
    Default,
    /// A cluster registered in the credential store
    Registered(ClusterId),
}

impl ClusterKey {
    /// Descriptor id, if this is a registered cluster
    pub fn id(&self) -> Option<ClusterId> {
        match self {
            ClusterKey::Default => None,
            ClusterKey::Registered(id) => Some(*id),
        }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterKey::Default => f.write_str("default"),
            ClusterKey::Registered(id) => write!(f, "{}", id),
        }
    }
}

impl Serialize for ClusterKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ClusterKey::Default => serializer.serialize_none(),
            ClusterKey::Registered(id) => serializer.serialize_i64(*id),
        }
    }
}

/// Last known reachability of a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    /// Never probed
    Unknown,
    /// Last probe succeeded
    Reachable,
    /// Last probe failed
    Unreachable,
}

impl ClusterStatus {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Unknown => "unknown",
            ClusterStatus::Reachable => "reachable",
            ClusterStatus::Unreachable => "unreachable",
        }
    }

    /// Parse the storage representation; anything unrecognised reads as Unknown
    pub fn parse(value: &str) -> Self {
        match value {
            "reachable" => ClusterStatus::Reachable,
            "unreachable" => ClusterStatus::Unreachable,
            _ => ClusterStatus::Unknown,
        }
    }
}

/// How the gateway authenticates to a cluster
#[derive(Debug, Clone)]
pub enum Credential {
    /// Bearer token against `server_url`
    Token {
        /// Service account or user token
        token: SecretString,
        /// Accept any serving certificate
        skip_tls_verify: bool,
    },
    /// Complete kubeconfig document; its current context is used
    Kubeconfig {
        /// Kubeconfig YAML
        content: SecretString,
    },
}

impl Credential {
    /// Which kind of credential this is, safe to show to callers
    pub fn kind(&self) -> CredentialKind {
        match self {
            Credential::Token { .. } => CredentialKind::Token,
            Credential::Kubeconfig { .. } => CredentialKind::Kubeconfig,
        }
    }
}

/// Credential kind without the secret material
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    /// Bearer token
    Token,
    /// Kubeconfig document
    Kubeconfig,
}

impl CredentialKind {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::Token => "token",
            CredentialKind::Kubeconfig => "kubeconfig",
        }
    }
}

/// Credential as it arrives in a request body
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum CredentialInput {
    /// Bearer token
    Token {
        /// Token value
        token: String,
        /// Accept any serving certificate
        #[serde(default)]
        skip_tls_verify: bool,
    },
    /// Kubeconfig document
    Kubeconfig {
        /// Kubeconfig YAML
        content: String,
    },
}

impl From<CredentialInput> for Credential {
    fn from(input: CredentialInput) -> Self {
        match input {
            CredentialInput::Token {
                token,
                skip_tls_verify,
            } => Credential::Token {
                token: SecretString::from(token),
                skip_tls_verify,
            },
            CredentialInput::Kubeconfig { content } => Credential::Kubeconfig {
                content: SecretString::from(content),
            },
        }
    }
}

/// The public view of a registered cluster
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterDescriptor {
    /// Store-assigned id
    pub id: ClusterId,
    /// Unique display name
    pub name: String,
    /// Free-form description
    pub description: String,
    /// API server URL
    pub server_url: String,
    /// Credential kind (never the credential)
    pub credential_type: CredentialKind,
    /// Last known reachability
    pub status: ClusterStatus,
    /// Registration time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

/// A descriptor together with its credential, for client construction only
#[derive(Debug, Clone)]
pub struct StoredCluster {
    /// Public descriptor
    pub descriptor: ClusterDescriptor,
    /// Secret credential
    pub credential: Credential,
}

/// Validated input for inserting a descriptor
#[derive(Debug, Clone)]
pub struct NewCluster {
    /// Unique display name
    pub name: String,
    /// Free-form description
    pub description: String,
    /// API server URL
    pub server_url: String,
    /// Credential
    pub credential: Credential,
}

/// Validated partial update; `None` leaves a field unchanged
#[derive(Debug, Clone, Default)]
pub struct ClusterPatch {
    /// New name
    pub name: Option<String>,
    /// New description
    pub description: Option<String>,
    /// New server URL
    pub server_url: Option<String>,
    /// New credential
    pub credential: Option<Credential>,
}

/// Request body for registering a cluster
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterCluster {
    /// Unique display name
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// API server URL; optional for kubeconfig credentials
    #[serde(default)]
    pub server_url: Option<String>,
    /// Credential
    pub credential: CredentialInput,
}

/// Request body for updating a cluster
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateCluster {
    /// New name
    #[serde(default)]
    pub name: Option<String>,
    /// New description
    #[serde(default)]
    pub description: Option<String>,
    /// New server URL
    #[serde(default)]
    pub server_url: Option<String>,
    /// Replacement credential
    #[serde(default)]
    pub credential: Option<CredentialInput>,
}

/// Request body for a standalone connection test
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestConnection {
    /// API server URL; optional for kubeconfig credentials
    #[serde(default)]
    pub server_url: Option<String>,
    /// Credential to probe with
    pub credential: CredentialInput,
}

/// Outcome of a connection probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionReport {
    /// Whether the probe reached the API server
    pub reachable: bool,
    /// Human-readable outcome
    pub message: String,
    /// API server git version when reachable
    pub remote_version: Option<String>,
}

/// Persistence for cluster descriptors
///
/// Implementations keep credential material out of the descriptor rows and
/// enforce name uniqueness, reporting a clash as a validation error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DescriptorRepository: Send + Sync {
    /// Insert a descriptor with status Unknown and assign it an id
    async fn insert(&self, cluster: NewCluster) -> Result<ClusterDescriptor>;

    /// Public descriptor by id
    async fn get(&self, id: ClusterId) -> Result<Option<ClusterDescriptor>>;

    /// Descriptor plus credential by id
    async fn fetch(&self, id: ClusterId) -> Result<Option<StoredCluster>>;

    /// All descriptors, ordered by id
    async fn list(&self) -> Result<Vec<ClusterDescriptor>>;

    /// Apply a patch; returns the new state, or None if the id is unknown
    async fn update(&self, id: ClusterId, patch: ClusterPatch) -> Result<Option<StoredCluster>>;

    /// Record the outcome of a probe
    async fn set_status(
        &self,
        id: ClusterId,
        status: ClusterStatus,
    ) -> Result<Option<ClusterDescriptor>>;

    /// Remove a descriptor and its credential; false if the id was unknown
    async fn delete(&self, id: ClusterId) -> Result<bool>;
}

/// Receives descriptor lifecycle events from the credential store
///
/// Both calls complete before the store acknowledges the triggering update or
/// delete to its caller.
#[async_trait]
pub trait DescriptorListener: Send + Sync {
    /// The descriptor's connection details may have changed
    async fn descriptor_changed(&self, id: ClusterId);

    /// The descriptor no longer exists
    async fn descriptor_removed(&self, id: ClusterId);
}

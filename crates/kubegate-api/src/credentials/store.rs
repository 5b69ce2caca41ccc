//! Credential store: validation, probing, and change notification on top of a
//! [`DescriptorRepository`]

use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use tracing::{info, warn};

use kubegate_common::kube_utils::{kubeconfig_server_url, parse_kubeconfig, validate_server_url};

use super::{
    ClusterDescriptor, ClusterId, ClusterPatch, ClusterStatus, ConnectionReport, Credential,
    DescriptorListener, DescriptorRepository, NewCluster, RegisterCluster, UpdateCluster,
};
use crate::error::{Error, Result};
use crate::upstream::{probe_version, ClientFactory, ConnectTarget};

/// Default bound on a connection probe
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Owner of cluster descriptors
///
/// Updates and deletes notify every registered [`DescriptorListener`] before
/// returning, after the repository change is durable. A client construction
/// that starts after the call returns therefore reads the new state.
pub struct CredentialStore {
    repository: Arc<dyn DescriptorRepository>,
    factory: Arc<dyn ClientFactory>,
    probe_timeout: Duration,
    listeners: Vec<Arc<dyn DescriptorListener>>,
}

impl CredentialStore {
    /// Create a store with no listeners
    pub fn new(
        repository: Arc<dyn DescriptorRepository>,
        factory: Arc<dyn ClientFactory>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            repository,
            factory,
            probe_timeout,
            listeners: Vec::new(),
        }
    }

    /// Register a listener for update and delete events
    pub fn with_listener(mut self, listener: Arc<dyn DescriptorListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Register a new cluster, then probe it to set its initial status
    ///
    /// An unreachable cluster is still registered, with status Unreachable.
    pub async fn register(&self, request: RegisterCluster) -> Result<ClusterDescriptor> {
        let name = validate_name(&request.name)?;
        let credential = Credential::from(request.credential);
        let server_url = resolve_server_url(request.server_url.as_deref(), &credential)?;

        let descriptor = self
            .repository
            .insert(NewCluster {
                name,
                description: request.description.trim().to_string(),
                server_url: server_url.clone(),
                credential: credential.clone(),
            })
            .await?;
        info!(cluster = descriptor.id, name = %descriptor.name, "cluster registered");

        let report = self.probe(&server_url, &credential).await;
        self.record_status(descriptor.id, &report).await
    }

    /// Public descriptor by id
    pub async fn get(&self, id: ClusterId) -> Result<ClusterDescriptor> {
        self.repository
            .get(id)
            .await?
            .ok_or_else(|| Error::cluster_not_found(id.to_string()))
    }

    /// All registered clusters
    pub async fn list(&self) -> Result<Vec<ClusterDescriptor>> {
        self.repository.list().await
    }

    /// Apply a partial update, invalidate the cached client, and re-probe
    pub async fn update(&self, id: ClusterId, request: UpdateCluster) -> Result<ClusterDescriptor> {
        let patch = self.validate_patch(id, request).await?;

        let stored = self
            .repository
            .update(id, patch)
            .await?
            .ok_or_else(|| Error::cluster_not_found(id.to_string()))?;

        for listener in &self.listeners {
            listener.descriptor_changed(id).await;
        }
        info!(cluster = id, "cluster updated");

        let report = self
            .probe(&stored.descriptor.server_url, &stored.credential)
            .await;
        self.record_status(id, &report).await
    }

    /// Delete a cluster; its client is evicted and its sessions are closed
    /// before this returns
    pub async fn delete(&self, id: ClusterId) -> Result<()> {
        if !self.repository.delete(id).await? {
            return Err(Error::cluster_not_found(id.to_string()));
        }

        for listener in &self.listeners {
            listener.descriptor_removed(id).await;
        }
        info!(cluster = id, "cluster deleted");
        Ok(())
    }

    /// Probe a server with a credential without storing anything
    ///
    /// Malformed input is an error; an unreachable server is a report with
    /// `reachable: false`.
    pub async fn test_connection(
        &self,
        server_url: Option<&str>,
        credential: Credential,
    ) -> Result<ConnectionReport> {
        validate_credential(&credential)?;
        let server_url = resolve_server_url(server_url, &credential)?;
        Ok(self.probe(&server_url, &credential).await)
    }

    async fn probe(&self, server_url: &str, credential: &Credential) -> ConnectionReport {
        let target = ConnectTarget::Cluster {
            server_url: server_url.to_string(),
            credential: credential.clone(),
        };

        let api = match self.factory.connect(&target).await {
            Ok(api) => api,
            Err(e) => {
                return ConnectionReport {
                    reachable: false,
                    message: e.to_string(),
                    remote_version: None,
                }
            }
        };

        match probe_version(api.as_ref(), self.probe_timeout).await {
            Ok(version) => ConnectionReport {
                reachable: true,
                message: "connected".to_string(),
                remote_version: Some(version),
            },
            Err(message) => ConnectionReport {
                reachable: false,
                message,
                remote_version: None,
            },
        }
    }

    async fn record_status(
        &self,
        id: ClusterId,
        report: &ConnectionReport,
    ) -> Result<ClusterDescriptor> {
        let status = if report.reachable {
            ClusterStatus::Reachable
        } else {
            warn!(cluster = id, message = %report.message, "cluster probe failed");
            ClusterStatus::Unreachable
        };
        self.repository
            .set_status(id, status)
            .await?
            .ok_or_else(|| Error::cluster_not_found(id.to_string()))
    }

    async fn validate_patch(&self, id: ClusterId, request: UpdateCluster) -> Result<ClusterPatch> {
        let name = request.name.as_deref().map(validate_name).transpose()?;
        let credential = request.credential.map(Credential::from);
        if let Some(credential) = &credential {
            validate_credential(credential)?;
        }

        let server_url = match (request.server_url.as_deref(), &credential) {
            (Some(url), _) => Some(normalize_server_url(url)?),
            // A new kubeconfig brings its own server when it names one
            (None, Some(credential)) => kubeconfig_url(credential)?
                .map(|url| normalize_server_url(&url))
                .transpose()?,
            (None, None) => None,
        };

        if self.repository.get(id).await?.is_none() {
            return Err(Error::cluster_not_found(id.to_string()));
        }

        Ok(ClusterPatch {
            name,
            description: request.description.map(|d| d.trim().to_string()),
            server_url,
            credential,
        })
    }
}

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::validation_for_field("name", "must not be empty"));
    }
    Ok(name.to_string())
}

fn validate_credential(credential: &Credential) -> Result<()> {
    match credential {
        Credential::Token { token, .. } if token.expose_secret().trim().is_empty() => Err(
            Error::validation_for_field("credential", "token must not be empty"),
        ),
        Credential::Token { .. } => Ok(()),
        Credential::Kubeconfig { content } => parse_kubeconfig(content.expose_secret()).map(|_| ()),
    }
}

fn normalize_server_url(url: &str) -> Result<String> {
    validate_server_url(url)?;
    Ok(url.trim().trim_end_matches('/').to_string())
}

fn kubeconfig_url(credential: &Credential) -> Result<Option<String>> {
    match credential {
        Credential::Kubeconfig { content } => {
            let kubeconfig = parse_kubeconfig(content.expose_secret())?;
            Ok(kubeconfig_server_url(&kubeconfig))
        }
        Credential::Token { .. } => Ok(None),
    }
}

/// Pick the server URL for a credential: the explicit one if given, else the
/// kubeconfig's current context
fn resolve_server_url(explicit: Option<&str>, credential: &Credential) -> Result<String> {
    validate_credential(credential)?;
    if let Some(url) = explicit.filter(|u| !u.trim().is_empty()) {
        return normalize_server_url(url);
    }
    match kubeconfig_url(credential)? {
        Some(url) => normalize_server_url(&url),
        None => Err(Error::validation_for_field(
            "server_url",
            "required unless the kubeconfig's current context names a server",
        )),
    }
}

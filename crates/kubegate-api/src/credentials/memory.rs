//! In-memory descriptor repository for ephemeral runs and tests

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::{
    ClusterDescriptor, ClusterId, ClusterPatch, ClusterStatus, DescriptorRepository, NewCluster,
    StoredCluster,
};
use crate::error::{Error, Result};

#[derive(Default)]
struct Inner {
    next_id: ClusterId,
    clusters: BTreeMap<ClusterId, StoredCluster>,
}

/// Descriptor repository that forgets everything on restart
#[derive(Default)]
pub struct MemoryRepository {
    inner: RwLock<Inner>,
}

impl MemoryRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }
}

fn name_taken(inner: &Inner, name: &str, except: Option<ClusterId>) -> bool {
    inner
        .clusters
        .values()
        .any(|c| c.descriptor.name == name && Some(c.descriptor.id) != except)
}

#[async_trait]
impl DescriptorRepository for MemoryRepository {
    async fn insert(&self, cluster: NewCluster) -> Result<ClusterDescriptor> {
        let mut inner = self.inner.write();
        if name_taken(&inner, &cluster.name, None) {
            return Err(Error::validation_for_field(
                "name",
                format!("cluster name {:?} already exists", cluster.name),
            ));
        }
        inner.next_id += 1;
        let now = Utc::now();
        let descriptor = ClusterDescriptor {
            id: inner.next_id,
            name: cluster.name,
            description: cluster.description,
            server_url: cluster.server_url,
            credential_type: cluster.credential.kind(),
            status: ClusterStatus::Unknown,
            created_at: now,
            updated_at: now,
        };
        inner.clusters.insert(
            descriptor.id,
            StoredCluster {
                descriptor: descriptor.clone(),
                credential: cluster.credential,
            },
        );
        Ok(descriptor)
    }

    async fn get(&self, id: ClusterId) -> Result<Option<ClusterDescriptor>> {
        Ok(self
            .inner
            .read()
            .clusters
            .get(&id)
            .map(|c| c.descriptor.clone()))
    }

    async fn fetch(&self, id: ClusterId) -> Result<Option<StoredCluster>> {
        Ok(self.inner.read().clusters.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<ClusterDescriptor>> {
        Ok(self
            .inner
            .read()
            .clusters
            .values()
            .map(|c| c.descriptor.clone())
            .collect())
    }

    async fn update(&self, id: ClusterId, patch: ClusterPatch) -> Result<Option<StoredCluster>> {
        let mut inner = self.inner.write();
        if let Some(name) = &patch.name {
            if name_taken(&inner, name, Some(id)) {
                return Err(Error::validation_for_field(
                    "name",
                    format!("cluster name {:?} already exists", name),
                ));
            }
        }
        let Some(stored) = inner.clusters.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(name) = patch.name {
            stored.descriptor.name = name;
        }
        if let Some(description) = patch.description {
            stored.descriptor.description = description;
        }
        if let Some(server_url) = patch.server_url {
            stored.descriptor.server_url = server_url;
        }
        if let Some(credential) = patch.credential {
            stored.descriptor.credential_type = credential.kind();
            stored.credential = credential;
        }
        stored.descriptor.updated_at = Utc::now();
        Ok(Some(stored.clone()))
    }

    async fn set_status(
        &self,
        id: ClusterId,
        status: ClusterStatus,
    ) -> Result<Option<ClusterDescriptor>> {
        let mut inner = self.inner.write();
        Ok(inner.clusters.get_mut(&id).map(|stored| {
            stored.descriptor.status = status;
            stored.descriptor.clone()
        }))
    }

    async fn delete(&self, id: ClusterId) -> Result<bool> {
        Ok(self.inner.write().clusters.remove(&id).is_some())
    }
}

//! Shared fixtures for unit tests

use std::sync::Arc;

use async_trait::async_trait;

use crate::credentials::MemoryRepository;
use crate::error::Result;
use crate::pool::{ClientPool, PoolConfig};
use crate::upstream::{ClientFactory, ClusterApi, ConnectTarget, MockClusterApi};

/// Factory handing out one prepared API for every target
pub struct FixedFactory {
    api: Arc<dyn ClusterApi>,
}

impl FixedFactory {
    /// Factory for an already prepared API
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl ClientFactory for FixedFactory {
    async fn connect(&self, _target: &ConnectTarget) -> Result<Arc<dyn ClusterApi>> {
        Ok(self.api.clone())
    }
}

/// Pool whose default cluster is `api`
///
/// The version probe is answered here; callers only set up the calls their
/// test makes.
pub fn pool_with(mut api: MockClusterApi) -> Arc<ClientPool> {
    api.expect_server_version()
        .returning(|| Ok("v1.30.2".to_string()));
    Arc::new(ClientPool::new(
        Arc::new(MemoryRepository::new()),
        Arc::new(FixedFactory { api: Arc::new(api) }),
        PoolConfig::default(),
    ))
}

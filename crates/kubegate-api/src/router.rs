//! Request routing: `cluster_id` to pooled client

use std::sync::Arc;

use crate::credentials::ClusterKey;
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::pool::{ClientPool, ClusterClient};

/// Resolves the target cluster of a request
///
/// Routing never retries; pool errors reach the caller unchanged, and a
/// construction that outlasts the caller's budget is `deadline_exceeded`.
#[derive(Clone)]
pub struct RequestRouter {
    pool: Arc<ClientPool>,
}

impl RequestRouter {
    /// Route through a pool
    pub fn new(pool: Arc<ClientPool>) -> Self {
        Self { pool }
    }

    /// Underlying pool
    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }

    /// Acquire the client for a raw `cluster_id` parameter within `deadline`
    pub async fn route(
        &self,
        cluster_id: Option<&str>,
        deadline: Deadline,
    ) -> Result<Arc<ClusterClient>> {
        let key = parse_cluster(cluster_id)?;
        tokio::time::timeout(deadline.budget(), self.pool.acquire(key))
            .await
            .map_err(|_| Error::deadline("route", deadline.budget()))?
    }
}

/// Parse a `cluster_id` parameter; absent or empty selects the default cluster
pub fn parse_cluster(raw: Option<&str>) -> Result<ClusterKey> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(ClusterKey::Default);
    };
    match raw.parse::<i64>() {
        Ok(id) if id > 0 => Ok(ClusterKey::Registered(id)),
        _ => Err(Error::validation_for_field(
            "cluster_id",
            format!("invalid cluster id {:?}", raw),
        )),
    }
}

/// Require a non-empty resource name for a mutating operation
pub fn require_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::validation_for_field("name", "resource name is required"));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::credentials::MemoryRepository;
    use crate::pool::PoolConfig;
    use crate::upstream::{ClientFactory, ClusterApi, ConnectTarget};

    /// Factory whose connect never finishes
    struct Hanging;

    #[async_trait]
    impl ClientFactory for Hanging {
        async fn connect(&self, _target: &ConnectTarget) -> Result<Arc<dyn ClusterApi>> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_construction_is_bounded_by_the_deadline() {
        let pool = Arc::new(ClientPool::new(
            Arc::new(MemoryRepository::new()),
            Arc::new(Hanging),
            PoolConfig::default(),
        ));
        let router = RequestRouter::new(pool);

        let err = router
            .route(None, Deadline::default_of(Duration::from_secs(3)))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "deadline_exceeded");
    }

    #[tokio::test]
    async fn malformed_cluster_id_fails_before_the_pool() {
        let pool = Arc::new(ClientPool::new(
            Arc::new(MemoryRepository::new()),
            Arc::new(Hanging),
            PoolConfig::default(),
        ));
        let err = RequestRouter::new(pool)
            .route(Some("abc"), Deadline::default_of(Duration::from_secs(3)))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn cluster_id_parsing() {
        assert_eq!(parse_cluster(None).unwrap(), ClusterKey::Default);
        assert_eq!(parse_cluster(Some("")).unwrap(), ClusterKey::Default);
        assert_eq!(parse_cluster(Some("12")).unwrap(), ClusterKey::Registered(12));

        for bad in ["abc", "-1", "0", "1.5", "9999999999999999999999"] {
            let err = parse_cluster(Some(bad)).unwrap_err();
            assert_eq!(err.kind(), "validation_error", "accepted {bad:?}");
        }
    }

    #[test]
    fn names_must_be_present() {
        assert_eq!(require_name(" web ").unwrap(), "web");
        assert_eq!(require_name("  ").unwrap_err().kind(), "validation_error");
    }
}

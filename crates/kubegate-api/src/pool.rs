//! Cluster client pool
//!
//! One live client per cluster key, built lazily from the credential store's
//! current descriptor and probed before first use. Each key owns a slot
//! holding one shared construction future, so concurrent callers for the same
//! cluster share one construction and its outcome, failures included. Callers
//! for different clusters never wait on each other.
//!
//! A slot is replaced, never reset: invalidation removes it from the map and
//! cancels its construction, and the next `acquire` installs a fresh one.
//! Waiters on a cancelled slot start over, so a construction that read a
//! descriptor before it changed or disappeared is never handed out. Anyone
//! still holding an `Arc<ClusterClient>` from an old slot can finish their
//! call with it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kubegate_common::metrics::{
    InvalidationCause, CLIENTS_CACHED, CLIENT_CONSTRUCTIONS, CLIENT_INVALIDATIONS,
};

use crate::credentials::{
    ClusterId, ClusterKey, ClusterStatus, DescriptorListener, DescriptorRepository,
};
use crate::error::{Error, Result};
use crate::upstream::{probe_version, ClientFactory, ClusterApi, ConnectTarget};

/// Pool tuning
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Consecutive transport failures before a client is dropped
    pub failure_threshold: u32,
    /// Unused clients older than this are reaped
    pub idle_timeout: Duration,
    /// Bound on the construction-time version probe
    pub probe_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            idle_timeout: Duration::from_secs(30 * 60),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// A probed client for one cluster
pub struct ClusterClient {
    key: ClusterKey,
    api: Arc<dyn ClusterApi>,
    server_version: String,
    last_used: Mutex<Instant>,
    consecutive_failures: AtomicU32,
}

impl ClusterClient {
    /// Which cluster this client talks to
    pub fn key(&self) -> ClusterKey {
        self.key
    }

    /// Upstream API handle
    pub fn api(&self) -> &dyn ClusterApi {
        self.api.as_ref()
    }

    /// Version reported by the construction probe
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }
}

type Construction = Shared<BoxFuture<'static, Result<Arc<ClusterClient>>>>;

struct Slot {
    construction: Construction,
    cancelled: CancellationToken,
}

impl Slot {
    /// The constructed client, once construction has succeeded
    fn client(&self) -> Option<&Arc<ClusterClient>> {
        self.construction
            .peek()
            .and_then(|outcome| outcome.as_ref().ok())
    }
}

/// Owner of every cluster client in the process
pub struct ClientPool {
    builder: Builder,
    config: PoolConfig,
    slots: DashMap<ClusterKey, Arc<Slot>>,
}

impl ClientPool {
    /// Create an empty pool
    pub fn new(
        repository: Arc<dyn DescriptorRepository>,
        factory: Arc<dyn ClientFactory>,
        config: PoolConfig,
    ) -> Self {
        Self {
            builder: Builder {
                repository,
                factory,
                probe_timeout: config.probe_timeout,
            },
            config,
            slots: DashMap::new(),
        }
    }

    /// Cached healthy client for a key, constructing one if needed
    ///
    /// Every caller waiting on the same construction gets its outcome; a
    /// failed construction is not retried until the next `acquire`.
    pub async fn acquire(&self, key: ClusterKey) -> Result<Arc<ClusterClient>> {
        loop {
            let (slot, created) = self.slot_for(key);
            let outcome = slot.construction.clone().await;

            if slot.cancelled.is_cancelled() {
                debug!(cluster = %key, "construction superseded by invalidation, starting over");
                continue;
            }
            return match outcome {
                Ok(client) => {
                    if created {
                        CLIENTS_CACHED.record(self.cached() as u64, &[]);
                    }
                    client.touch();
                    Ok(client)
                }
                Err(e) => {
                    self.slots.remove_if(&key, |_, current| Arc::ptr_eq(current, &slot));
                    Err(e)
                }
            };
        }
    }

    /// Drop the cached client for a key; a no-op when nothing is cached
    ///
    /// A construction still in flight is cancelled, and its waiters build
    /// again from the descriptor as it is now.
    pub fn invalidate(&self, key: ClusterKey, cause: InvalidationCause) {
        if let Some((_, slot)) = self.slots.remove(&key) {
            slot.cancelled.cancel();
            if slot.client().is_some() {
                self.record_invalidation(key, cause);
            }
        }
    }

    /// Reset the failure count after a successful upstream call
    pub fn record_success(&self, client: &ClusterClient) {
        client.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Count a transport failure, dropping the client at the threshold
    ///
    /// Only the instance that failed is dropped; if it was already replaced,
    /// the replacement is left alone.
    pub fn record_transport_failure(&self, client: &Arc<ClusterClient>) {
        let failures = client.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures < self.config.failure_threshold {
            debug!(cluster = %client.key, failures, "upstream transport failure");
            return;
        }
        if self.evict_instance(client) {
            warn!(cluster = %client.key, failures, "dropping client after repeated transport failures");
            self.record_invalidation(client.key, InvalidationCause::CircuitBreaker);
        }
    }

    /// Drop every client unused for the idle timeout; returns how many went
    pub fn evict_idle(&self) -> usize {
        let idle: Vec<Arc<ClusterClient>> = self
            .slots
            .iter()
            .filter_map(|entry| entry.value().client().cloned())
            .filter(|client| client.idle_for() >= self.config.idle_timeout)
            .collect();

        let mut evicted = 0;
        for client in idle {
            if self.evict_instance(&client) {
                debug!(cluster = %client.key, "reaped idle client");
                self.record_invalidation(client.key, InvalidationCause::Idle);
                evicted += 1;
            }
        }
        evicted
    }

    /// Number of constructed clients currently cached
    pub fn cached(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.value().client().is_some())
            .count()
    }

    /// Run [`evict_idle`](Self::evict_idle) on an interval until shutdown
    pub fn spawn_reaper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = self.evict_idle();
                        if evicted > 0 {
                            info!(evicted, "idle client reaper pass");
                        }
                    }
                }
            }
            debug!("idle client reaper stopped");
        })
    }

    /// The key's current slot, installing one with a fresh construction if needed
    ///
    /// The slot is cloned out so the map shard lock is not held across an await.
    fn slot_for(&self, key: ClusterKey) -> (Arc<Slot>, bool) {
        match self.slots.entry(key) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let cancelled = CancellationToken::new();
                let builder = self.builder.clone();
                let token = cancelled.clone();
                let construction = async move {
                    tokio::select! {
                        _ = token.cancelled() => Err(Error::cluster_not_found(key.to_string())),
                        built = builder.construct(key) => built,
                    }
                }
                .boxed()
                .shared();
                let slot = Arc::new(Slot {
                    construction,
                    cancelled,
                });
                entry.insert(slot.clone());
                (slot, true)
            }
        }
    }

    fn evict_instance(&self, client: &Arc<ClusterClient>) -> bool {
        self.slots
            .remove_if(&client.key, |_, slot| {
                slot.client()
                    .map(|cached| Arc::ptr_eq(cached, client))
                    .unwrap_or(false)
            })
            .is_some()
    }

    fn record_invalidation(&self, key: ClusterKey, cause: InvalidationCause) {
        info!(cluster = %key, cause = cause.as_str(), "cluster client invalidated");
        CLIENT_INVALIDATIONS.add(1, &[KeyValue::new("cause", cause.as_str())]);
        CLIENTS_CACHED.record(self.cached() as u64, &[]);
    }
}

/// Builds and probes clients; owned by each construction so it can outlive
/// the caller that started it
#[derive(Clone)]
struct Builder {
    repository: Arc<dyn DescriptorRepository>,
    factory: Arc<dyn ClientFactory>,
    probe_timeout: Duration,
}

impl Builder {
    async fn construct(self, key: ClusterKey) -> Result<Arc<ClusterClient>> {
        let target = match key {
            ClusterKey::Default => ConnectTarget::Default,
            ClusterKey::Registered(id) => match self.repository.fetch(id).await? {
                Some(stored) => ConnectTarget::Cluster {
                    server_url: stored.descriptor.server_url,
                    credential: stored.credential,
                },
                None => {
                    CLIENT_CONSTRUCTIONS.add(1, &[KeyValue::new("result", "not_found")]);
                    return Err(Error::cluster_not_found(id.to_string()));
                }
            },
        };

        let api = match self.factory.connect(&target).await {
            Ok(api) => api,
            Err(e) => return Err(self.construction_failed(key, e.to_string()).await),
        };
        let server_version = match probe_version(api.as_ref(), self.probe_timeout).await {
            Ok(version) => version,
            Err(message) => return Err(self.construction_failed(key, message).await),
        };

        info!(cluster = %key, version = %server_version, "cluster client constructed");
        CLIENT_CONSTRUCTIONS.add(1, &[KeyValue::new("result", "success")]);
        self.record_status(key, ClusterStatus::Reachable).await;

        Ok(Arc::new(ClusterClient {
            key,
            api,
            server_version,
            last_used: Mutex::new(Instant::now()),
            consecutive_failures: AtomicU32::new(0),
        }))
    }

    async fn construction_failed(&self, key: ClusterKey, message: String) -> Error {
        warn!(cluster = %key, error = %message, "cluster client construction failed");
        CLIENT_CONSTRUCTIONS.add(1, &[KeyValue::new("result", "unreachable")]);
        self.record_status(key, ClusterStatus::Unreachable).await;
        Error::unreachable(key.to_string(), message)
    }

    async fn record_status(&self, key: ClusterKey, status: ClusterStatus) {
        let Some(id) = key.id() else { return };
        if let Err(e) = self.repository.set_status(id, status).await {
            warn!(cluster = id, error = %e, "failed to record cluster status");
        }
    }
}

#[async_trait]
impl DescriptorListener for ClientPool {
    async fn descriptor_changed(&self, id: ClusterId) {
        self.invalidate(ClusterKey::Registered(id), InvalidationCause::CredentialChange);
    }

    async fn descriptor_removed(&self, id: ClusterId) {
        self.invalidate(ClusterKey::Registered(id), InvalidationCause::Removed);
    }
}

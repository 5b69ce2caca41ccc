//! Session registry for stream bridge sessions
//!
//! The registry is the only owner of session records. A bridge holds an
//! `Arc<Session>` for the lifetime of its connection and reports progress by
//! advancing the session's state; anyone else (an admin, the idle sweeper,
//! cluster deletion) ends a session through [`SessionRegistry::close`], which
//! cancels the bridge and waits a bounded time for it to wind down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use kubegate_common::metrics::{SESSIONS_ACTIVE, SESSIONS_CLOSED, SESSIONS_OPENED};

use crate::credentials::{ClusterId, ClusterKey, DescriptorListener};

/// Extra wait beyond the bridge's drain grace before a close is forced
const CLOSE_SLACK: Duration = Duration::from_millis(500);

/// What a session is connected to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SessionTarget {
    /// Interactive exec in a pod container
    PodExec {
        /// Pod namespace
        namespace: String,
        /// Pod name
        pod: String,
        /// Container name
        container: String,
    },
    /// SSH shell on a node
    NodeSsh {
        /// Node name
        node: String,
    },
}

impl SessionTarget {
    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            SessionTarget::PodExec { .. } => "pod-exec",
            SessionTarget::NodeSsh { .. } => "node-ssh",
        }
    }
}

/// Session lifecycle; states only ever move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Registered, upstream not yet open
    Connecting,
    /// Relaying bytes
    Active,
    /// Draining before close
    Closing,
    /// Finished
    Closed,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed its connection
    ClientClosed,
    /// The upstream process or channel ended
    UpstreamClosed,
    /// No traffic for the idle timeout
    IdleTimeout,
    /// The session's maximum lifetime elapsed
    DeadlineExceeded,
    /// The cluster's descriptor was deleted
    ClusterRemoved,
    /// Closed through the admin surface or at shutdown
    AdminClosed,
    /// A relay or setup error
    Error(String),
}

impl CloseReason {
    /// Metric label and wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::UpstreamClosed => "upstream_closed",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::DeadlineExceeded => "deadline",
            CloseReason::ClusterRemoved => "cluster_removed",
            CloseReason::AdminClosed => "admin",
            CloseReason::Error(_) => "error",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Error(message) => write!(f, "error: {}", message),
            other => f.write_str(other.as_str()),
        }
    }
}

/// One bridge session
pub struct Session {
    id: Uuid,
    cluster: ClusterKey,
    target: SessionTarget,
    created_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    deadline: Option<Instant>,
    state: watch::Sender<SessionState>,
    close_reason: Mutex<Option<CloseReason>>,
    cancel: CancellationToken,
}

impl Session {
    /// Session id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Cluster the session belongs to
    pub fn cluster(&self) -> ClusterKey {
        self.cluster
    }

    /// Session target
    pub fn target(&self) -> &SessionTarget {
        &self.target
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Maximum lifetime, if the caller set one
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fires when the session should stop relaying
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Why the session ended, once known
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    /// Move to a later state; returns false if `next` is not ahead
    pub fn advance(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Record traffic
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last recorded traffic
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Ask the bridge to stop; the first reason given wins
    pub fn request_close(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.advance(SessionState::Closing);
        self.cancel.cancel();
    }

    /// Serializable snapshot
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            cluster_id: self.cluster,
            target: self.target.clone(),
            state: self.state(),
            created_at: self.created_at,
            idle_seconds: self.idle_for().as_secs(),
            close_reason: self.close_reason().map(|r| r.to_string()),
        }
    }
}

/// Session as reported by the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Session id
    pub id: Uuid,
    /// Cluster id; null for the default cluster
    pub cluster_id: ClusterKey,
    /// Target
    pub target: SessionTarget,
    /// Current state
    pub state: SessionState,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Seconds since the last traffic
    pub idle_seconds: u64,
    /// Close reason, once closing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
}

/// Registry tuning
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Sessions with no traffic for this long are closed by the sweeper
    pub idle_timeout: Duration,
    /// How long a closing bridge may drain output
    pub close_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(15 * 60),
            close_grace: Duration::from_secs(2),
        }
    }
}

/// All active bridge sessions
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Arc<Session>>,
    config: SessionConfig,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
        }
    }

    /// Registry tuning
    pub fn config(&self) -> SessionConfig {
        self.config
    }

    /// Register a new session in the Connecting state
    pub fn create(
        &self,
        cluster: ClusterKey,
        target: SessionTarget,
        max_lifetime: Option<Duration>,
    ) -> Arc<Session> {
        let now = Instant::now();
        let (state, _) = watch::channel(SessionState::Connecting);
        let session = Arc::new(Session {
            id: Uuid::new_v4(),
            cluster,
            target,
            created_at: Utc::now(),
            last_activity: Mutex::new(now),
            deadline: max_lifetime.map(|lifetime| now + lifetime),
            state,
            close_reason: Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        self.sessions.insert(session.id, session.clone());
        SESSIONS_OPENED.add(1, &[KeyValue::new("target", session.target.label())]);
        SESSIONS_ACTIVE.record(self.sessions.len() as u64, &[]);
        info!(session = %session.id, cluster = %cluster, target = session.target.label(), "session registered");
        session
    }

    /// Session by id
    pub fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Record traffic on a session; false if it is not registered
    pub fn touch(&self, id: Uuid) -> bool {
        match self.sessions.get(&id) {
            Some(entry) => {
                entry.value().touch();
                true
            }
            None => false,
        }
    }

    /// Snapshot of active sessions, optionally for one cluster
    pub fn list(&self, cluster: Option<ClusterKey>) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .filter(|entry| cluster.map_or(true, |c| entry.value().cluster == c))
            .map(|entry| entry.value().info())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Number of active sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether there are no active sessions
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close a session and wait for its bridge to finish
    ///
    /// Returns false if the session was not registered, which makes repeated
    /// or concurrent closes harmless. The entry is gone from [`list`](Self::list)
    /// before this returns, and the session is Closed even if its bridge
    /// never acknowledged.
    pub async fn close(&self, id: Uuid, reason: CloseReason) -> bool {
        let Some((_, session)) = self.sessions.remove(&id) else {
            return false;
        };
        SESSIONS_ACTIVE.record(self.sessions.len() as u64, &[]);

        session.request_close(reason);
        let mut state = session.state.subscribe();
        let wait = self.config.close_grace + CLOSE_SLACK;
        let acknowledged = tokio::time::timeout(
            wait,
            state.wait_for(|s| *s == SessionState::Closed),
        )
        .await
        .is_ok();
        if !acknowledged {
            warn!(session = %id, "bridge did not close in time, forcing");
        }
        session.advance(SessionState::Closed);

        let reason = session.close_reason().unwrap_or(CloseReason::AdminClosed);
        SESSIONS_CLOSED.add(1, &[KeyValue::new("reason", reason.as_str())]);
        info!(session = %id, cluster = %session.cluster, reason = %reason, "session closed");
        true
    }

    /// Close every session of a cluster; returns how many were closed
    pub async fn close_all(&self, cluster: ClusterKey, reason: CloseReason) -> usize {
        let ids: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().cluster == cluster)
            .map(|entry| *entry.key())
            .collect();
        self.close_many(ids, reason).await
    }

    /// Close every session in the registry
    pub async fn drain(&self, reason: CloseReason) -> usize {
        let ids: Vec<Uuid> = self.sessions.iter().map(|entry| *entry.key()).collect();
        self.close_many(ids, reason).await
    }

    /// Close sessions idle past the idle timeout; returns how many were closed
    pub async fn sweep_idle(&self) -> usize {
        let ids: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() >= self.config.idle_timeout)
            .map(|entry| *entry.key())
            .collect();
        self.close_many(ids, CloseReason::IdleTimeout).await
    }

    /// Run [`sweep_idle`](Self::sweep_idle) on an interval until shutdown
    pub fn spawn_sweeper(
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
                        let closed = self.sweep_idle().await;
                        if closed > 0 {
                            info!(closed, "idle session sweep");
                        }
                    }
                }
            }
            debug!("idle session sweeper stopped");
        })
    }

    async fn close_many(&self, ids: Vec<Uuid>, reason: CloseReason) -> usize {
        let closes = ids.into_iter().map(|id| self.close(id, reason.clone()));
        futures::future::join_all(closes)
            .await
            .into_iter()
            .filter(|closed| *closed)
            .count()
    }
}

#[async_trait]
impl DescriptorListener for SessionRegistry {
    async fn descriptor_changed(&self, _id: ClusterId) {}

    async fn descriptor_removed(&self, id: ClusterId) {
        let closed = self
            .close_all(ClusterKey::Registered(id), CloseReason::ClusterRemoved)
            .await;
        if closed > 0 {
            info!(cluster = id, closed, "closed sessions of removed cluster");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec_target(pod: &str) -> SessionTarget {
        SessionTarget::PodExec {
            namespace: "default".into(),
            pod: pod.into(),
            container: "app".into(),
        }
    }

    /// Simulates a bridge that acknowledges cancellation after a short drain
    fn spawn_bridge(session: Arc<Session>, drain: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            session.advance(SessionState::Active);
            session.cancellation().cancelled().await;
            tokio::time::sleep(drain).await;
            session.advance(SessionState::Closed);
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[test]
    fn state_never_moves_backwards() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let session = registry.create(ClusterKey::Default, exec_target("web"), None);
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.advance(SessionState::Active));
        assert!(session.advance(SessionState::Closing));
        assert!(!session.advance(SessionState::Active));
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[test]
    fn first_close_reason_wins() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let session = registry.create(ClusterKey::Default, exec_target("web"), None);
        session.request_close(CloseReason::ClientClosed);
        session.request_close(CloseReason::AdminClosed);
        assert_eq!(session.close_reason(), Some(CloseReason::ClientClosed));
        assert!(session.cancellation().is_cancelled());
    }

    #[test]
    fn list_filters_by_cluster() {
        let registry = SessionRegistry::new(SessionConfig::default());
        registry.create(ClusterKey::Registered(1), exec_target("a"), None);
        registry.create(ClusterKey::Registered(2), exec_target("b"), None);
        registry.create(
            ClusterKey::Registered(1),
            SessionTarget::NodeSsh {
                node: "worker-1".into(),
            },
            None,
        );

        assert_eq!(registry.list(None).len(), 3);
        assert_eq!(registry.list(Some(ClusterKey::Registered(1))).len(), 2);
        assert!(registry.list(Some(ClusterKey::Default)).is_empty());
    }

    #[test]
    fn info_serializes_target_kind() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let session = registry.create(ClusterKey::Registered(3), exec_target("web"), None);
        let json = serde_json::to_value(session.info()).unwrap();
        assert_eq!(json["target"]["kind"], "pod-exec");
        assert_eq!(json["cluster_id"], 3);
        assert_eq!(json["state"], "connecting");
    }

    // =========================================================================
    // Close
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn close_waits_for_bridge_and_is_idempotent() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let session = registry.create(ClusterKey::Default, exec_target("web"), None);
        let bridge = spawn_bridge(session.clone(), Duration::from_millis(300));

        let started = Instant::now();
        assert!(registry.close(session.id(), CloseReason::AdminClosed).await);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.get(session.id()).is_none());
        bridge.await.unwrap();

        assert!(!registry.close(session.id(), CloseReason::AdminClosed).await);
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_bridge_is_forced_closed() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let session = registry.create(ClusterKey::Default, exec_target("web"), None);

        assert!(registry.close(session.id(), CloseReason::AdminClosed).await);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn removing_a_cluster_closes_only_its_sessions() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let doomed = registry.create(ClusterKey::Registered(7), exec_target("a"), None);
        let other = registry.create(ClusterKey::Registered(8), exec_target("b"), None);
        spawn_bridge(doomed.clone(), Duration::from_millis(10));

        registry.descriptor_removed(7).await;

        assert_eq!(doomed.state(), SessionState::Closed);
        assert_eq!(doomed.close_reason(), Some(CloseReason::ClusterRemoved));
        assert_eq!(other.state(), SessionState::Connecting);
        assert_eq!(registry.len(), 1);
    }

    // =========================================================================
    // Idle sweep
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_closed_and_removed() {
        let registry = SessionRegistry::new(SessionConfig {
            idle_timeout: Duration::from_secs(15 * 60),
            close_grace: Duration::from_secs(2),
        });
        let idle = registry.create(ClusterKey::Default, exec_target("idle"), None);
        let busy = registry.create(ClusterKey::Default, exec_target("busy"), None);
        spawn_bridge(idle.clone(), Duration::ZERO);

        tokio::time::advance(Duration::from_secs(10 * 60)).await;
        assert!(registry.touch(busy.id()));
        tokio::time::advance(Duration::from_secs(6 * 60)).await;

        assert_eq!(registry.sweep_idle().await, 1);
        assert_eq!(idle.state(), SessionState::Closed);
        assert_eq!(idle.close_reason(), Some(CloseReason::IdleTimeout));
        let remaining = registry.list(None);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, busy.id());
    }
}

//! Cluster registration and session administration

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::{ok, ApiResult, ClusterQuery};
use crate::auth::UserIdentity;
use crate::credentials::{
    ClusterDescriptor, ClusterId, ClusterKey, ConnectionReport, Credential, RegisterCluster,
    TestConnection, UpdateCluster,
};
use crate::error::{Error, Result};
use crate::router::parse_cluster;
use crate::server::AppState;
use crate::sessions::{CloseReason, SessionInfo};

fn registered_id(raw: &str) -> Result<ClusterId> {
    match parse_cluster(Some(raw))? {
        ClusterKey::Registered(id) => Ok(id),
        ClusterKey::Default => Err(Error::validation_for_field("id", "cluster id is required")),
    }
}

/// Session filter from `cluster_id`; absent or blank lists every cluster
fn session_filter(raw: Option<&str>) -> Result<Option<ClusterKey>> {
    match raw.map(str::trim).filter(|raw| !raw.is_empty()) {
        None => Ok(None),
        Some(raw) => parse_cluster(Some(raw)).map(Some),
    }
}

/// `GET /api/v1/clusters`
pub async fn list_clusters(State(state): State<AppState>) -> ApiResult<Vec<ClusterDescriptor>> {
    ok(state.store.list().await?)
}

/// `POST /api/v1/clusters`
pub async fn register_cluster(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<UserIdentity>,
    Json(body): Json<RegisterCluster>,
) -> ApiResult<ClusterDescriptor> {
    let descriptor = state.store.register(body).await?;
    info!(cluster = descriptor.id, user = %user.username, "register requested");
    ok(descriptor)
}

/// `POST /api/v1/clusters/test-connection`
pub async fn test_connection(
    State(state): State<AppState>,
    Json(body): Json<TestConnection>,
) -> ApiResult<ConnectionReport> {
    let report = state
        .store
        .test_connection(body.server_url.as_deref(), Credential::from(body.credential))
        .await?;
    ok(report)
}

/// `GET /api/v1/clusters/{id}`
pub async fn get_cluster(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ClusterDescriptor> {
    ok(state.store.get(registered_id(&id)?).await?)
}

/// `PUT /api/v1/clusters/{id}`
pub async fn update_cluster(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateCluster>,
) -> ApiResult<ClusterDescriptor> {
    ok(state.store.update(registered_id(&id)?, body).await?)
}

/// `DELETE /api/v1/clusters/{id}`
///
/// Returns once the cluster's client is evicted and its sessions are closed.
pub async fn delete_cluster(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<UserIdentity>,
    Path(id): Path<String>,
) -> ApiResult<()> {
    let id = registered_id(&id)?;
    state.store.delete(id).await?;
    info!(cluster = id, user = %user.username, "delete completed");
    ok(())
}

/// `GET /api/v1/sessions`
///
/// Without `cluster_id`, or with an empty one, every session is listed.
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ClusterQuery>,
) -> ApiResult<Vec<SessionInfo>> {
    let filter = session_filter(query.cluster_id.as_deref())?;
    ok(state.sessions.list(filter))
}

/// Outcome of an admin close
#[derive(Debug, Serialize)]
pub struct SessionClosed {
    /// Session id
    pub id: Uuid,
    /// False when the session was already gone
    pub closed: bool,
}

/// `DELETE /api/v1/sessions/{id}`
pub async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SessionClosed> {
    let id = Uuid::parse_str(id.trim())
        .map_err(|_| Error::validation_for_field("id", format!("invalid session id {:?}", id)))?;
    let closed = state.sessions.close(id, CloseReason::AdminClosed).await;
    ok(SessionClosed { id, closed })
}

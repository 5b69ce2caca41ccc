//! Pods, deployments and manifest creation

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use super::resources::{delete_namespaced, get_namespaced, list_namespaced};
use super::{client_for, ok, ApiResult, ListQuery, ManifestBody, ObjectQuery};
use crate::deadline::Deadline;
use crate::resources::{CreatedObject, ExecOutput, ResourcePage};
use crate::server::AppState;
use crate::upstream::{LogRequest, ResourceKind};

// =============================================================================
// Pods
// =============================================================================

/// `GET /api/v1/pods`
pub async fn list_pods(
    State(state): State<AppState>,
    deadline: Deadline,
    Query(query): Query<ListQuery>,
) -> ApiResult<ResourcePage> {
    list_namespaced(state, deadline, ResourceKind::Pod, query).await
}

/// `GET /api/v1/pods/{name}`
pub async fn get_pod(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(name): Path<String>,
    Query(query): Query<ObjectQuery>,
) -> ApiResult<Value> {
    get_namespaced(state, deadline, ResourceKind::Pod, name, query).await
}

/// `DELETE /api/v1/pods/{name}`
pub async fn delete_pod(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(name): Path<String>,
    Query(query): Query<ObjectQuery>,
) -> ApiResult<()> {
    delete_namespaced(state, deadline, ResourceKind::Pod, name, query).await
}

/// Query of a log read
#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    /// Target cluster
    pub cluster_id: Option<String>,
    /// Namespace
    pub namespace: Option<String>,
    /// Container
    pub container: Option<String>,
    /// Lines from the end; 100 when absent
    pub tail_lines: Option<i64>,
    /// Logs of the previous container instance
    #[serde(default)]
    pub previous: bool,
}

/// `GET /api/v1/pods/{name}/logs`
pub async fn pod_logs(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<String> {
    let client = client_for(&state, deadline, query.cluster_id.as_deref()).await?;
    let request = LogRequest {
        container: query.container.filter(|c| !c.is_empty()),
        tail_lines: query.tail_lines,
        previous: query.previous,
    };
    ok(state
        .proxy
        .logs(&client, deadline, query.namespace.as_deref(), &name, request)
        .await?)
}

/// Request body for a one-shot exec
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecBody {
    /// Command and arguments
    pub command: Vec<String>,
    /// Container; the pod's default container when absent
    #[serde(default)]
    pub container: Option<String>,
}

/// `POST /api/v1/pods/{name}/exec`
pub async fn exec_pod(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(name): Path<String>,
    Query(query): Query<ObjectQuery>,
    Json(body): Json<ExecBody>,
) -> ApiResult<ExecOutput> {
    let client = client_for(&state, deadline, query.cluster_id.as_deref()).await?;
    ok(state
        .proxy
        .exec_command(
            &client,
            deadline,
            query.namespace.as_deref(),
            &name,
            body.container.filter(|c| !c.is_empty()),
            body.command,
        )
        .await?)
}

/// `POST /api/v1/{pods,deployments,services}/yaml`
///
/// The kind in the path is cosmetic; any supported object in the manifest is
/// created.
pub async fn create_from_manifest(
    State(state): State<AppState>,
    deadline: Deadline,
    Query(query): Query<ObjectQuery>,
    Json(body): Json<ManifestBody>,
) -> ApiResult<Vec<CreatedObject>> {
    let client = client_for(&state, deadline, query.cluster_id.as_deref()).await?;
    ok(state
        .proxy
        .create_from_manifest(&client, deadline, query.namespace.as_deref(), &body.yaml)
        .await?)
}

// =============================================================================
// Deployments
// =============================================================================

/// `GET /api/v1/deployments`
pub async fn list_deployments(
    State(state): State<AppState>,
    deadline: Deadline,
    Query(query): Query<ListQuery>,
) -> ApiResult<ResourcePage> {
    list_namespaced(state, deadline, ResourceKind::Deployment, query).await
}

/// `GET /api/v1/deployments/{name}`
pub async fn get_deployment(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(name): Path<String>,
    Query(query): Query<ObjectQuery>,
) -> ApiResult<Value> {
    get_namespaced(state, deadline, ResourceKind::Deployment, name, query).await
}

/// `DELETE /api/v1/deployments/{name}`
pub async fn delete_deployment(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(name): Path<String>,
    Query(query): Query<ObjectQuery>,
) -> ApiResult<()> {
    delete_namespaced(state, deadline, ResourceKind::Deployment, name, query).await
}

/// Request body for a scale
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScaleBody {
    /// Desired replica count
    pub replicas: i32,
}

/// `PUT /api/v1/deployments/{name}/scale`
pub async fn scale_deployment(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(name): Path<String>,
    Query(query): Query<ObjectQuery>,
    Json(body): Json<ScaleBody>,
) -> ApiResult<Value> {
    let client = client_for(&state, deadline, query.cluster_id.as_deref()).await?;
    ok(state
        .proxy
        .scale(
            &client,
            deadline,
            query.namespace.as_deref(),
            &name,
            body.replicas,
        )
        .await?)
}

/// `PUT /api/v1/deployments/{name}/restart`
pub async fn restart_deployment(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(name): Path<String>,
    Query(query): Query<ObjectQuery>,
) -> ApiResult<Value> {
    let client = client_for(&state, deadline, query.cluster_id.as_deref()).await?;
    ok(state
        .proxy
        .restart(&client, deadline, query.namespace.as_deref(), &name)
        .await?)
}

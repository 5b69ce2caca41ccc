//! Cluster-level and configuration resources: dashboard, namespaces, nodes,
//! services, configmaps and secrets

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use super::{client_for, ok, ApiResult, ClusterQuery, ListQuery, ObjectQuery};
use crate::deadline::Deadline;
use crate::resources::summary::SecretInfo;
use crate::resources::{ConfigMapWrite, DashboardStats, ListOptions, ResourcePage, SecretWrite};
use crate::server::AppState;
use crate::upstream::ResourceKind;

/// `GET /api/v1/dashboard/stats`
pub async fn dashboard_stats(
    State(state): State<AppState>,
    deadline: Deadline,
    Query(query): Query<ClusterQuery>,
) -> ApiResult<DashboardStats> {
    let client = client_for(&state, deadline, query.cluster_id.as_deref()).await?;
    ok(state.proxy.dashboard_stats(&client, deadline).await?)
}

// =============================================================================
// Namespaces and nodes
// =============================================================================

/// `GET /api/v1/namespaces`
pub async fn list_namespaces(
    State(state): State<AppState>,
    deadline: Deadline,
    Query(query): Query<ListQuery>,
) -> ApiResult<ResourcePage> {
    list_cluster_scoped(state, deadline, ResourceKind::Namespace, query).await
}

/// Request body for creating a namespace
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateNamespace {
    /// Namespace name
    pub name: String,
}

/// `POST /api/v1/namespaces`
pub async fn create_namespace(
    State(state): State<AppState>,
    deadline: Deadline,
    Query(query): Query<ClusterQuery>,
    Json(body): Json<CreateNamespace>,
) -> ApiResult<Value> {
    let client = client_for(&state, deadline, query.cluster_id.as_deref()).await?;
    ok(state.proxy.create_namespace(&client, deadline, &body.name).await?)
}

/// `DELETE /api/v1/namespaces/{name}`
pub async fn delete_namespace(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(name): Path<String>,
    Query(query): Query<ClusterQuery>,
) -> ApiResult<()> {
    let client = client_for(&state, deadline, query.cluster_id.as_deref()).await?;
    state
        .proxy
        .delete(&client, deadline, ResourceKind::Namespace, None, &name)
        .await?;
    ok(())
}

/// `GET /api/v1/nodes`
pub async fn list_nodes(
    State(state): State<AppState>,
    deadline: Deadline,
    Query(query): Query<ListQuery>,
) -> ApiResult<ResourcePage> {
    list_cluster_scoped(state, deadline, ResourceKind::Node, query).await
}

/// `GET /api/v1/nodes/{name}`
pub async fn get_node(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(name): Path<String>,
    Query(query): Query<ClusterQuery>,
) -> ApiResult<Value> {
    let client = client_for(&state, deadline, query.cluster_id.as_deref()).await?;
    ok(state
        .proxy
        .get(&client, deadline, ResourceKind::Node, None, &name)
        .await?)
}

async fn list_cluster_scoped(
    state: AppState,
    deadline: Deadline,
    kind: ResourceKind,
    query: ListQuery,
) -> ApiResult<ResourcePage> {
    let client = client_for(&state, deadline, query.cluster_id.as_deref()).await?;
    let options = ListOptions {
        limit: query.limit,
        continue_token: query.continue_token,
        ..ListOptions::default()
    };
    ok(state.proxy.list(&client, deadline, kind, options).await?)
}

// =============================================================================
// Services
// =============================================================================

/// `GET /api/v1/services`
pub async fn list_services(
    State(state): State<AppState>,
    deadline: Deadline,
    Query(query): Query<ListQuery>,
) -> ApiResult<ResourcePage> {
    list_namespaced(state, deadline, ResourceKind::Service, query).await
}

/// `GET /api/v1/services/{name}`
pub async fn get_service(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(name): Path<String>,
    Query(query): Query<ObjectQuery>,
) -> ApiResult<Value> {
    get_namespaced(state, deadline, ResourceKind::Service, name, query).await
}

/// `DELETE /api/v1/services/{name}`
pub async fn delete_service(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(name): Path<String>,
    Query(query): Query<ObjectQuery>,
) -> ApiResult<()> {
    delete_namespaced(state, deadline, ResourceKind::Service, name, query).await
}

/// Shared list handler body for namespaced kinds
pub(crate) async fn list_namespaced(
    state: AppState,
    deadline: Deadline,
    kind: ResourceKind,
    query: ListQuery,
) -> ApiResult<ResourcePage> {
    let client = client_for(&state, deadline, query.cluster_id.as_deref()).await?;
    ok(state
        .proxy
        .list(&client, deadline, kind, query.options())
        .await?)
}

/// Shared get handler body for namespaced kinds
pub(crate) async fn get_namespaced(
    state: AppState,
    deadline: Deadline,
    kind: ResourceKind,
    name: String,
    query: ObjectQuery,
) -> ApiResult<Value> {
    let client = client_for(&state, deadline, query.cluster_id.as_deref()).await?;
    ok(state
        .proxy
        .get(&client, deadline, kind, query.namespace.as_deref(), &name)
        .await?)
}

/// Shared delete handler body for namespaced kinds
pub(crate) async fn delete_namespaced(
    state: AppState,
    deadline: Deadline,
    kind: ResourceKind,
    name: String,
    query: ObjectQuery,
) -> ApiResult<()> {
    let client = client_for(&state, deadline, query.cluster_id.as_deref()).await?;
    state
        .proxy
        .delete(&client, deadline, kind, query.namespace.as_deref(), &name)
        .await?;
    ok(())
}

// =============================================================================
// ConfigMaps
// =============================================================================

/// Request body for creating a configmap
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateConfigMap {
    /// Name
    pub name: String,
    /// Namespace; `default` when absent
    #[serde(default)]
    pub namespace: Option<String>,
    /// Data entries
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    /// Labels
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
}

/// Request body for updating a configmap; the namespace comes from the query
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateConfigMap {
    /// Replacement data
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    /// Replacement labels; unchanged when absent
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
}

/// `GET /api/v1/configmaps`
pub async fn list_configmaps(
    State(state): State<AppState>,
    deadline: Deadline,
    Query(query): Query<ListQuery>,
) -> ApiResult<ResourcePage> {
    list_namespaced(state, deadline, ResourceKind::ConfigMap, query).await
}

/// `GET /api/v1/configmaps/{name}`
pub async fn get_configmap(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(name): Path<String>,
    Query(query): Query<ObjectQuery>,
) -> ApiResult<Value> {
    get_namespaced(state, deadline, ResourceKind::ConfigMap, name, query).await
}

/// `POST /api/v1/configmaps`
pub async fn create_configmap(
    State(state): State<AppState>,
    deadline: Deadline,
    Query(query): Query<ClusterQuery>,
    Json(body): Json<CreateConfigMap>,
) -> ApiResult<Value> {
    let client = client_for(&state, deadline, query.cluster_id.as_deref()).await?;
    let write = ConfigMapWrite {
        namespace: body.namespace,
        data: body.data,
        labels: body.labels,
    };
    ok(state
        .proxy
        .create_configmap(&client, deadline, &body.name, write)
        .await?)
}

/// `PUT /api/v1/configmaps/{name}`
pub async fn update_configmap(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(name): Path<String>,
    Query(query): Query<ObjectQuery>,
    Json(body): Json<UpdateConfigMap>,
) -> ApiResult<Value> {
    let client = client_for(&state, deadline, query.cluster_id.as_deref()).await?;
    let write = ConfigMapWrite {
        namespace: query.namespace,
        data: body.data,
        labels: body.labels,
    };
    ok(state
        .proxy
        .update_configmap(&client, deadline, &name, write)
        .await?)
}

/// `DELETE /api/v1/configmaps/{name}`
pub async fn delete_configmap(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(name): Path<String>,
    Query(query): Query<ObjectQuery>,
) -> ApiResult<()> {
    delete_namespaced(state, deadline, ResourceKind::ConfigMap, name, query).await
}

// =============================================================================
// Secrets
// =============================================================================

/// Request body for creating a secret
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateSecret {
    /// Name
    pub name: String,
    /// Namespace; `default` when absent
    #[serde(default)]
    pub namespace: Option<String>,
    /// Secret type; `Opaque` when absent
    #[serde(default, rename = "type")]
    pub type_: Option<String>,
    /// Plain-text values
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    /// Plain-text values merged by the server
    #[serde(default)]
    pub string_data: BTreeMap<String, String>,
    /// Labels
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
}

/// Request body for updating a secret; the namespace comes from the query
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateSecret {
    /// New type; unchanged when absent
    #[serde(default, rename = "type")]
    pub type_: Option<String>,
    /// Replacement values
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    /// Values merged by the server
    #[serde(default)]
    pub string_data: BTreeMap<String, String>,
    /// Replacement labels; unchanged when absent
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
}

/// Query of a secret read
#[derive(Debug, Default, Deserialize)]
pub struct SecretQuery {
    /// Target cluster
    pub cluster_id: Option<String>,
    /// Namespace
    pub namespace: Option<String>,
    /// Return decoded values instead of base64
    #[serde(default)]
    pub decode: bool,
}

/// `GET /api/v1/secrets`
pub async fn list_secrets(
    State(state): State<AppState>,
    deadline: Deadline,
    Query(query): Query<ListQuery>,
) -> ApiResult<ResourcePage> {
    list_namespaced(state, deadline, ResourceKind::Secret, query).await
}

/// `GET /api/v1/secrets/{name}`
pub async fn get_secret(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(name): Path<String>,
    Query(query): Query<SecretQuery>,
) -> ApiResult<SecretInfo> {
    let client = client_for(&state, deadline, query.cluster_id.as_deref()).await?;
    ok(state
        .proxy
        .get_secret(&client, deadline, query.namespace.as_deref(), &name, query.decode)
        .await?)
}

/// `POST /api/v1/secrets`
pub async fn create_secret(
    State(state): State<AppState>,
    deadline: Deadline,
    Query(query): Query<ClusterQuery>,
    Json(body): Json<CreateSecret>,
) -> ApiResult<Value> {
    let client = client_for(&state, deadline, query.cluster_id.as_deref()).await?;
    let write = SecretWrite {
        namespace: body.namespace,
        type_: body.type_,
        data: body.data,
        string_data: body.string_data,
        labels: body.labels,
    };
    ok(state
        .proxy
        .create_secret(&client, deadline, &body.name, write)
        .await?)
}

/// `PUT /api/v1/secrets/{name}`
pub async fn update_secret(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(name): Path<String>,
    Query(query): Query<ObjectQuery>,
    Json(body): Json<UpdateSecret>,
) -> ApiResult<Value> {
    let client = client_for(&state, deadline, query.cluster_id.as_deref()).await?;
    let write = SecretWrite {
        namespace: query.namespace,
        type_: body.type_,
        data: body.data,
        string_data: body.string_data,
        labels: body.labels,
    };
    ok(state
        .proxy
        .update_secret(&client, deadline, &name, write)
        .await?)
}

/// `DELETE /api/v1/secrets/{name}`
pub async fn delete_secret(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(name): Path<String>,
    Query(query): Query<ObjectQuery>,
) -> ApiResult<()> {
    delete_namespaced(state, deadline, ResourceKind::Secret, name, query).await
}

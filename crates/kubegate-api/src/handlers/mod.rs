//! HTTP handlers
//!
//! Successful JSON responses use the envelope `{code: 0, message: "success",
//! data}`; failures go through [`ApiError`]. Query strings are lenient (they
//! also carry `token` and `timeout_seconds`), request bodies are not.

pub mod clusters;
pub mod resources;
pub mod streams;
pub mod workloads;

use std::sync::Arc;

use axum::Json;
use serde::{Deserialize, Serialize};

use crate::deadline::Deadline;
use crate::error::{ApiError, Result};
use crate::pool::ClusterClient;
use crate::resources::ListOptions;
use crate::server::AppState;

/// Success envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    /// Always 0
    pub code: u16,
    /// Always "success"
    pub message: &'static str,
    /// Payload
    pub data: T,
}

/// Handler result
pub type ApiResult<T> = std::result::Result<Json<ApiResponse<T>>, ApiError>;

/// Wrap a payload in the success envelope
pub fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse {
        code: 0,
        message: "success",
        data,
    }))
}

/// `cluster_id` alone
#[derive(Debug, Default, Deserialize)]
pub struct ClusterQuery {
    /// Target cluster; the default cluster when absent
    pub cluster_id: Option<String>,
}

/// Target of a single namespaced object
#[derive(Debug, Default, Deserialize)]
pub struct ObjectQuery {
    /// Target cluster
    pub cluster_id: Option<String>,
    /// Namespace; `default` when absent
    pub namespace: Option<String>,
}

/// Selection and paging of a list
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Target cluster
    pub cluster_id: Option<String>,
    /// Namespace; `default` when absent
    pub namespace: Option<String>,
    /// List across all namespaces
    #[serde(default)]
    pub all_namespaces: bool,
    /// Page size
    pub limit: Option<u32>,
    /// Continue token
    #[serde(rename = "continue")]
    pub continue_token: Option<String>,
}

impl ListQuery {
    fn options(self) -> ListOptions {
        ListOptions {
            namespace: self.namespace,
            all_namespaces: self.all_namespaces,
            limit: self.limit,
            continue_token: self.continue_token,
        }
    }
}

/// Request body for creating objects from a manifest
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestBody {
    /// One or more YAML documents
    pub yaml: String,
}

/// Resolve the request's cluster through the router, within the request's budget
pub async fn client_for(
    state: &AppState,
    deadline: Deadline,
    cluster_id: Option<&str>,
) -> Result<Arc<ClusterClient>> {
    state.router.route(cluster_id, deadline).await
}

//! WebSocket terminals
//!
//! The target is validated and the upstream channel opened before the
//! upgrade is accepted, so a bad pod or an unreachable node comes back as an
//! ordinary JSON error instead of a socket that closes immediately.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;
use tracing::{info, warn};

use super::client_for;
use crate::bridge::frames::CHANNEL_PROTOCOLS;
use crate::bridge::{FrameMode, OpenedBridge, PodTerminal, TerminalSize};
use crate::deadline::Deadline;
use crate::error::ApiError;
use crate::server::AppState;
use crate::sessions::CloseReason;

/// Query of a terminal upgrade
#[derive(Debug, Default, Deserialize)]
pub struct TerminalQuery {
    /// Target cluster
    pub cluster_id: Option<String>,
    /// Namespace
    pub namespace: Option<String>,
    /// Container
    pub container: Option<String>,
    /// Initial columns
    pub cols: Option<u16>,
    /// Initial rows
    pub rows: Option<u16>,
}

impl TerminalQuery {
    fn size(&self) -> TerminalSize {
        let default = TerminalSize::default();
        TerminalSize {
            cols: self.cols.filter(|c| *c > 0).unwrap_or(default.cols),
            rows: self.rows.filter(|r| *r > 0).unwrap_or(default.rows),
        }
    }
}

/// `GET /api/v1/pods/{name}/terminal`
pub async fn pod_terminal(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(name): Path<String>,
    Query(query): Query<TerminalQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let client = client_for(&state, deadline, query.cluster_id.as_deref()).await?;
    let terminal = PodTerminal {
        namespace: query
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| kubegate_common::DEFAULT_NAMESPACE.to_string()),
        pod: crate::router::require_name(&name)?.to_string(),
        container: query.container.clone().filter(|c| !c.is_empty()),
        size: query.size(),
    };
    let opened = state.bridge.open_pod(&client, deadline, terminal).await?;
    Ok(upgrade(state, opened, &headers, ws))
}

/// `GET /api/v1/nodes/{name}/ssh`
pub async fn node_shell(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(name): Path<String>,
    Query(query): Query<TerminalQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let client = client_for(&state, deadline, query.cluster_id.as_deref()).await?;
    let node = crate::router::require_name(&name)?;
    let opened = state
        .bridge
        .open_node(&client, deadline, node, query.size())
        .await?;
    Ok(upgrade(state, opened, &headers, ws))
}

fn upgrade(state: AppState, opened: OpenedBridge, headers: &HeaderMap, ws: WebSocketUpgrade) -> Response {
    let mode = FrameMode::negotiate(headers);
    let ws = match mode {
        FrameMode::Channel => ws.protocols(CHANNEL_PROTOCOLS),
        FrameMode::Plain => ws,
    };

    let session = opened.session().clone();
    info!(session = %session.id(), target = session.target().label(), ?mode, "upgrading terminal");

    let on_failure = {
        let bridge = state.bridge.clone();
        let session = session.clone();
        move |e: axum::Error| {
            warn!(session = %session.id(), error = %e, "websocket upgrade failed");
            tokio::spawn(async move {
                bridge
                    .discard(&session, CloseReason::Error(format!("upgrade failed: {}", e)))
                    .await;
            });
        }
    };

    let bridge = state.bridge.clone();
    ws.on_failed_upgrade(on_failure)
        .on_upgrade(move |socket| async move { bridge.serve(opened, socket, mode).await })
}

//! kubegate API
//!
//! A multi-cluster Kubernetes control-plane gateway. Clients talk to one
//! HTTP/WebSocket surface and select a cluster per request with
//! `cluster_id`; the gateway keeps the credentials, one pooled client per
//! cluster, and the terminal sessions it bridges.
//!
//! # Architecture
//!
//! ```text
//! client ──► auth ──► RequestRouter ──► ClientPool ──► ResourceProxy ──► API server
//!                                   │                └─► StreamBridge ──► exec / ssh
//!                                   └─► CredentialStore ──► SessionRegistry
//! ```
//!
//! # Endpoints
//!
//! - `GET /healthz` - Health check
//! - `/api/v1/clusters[/{id}]` - Cluster registration
//! - `/api/v1/sessions[/{id}]` - Session administration
//! - `/api/v1/{namespaces,nodes,pods,deployments,services,configmaps,secrets}` - Resources
//! - `GET /api/v1/pods/{name}/terminal`, `GET /api/v1/nodes/{name}/ssh` - Terminals

#![deny(missing_docs)]

pub mod auth;
pub mod bridge;
pub mod config;
pub mod credentials;
pub mod deadline;
pub mod error;
pub mod handlers;
pub mod pool;
pub mod resources;
pub mod router;
pub mod server;
pub mod sessions;
pub mod upstream;

#[cfg(test)]
mod testing;

pub use auth::{JwtValidator, UserIdentity};
pub use config::GatewayConfig;
pub use error::{ApiError, Error, Result};
pub use server::{build_router, run, shutdown_signal, AppState};

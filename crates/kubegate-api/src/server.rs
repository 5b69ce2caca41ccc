//! Gateway HTTP server

use std::sync::Arc;
use std::time::Duration;

use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::{require_auth, JwtValidator};
use crate::bridge::{NodeShellConnector, StreamBridge};
use crate::config::GatewayConfig;
use crate::credentials::{CredentialStore, DescriptorRepository};
use crate::error::{Error, Result};
use crate::handlers::{clusters, resources, streams, workloads};
use crate::pool::ClientPool;
use crate::resources::ResourceProxy;
use crate::router::RequestRouter;
use crate::sessions::{CloseReason, SessionRegistry};
use crate::upstream::ClientFactory;

/// How long in-flight HTTP requests get to finish after shutdown starts
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Gateway configuration
    pub config: Arc<GatewayConfig>,
    /// Token validation
    pub auth: Arc<JwtValidator>,
    /// Cluster descriptors
    pub store: Arc<CredentialStore>,
    /// `cluster_id` to client
    pub router: RequestRouter,
    /// Resource operations
    pub proxy: ResourceProxy,
    /// Active bridge sessions
    pub sessions: Arc<SessionRegistry>,
    /// Terminal bridges
    pub bridge: StreamBridge,
}

impl AppState {
    /// Wire the gateway's components together
    ///
    /// The pool and the session registry are registered as store listeners,
    /// so updating or deleting a cluster evicts its client and deleting it
    /// closes its sessions before the store call returns.
    pub fn new(
        config: GatewayConfig,
        repository: Arc<dyn DescriptorRepository>,
        factory: Arc<dyn ClientFactory>,
        ssh: Option<Arc<dyn NodeShellConnector>>,
    ) -> Self {
        let pool = Arc::new(ClientPool::new(
            repository.clone(),
            factory.clone(),
            config.pool,
        ));
        let sessions = Arc::new(SessionRegistry::new(config.sessions));
        let store = CredentialStore::new(repository, factory, config.pool.probe_timeout)
            .with_listener(pool.clone())
            .with_listener(sessions.clone());

        let proxy = ResourceProxy::new(pool.clone());
        let bridge = StreamBridge::new(
            proxy.clone(),
            sessions.clone(),
            ssh,
            config.shell_command.clone(),
        );

        Self {
            auth: Arc::new(JwtValidator::new(&config.jwt_secret)),
            config: Arc::new(config),
            store: Arc::new(store),
            router: RequestRouter::new(pool),
            proxy,
            sessions,
            bridge,
        }
    }
}

/// Build the application router
///
/// `/healthz` is open; everything under `/api/v1` requires a token.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        // Clusters and sessions
        .route(
            "/clusters",
            get(clusters::list_clusters).post(clusters::register_cluster),
        )
        .route("/clusters/test-connection", post(clusters::test_connection))
        .route(
            "/clusters/{id}",
            get(clusters::get_cluster)
                .put(clusters::update_cluster)
                .delete(clusters::delete_cluster),
        )
        .route("/sessions", get(clusters::list_sessions))
        .route("/sessions/{id}", axum::routing::delete(clusters::close_session))
        .route("/dashboard/stats", get(resources::dashboard_stats))
        // Cluster-scoped kinds
        .route(
            "/namespaces",
            get(resources::list_namespaces).post(resources::create_namespace),
        )
        .route(
            "/namespaces/{name}",
            axum::routing::delete(resources::delete_namespace),
        )
        .route("/nodes", get(resources::list_nodes))
        .route("/nodes/{name}", get(resources::get_node))
        .route("/nodes/{name}/ssh", get(streams::node_shell))
        // Pods
        .route("/pods", get(workloads::list_pods))
        .route("/pods/yaml", post(workloads::create_from_manifest))
        .route(
            "/pods/{name}",
            get(workloads::get_pod).delete(workloads::delete_pod),
        )
        .route("/pods/{name}/logs", get(workloads::pod_logs))
        .route("/pods/{name}/exec", post(workloads::exec_pod))
        .route("/pods/{name}/terminal", get(streams::pod_terminal))
        // Deployments
        .route("/deployments", get(workloads::list_deployments))
        .route("/deployments/yaml", post(workloads::create_from_manifest))
        .route(
            "/deployments/{name}",
            get(workloads::get_deployment).delete(workloads::delete_deployment),
        )
        .route("/deployments/{name}/scale", put(workloads::scale_deployment))
        .route(
            "/deployments/{name}/restart",
            put(workloads::restart_deployment),
        )
        // Services
        .route("/services", get(resources::list_services))
        .route("/services/yaml", post(workloads::create_from_manifest))
        .route(
            "/services/{name}",
            get(resources::get_service).delete(resources::delete_service),
        )
        // ConfigMaps and Secrets
        .route(
            "/configmaps",
            get(resources::list_configmaps).post(resources::create_configmap),
        )
        .route(
            "/configmaps/{name}",
            get(resources::get_configmap)
                .put(resources::update_configmap)
                .delete(resources::delete_configmap),
        )
        .route(
            "/secrets",
            get(resources::list_secrets).post(resources::create_secret),
        )
        .route(
            "/secrets/{name}",
            get(resources::get_secret)
                .put(resources::update_secret)
                .delete(resources::delete_secret),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .nest("/api/v1", api)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
        .with_state(state)
}

/// Serve until `shutdown` fires, then close every session and stop the
/// background tasks
pub async fn run(state: AppState, shutdown: CancellationToken) -> Result<()> {
    let config = state.config.clone();
    let reaper = state
        .router
        .pool()
        .clone()
        .spawn_reaper(config.reap_interval, shutdown.clone());
    let sweeper = state
        .sessions
        .clone()
        .spawn_sweeper(config.sweep_interval, shutdown.clone());

    let sessions = state.sessions.clone();
    let app = build_router(state);

    let served = match &config.tls {
        Some(tls) => {
            let rustls = RustlsConfig::from_pem_file(&tls.cert, &tls.key)
                .await
                .map_err(|e| Error::validation_for_field("tls", format!("TLS config error: {}", e)))?;

            let handle = axum_server::Handle::new();
            let on_shutdown = handle.clone();
            let token = shutdown.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                on_shutdown.graceful_shutdown(Some(SHUTDOWN_GRACE));
            });

            info!(addr = %config.listen, "starting gateway (https)");
            axum_server::bind_rustls(config.listen, rustls)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }
        None => {
            let listener = tokio::net::TcpListener::bind(config.listen)
                .await
                .map_err(|e| Error::internal_with_context("bind", e.to_string()))?;
            info!(addr = %config.listen, "starting gateway (http)");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.clone().cancelled_owned())
                .await
        }
    };

    // The server can also stop on its own (listener failure)
    shutdown.cancel();
    let closed = sessions.drain(CloseReason::AdminClosed).await;
    if closed > 0 {
        info!(closed, "closed sessions at shutdown");
    }
    let _ = reaper.await;
    let _ = sweeper.await;

    served.map_err(|e| Error::internal_with_context("serve", e.to_string()))
}

/// Resolve on ctrl-c or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}

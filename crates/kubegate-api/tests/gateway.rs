//! Router-level tests: the full axum app against an in-memory cluster

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use jsonwebtoken::{encode, EncodingKey, Header};
use parking_lot::Mutex;
use secrecy::SecretString;
use serde_json::{json, Value};
use tower::ServiceExt;

use kubegate_api::auth::Claims;
use kubegate_api::credentials::{ClusterKey, MemoryRepository};
use kubegate_api::error::Error;
use kubegate_api::sessions::{CloseReason, SessionState, SessionTarget};
use kubegate_api::upstream::{
    ClientFactory, ClusterApi, ConnectTarget, ExecRequest, LogRequest, ObjectPage, PageRequest,
    ResourceKind, ResourceScope, ShellStream, UpstreamFailure,
};
use kubegate_api::{build_router, AppState, GatewayConfig};

const SECRET: &str = "integration-secret";

// =============================================================================
// In-memory cluster
// =============================================================================

/// One deployment and nothing else; counts writes and can inject conflicts
struct FakeCluster {
    reachable: bool,
    deployment: Mutex<Value>,
    conflicts: AtomicUsize,
    replaces: AtomicUsize,
    creates: AtomicUsize,
}

impl FakeCluster {
    fn new(reachable: bool) -> Self {
        Self {
            reachable,
            deployment: Mutex::new(json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "web", "namespace": "default", "resourceVersion": "10"},
                "spec": {"replicas": 2}
            })),
            conflicts: AtomicUsize::new(0),
            replaces: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
        }
    }

    fn not_found(name: &str) -> UpstreamFailure {
        UpstreamFailure::Status {
            code: 404,
            reason: "NotFound".into(),
            message: format!("{:?} not found", name),
        }
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn server_version(&self) -> Result<String, UpstreamFailure> {
        if self.reachable {
            Ok("v1.30.2".into())
        } else {
            Err(UpstreamFailure::Transport("connection refused".into()))
        }
    }

    async fn list(&self, scope: &ResourceScope, _page: &PageRequest) -> Result<ObjectPage, UpstreamFailure> {
        let items = match scope.kind {
            ResourceKind::Deployment => vec![self.deployment.lock().clone()],
            _ => Vec::new(),
        };
        Ok(ObjectPage {
            items,
            ..ObjectPage::default()
        })
    }

    async fn get(&self, scope: &ResourceScope, name: &str) -> Result<Value, UpstreamFailure> {
        match (scope.kind, name) {
            (ResourceKind::Deployment, "web") => Ok(self.deployment.lock().clone()),
            _ => Err(Self::not_found(name)),
        }
    }

    async fn create(&self, _scope: &ResourceScope, object: Value) -> Result<Value, UpstreamFailure> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(object)
    }

    async fn replace(&self, _scope: &ResourceScope, _name: &str, object: Value) -> Result<Value, UpstreamFailure> {
        self.replaces.fetch_add(1, Ordering::SeqCst);
        if self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(UpstreamFailure::Status {
                code: 409,
                reason: "Conflict".into(),
                message: "the object has been modified".into(),
            });
        }
        *self.deployment.lock() = object.clone();
        Ok(object)
    }

    async fn delete(&self, _scope: &ResourceScope, name: &str) -> Result<(), UpstreamFailure> {
        Err(Self::not_found(name))
    }

    async fn create_manifest_object(&self, object: Value, _default_namespace: &str) -> Result<Value, UpstreamFailure> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(object)
    }

    async fn logs(&self, _namespace: &str, _pod: &str, _request: &LogRequest) -> Result<String, UpstreamFailure> {
        Ok(String::new())
    }

    async fn exec(&self, _namespace: &str, pod: &str, _request: &ExecRequest) -> Result<ShellStream, UpstreamFailure> {
        Err(Self::not_found(pod))
    }
}

/// The default cluster is healthy; registered clusters are reachable unless
/// their URL says otherwise
struct FakeFactory {
    default: Arc<FakeCluster>,
}

#[async_trait]
impl ClientFactory for FakeFactory {
    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn ClusterApi>, Error> {
        match target {
            ConnectTarget::Default => Ok(self.default.clone()),
            ConnectTarget::Cluster { server_url, .. } => Ok(Arc::new(FakeCluster::new(
                !server_url.contains("unreachable"),
            ))),
        }
    }
}

// =============================================================================
// Harness
// =============================================================================

fn app() -> (Router, Arc<FakeCluster>) {
    let (app, _, cluster) = app_with_state();
    (app, cluster)
}

fn app_with_state() -> (Router, AppState, Arc<FakeCluster>) {
    let cluster = Arc::new(FakeCluster::new(true));
    let state = AppState::new(
        GatewayConfig::new(SecretString::from(SECRET.to_string())),
        Arc::new(MemoryRepository::new()),
        Arc::new(FakeFactory {
            default: cluster.clone(),
        }),
        None,
    );
    (build_router(state.clone()), state, cluster)
}

async fn register(app: &Router, name: &str) -> i64 {
    let (status, body) = send(
        app,
        request(
            Method::POST,
            "/api/v1/clusters",
            Some(json!({
                "name": name,
                "server_url": "https://10.0.0.1:6443",
                "credential": {"type": "token", "token": "abc"}
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body["data"]["id"].as_i64().unwrap()
}

fn token() -> String {
    let claims = Claims {
        user_id: 1,
        username: "admin".into(),
        role: "admin".into(),
        exp: (chrono::Utc::now().timestamp() + 3600) as u64,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token()));
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

// =============================================================================
// Authentication and routing
// =============================================================================

#[tokio::test]
async fn healthz_needs_no_token() {
    let (app, _) = app();
    let response = app
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn api_rejects_missing_token_before_cluster_access() {
    let (app, cluster) = app();
    let (status, body) = send(
        &app,
        Request::get("/api/v1/deployments").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["kind"], "authentication_error");
    assert_eq!(cluster.replaces.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_and_malformed_cluster_ids() {
    let (app, _) = app();

    let (status, body) = send(&app, request(Method::GET, "/api/v1/pods?cluster_id=42", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "cluster_not_found");

    let (status, body) = send(&app, request(Method::GET, "/api/v1/pods?cluster_id=abc", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation_error");
}

#[tokio::test]
async fn list_uses_the_success_envelope() {
    let (app, _) = app();
    let (status, body) = send(&app, request(Method::GET, "/api/v1/deployments", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 0);
    assert_eq!(body["message"], "success");
    assert_eq!(body["data"]["items"][0]["name"], "web");
    assert!(body["data"].get("continue").is_none());
}

// =============================================================================
// Cluster lifecycle
// =============================================================================

#[tokio::test]
async fn register_list_and_delete_a_cluster() {
    let (app, _) = app();

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/api/v1/clusters",
            Some(json!({
                "name": "prod",
                "server_url": "https://10.0.0.1:6443",
                "credential": {"type": "token", "token": "abc"}
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let id = body["data"]["id"].as_i64().unwrap();
    assert_eq!(body["data"]["credential_type"], "token");
    assert!(body["data"].get("credential").is_none());

    let (_, body) = send(&app, request(Method::GET, "/api/v1/clusters", None)).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let uri = format!("/api/v1/clusters/{}", id);
    let (status, _) = send(&app, request(Method::DELETE, &uri, None)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, request(Method::GET, &uri, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "cluster_not_found");
}

#[tokio::test]
async fn deleting_a_cluster_closes_its_sessions_before_answering() {
    let (app, state, _) = app_with_state();
    let id = register(&app, "prod").await;

    let uri = format!("/api/v1/deployments?cluster_id={}", id);
    let (status, _) = send(&app, request(Method::GET, &uri, None)).await;
    assert_eq!(status, StatusCode::OK);

    let doomed = state.sessions.create(
        ClusterKey::Registered(id),
        SessionTarget::NodeSsh {
            node: "node-1".into(),
        },
        None,
    );
    let survivor = state.sessions.create(
        ClusterKey::Default,
        SessionTarget::NodeSsh {
            node: "node-2".into(),
        },
        None,
    );
    doomed.advance(SessionState::Active);
    let bridge = {
        let session = doomed.clone();
        tokio::spawn(async move {
            session.cancellation().cancelled().await;
            session.advance(SessionState::Closed);
        })
    };

    let (status, _) = send(
        &app,
        request(Method::DELETE, &format!("/api/v1/clusters/{}", id), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doomed.state(), SessionState::Closed);
    assert_eq!(doomed.close_reason(), Some(CloseReason::ClusterRemoved));
    assert_eq!(survivor.state(), SessionState::Connecting);

    let sessions_uri = format!("/api/v1/sessions?cluster_id={}", id);
    let (_, body) = send(&app, request(Method::GET, &sessions_uri, None)).await;
    assert_eq!(body["data"], json!([]));
    let (_, body) = send(&app, request(Method::GET, "/api/v1/sessions?cluster_id=", None)).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, body) = send(&app, request(Method::GET, &uri, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "cluster_not_found");
    bridge.await.unwrap();
}

#[tokio::test]
async fn test_connection_reports_unreachable_servers() {
    let (app, _) = app();
    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/api/v1/clusters/test-connection",
            Some(json!({
                "server_url": "https://unreachable.example:6443",
                "credential": {"type": "token", "token": "abc"}
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["reachable"], false);
}

#[tokio::test]
async fn unknown_body_fields_are_rejected() {
    let (app, _) = app();
    let (status, _) = send(
        &app,
        request(
            Method::POST,
            "/api/v1/clusters",
            Some(json!({
                "name": "prod",
                "server_url": "https://10.0.0.1:6443",
                "credential": {"type": "token", "token": "abc"},
                "owner": "me"
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

// =============================================================================
// Resource operations
// =============================================================================

#[tokio::test]
async fn scale_retries_one_conflict() {
    let (app, cluster) = app();
    cluster.conflicts.store(1, Ordering::SeqCst);

    let (status, body) = send(
        &app,
        request(
            Method::PUT,
            "/api/v1/deployments/web/scale",
            Some(json!({"replicas": 5})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["replicas"], 5);
    assert_eq!(cluster.replaces.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn second_conflict_names_the_write_step() {
    let (app, cluster) = app();
    cluster.conflicts.store(2, Ordering::SeqCst);

    let (status, body) = send(
        &app,
        request(Method::PUT, "/api/v1/deployments/web/restart", None),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "conflict");
    assert_eq!(body["step"], "write");
    assert_eq!(cluster.deployment.lock()["spec"]["replicas"], 2);
}

#[tokio::test]
async fn invalid_manifest_makes_no_upstream_call() {
    let (app, cluster) = app();
    let yaml = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\nkind: [unclosed\n";
    let (status, body) = send(
        &app,
        request(Method::POST, "/api/v1/deployments/yaml", Some(json!({"yaml": yaml}))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "manifest_parse_error");
    assert_eq!(cluster.creates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn sessions_list_starts_empty() {
    let (app, _) = app();
    let (status, body) = send(&app, request(Method::GET, "/api/v1/sessions", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));

    let (status, body) = send(
        &app,
        request(Method::DELETE, "/api/v1/sessions/not-a-uuid", None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation_error");
}

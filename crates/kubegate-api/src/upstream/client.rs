//! kube-rs backed [`ClusterApi`]

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, SinkExt};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{
    Api, AttachParams, AttachedProcess, DeleteParams, DynamicObject, ListParams, LogParams,
    PostParams, TerminalSize,
};
use kube::core::{GroupVersion, TypeMeta};
use kube::discovery::{self, ApiResource, Scope};
use kube::Client;
use secrecy::ExposeSecret;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use kubegate_common::kube_utils::{
    client_from_kubeconfig, client_from_token, default_client, ClientTimeouts,
};

use super::{
    ClientFactory, ClusterApi, ConnectTarget, ExecRequest, ExitStatus, LogRequest, ObjectPage,
    OutputStream, PageRequest, ResourceScope, ShellInput, ShellOutput, ShellStream,
    UpstreamFailure,
};
use crate::credentials::Credential;
use crate::error::Error;

/// Read size for exec output
const READ_BUFFER_SIZE: usize = 4096;
/// Output chunks buffered between the upstream readers and the bridge
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

impl From<kube::Error> for UpstreamFailure {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(status) => UpstreamFailure::Status {
                code: status.code,
                reason: status.reason,
                message: status.message,
            },
            kube::Error::UpgradeConnection(e) => UpstreamFailure::Status {
                code: 502,
                reason: "UpgradeFailed".to_string(),
                message: e.to_string(),
            },
            kube::Error::Discovery(e) => UpstreamFailure::UnknownKind(e.to_string()),
            kube::Error::SerdeError(e) => UpstreamFailure::Decode(e.to_string()),
            kube::Error::FromUtf8(e) => UpstreamFailure::Decode(e.to_string()),
            kube::Error::BuildRequest(e) => UpstreamFailure::Decode(e.to_string()),
            other => UpstreamFailure::Transport(other.to_string()),
        }
    }
}

/// [`ClusterApi`] over a kube-rs client, using dynamic objects
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic_api(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }

    fn scoped_api(&self, scope: &ResourceScope) -> (Api<DynamicObject>, ApiResource) {
        let ar = scope.kind.api_resource();
        (self.dynamic_api(&ar, scope.namespace.as_deref()), ar)
    }
}

/// Serialize a dynamic object, restoring the type meta that lists omit
fn to_value(mut obj: DynamicObject, ar: &ApiResource) -> Result<Value, UpstreamFailure> {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
        });
    }
    serde_json::to_value(&obj).map_err(|e| UpstreamFailure::Decode(e.to_string()))
}

fn from_value(object: Value) -> Result<DynamicObject, UpstreamFailure> {
    serde_json::from_value(object).map_err(|e| UpstreamFailure::Decode(e.to_string()))
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn server_version(&self) -> Result<String, UpstreamFailure> {
        let info = self.client.apiserver_version().await?;
        Ok(info.git_version)
    }

    async fn list(
        &self,
        scope: &ResourceScope,
        page: &PageRequest,
    ) -> Result<ObjectPage, UpstreamFailure> {
        let (api, ar) = self.scoped_api(scope);
        let mut params = ListParams::default();
        if page.limit > 0 {
            params = params.limit(page.limit);
        }
        if let Some(token) = &page.continue_token {
            params = params.continue_token(token);
        }

        let list = api.list(&params).await?;
        let items = list
            .items
            .into_iter()
            .map(|obj| to_value(obj, &ar))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ObjectPage {
            items,
            continue_token: list.metadata.continue_.filter(|t| !t.is_empty()),
            remaining: list.metadata.remaining_item_count,
        })
    }

    async fn get(&self, scope: &ResourceScope, name: &str) -> Result<Value, UpstreamFailure> {
        let (api, ar) = self.scoped_api(scope);
        to_value(api.get(name).await?, &ar)
    }

    async fn create(&self, scope: &ResourceScope, object: Value) -> Result<Value, UpstreamFailure> {
        let (api, ar) = self.scoped_api(scope);
        let created = api.create(&PostParams::default(), &from_value(object)?).await?;
        to_value(created, &ar)
    }

    async fn replace(
        &self,
        scope: &ResourceScope,
        name: &str,
        object: Value,
    ) -> Result<Value, UpstreamFailure> {
        let (api, ar) = self.scoped_api(scope);
        let replaced = api
            .replace(name, &PostParams::default(), &from_value(object)?)
            .await?;
        to_value(replaced, &ar)
    }

    async fn delete(&self, scope: &ResourceScope, name: &str) -> Result<(), UpstreamFailure> {
        let (api, _) = self.scoped_api(scope);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn create_manifest_object(
        &self,
        object: Value,
        default_namespace: &str,
    ) -> Result<Value, UpstreamFailure> {
        let api_version = object["apiVersion"].as_str().unwrap_or_default();
        let kind = object["kind"].as_str().unwrap_or_default();
        let gv: GroupVersion = api_version
            .parse()
            .map_err(|e| UpstreamFailure::UnknownKind(format!("{}: {}", api_version, e)))?;
        let (ar, caps) = discovery::pinned_kind(&self.client, &gv.with_kind(kind)).await?;

        let mut obj = from_value(object)?;
        let api = if caps.scope == Scope::Namespaced {
            let namespace = obj
                .metadata
                .namespace
                .get_or_insert_with(|| default_namespace.to_string())
                .clone();
            self.dynamic_api(&ar, Some(&namespace))
        } else {
            obj.metadata.namespace = None;
            self.dynamic_api(&ar, None)
        };

        let created = api.create(&PostParams::default(), &obj).await?;
        to_value(created, &ar)
    }

    async fn logs(
        &self,
        namespace: &str,
        pod: &str,
        request: &LogRequest,
    ) -> Result<String, UpstreamFailure> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            container: request.container.clone(),
            tail_lines: request.tail_lines,
            previous: request.previous,
            ..Default::default()
        };
        Ok(pods.logs(pod, &params).await?)
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        request: &ExecRequest,
    ) -> Result<ShellStream, UpstreamFailure> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut params = AttachParams::default()
            .stdin(request.stdin)
            .stdout(true)
            // kube rejects stderr alongside a tty; the tty merges it into stdout
            .stderr(!request.tty)
            .tty(request.tty);
        if let Some(container) = &request.container {
            params = params.container(container.clone());
        }

        let attached = pods.exec(pod, request.command.clone(), &params).await?;
        debug!(namespace, pod, tty = request.tty, "exec stream attached");
        Ok(shell_stream(attached))
    }
}

/// Split an attached process into the bridge-facing [`ShellStream`]
fn shell_stream(mut attached: AttachedProcess) -> ShellStream {
    let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

    if let Some(stdout) = attached.stdout() {
        tokio::spawn(forward_reader(stdout, output_tx.clone(), OutputStream::Stdout));
    }
    if let Some(stderr) = attached.stderr() {
        tokio::spawn(forward_reader(stderr, output_tx.clone(), OutputStream::Stderr));
    }
    // The channel closes once both readers finish
    drop(output_tx);

    let input = KubeShellInput {
        stdin: attached
            .stdin()
            .map(|w| Box::new(w) as Box<dyn AsyncWrite + Unpin + Send>),
        terminal_size: attached.terminal_size(),
    };

    let status = attached.take_status();
    let exit = async move {
        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        // Keep the process handle alive until its status has resolved
        drop(attached);
        status.map(exit_from_status).unwrap_or_else(ExitStatus::clean)
    }
    .boxed();

    ShellStream {
        input: Box::new(input),
        output: output_rx,
        exit,
    }
}

struct KubeShellInput {
    stdin: Option<Box<dyn AsyncWrite + Unpin + Send>>,
    terminal_size: Option<futures::channel::mpsc::Sender<TerminalSize>>,
}

#[async_trait]
impl ShellInput for KubeShellInput {
    async fn write(&mut self, data: Vec<u8>) -> Result<(), String> {
        let Some(writer) = self.stdin.as_mut() else {
            return Err("stdin not available".to_string());
        };
        writer.write_all(&data).await.map_err(|e| e.to_string())?;
        writer.flush().await.map_err(|e| e.to_string())
    }

    async fn resize(&mut self, width: u16, height: u16) {
        if let Some(tx) = self.terminal_size.as_mut() {
            let _ = tx.send(TerminalSize { width, height }).await;
        }
    }

    async fn close(&mut self) {
        if let Some(mut writer) = self.stdin.take() {
            let _ = writer.shutdown().await;
        }
        self.terminal_size.take();
    }
}

async fn forward_reader<R: AsyncRead + Unpin>(
    mut reader: R,
    tx: mpsc::Sender<ShellOutput>,
    stream: OutputStream,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = ShellOutput {
                    stream,
                    data: buf[..n].to_vec(),
                };
                // A full channel parks this read until the bridge catches up
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, ?stream, "exec reader error");
                break;
            }
        }
    }
}

/// Interpret the exec Status, whose `ExitCode` cause carries a non-zero code
fn exit_from_status(status: Status) -> ExitStatus {
    if status.status.as_deref() == Some("Success") {
        return ExitStatus::clean();
    }
    let code = status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
                .and_then(|c| c.message.as_deref())
                .and_then(|m| m.parse::<i32>().ok())
        });
    ExitStatus {
        success: false,
        code,
        message: status.message,
    }
}

/// Builds kube-rs clients from descriptors or the gateway's own kubeconfig
pub struct KubeClientFactory {
    default_kubeconfig: Option<PathBuf>,
    timeouts: ClientTimeouts,
}

impl KubeClientFactory {
    /// Create a factory
    pub fn new(default_kubeconfig: Option<PathBuf>, timeouts: ClientTimeouts) -> Self {
        Self {
            default_kubeconfig,
            timeouts,
        }
    }
}

#[async_trait]
impl ClientFactory for KubeClientFactory {
    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn ClusterApi>, Error> {
        let client = match target {
            ConnectTarget::Default => {
                default_client(self.default_kubeconfig.as_deref(), self.timeouts).await?
            }
            ConnectTarget::Cluster {
                server_url,
                credential: Credential::Token {
                    token,
                    skip_tls_verify,
                },
            } => client_from_token(server_url, token.clone(), *skip_tls_verify, self.timeouts)?,
            ConnectTarget::Cluster {
                server_url,
                credential: Credential::Kubeconfig { content },
            } => {
                client_from_kubeconfig(
                    content.expose_secret(),
                    Some(server_url.as_str()).filter(|u| !u.is_empty()),
                    self.timeouts,
                )
                .await?
            }
        };
        Ok(Arc::new(KubeClusterApi::new(client)))
    }
}

//! Stream bridge: WebSocket terminals for pods and nodes
//!
//! Opening a bridge happens in two halves. [`StreamBridge::open_pod`] and
//! [`StreamBridge::open_node`] run before the WebSocket upgrade: they check
//! the target, register the session and open the upstream channel, so any
//! failure is still an ordinary HTTP error. [`StreamBridge::serve`] runs
//! after the upgrade and relays until the session ends.

pub mod frames;
pub mod relay;
pub mod ssh;

use std::sync::Arc;

use axum::extract::ws::WebSocket;
use futures::StreamExt;
use tracing::{info, warn};

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::pool::ClusterClient;
use crate::resources::ResourceProxy;
use crate::sessions::{CloseReason, Session, SessionRegistry, SessionState, SessionTarget};
use crate::upstream::{ExecRequest, ShellStream};

pub use self::frames::FrameMode;
pub use self::ssh::{NodeShellConnector, RusshConnector, TerminalSize};

/// Pod terminal parameters
#[derive(Debug, Clone)]
pub struct PodTerminal {
    /// Namespace
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Container; the pod's first container when None
    pub container: Option<String>,
    /// Initial terminal size
    pub size: TerminalSize,
}

/// A registered session with its upstream channel open, waiting for the upgrade
pub struct OpenedBridge {
    session: Arc<Session>,
    shell: ShellStream,
    size: TerminalSize,
}

impl OpenedBridge {
    /// The registered session
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

/// Opens and runs bridge sessions
#[derive(Clone)]
pub struct StreamBridge {
    proxy: ResourceProxy,
    sessions: Arc<SessionRegistry>,
    ssh: Option<Arc<dyn NodeShellConnector>>,
    shell_command: Vec<String>,
}

impl StreamBridge {
    /// Bridge using `proxy` for pod targets and `ssh` for node shells
    pub fn new(
        proxy: ResourceProxy,
        sessions: Arc<SessionRegistry>,
        ssh: Option<Arc<dyn NodeShellConnector>>,
        shell_command: Vec<String>,
    ) -> Self {
        Self {
            proxy,
            sessions,
            ssh,
            shell_command,
        }
    }

    /// Validate a pod target, register a session and start the shell
    pub async fn open_pod(
        &self,
        client: &Arc<ClusterClient>,
        deadline: Deadline,
        terminal: PodTerminal,
    ) -> Result<OpenedBridge> {
        let container = self
            .proxy
            .validate_pod_target(
                client,
                deadline,
                &terminal.namespace,
                &terminal.pod,
                terminal.container.as_deref(),
            )
            .await?;

        let session = self.sessions.create(
            client.key(),
            SessionTarget::PodExec {
                namespace: terminal.namespace.clone(),
                pod: terminal.pod.clone(),
                container: container.clone(),
            },
            deadline.explicit(),
        );

        let request = ExecRequest {
            container: Some(container),
            command: self.shell_command.clone(),
            tty: true,
            stdin: true,
        };
        let opened = self
            .proxy
            .open_shell(client, deadline, &terminal.namespace, &terminal.pod, request)
            .await;
        self.finish_open(session, opened, terminal.size).await
    }

    /// Resolve a node's address, register a session and log in over SSH
    pub async fn open_node(
        &self,
        client: &Arc<ClusterClient>,
        deadline: Deadline,
        node: &str,
        size: TerminalSize,
    ) -> Result<OpenedBridge> {
        let Some(ssh) = &self.ssh else {
            return Err(Error::validation("node shells are not configured on this gateway"));
        };
        let address = self.proxy.node_address(client, deadline, node).await?;

        let session = self.sessions.create(
            client.key(),
            SessionTarget::NodeSsh {
                node: node.to_string(),
            },
            deadline.explicit(),
        );
        let opened = ssh.open(&address, size).await;
        self.finish_open(session, opened, size).await
    }

    async fn finish_open(
        &self,
        session: Arc<Session>,
        opened: Result<ShellStream>,
        size: TerminalSize,
    ) -> Result<OpenedBridge> {
        match opened {
            Ok(shell) => Ok(OpenedBridge {
                session,
                shell,
                size,
            }),
            Err(e) => {
                warn!(session = %session.id(), error = %e, "upstream channel failed to open");
                self.discard(&session, CloseReason::Error(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Drop a session that never reached the relay
    pub async fn discard(&self, session: &Session, reason: CloseReason) {
        session.request_close(reason.clone());
        session.advance(SessionState::Closed);
        self.sessions.close(session.id(), reason).await;
    }

    /// Relay an upgraded socket until the session ends, then deregister it
    pub async fn serve(&self, opened: OpenedBridge, socket: WebSocket, mode: FrameMode) {
        let OpenedBridge {
            session,
            mut shell,
            size,
        } = opened;
        shell.input.resize(size.cols, size.rows).await;

        let (outgoing, incoming) = socket.split();
        let grace = self.sessions.config().close_grace;
        let reason = relay::relay(session.clone(), shell, mode, grace, incoming, outgoing).await;

        info!(session = %session.id(), reason = %reason, "bridge finished");
        self.sessions.close(session.id(), reason).await;
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::credentials::ClusterKey;
    use crate::sessions::SessionConfig;
    use crate::testing::pool_with;
    use crate::upstream::{ExitStatus, MockClusterApi, ShellInput, UpstreamFailure};
    use ssh::MockNodeShellConnector;

    struct NullInput;

    #[async_trait::async_trait]
    impl ShellInput for NullInput {
        async fn write(&mut self, _data: Vec<u8>) -> std::result::Result<(), String> {
            Ok(())
        }
        async fn resize(&mut self, _width: u16, _height: u16) {}
        async fn close(&mut self) {}
    }

    fn idle_shell() -> ShellStream {
        let (_tx, rx) = mpsc::channel(1);
        ShellStream {
            input: Box::new(NullInput),
            output: rx,
            exit: async { ExitStatus::clean() }.boxed(),
        }
    }

    fn running_pod() -> serde_json::Value {
        json!({
            "metadata": {"name": "web-0", "namespace": "default"},
            "spec": {"containers": [{"name": "app"}]},
            "status": {"phase": "Running"}
        })
    }

    async fn bridge_for(
        api: MockClusterApi,
        ssh: Option<Arc<dyn NodeShellConnector>>,
    ) -> (StreamBridge, Arc<SessionRegistry>, Arc<ClusterClient>) {
        let pool = pool_with(api);
        let client = pool.acquire(ClusterKey::Default).await.unwrap();
        let sessions = Arc::new(SessionRegistry::new(SessionConfig::default()));
        let bridge = StreamBridge::new(
            ResourceProxy::new(pool),
            sessions.clone(),
            ssh,
            vec!["/bin/sh".into()],
        );
        (bridge, sessions, client)
    }

    fn terminal() -> PodTerminal {
        PodTerminal {
            namespace: "default".into(),
            pod: "web-0".into(),
            container: None,
            size: TerminalSize::default(),
        }
    }

    #[tokio::test]
    async fn pod_open_registers_a_connecting_session() {
        let mut api = MockClusterApi::new();
        api.expect_get().returning(|_, _| Ok(running_pod()));
        api.expect_exec()
            .withf(|_, _, req| req.tty && req.stdin && req.container.as_deref() == Some("app"))
            .returning(|_, _, _| Ok(idle_shell()));
        let (bridge, sessions, client) = bridge_for(api, None).await;

        let opened = bridge
            .open_pod(&client, Deadline::default_of(std::time::Duration::from_secs(30)), terminal())
            .await
            .unwrap();
        assert_eq!(opened.session().state(), SessionState::Connecting);
        assert!(opened.session().deadline().is_none());
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn failed_exec_leaves_no_session_behind() {
        let mut api = MockClusterApi::new();
        api.expect_get().returning(|_, _| Ok(running_pod()));
        api.expect_exec().returning(|_, _, _| {
            Err(UpstreamFailure::Status {
                code: 403,
                reason: "Forbidden".into(),
                message: "pods/exec is forbidden".into(),
            })
        });
        let (bridge, sessions, client) = bridge_for(api, None).await;

        let err = bridge
            .open_pod(&client, Deadline::default_of(std::time::Duration::from_secs(30)), terminal())
            .await
            .err()
            .unwrap();
        assert_eq!(err.status_code(), 403);
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn node_shell_requires_ssh_configuration() {
        let mut api = MockClusterApi::new();
        api.expect_get().never();
        let (bridge, sessions, client) = bridge_for(api, None).await;

        let err = bridge
            .open_node(
                &client,
                Deadline::default_of(std::time::Duration::from_secs(30)),
                "worker-1",
                TerminalSize::default(),
            )
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "validation_error");
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn node_shell_dials_the_internal_ip() {
        let mut api = MockClusterApi::new();
        api.expect_get().returning(|_, _| {
            Ok(json!({
                "metadata": {"name": "worker-1"},
                "status": {"addresses": [{"type": "InternalIP", "address": "192.168.1.11"}]}
            }))
        });
        let mut ssh = MockNodeShellConnector::new();
        ssh.expect_open()
            .withf(|address, size| address == "192.168.1.11" && size.cols == 132)
            .times(1)
            .returning(|_, _| Ok(idle_shell()));
        let (bridge, sessions, client) = bridge_for(api, Some(Arc::new(ssh))).await;

        let opened = bridge
            .open_node(
                &client,
                Deadline::default_of(std::time::Duration::from_secs(30)),
                "worker-1",
                TerminalSize { cols: 132, rows: 43 },
            )
            .await
            .unwrap();
        assert_eq!(
            opened.session().target(),
            &SessionTarget::NodeSsh {
                node: "worker-1".into()
            }
        );
        assert_eq!(sessions.len(), 1);
    }
}

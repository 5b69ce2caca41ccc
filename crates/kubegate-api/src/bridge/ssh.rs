//! Node shells over SSH
//!
//! The gateway logs in to a node's InternalIP with its own key and asks for a
//! pty and a shell. One task owns the russh channel and multiplexes stdin,
//! resizes and EOF from the bridge with the channel's output messages.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use russh::client::{self, Config, Handle};
use russh::keys::{HashAlg, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelMsg, Disconnect};
use secrecy::ExposeSecret;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::SshSettings;
use crate::error::{Error, Result};
use crate::upstream::{ExitStatus, OutputStream, ShellInput, ShellOutput, ShellStream};

/// Output chunks buffered between the channel task and the bridge
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Terminal type requested for node shells
const TERM: &str = "xterm";

/// Initial terminal size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    /// Columns
    pub cols: u16,
    /// Rows
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Opens interactive shells on nodes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeShellConnector: Send + Sync {
    /// Log in to `address` and start a shell with a pty of `size`
    async fn open(&self, address: &str, size: TerminalSize) -> Result<ShellStream>;
}

/// [`NodeShellConnector`] backed by russh
pub struct RusshConnector {
    settings: SshSettings,
    key: Arc<PrivateKey>,
}

impl RusshConnector {
    /// Load the gateway's private key
    pub fn new(settings: SshSettings) -> Result<Self> {
        let passphrase = settings.passphrase.as_ref().map(|p| p.expose_secret().to_string());
        let key = russh::keys::load_secret_key(&settings.private_key, passphrase.as_deref())
            .map_err(|e| {
                Error::validation_for_field(
                    "ssh_private_key",
                    format!("cannot load {}: {}", settings.private_key.display(), e),
                )
            })?;
        Ok(Self {
            settings,
            key: Arc::new(key),
        })
    }

    async fn login(&self, address: &str) -> Result<Handle<NodeHandler>> {
        let config = Config {
            inactivity_timeout: None,
            keepalive_interval: Some(std::time::Duration::from_secs(30)),
            keepalive_max: 3,
            ..<_>::default()
        };
        let handler = NodeHandler {
            host: address.to_string(),
            port: self.settings.port,
            known_hosts: self.settings.known_hosts.clone(),
        };

        let connect = client::connect(Arc::new(config), (address, self.settings.port), handler);
        let mut session = tokio::time::timeout(self.settings.connect_timeout, connect)
            .await
            .map_err(|_| Error::deadline("ssh connect", self.settings.connect_timeout))?
            .map_err(|e| ssh_failure(address, e))?;

        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        let auth = session
            .authenticate_publickey(
                &self.settings.user,
                PrivateKeyWithHashAlg::new(self.key.clone(), hash_alg),
            )
            .await
            .map_err(|e| ssh_failure(address, e))?;
        if !auth.success() {
            return Err(Error::upstream(
                502,
                "SshAuthFailed",
                format!("{} rejected key for user {}", address, self.settings.user),
            ));
        }
        info!(node = address, user = %self.settings.user, "ssh session authenticated");
        Ok(session)
    }
}

#[async_trait]
impl NodeShellConnector for RusshConnector {
    async fn open(&self, address: &str, size: TerminalSize) -> Result<ShellStream> {
        address
            .parse::<IpAddr>()
            .map_err(|_| Error::validation(format!("invalid node address {:?}", address)))?;

        let session = self.login(address).await?;
        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| ssh_failure(address, e))?;
        channel
            .request_pty(false, TERM, size.cols.into(), size.rows.into(), 0, 0, &[])
            .await
            .map_err(|e| ssh_failure(address, e))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| ssh_failure(address, e))?;

        let (commands_tx, commands_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(pump(session, channel, commands_rx, output_tx, exit_tx));

        Ok(ShellStream {
            input: Box::new(SshShellInput {
                commands: commands_tx,
            }),
            output: output_rx,
            exit: async move {
                exit_rx.await.unwrap_or(ExitStatus {
                    success: false,
                    code: None,
                    message: Some("ssh session ended unexpectedly".to_string()),
                })
            }
            .boxed(),
        })
    }
}

fn ssh_failure(address: &str, e: russh::Error) -> Error {
    Error::upstream(502, "SshFailed", format!("{}: {}", address, e))
}

struct NodeHandler {
    host: String,
    port: u16,
    known_hosts: Option<PathBuf>,
}

impl client::Handler for NodeHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256);
        let Some(path) = &self.known_hosts else {
            info!(node = %self.host, %fingerprint, "accepting node host key");
            return Ok(true);
        };
        match russh::keys::check_known_hosts_path(&self.host, self.port, server_public_key, path) {
            Ok(true) => Ok(true),
            Ok(false) => {
                warn!(node = %self.host, %fingerprint, "node host key not in known_hosts");
                Ok(false)
            }
            Err(e) => {
                warn!(node = %self.host, %fingerprint, error = %e, "node host key rejected");
                Ok(false)
            }
        }
    }
}

enum Command {
    Data(Vec<u8>),
    Resize(u16, u16),
    Eof,
}

struct SshShellInput {
    commands: mpsc::Sender<Command>,
}

#[async_trait]
impl ShellInput for SshShellInput {
    async fn write(&mut self, data: Vec<u8>) -> std::result::Result<(), String> {
        self.commands
            .send(Command::Data(data))
            .await
            .map_err(|_| "ssh channel closed".to_string())
    }

    async fn resize(&mut self, width: u16, height: u16) {
        let _ = self.commands.send(Command::Resize(width, height)).await;
    }

    async fn close(&mut self) {
        let _ = self.commands.send(Command::Eof).await;
    }
}

async fn pump(
    session: Handle<NodeHandler>,
    mut channel: Channel<client::Msg>,
    mut commands: mpsc::Receiver<Command>,
    output: mpsc::Sender<ShellOutput>,
    exit: oneshot::Sender<ExitStatus>,
) {
    let mut exit_code: Option<u32> = None;
    let mut input_open = true;

    loop {
        tokio::select! {
            command = commands.recv(), if input_open => match command {
                Some(Command::Data(data)) => {
                    if let Err(e) = channel.data(&data[..]).await {
                        debug!(error = %e, "ssh write failed");
                        break;
                    }
                }
                Some(Command::Resize(cols, rows)) => {
                    let _ = channel.window_change(cols.into(), rows.into(), 0, 0).await;
                }
                Some(Command::Eof) | None => {
                    input_open = false;
                    let _ = channel.eof().await;
                }
            },
            message = channel.wait() => match message {
                Some(ChannelMsg::Data { data }) => {
                    let chunk = ShellOutput { stream: OutputStream::Stdout, data: data.to_vec() };
                    if output.send(chunk).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    let chunk = ShellOutput { stream: OutputStream::Stderr, data: data.to_vec() };
                    if output.send(chunk).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
        }
    }

    drop(output);
    let _ = session
        .disconnect(Disconnect::ByApplication, "session closed", "en")
        .await;

    let status = match exit_code {
        Some(0) | None => ExitStatus {
            success: true,
            code: exit_code.map(|c| c as i32),
            message: None,
        },
        Some(code) => ExitStatus {
            success: false,
            code: Some(code as i32),
            message: Some(format!("shell exited with status {}", code)),
        },
    };
    let _ = exit.send(status);
}

//! Gateway configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use kubegate_common::kube_utils::ClientTimeouts;
use kubegate_common::DEFAULT_PORT;

use crate::pool::PoolConfig;
use crate::sessions::SessionConfig;

/// Where cluster descriptors are kept
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// SQLite database file
    Sqlite(PathBuf),
    /// Process memory; lost on restart
    Ephemeral,
}

/// Credentials for node shells
#[derive(Debug, Clone)]
pub struct SshSettings {
    /// Login user on every node
    pub user: String,
    /// Private key file
    pub private_key: PathBuf,
    /// Passphrase for the key
    pub passphrase: Option<SecretString>,
    /// sshd port
    pub port: u16,
    /// known_hosts file; without one, host keys are accepted and logged
    pub known_hosts: Option<PathBuf>,
    /// TCP connect and handshake bound
    pub connect_timeout: Duration,
}

/// PEM files for serving HTTPS
#[derive(Debug, Clone)]
pub struct TlsFiles {
    /// Certificate chain
    pub cert: PathBuf,
    /// Private key
    pub key: PathBuf,
}

/// Complete gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen address
    pub listen: SocketAddr,
    /// Descriptor storage
    pub storage: StorageConfig,
    /// Secret shared with the token issuer
    pub jwt_secret: SecretString,
    /// Kubeconfig for the default cluster; inferred when None
    pub default_kubeconfig: Option<PathBuf>,
    /// Budget for requests that don't set one
    pub request_timeout: Duration,
    /// Transport timeouts for cluster clients
    pub client_timeouts: ClientTimeouts,
    /// Client pool tuning
    pub pool: PoolConfig,
    /// How often idle clients are reaped
    pub reap_interval: Duration,
    /// Session registry tuning
    pub sessions: SessionConfig,
    /// How often idle sessions are swept
    pub sweep_interval: Duration,
    /// Command run by pod terminals
    pub shell_command: Vec<String>,
    /// Node shell access; node SSH is refused when None
    pub ssh: Option<SshSettings>,
    /// HTTPS; plain HTTP when None
    pub tls: Option<TlsFiles>,
}

impl GatewayConfig {
    /// Defaults for everything but the JWT secret
    pub fn new(jwt_secret: SecretString) -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            storage: StorageConfig::Ephemeral,
            jwt_secret,
            default_kubeconfig: None,
            request_timeout: Duration::from_secs(30),
            client_timeouts: ClientTimeouts::default(),
            pool: PoolConfig::default(),
            reap_interval: Duration::from_secs(60),
            sessions: SessionConfig::default(),
            sweep_interval: Duration::from_secs(30),
            shell_command: vec!["/bin/sh".to_string()],
            ssh: None,
            tls: None,
        }
    }
}

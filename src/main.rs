//! kubegate - multi-cluster Kubernetes control-plane gateway

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing::info;

use kubegate_api::bridge::{NodeShellConnector, RusshConnector};
use kubegate_api::config::{GatewayConfig, SshSettings, StorageConfig, TlsFiles};
use kubegate_api::credentials::{
    Credential, CredentialStore, DescriptorRepository, MemoryRepository, SqliteRepository,
    DEFAULT_PROBE_TIMEOUT,
};
use kubegate_api::upstream::KubeClientFactory;
use kubegate_api::AppState;
use kubegate_common::kube_utils::ClientTimeouts;
use kubegate_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};

/// kubegate - one HTTP/WebSocket surface for many Kubernetes clusters
#[derive(Parser, Debug)]
#[command(name = "kubegate", version, about, long_about = None)]
struct Cli {
    /// Log line format
    #[arg(long, value_enum, default_value = "json", global = true)]
    log_format: LogStyle,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway (default mode)
    Serve(ServeArgs),

    /// Probe an API server with a credential and exit
    ///
    /// Nothing is stored. Exits non-zero when the server is unreachable.
    TestConnection(TestConnectionArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogStyle {
    Json,
    Pretty,
}

/// Gateway arguments
#[derive(Args, Debug)]
struct ServeArgs {
    /// Listen address
    #[arg(long, env = "KUBEGATE_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// SQLite database for cluster descriptors
    #[arg(long, env = "KUBEGATE_DATABASE", default_value = "kubegate.db", conflicts_with = "ephemeral")]
    database: PathBuf,

    /// Keep cluster descriptors in memory only
    #[arg(long)]
    ephemeral: bool,

    /// Secret shared with the token issuer
    #[arg(long, env = "KUBEGATE_JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,

    /// Kubeconfig for the default cluster; in-cluster or ~/.kube/config when unset
    #[arg(long, env = "KUBEGATE_DEFAULT_KUBECONFIG")]
    default_kubeconfig: Option<PathBuf>,

    /// Budget in seconds for requests that don't set one
    #[arg(long, default_value = "30")]
    request_timeout_secs: u64,

    /// Idle seconds before a cached cluster client is dropped
    #[arg(long, default_value = "1800")]
    client_idle_secs: u64,

    /// Idle seconds before a terminal session is closed
    #[arg(long, default_value = "900")]
    session_idle_secs: u64,

    /// Seconds a closing terminal may drain output
    #[arg(long, default_value = "2")]
    close_grace_secs: u64,

    /// Command started by pod terminals
    #[arg(long, default_value = "/bin/sh", value_delimiter = ' ')]
    shell_command: Vec<String>,

    #[command(flatten)]
    ssh: SshArgs,

    /// TLS certificate chain (PEM); HTTPS when set together with --tls-key
    #[arg(long, env = "KUBEGATE_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, env = "KUBEGATE_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,
}

/// Node shell arguments
#[derive(Args, Debug)]
struct SshArgs {
    /// Private key used to log in to nodes; node shells are disabled when unset
    #[arg(long, env = "KUBEGATE_SSH_KEY")]
    ssh_key: Option<PathBuf>,

    /// Passphrase of the SSH key
    #[arg(long, env = "KUBEGATE_SSH_KEY_PASSPHRASE", hide_env_values = true)]
    ssh_key_passphrase: Option<String>,

    /// Login user on nodes
    #[arg(long, env = "KUBEGATE_SSH_USER", default_value = "root")]
    ssh_user: String,

    /// sshd port on nodes
    #[arg(long, default_value = "22")]
    ssh_port: u16,

    /// known_hosts file for node host keys
    #[arg(long)]
    ssh_known_hosts: Option<PathBuf>,
}

/// Connection probe arguments
#[derive(Args, Debug)]
struct TestConnectionArgs {
    /// API server URL; taken from the kubeconfig when omitted
    #[arg(long)]
    server: Option<String>,

    /// Bearer token
    #[arg(long, conflicts_with = "kubeconfig", required_unless_present = "kubeconfig")]
    token: Option<String>,

    /// Kubeconfig file
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Accept any serving certificate (token credentials only)
    #[arg(long)]
    insecure_skip_tls_verify: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // kube and axum-server both link rustls; pick the provider explicitly
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install the rustls crypto provider");
    }

    let cli = Cli::parse();
    let telemetry = init_telemetry(TelemetryConfig {
        log_format: match cli.log_format {
            LogStyle::Json => LogFormat::Json,
            LogStyle::Pretty => LogFormat::Pretty,
        },
        ..TelemetryConfig::default()
    })?;

    let result = match cli.command {
        Some(Commands::TestConnection(args)) => match run_test_connection(args).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                telemetry.shutdown();
                std::process::exit(2);
            }
            Err(e) => Err(e),
        },
        Some(Commands::Serve(args)) => run_serve(args).await,
        None => match ServeArgs::parse_from_env() {
            Ok(args) => run_serve(args).await,
            Err(e) => Err(e),
        },
    };
    telemetry.shutdown();
    result
}

impl ServeArgs {
    /// `serve` arguments from the environment alone, for a bare `kubegate`
    fn parse_from_env() -> anyhow::Result<Self> {
        #[derive(Parser)]
        struct Wrapper {
            #[command(flatten)]
            args: ServeArgs,
        }
        Ok(Wrapper::try_parse_from(["kubegate"])?.args)
    }

    fn into_config(self) -> anyhow::Result<GatewayConfig> {
        let mut config = GatewayConfig::new(SecretString::from(self.jwt_secret));
        config.listen = self.listen;
        config.storage = if self.ephemeral {
            StorageConfig::Ephemeral
        } else {
            StorageConfig::Sqlite(self.database)
        };
        config.default_kubeconfig = self.default_kubeconfig;
        config.request_timeout = Duration::from_secs(self.request_timeout_secs);
        config.pool.idle_timeout = Duration::from_secs(self.client_idle_secs);
        config.sessions.idle_timeout = Duration::from_secs(self.session_idle_secs);
        config.sessions.close_grace = Duration::from_secs(self.close_grace_secs);
        if self.shell_command.iter().any(|part| !part.is_empty()) {
            config.shell_command = self.shell_command;
        }
        config.ssh = self.ssh.ssh_key.map(|private_key| SshSettings {
            user: self.ssh.ssh_user,
            private_key,
            passphrase: self.ssh.ssh_key_passphrase.map(SecretString::from),
            port: self.ssh.ssh_port,
            known_hosts: self.ssh.ssh_known_hosts,
            connect_timeout: Duration::from_secs(10),
        });
        config.tls = match (self.tls_cert, self.tls_key) {
            (Some(cert), Some(key)) => Some(TlsFiles { cert, key }),
            _ => None,
        };
        if config.request_timeout.is_zero() {
            anyhow::bail!("--request-timeout-secs must be positive");
        }
        Ok(config)
    }
}

async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = args.into_config()?;

    let repository: Arc<dyn DescriptorRepository> = match &config.storage {
        StorageConfig::Sqlite(path) => {
            info!(path = %path.display(), "opening descriptor database");
            Arc::new(SqliteRepository::open(path)?)
        }
        StorageConfig::Ephemeral => {
            info!("cluster descriptors are kept in memory");
            Arc::new(MemoryRepository::new())
        }
    };
    let factory = Arc::new(KubeClientFactory::new(
        config.default_kubeconfig.clone(),
        config.client_timeouts,
    ));
    let ssh = match &config.ssh {
        Some(settings) => {
            let connector: Arc<dyn NodeShellConnector> = Arc::new(RusshConnector::new(settings.clone())?);
            info!(user = %settings.user, port = settings.port, "node shells enabled");
            Some(connector)
        }
        None => None,
    };

    let state = AppState::new(config, repository, factory, ssh);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        kubegate_api::shutdown_signal().await;
        signal.cancel();
    });

    kubegate_api::run(state, shutdown).await?;
    info!("gateway stopped");
    Ok(())
}

/// Returns whether the server was reachable
async fn run_test_connection(args: TestConnectionArgs) -> anyhow::Result<bool> {
    let credential = match (args.token, args.kubeconfig) {
        (Some(token), _) => Credential::Token {
            token: SecretString::from(token),
            skip_tls_verify: args.insecure_skip_tls_verify,
        },
        (None, Some(path)) => {
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
            Credential::Kubeconfig {
                content: SecretString::from(content),
            }
        }
        (None, None) => anyhow::bail!("one of --token or --kubeconfig is required"),
    };

    let store = CredentialStore::new(
        Arc::new(MemoryRepository::new()),
        Arc::new(KubeClientFactory::new(None, ClientTimeouts::default())),
        DEFAULT_PROBE_TIMEOUT,
    );
    let report = store
        .test_connection(args.server.as_deref(), credential)
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(report.reachable)
}

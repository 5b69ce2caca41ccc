//! Kubernetes client construction helpers
//!
//! Every cluster client the gateway uses is built here, from one of three
//! sources: a server URL plus bearer token, an inline kubeconfig document, or
//! the process's own kubeconfig (explicit path or inferred).

use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use secrecy::SecretString;

use crate::Error;

/// Default connection timeout for cluster clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for cluster clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport timeouts applied to every constructed client
#[derive(Debug, Clone, Copy)]
pub struct ClientTimeouts {
    /// TCP/TLS connect timeout
    pub connect: Duration,
    /// Per-request read timeout. Streaming calls (exec, logs) are not bound by it.
    pub read: Option<Duration>,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            read: Some(DEFAULT_READ_TIMEOUT),
        }
    }
}

/// Check that a server URL is an absolute http(s) URL with a host
pub fn validate_server_url(server_url: &str) -> Result<http::Uri, Error> {
    let trimmed = server_url.trim();
    if trimmed.is_empty() {
        return Err(Error::validation_for_field("server_url", "must not be empty"));
    }
    let uri: http::Uri = trimmed
        .parse()
        .map_err(|e| Error::validation_for_field("server_url", format!("malformed URL: {}", e)))?;
    match uri.scheme_str() {
        Some("https") | Some("http") => {}
        _ => {
            return Err(Error::validation_for_field(
                "server_url",
                "scheme must be http or https",
            ))
        }
    }
    if uri.host().map(str::is_empty).unwrap_or(true) {
        return Err(Error::validation_for_field("server_url", "missing host"));
    }
    Ok(uri)
}

/// Parse an inline kubeconfig document
pub fn parse_kubeconfig(content: &str) -> Result<Kubeconfig, Error> {
    if content.trim().is_empty() {
        return Err(Error::validation_for_field("credential", "kubeconfig is empty"));
    }
    Kubeconfig::from_yaml(content).map_err(|e| {
        Error::validation_for_field("credential", format!("invalid kubeconfig: {}", e))
    })
}

/// Server URL of the kubeconfig's current context, if it names one
pub fn kubeconfig_server_url(kubeconfig: &Kubeconfig) -> Option<String> {
    let context_name = kubeconfig.current_context.as_deref()?;
    let cluster_name = kubeconfig
        .contexts
        .iter()
        .find(|c| c.name == context_name)?
        .context
        .as_ref()?
        .cluster
        .clone();
    kubeconfig
        .clusters
        .iter()
        .find(|c| c.name == cluster_name)?
        .cluster
        .as_ref()?
        .server
        .clone()
}

/// Build a client for a server URL authenticated by a bearer token
pub fn client_from_token(
    server_url: &str,
    token: SecretString,
    skip_tls_verify: bool,
    timeouts: ClientTimeouts,
) -> Result<Client, Error> {
    let uri = validate_server_url(server_url)?;
    let mut config = Config::new(uri);
    config.auth_info.token = Some(token);
    config.accept_invalid_certs = skip_tls_verify;
    apply_timeouts(&mut config, timeouts);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("client_from_token", format!("failed to create client: {}", e))
    })
}

/// Build a client from an inline kubeconfig document
///
/// `server_url`, when given, replaces the current context's server.
pub async fn client_from_kubeconfig(
    content: &str,
    server_url: Option<&str>,
    timeouts: ClientTimeouts,
) -> Result<Client, Error> {
    let kubeconfig = parse_kubeconfig(content)?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::validation_for_field("credential", format!("unusable kubeconfig: {}", e))
        })?;
    if let Some(url) = server_url {
        config.cluster_url = validate_server_url(url)?;
    }
    apply_timeouts(&mut config, timeouts);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context(
            "client_from_kubeconfig",
            format!("failed to create client: {}", e),
        )
    })
}

/// Build a client for the gateway's own default cluster
///
/// With a path, that kubeconfig is loaded; otherwise the config is inferred
/// (in-cluster service account, then `$KUBECONFIG` / `~/.kube/config`).
pub async fn default_client(
    kubeconfig: Option<&Path>,
    timeouts: ClientTimeouts,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "default_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "default_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("default_client", format!("failed to infer config: {}", e))
        })?,
    };
    apply_timeouts(&mut config, timeouts);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("default_client", format!("failed to create client: {}", e))
    })
}

fn apply_timeouts(config: &mut Config, timeouts: ClientTimeouts) {
    config.connect_timeout = Some(timeouts.connect);
    config.read_timeout = timeouts.read;
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: dev
clusters:
- name: dev-cluster
  cluster:
    server: https://10.0.0.1:6443
    insecure-skip-tls-verify: true
- name: other
  cluster:
    server: https://10.0.0.2:6443
contexts:
- name: dev
  context:
    cluster: dev-cluster
    user: admin
users:
- name: admin
  user:
    token: abc
"#;

    #[test]
    fn accepts_https_and_http_urls() {
        assert!(validate_server_url("https://10.0.0.1:6443").is_ok());
        assert!(validate_server_url("http://localhost:8080").is_ok());
        assert!(validate_server_url("  https://api.example.com  ").is_ok());
    }

    #[test]
    fn rejects_malformed_urls() {
        for bad in ["", "   ", "not a url", "ftp://host", "10.0.0.1:6443", "https://"] {
            let err = validate_server_url(bad).unwrap_err();
            assert_eq!(err.kind(), "validation_error", "accepted {bad:?}");
        }
    }

    #[test]
    fn finds_current_context_server() {
        let kubeconfig = parse_kubeconfig(KUBECONFIG).unwrap();
        assert_eq!(
            kubeconfig_server_url(&kubeconfig).as_deref(),
            Some("https://10.0.0.1:6443")
        );
    }

    #[test]
    fn no_current_context_means_no_server() {
        let without = KUBECONFIG.replace("current-context: dev\n", "");
        let kubeconfig = parse_kubeconfig(&without).unwrap();
        assert_eq!(kubeconfig_server_url(&kubeconfig), None);
    }

    #[test]
    fn empty_kubeconfig_is_a_validation_error() {
        assert_eq!(parse_kubeconfig("  ").unwrap_err().kind(), "validation_error");
    }

    #[test]
    fn token_client_rejects_bad_url_before_building() {
        let err = client_from_token(
            "nope",
            SecretString::from("t".to_string()),
            false,
            ClientTimeouts::default(),
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), "validation_error");
    }
}

//! Resource proxy
//!
//! Resource operations against one pooled cluster client. Every upstream call
//! runs under the caller's deadline and reports its outcome back to the pool,
//! so transport failures count against the client's health and successes
//! reset it.
//!
//! Scale, restart and the configmap/secret updates are read-modify-write
//! cycles that carry the read's resourceVersion as a precondition. A write
//! conflict restarts the whole cycle once; a second conflict is returned.

pub mod manifest;
pub mod summary;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Node, Pod, Secret};
use opentelemetry::KeyValue;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use kubegate_common::metrics::{UPSTREAM_CALLS, UPSTREAM_CALL_DURATION};
use kubegate_common::{DEFAULT_NAMESPACE, RESTARTED_AT_ANNOTATION};

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::pool::{ClientPool, ClusterClient};
use crate::router::require_name;
use crate::upstream::{
    ExecRequest, LogRequest, OutputStream, PageRequest, ResourceKind, ResourceScope, ShellStream,
    UpstreamFailure,
};

use self::summary::{decode, node_internal_ip, secret_info, summarize, SecretInfo};

/// Page size when the caller doesn't set one
pub const DEFAULT_PAGE_LIMIT: u32 = 500;

/// Log lines returned when the caller doesn't set `tail_lines`
pub const DEFAULT_TAIL_LINES: i64 = 100;

/// Read-modify-write cycles attempted before a conflict is returned
const WRITE_ATTEMPTS: u32 = 2;

/// Absolute end of a caller's budget
#[derive(Debug, Clone, Copy)]
struct Budget {
    until: Instant,
    total: Duration,
}

impl Budget {
    fn start(deadline: Deadline) -> Self {
        Self {
            until: Instant::now() + deadline.budget(),
            total: deadline.budget(),
        }
    }
}

/// List selection and paging
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Namespace; `default` when None
    pub namespace: Option<String>,
    /// List across every namespace, ignoring `namespace`
    pub all_namespaces: bool,
    /// Page size
    pub limit: Option<u32>,
    /// Continue token from the previous page
    pub continue_token: Option<String>,
}

/// One explicit page of summaries
#[derive(Debug, Clone, Serialize)]
pub struct ResourcePage {
    /// Summaries in server order
    pub items: Vec<Value>,
    /// Token for the next page; absent on the last page
    #[serde(rename = "continue", skip_serializing_if = "Option::is_none")]
    pub continue_token: Option<String>,
    /// Items left after this page, when the server reports it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<i64>,
}

/// ConfigMap contents to write
#[derive(Debug, Clone, Default)]
pub struct ConfigMapWrite {
    /// Namespace
    pub namespace: Option<String>,
    /// Data entries; replaces the existing data on update
    pub data: BTreeMap<String, String>,
    /// Labels; left alone on update when None
    pub labels: Option<BTreeMap<String, String>>,
}

/// Secret contents to write
#[derive(Debug, Clone, Default)]
pub struct SecretWrite {
    /// Namespace
    pub namespace: Option<String>,
    /// Secret type; `Opaque` on create when None
    pub type_: Option<String>,
    /// Plain-text values, stored base64-encoded
    pub data: BTreeMap<String, String>,
    /// Plain-text values merged by the server over `data`
    pub string_data: BTreeMap<String, String>,
    /// Labels; left alone on update when None
    pub labels: Option<BTreeMap<String, String>>,
}

/// An object created from a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedObject {
    /// Kind
    pub kind: String,
    /// Name
    pub name: String,
    /// Namespace; empty for cluster-scoped objects
    pub namespace: String,
}

/// Result of a one-shot exec
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecOutput {
    /// Collected stdout
    pub stdout: String,
    /// Collected stderr
    pub stderr: String,
    /// Whether the command succeeded
    pub success: bool,
    /// Exit code, when reported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Failure message, when reported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Pod counts by phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PodPhaseStats {
    /// Running
    pub running: u64,
    /// Pending
    pub pending: u64,
    /// Failed
    pub failed: u64,
    /// Succeeded
    pub succeeded: u64,
    /// Anything else
    pub unknown: u64,
}

impl PodPhaseStats {
    fn count(&mut self, phase: Option<&str>) {
        match phase {
            Some("Running") => self.running += 1,
            Some("Pending") => self.pending += 1,
            Some("Failed") => self.failed += 1,
            Some("Succeeded") => self.succeeded += 1,
            _ => self.unknown += 1,
        }
    }
}

/// Object counts for one cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DashboardStats {
    /// Nodes
    pub node_count: u64,
    /// Namespaces
    pub namespace_count: u64,
    /// Pods across all namespaces
    pub pod_count: u64,
    /// Deployments across all namespaces
    pub deployment_count: u64,
    /// Services across all namespaces
    pub service_count: u64,
    /// ConfigMaps across all namespaces
    pub configmap_count: u64,
    /// Secrets across all namespaces
    pub secret_count: u64,
    /// Pods by phase
    pub pod_status_stats: PodPhaseStats,
}

/// Resource operations over pooled cluster clients
#[derive(Clone)]
pub struct ResourceProxy {
    pool: Arc<ClientPool>,
}

impl ResourceProxy {
    /// Proxy reporting call health to `pool`
    pub fn new(pool: Arc<ClientPool>) -> Self {
        Self { pool }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// One page of summaries
    pub async fn list(
        &self,
        client: &Arc<ClusterClient>,
        deadline: Deadline,
        kind: ResourceKind,
        options: ListOptions,
    ) -> Result<ResourcePage> {
        let budget = Budget::start(deadline);
        let limit = options.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if limit == 0 {
            return Err(Error::validation_for_field("limit", "limit must be positive"));
        }

        let scope = if options.all_namespaces && kind.is_namespaced() {
            ResourceScope::all_namespaces(kind)
        } else {
            ResourceScope::new(kind, options.namespace.as_deref())
        };
        let page = PageRequest {
            limit,
            continue_token: options.continue_token.filter(|t| !t.is_empty()),
        };

        let objects = self
            .call(client, &budget, "list", None, client.api().list(&scope, &page))
            .await?;

        let now = Utc::now();
        let items = objects
            .items
            .into_iter()
            .map(|object| summarize(kind, object, now))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| e.into_error(&client.key().to_string(), None))?;

        Ok(ResourcePage {
            items,
            continue_token: objects.continue_token,
            remaining: objects.remaining,
        })
    }

    /// Summary of one object
    pub async fn get(
        &self,
        client: &Arc<ClusterClient>,
        deadline: Deadline,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Value> {
        let budget = Budget::start(deadline);
        let scope = ResourceScope::new(kind, namespace);
        let name = require_name(name)?;
        let object = self
            .call(client, &budget, "get", None, client.api().get(&scope, name))
            .await?;
        summarize(kind, object, Utc::now()).map_err(|e| e.into_error(&client.key().to_string(), None))
    }

    /// Secret summary, optionally with decoded values
    pub async fn get_secret(
        &self,
        client: &Arc<ClusterClient>,
        deadline: Deadline,
        namespace: Option<&str>,
        name: &str,
        decode_values: bool,
    ) -> Result<SecretInfo> {
        let budget = Budget::start(deadline);
        let scope = ResourceScope::new(ResourceKind::Secret, namespace);
        let name = require_name(name)?;
        let object = self
            .call(client, &budget, "get", None, client.api().get(&scope, name))
            .await?;
        let secret: Secret =
            decode(object).map_err(|e| e.into_error(&client.key().to_string(), None))?;
        Ok(secret_info(&secret, decode_values))
    }

    /// Pod logs
    pub async fn logs(
        &self,
        client: &Arc<ClusterClient>,
        deadline: Deadline,
        namespace: Option<&str>,
        pod: &str,
        mut request: LogRequest,
    ) -> Result<String> {
        let budget = Budget::start(deadline);
        let pod = require_name(pod)?;
        let namespace = namespace_or_default(namespace);
        if request.tail_lines.is_none() {
            request.tail_lines = Some(DEFAULT_TAIL_LINES);
        }
        self.call(
            client,
            &budget,
            "logs",
            None,
            client.api().logs(namespace, pod, &request),
        )
        .await
    }

    /// Object counts, one unpaged list per kind
    #[instrument(skip(self, client, deadline), fields(cluster = %client.key()))]
    pub async fn dashboard_stats(
        &self,
        client: &Arc<ClusterClient>,
        deadline: Deadline,
    ) -> Result<DashboardStats> {
        let budget = Budget::start(deadline);
        let everything = PageRequest::default();
        let scope = ResourceScope::all_namespaces;
        let pod_scope = scope(ResourceKind::Pod);

        let (nodes, namespaces, pods, deployments, services, configmaps, secrets) = futures::try_join!(
            self.count(client, &budget, scope(ResourceKind::Node), &everything),
            self.count(client, &budget, scope(ResourceKind::Namespace), &everything),
            self.call(
                client,
                &budget,
                "list",
                None,
                client.api().list(&pod_scope, &everything)
            ),
            self.count(client, &budget, scope(ResourceKind::Deployment), &everything),
            self.count(client, &budget, scope(ResourceKind::Service), &everything),
            self.count(client, &budget, scope(ResourceKind::ConfigMap), &everything),
            self.count(client, &budget, scope(ResourceKind::Secret), &everything),
        )?;

        let mut pod_status_stats = PodPhaseStats::default();
        for pod in &pods.items {
            pod_status_stats.count(pod.pointer("/status/phase").and_then(Value::as_str));
        }

        Ok(DashboardStats {
            node_count: nodes,
            namespace_count: namespaces,
            pod_count: pods.items.len() as u64,
            deployment_count: deployments,
            service_count: services,
            configmap_count: configmaps,
            secret_count: secrets,
            pod_status_stats,
        })
    }

    async fn count(
        &self,
        client: &Arc<ClusterClient>,
        budget: &Budget,
        scope: ResourceScope,
        page: &PageRequest,
    ) -> Result<u64> {
        let objects = self
            .call(client, budget, "list", None, client.api().list(&scope, page))
            .await?;
        Ok(objects.items.len() as u64)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Delete one object
    pub async fn delete(
        &self,
        client: &Arc<ClusterClient>,
        deadline: Deadline,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<()> {
        let budget = Budget::start(deadline);
        let scope = ResourceScope::new(kind, namespace);
        let name = require_name(name)?;
        self.call(client, &budget, "delete", None, client.api().delete(&scope, name))
            .await?;
        info!(cluster = %client.key(), kind = %kind, name, "deleted");
        Ok(())
    }

    /// Create a namespace
    pub async fn create_namespace(
        &self,
        client: &Arc<ClusterClient>,
        deadline: Deadline,
        name: &str,
    ) -> Result<Value> {
        let name = require_name(name)?;
        let object = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name },
        });
        self.create(client, deadline, ResourceKind::Namespace, None, object)
            .await
    }

    /// Create a configmap
    pub async fn create_configmap(
        &self,
        client: &Arc<ClusterClient>,
        deadline: Deadline,
        name: &str,
        write: ConfigMapWrite,
    ) -> Result<Value> {
        let name = require_name(name)?;
        let namespace = namespace_or_default(write.namespace.as_deref());
        let object = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "labels": write.labels.unwrap_or_default(),
            },
            "data": write.data,
        });
        self.create(client, deadline, ResourceKind::ConfigMap, Some(namespace), object)
            .await
    }

    /// Replace a configmap's data (and labels, when given)
    pub async fn update_configmap(
        &self,
        client: &Arc<ClusterClient>,
        deadline: Deadline,
        name: &str,
        write: ConfigMapWrite,
    ) -> Result<Value> {
        let budget = Budget::start(deadline);
        let name = require_name(name)?;
        let scope = ResourceScope::new(ResourceKind::ConfigMap, write.namespace.as_deref());
        let data = serde_json::to_value(&write.data).map_err(|e| Error::internal(e.to_string()))?;

        let updated = self
            .read_modify_write(client, &budget, &scope, name, |object| {
                set_labels(object, write.labels.as_ref())?;
                as_map(object)?.insert("data".to_string(), data.clone());
                Ok(())
            })
            .await?;
        summarize(ResourceKind::ConfigMap, updated, Utc::now())
            .map_err(|e| e.into_error(&client.key().to_string(), None))
    }

    /// Create a secret from plain-text values
    pub async fn create_secret(
        &self,
        client: &Arc<ClusterClient>,
        deadline: Deadline,
        name: &str,
        write: SecretWrite,
    ) -> Result<Value> {
        let name = require_name(name)?;
        let namespace = namespace_or_default(write.namespace.as_deref());
        let mut object = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "labels": write.labels.clone().unwrap_or_default(),
            },
            "type": write.type_.as_deref().unwrap_or("Opaque"),
            "data": encode_values(&write.data),
        });
        if !write.string_data.is_empty() {
            as_map(&mut object)?.insert("stringData".to_string(), json!(write.string_data));
        }
        self.create(client, deadline, ResourceKind::Secret, Some(namespace), object)
            .await
    }

    /// Replace a secret's values (and labels, when given)
    pub async fn update_secret(
        &self,
        client: &Arc<ClusterClient>,
        deadline: Deadline,
        name: &str,
        write: SecretWrite,
    ) -> Result<Value> {
        let budget = Budget::start(deadline);
        let name = require_name(name)?;
        let scope = ResourceScope::new(ResourceKind::Secret, write.namespace.as_deref());
        let data = encode_values(&write.data);

        let updated = self
            .read_modify_write(client, &budget, &scope, name, |object| {
                set_labels(object, write.labels.as_ref())?;
                let map = as_map(object)?;
                map.insert("data".to_string(), data.clone());
                if write.string_data.is_empty() {
                    map.remove("stringData");
                } else {
                    map.insert("stringData".to_string(), json!(write.string_data));
                }
                if let Some(type_) = &write.type_ {
                    map.insert("type".to_string(), json!(type_));
                }
                Ok(())
            })
            .await?;
        summarize(ResourceKind::Secret, updated, Utc::now())
            .map_err(|e| e.into_error(&client.key().to_string(), None))
    }

    /// Set a deployment's replica count
    #[instrument(skip(self, client, deadline), fields(cluster = %client.key()))]
    pub async fn scale(
        &self,
        client: &Arc<ClusterClient>,
        deadline: Deadline,
        namespace: Option<&str>,
        name: &str,
        replicas: i32,
    ) -> Result<Value> {
        if replicas < 0 {
            return Err(Error::validation_for_field(
                "replicas",
                "replicas must not be negative",
            ));
        }
        let budget = Budget::start(deadline);
        let name = require_name(name)?;
        let scope = ResourceScope::new(ResourceKind::Deployment, namespace);

        let updated = self
            .read_modify_write(client, &budget, &scope, name, |object| {
                object_at(object, &["spec"])?.insert("replicas".to_string(), json!(replicas));
                Ok(())
            })
            .await?;
        info!(replicas, "deployment scaled");
        summarize(ResourceKind::Deployment, updated, Utc::now())
            .map_err(|e| e.into_error(&client.key().to_string(), None))
    }

    /// Roll a deployment's pods by stamping its template
    #[instrument(skip(self, client, deadline), fields(cluster = %client.key()))]
    pub async fn restart(
        &self,
        client: &Arc<ClusterClient>,
        deadline: Deadline,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Value> {
        let budget = Budget::start(deadline);
        let name = require_name(name)?;
        let scope = ResourceScope::new(ResourceKind::Deployment, namespace);
        let stamp = Utc::now().to_rfc3339();

        let updated = self
            .read_modify_write(client, &budget, &scope, name, |object| {
                object_at(object, &["spec", "template", "metadata", "annotations"])?
                    .insert(RESTARTED_AT_ANNOTATION.to_string(), json!(stamp));
                Ok(())
            })
            .await?;
        info!(restarted_at = %stamp, "deployment restarted");
        summarize(ResourceKind::Deployment, updated, Utc::now())
            .map_err(|e| e.into_error(&client.key().to_string(), None))
    }

    /// Create every object in a YAML payload, in order
    ///
    /// The whole payload is parsed and checked first; a bad document means no
    /// upstream call is made. Creation stops at the first failure, leaving
    /// earlier objects in place.
    #[instrument(skip(self, client, deadline, raw), fields(cluster = %client.key()))]
    pub async fn create_from_manifest(
        &self,
        client: &Arc<ClusterClient>,
        deadline: Deadline,
        default_namespace: Option<&str>,
        raw: &str,
    ) -> Result<Vec<CreatedObject>> {
        let objects = manifest::parse(raw)?;
        let budget = Budget::start(deadline);
        let default_namespace = namespace_or_default(default_namespace);

        let mut created = Vec::with_capacity(objects.len());
        for (index, object) in objects.into_iter().enumerate() {
            let step = format!("create document {}", index);
            let result = self
                .call(
                    client,
                    &budget,
                    "create",
                    Some(&step),
                    client.api().create_manifest_object(object, default_namespace),
                )
                .await?;
            let text = |pointer: &str| {
                result
                    .pointer(pointer)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            created.push(CreatedObject {
                kind: text("/kind"),
                name: text("/metadata/name"),
                namespace: text("/metadata/namespace"),
            });
        }
        info!(count = created.len(), "manifest applied");
        Ok(created)
    }

    async fn create(
        &self,
        client: &Arc<ClusterClient>,
        deadline: Deadline,
        kind: ResourceKind,
        namespace: Option<&str>,
        object: Value,
    ) -> Result<Value> {
        let budget = Budget::start(deadline);
        let scope = ResourceScope::new(kind, namespace);
        let created = self
            .call(client, &budget, "create", None, client.api().create(&scope, object))
            .await?;
        summarize(kind, created, Utc::now()).map_err(|e| e.into_error(&client.key().to_string(), None))
    }

    // =========================================================================
    // Exec and stream targets
    // =========================================================================

    /// Run a command to completion and collect its output
    #[instrument(skip(self, client, deadline, command), fields(cluster = %client.key()))]
    pub async fn exec_command(
        &self,
        client: &Arc<ClusterClient>,
        deadline: Deadline,
        namespace: Option<&str>,
        pod: &str,
        container: Option<String>,
        command: Vec<String>,
    ) -> Result<ExecOutput> {
        if command.is_empty() || command[0].trim().is_empty() {
            return Err(Error::validation_for_field("command", "command is required"));
        }
        let budget = Budget::start(deadline);
        let pod = require_name(pod)?;
        let namespace = namespace_or_default(namespace);
        let request = ExecRequest {
            container,
            command,
            tty: false,
            stdin: false,
        };

        let api = client.api();
        let run = async {
            let stream = api.exec(namespace, pod, &request).await?;
            Ok::<_, UpstreamFailure>(collect_output(stream).await)
        };
        self.call(client, &budget, "exec", None, run).await
    }

    /// Open an interactive process for a terminal session
    pub async fn open_shell(
        &self,
        client: &Arc<ClusterClient>,
        deadline: Deadline,
        namespace: &str,
        pod: &str,
        request: ExecRequest,
    ) -> Result<ShellStream> {
        let budget = Budget::start(deadline);
        self.call(
            client,
            &budget,
            "exec",
            None,
            client.api().exec(namespace, pod, &request),
        )
        .await
    }

    /// Check that a pod can host a terminal; returns the container to use
    ///
    /// The pod must be Running. Without an explicit container the pod's first
    /// container is used.
    pub async fn validate_pod_target(
        &self,
        client: &Arc<ClusterClient>,
        deadline: Deadline,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
    ) -> Result<String> {
        let budget = Budget::start(deadline);
        let pod_name = require_name(pod)?;
        let scope = ResourceScope::new(ResourceKind::Pod, Some(namespace));
        let object = self
            .call(client, &budget, "get", None, client.api().get(&scope, pod_name))
            .await?;
        let pod: Pod = decode(object).map_err(|e| e.into_error(&client.key().to_string(), None))?;

        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Unknown");
        if phase != "Running" {
            return Err(Error::validation(format!(
                "pod {} is {}, not Running",
                pod_name, phase
            )));
        }

        let containers = pod.spec.map(|s| s.containers).unwrap_or_default();
        match container.map(str::trim).filter(|c| !c.is_empty()) {
            Some(wanted) => containers
                .iter()
                .find(|c| c.name == wanted)
                .map(|c| c.name.clone())
                .ok_or_else(|| {
                    Error::validation_for_field(
                        "container",
                        format!("pod {} has no container {}", pod_name, wanted),
                    )
                }),
            None => containers.first().map(|c| c.name.clone()).ok_or_else(|| {
                Error::validation(format!("pod {} has no containers", pod_name))
            }),
        }
    }

    /// InternalIP of a node, for node shells
    pub async fn node_address(
        &self,
        client: &Arc<ClusterClient>,
        deadline: Deadline,
        node: &str,
    ) -> Result<String> {
        let budget = Budget::start(deadline);
        let name = require_name(node)?;
        let scope = ResourceScope::new(ResourceKind::Node, None);
        let object = self
            .call(client, &budget, "get", None, client.api().get(&scope, name))
            .await?;
        let node: Node = decode(object).map_err(|e| e.into_error(&client.key().to_string(), None))?;
        node_internal_ip(&node)
            .ok_or_else(|| Error::validation(format!("node {} has no InternalIP address", name)))
    }

    // =========================================================================
    // Call plumbing
    // =========================================================================

    /// Read, mutate and write back one object, restarting once on conflict
    async fn read_modify_write<F>(
        &self,
        client: &Arc<ClusterClient>,
        budget: &Budget,
        scope: &ResourceScope,
        name: &str,
        mut mutate: F,
    ) -> Result<Value>
    where
        F: FnMut(&mut Value) -> Result<()>,
    {
        let cluster = client.key().to_string();
        let mut attempt = 1;
        loop {
            let mut object = self
                .call(client, budget, "get", Some("read"), client.api().get(scope, name))
                .await?;
            mutate(&mut object)?;

            match self
                .attempt(client, budget, "replace", client.api().replace(scope, name, object))
                .await
                .map_err(|error| error.at_step("write"))?
            {
                Ok(updated) => return Ok(updated),
                Err(failure) if failure.is_conflict() && attempt < WRITE_ATTEMPTS => {
                    debug!(cluster = %cluster, kind = %scope.kind, name, attempt, "write conflict, retrying");
                    attempt += 1;
                }
                Err(failure) => return Err(failure.into_error(&cluster, Some("write"))),
            }
        }
    }

    /// Run one upstream call and classify its failure
    async fn call<T, F>(
        &self,
        client: &Arc<ClusterClient>,
        budget: &Budget,
        verb: &'static str,
        step: Option<&str>,
        call: F,
    ) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, UpstreamFailure>>,
    {
        match self.attempt(client, budget, verb, call).await {
            Ok(result) => {
                result.map_err(|failure| failure.into_error(&client.key().to_string(), step))
            }
            Err(error) => Err(match step {
                Some(step) => error.at_step(step),
                None => error,
            }),
        }
    }

    /// Run one upstream call under the budget, reporting its health to the pool
    ///
    /// Expiry drops the call's future, which cancels the request in flight.
    async fn attempt<T, F>(
        &self,
        client: &Arc<ClusterClient>,
        budget: &Budget,
        verb: &'static str,
        call: F,
    ) -> Result<std::result::Result<T, UpstreamFailure>>
    where
        F: Future<Output = std::result::Result<T, UpstreamFailure>>,
    {
        let started = Instant::now();
        let outcome = tokio::time::timeout_at(budget.until, call).await;
        UPSTREAM_CALL_DURATION.record(
            started.elapsed().as_secs_f64(),
            &[KeyValue::new("verb", verb)],
        );

        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                record_outcome(verb, "deadline");
                return Err(Error::deadline(verb, budget.total));
            }
        };

        match &result {
            Ok(_) => {
                self.pool.record_success(client);
                record_outcome(verb, "ok");
            }
            Err(failure) if failure.is_transport() => {
                self.pool.record_transport_failure(client);
                record_outcome(verb, "unreachable");
            }
            Err(failure) => {
                // The server answered, so the client itself is healthy
                self.pool.record_success(client);
                record_outcome(verb, if failure.is_conflict() { "conflict" } else { "upstream" });
            }
        }
        Ok(result)
    }
}

fn record_outcome(verb: &'static str, outcome: &'static str) {
    UPSTREAM_CALLS.add(
        1,
        &[KeyValue::new("verb", verb), KeyValue::new("outcome", outcome)],
    );
}

fn namespace_or_default(namespace: Option<&str>) -> &str {
    namespace
        .map(str::trim)
        .filter(|ns| !ns.is_empty())
        .unwrap_or(DEFAULT_NAMESPACE)
}

fn encode_values(values: &BTreeMap<String, String>) -> Value {
    values
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(STANDARD.encode(v.as_bytes()))))
        .collect::<Map<_, _>>()
        .into()
}

fn as_map(value: &mut Value) -> Result<&mut Map<String, Value>> {
    value
        .as_object_mut()
        .ok_or_else(|| Error::upstream(502, "BadGateway", "upstream object is not a JSON object"))
}

/// Walk to a nested object, creating missing levels
fn object_at<'a>(value: &'a mut Value, path: &[&str]) -> Result<&'a mut Map<String, Value>> {
    let mut current = as_map(value)?;
    for key in path {
        let next = current
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if next.is_null() {
            *next = Value::Object(Map::new());
        }
        current = as_map(next)?;
    }
    Ok(current)
}

fn set_labels(object: &mut Value, labels: Option<&BTreeMap<String, String>>) -> Result<()> {
    if let Some(labels) = labels {
        object_at(object, &["metadata"])?.insert("labels".to_string(), json!(labels));
    }
    Ok(())
}

async fn collect_output(mut stream: ShellStream) -> ExecOutput {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    while let Some(chunk) = stream.output.recv().await {
        match chunk.stream {
            OutputStream::Stdout => stdout.extend_from_slice(&chunk.data),
            OutputStream::Stderr => stderr.extend_from_slice(&chunk.data),
        }
    }
    let status = stream.exit.await;
    ExecOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        success: status.success,
        exit_code: status.code,
        message: status.message,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::FutureExt;
    use tokio::sync::mpsc;

    use super::*;
    use crate::credentials::ClusterKey;
    use crate::testing::pool_with;
    use crate::upstream::{
        ClusterApi, ExitStatus, MockClusterApi, ObjectPage, ShellInput, ShellOutput,
    };

    const BUDGET: Duration = Duration::from_secs(30);

    fn deadline() -> Deadline {
        Deadline::default_of(BUDGET)
    }

    async fn proxy_for(api: MockClusterApi) -> (ResourceProxy, Arc<ClusterClient>) {
        let pool = pool_with(api);
        let client = pool.acquire(ClusterKey::Default).await.unwrap();
        (ResourceProxy::new(pool), client)
    }

    fn deployment(replicas: i32, resource_version: &str) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "default", "resourceVersion": resource_version},
            "spec": {
                "replicas": replicas,
                "selector": {"matchLabels": {"app": "web"}},
                "template": {"metadata": {"labels": {"app": "web"}}, "spec": {"containers": []}}
            }
        })
    }

    fn conflict() -> UpstreamFailure {
        UpstreamFailure::Status {
            code: 409,
            reason: "Conflict".into(),
            message: "the object has been modified".into(),
        }
    }

    // =========================================================================
    // Read-modify-write
    // =========================================================================

    #[tokio::test]
    async fn scale_writes_replicas_with_read_version() {
        let mut api = MockClusterApi::new();
        api.expect_get()
            .times(1)
            .returning(|_, _| Ok(deployment(1, "41")));
        api.expect_replace()
            .times(1)
            .withf(|scope, name, object| {
                scope.kind == ResourceKind::Deployment
                    && name == "web"
                    && object["spec"]["replicas"] == 5
                    && object["metadata"]["resourceVersion"] == "41"
            })
            .returning(|_, _, object| Ok(object));

        let (proxy, client) = proxy_for(api).await;
        let summary = proxy.scale(&client, deadline(), None, "web", 5).await.unwrap();
        assert_eq!(summary["replicas"], 5);
    }

    #[tokio::test]
    async fn scale_retries_one_conflict() {
        let writes = Arc::new(AtomicUsize::new(0));
        let mut api = MockClusterApi::new();
        api.expect_get()
            .times(2)
            .returning(|_, _| Ok(deployment(1, "41")));
        let seen = writes.clone();
        api.expect_replace().times(2).returning(move |_, _, object| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(conflict())
            } else {
                Ok(object)
            }
        });

        let (proxy, client) = proxy_for(api).await;
        let summary = proxy.scale(&client, deadline(), None, "web", 3).await.unwrap();
        assert_eq!(summary["replicas"], 3);
        assert_eq!(writes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_conflict_is_reported_at_write_step() {
        let mut api = MockClusterApi::new();
        api.expect_get()
            .times(2)
            .returning(|_, _| Ok(deployment(1, "41")));
        api.expect_replace()
            .times(2)
            .returning(|_, _, _| Err(conflict()));

        let (proxy, client) = proxy_for(api).await;
        let err = proxy.scale(&client, deadline(), None, "web", 3).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
        assert_eq!(err.step(), Some("write"));
    }

    #[tokio::test]
    async fn missing_deployment_fails_at_read_step() {
        let mut api = MockClusterApi::new();
        api.expect_get().returning(|_, _| {
            Err(UpstreamFailure::Status {
                code: 404,
                reason: "NotFound".into(),
                message: "deployments.apps \"web\" not found".into(),
            })
        });
        api.expect_replace().never();

        let (proxy, client) = proxy_for(api).await;
        let err = proxy.restart(&client, deadline(), None, "web").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.step(), Some("read"));
    }

    #[tokio::test]
    async fn transport_failure_on_write_names_the_step() {
        let mut api = MockClusterApi::new();
        api.expect_get()
            .times(1)
            .returning(|_, _| Ok(deployment(1, "41")));
        api.expect_replace()
            .times(1)
            .returning(|_, _, _| Err(UpstreamFailure::Transport("connection reset".into())));

        let (proxy, client) = proxy_for(api).await;
        let err = proxy.scale(&client, deadline(), None, "web", 5).await.unwrap_err();
        assert_eq!(err.kind(), "cluster_unreachable");
        assert_eq!(err.step(), Some("write"));
    }

    #[tokio::test]
    async fn transport_failure_on_read_names_the_step() {
        let mut api = MockClusterApi::new();
        api.expect_get()
            .returning(|_, _| Err(UpstreamFailure::Transport("connection reset".into())));
        api.expect_replace().never();

        let (proxy, client) = proxy_for(api).await;
        let err = proxy.restart(&client, deadline(), None, "web").await.unwrap_err();
        assert_eq!(err.kind(), "cluster_unreachable");
        assert_eq!(err.step(), Some("read"));
    }

    /// Delegates to a mock, except that the chosen verb never answers
    struct Stalling {
        inner: MockClusterApi,
        verb: &'static str,
    }

    impl Stalling {
        async fn stall_on(&self, verb: &str) {
            if self.verb == verb {
                std::future::pending::<()>().await;
            }
        }
    }

    #[async_trait]
    impl ClusterApi for Stalling {
        async fn server_version(&self) -> std::result::Result<String, UpstreamFailure> {
            self.inner.server_version().await
        }
        async fn list(
            &self,
            scope: &ResourceScope,
            page: &PageRequest,
        ) -> std::result::Result<ObjectPage, UpstreamFailure> {
            self.inner.list(scope, page).await
        }
        async fn get(
            &self,
            scope: &ResourceScope,
            name: &str,
        ) -> std::result::Result<Value, UpstreamFailure> {
            self.stall_on("get").await;
            self.inner.get(scope, name).await
        }
        async fn create(
            &self,
            scope: &ResourceScope,
            object: Value,
        ) -> std::result::Result<Value, UpstreamFailure> {
            self.inner.create(scope, object).await
        }
        async fn replace(
            &self,
            scope: &ResourceScope,
            name: &str,
            object: Value,
        ) -> std::result::Result<Value, UpstreamFailure> {
            self.stall_on("replace").await;
            self.inner.replace(scope, name, object).await
        }
        async fn delete(
            &self,
            scope: &ResourceScope,
            name: &str,
        ) -> std::result::Result<(), UpstreamFailure> {
            self.inner.delete(scope, name).await
        }
        async fn create_manifest_object(
            &self,
            object: Value,
            default_namespace: &str,
        ) -> std::result::Result<Value, UpstreamFailure> {
            self.inner.create_manifest_object(object, default_namespace).await
        }
        async fn logs(
            &self,
            namespace: &str,
            pod: &str,
            request: &LogRequest,
        ) -> std::result::Result<String, UpstreamFailure> {
            self.inner.logs(namespace, pod, request).await
        }
        async fn exec(
            &self,
            namespace: &str,
            pod: &str,
            request: &ExecRequest,
        ) -> std::result::Result<ShellStream, UpstreamFailure> {
            self.inner.exec(namespace, pod, request).await
        }
    }

    async fn stalling_proxy(verb: &'static str) -> (ResourceProxy, Arc<ClusterClient>) {
        let mut inner = MockClusterApi::new();
        inner
            .expect_server_version()
            .returning(|| Ok("v1.30.2".to_string()));
        inner
            .expect_get()
            .returning(|_, _| Ok(deployment(1, "41")));
        inner.expect_replace().never();
        let pool = Arc::new(ClientPool::new(
            Arc::new(crate::credentials::MemoryRepository::new()),
            Arc::new(crate::testing::FixedFactory::new(Arc::new(Stalling { inner, verb }))),
            crate::pool::PoolConfig::default(),
        ));
        let client = pool.acquire(ClusterKey::Default).await.unwrap();
        (ResourceProxy::new(pool), client)
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_during_read_names_the_step() {
        let (proxy, client) = stalling_proxy("get").await;
        let err = proxy.restart(&client, deadline(), None, "web").await.unwrap_err();
        assert_eq!(err.kind(), "deadline_exceeded");
        assert_eq!(err.step(), Some("read"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_during_write_names_the_step() {
        let (proxy, client) = stalling_proxy("replace").await;
        let err = proxy.scale(&client, deadline(), None, "web", 5).await.unwrap_err();
        assert_eq!(err.kind(), "deadline_exceeded");
        assert_eq!(err.step(), Some("write"));
    }

    #[tokio::test]
    async fn restart_stamps_template_annotation() {
        let mut api = MockClusterApi::new();
        api.expect_get().returning(|_, _| Ok(deployment(2, "7")));
        api.expect_replace()
            .withf(|_, _, object| {
                object
                    .pointer("/spec/template/metadata/annotations")
                    .and_then(|a| a.get(RESTARTED_AT_ANNOTATION))
                    .and_then(Value::as_str)
                    .map(|stamp| chrono::DateTime::parse_from_rfc3339(stamp).is_ok())
                    .unwrap_or(false)
            })
            .returning(|_, _, object| Ok(object));

        let (proxy, client) = proxy_for(api).await;
        proxy.restart(&client, deadline(), None, "web").await.unwrap();
    }

    #[tokio::test]
    async fn negative_replicas_never_reach_upstream() {
        let mut api = MockClusterApi::new();
        api.expect_get().never();
        let (proxy, client) = proxy_for(api).await;
        let err = proxy.scale(&client, deadline(), None, "web", -1).await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[tokio::test]
    async fn secret_update_encodes_values_and_keeps_labels() {
        let mut api = MockClusterApi::new();
        api.expect_get().returning(|_, _| {
            Ok(json!({
                "apiVersion": "v1", "kind": "Secret",
                "metadata": {"name": "db", "namespace": "default", "labels": {"team": "core"}},
                "type": "Opaque",
                "data": {"old": "eA=="}
            }))
        });
        api.expect_replace()
            .withf(|_, _, object| {
                object["data"] == json!({"password": "aHVudGVyMg=="})
                    && object["metadata"]["labels"]["team"] == "core"
            })
            .returning(|_, _, object| Ok(object));

        let (proxy, client) = proxy_for(api).await;
        let write = SecretWrite {
            data: BTreeMap::from([("password".to_string(), "hunter2".to_string())]),
            ..Default::default()
        };
        let summary = proxy.update_secret(&client, deadline(), "db", write).await.unwrap();
        assert_eq!(summary["data"]["password"], "aHVudGVyMg==");
    }

    // =========================================================================
    // Manifests
    // =========================================================================

    #[tokio::test]
    async fn invalid_manifest_makes_no_upstream_call() {
        let mut api = MockClusterApi::new();
        api.expect_create_manifest_object().never();
        let (proxy, client) = proxy_for(api).await;

        let raw = "apiVersion: v1\nkind: Pod\nmetadata:\n  name: ok\n---\napiVersion: v1\nkind: Pod\n";
        let err = proxy
            .create_from_manifest(&client, deadline(), None, raw)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[tokio::test]
    async fn manifest_objects_are_created_in_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut api = MockClusterApi::new();
        let seen = order.clone();
        api.expect_create_manifest_object()
            .times(2)
            .returning(move |mut object, default_ns| {
                seen.lock().push(object["kind"].as_str().unwrap_or_default().to_string());
                if object["kind"] != "Namespace" {
                    object["metadata"]["namespace"] = json!(default_ns);
                }
                Ok(object)
            });
        let (proxy, client) = proxy_for(api).await;

        let raw = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: shop\n---\napiVersion: v1\nkind: Service\nmetadata:\n  name: web\n";
        let created = proxy
            .create_from_manifest(&client, deadline(), Some("shop"), raw)
            .await
            .unwrap();
        assert_eq!(*order.lock(), vec!["Namespace", "Service"]);
        assert_eq!(created[1].namespace, "shop");
        assert_eq!(created[0].namespace, "");
    }

    #[tokio::test]
    async fn failed_document_names_its_step() {
        let mut api = MockClusterApi::new();
        api.expect_create_manifest_object().returning(|object, _| {
            if object["metadata"]["name"] == "second" {
                Err(UpstreamFailure::Status {
                    code: 409,
                    reason: "AlreadyExists".into(),
                    message: "already exists".into(),
                })
            } else {
                Ok(object)
            }
        });
        let (proxy, client) = proxy_for(api).await;

        let raw = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: first\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: second\n";
        let err = proxy
            .create_from_manifest(&client, deadline(), None, raw)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
        assert_eq!(err.kind(), "upstream_error");
        assert_eq!(err.step(), Some("create document 1"));
    }

    // =========================================================================
    // Lists and counts
    // =========================================================================

    #[tokio::test]
    async fn list_uses_default_limit_and_passes_continue_through() {
        let mut api = MockClusterApi::new();
        api.expect_list()
            .withf(|scope, page| {
                scope.namespace.as_deref() == Some("shop")
                    && page.limit == DEFAULT_PAGE_LIMIT
                    && page.continue_token.as_deref() == Some("abc")
            })
            .returning(|_, _| {
                Ok(ObjectPage {
                    items: vec![json!({"metadata": {"name": "settings", "namespace": "shop"}, "data": {"a": "b"}})],
                    continue_token: Some("next".into()),
                    remaining: Some(12),
                })
            });
        let (proxy, client) = proxy_for(api).await;

        let page = proxy
            .list(
                &client,
                deadline(),
                ResourceKind::ConfigMap,
                ListOptions {
                    namespace: Some("shop".into()),
                    continue_token: Some("abc".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.items[0]["data"]["a"], "b");
        assert_eq!(page.continue_token.as_deref(), Some("next"));

        let json = serde_json::to_value(&page).unwrap();
        assert_eq!(json["continue"], "next");
        assert_eq!(json["remaining"], 12);
    }

    #[tokio::test]
    async fn dashboard_counts_each_kind_once() {
        let mut api = MockClusterApi::new();
        api.expect_list().times(7).returning(|scope, page| {
            assert_eq!(page.limit, 0);
            let items = match scope.kind {
                ResourceKind::Pod => vec![
                    json!({"status": {"phase": "Running"}}),
                    json!({"status": {"phase": "Running"}}),
                    json!({"status": {"phase": "Pending"}}),
                    json!({"status": {}}),
                ],
                ResourceKind::Node => vec![json!({}), json!({})],
                ResourceKind::Secret => vec![json!({}); 5],
                _ => vec![json!({})],
            };
            Ok(ObjectPage {
                items,
                ..Default::default()
            })
        });
        let (proxy, client) = proxy_for(api).await;

        let stats = proxy.dashboard_stats(&client, deadline()).await.unwrap();
        assert_eq!(stats.node_count, 2);
        assert_eq!(stats.pod_count, 4);
        assert_eq!(stats.secret_count, 5);
        assert_eq!(stats.namespace_count, 1);
        assert_eq!(
            stats.pod_status_stats,
            PodPhaseStats {
                running: 2,
                pending: 1,
                unknown: 1,
                ..Default::default()
            }
        );
    }

    // =========================================================================
    // Failure classification
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_cancels_the_call() {
        let (proxy, client) = proxy_for(MockClusterApi::new()).await;
        let budget = Budget::start(Deadline::default_of(Duration::from_secs(2)));
        let err = proxy
            .call::<(), _>(&client, &budget, "get", None, std::future::pending())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "deadline_exceeded");
        assert_eq!(err.status_code(), 504);
    }

    #[tokio::test]
    async fn repeated_transport_failures_drop_the_client() {
        let mut api = MockClusterApi::new();
        api.expect_get()
            .returning(|_, _| Err(UpstreamFailure::Transport("connection reset".into())));
        let pool = pool_with(api);
        let client = pool.acquire(ClusterKey::Default).await.unwrap();
        let proxy = ResourceProxy::new(pool.clone());

        for _ in 0..3 {
            let err = proxy
                .get(&client, deadline(), ResourceKind::Pod, None, "web-0")
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "cluster_unreachable");
        }
        assert_eq!(pool.cached(), 0);
    }

    // =========================================================================
    // Exec and stream targets
    // =========================================================================

    struct NullInput;

    #[async_trait]
    impl ShellInput for NullInput {
        async fn write(&mut self, _data: Vec<u8>) -> std::result::Result<(), String> {
            Ok(())
        }
        async fn resize(&mut self, _width: u16, _height: u16) {}
        async fn close(&mut self) {}
    }

    #[tokio::test]
    async fn exec_collects_both_streams_and_exit() {
        let mut api = MockClusterApi::new();
        api.expect_exec()
            .withf(|ns, pod, req| ns == "default" && pod == "web-0" && !req.tty && req.command == ["ls", "/missing"])
            .returning(|_, _, _| {
                let (tx, rx) = mpsc::channel(4);
                tx.try_send(ShellOutput { stream: OutputStream::Stdout, data: b"a\n".to_vec() }).unwrap();
                tx.try_send(ShellOutput { stream: OutputStream::Stderr, data: b"no such file\n".to_vec() }).unwrap();
                drop(tx);
                Ok(ShellStream {
                    input: Box::new(NullInput),
                    output: rx,
                    exit: async {
                        ExitStatus { success: false, code: Some(2), message: Some("exit 2".into()) }
                    }
                    .boxed(),
                })
            });
        let (proxy, client) = proxy_for(api).await;

        let output = proxy
            .exec_command(
                &client,
                deadline(),
                None,
                "web-0",
                None,
                vec!["ls".into(), "/missing".into()],
            )
            .await
            .unwrap();
        assert_eq!(output.stdout, "a\n");
        assert_eq!(output.stderr, "no such file\n");
        assert!(!output.success);
        assert_eq!(output.exit_code, Some(2));
    }

    fn pod(phase: &str) -> Value {
        json!({
            "metadata": {"name": "web-0", "namespace": "default"},
            "spec": {"containers": [{"name": "app"}, {"name": "sidecar"}]},
            "status": {"phase": phase}
        })
    }

    #[tokio::test]
    async fn pod_target_defaults_to_first_container() {
        let mut api = MockClusterApi::new();
        api.expect_get().returning(|_, _| Ok(pod("Running")));
        let (proxy, client) = proxy_for(api).await;

        let container = proxy
            .validate_pod_target(&client, deadline(), "default", "web-0", None)
            .await
            .unwrap();
        assert_eq!(container, "app");

        let container = proxy
            .validate_pod_target(&client, deadline(), "default", "web-0", Some("sidecar"))
            .await
            .unwrap();
        assert_eq!(container, "sidecar");

        let err = proxy
            .validate_pod_target(&client, deadline(), "default", "web-0", Some("db"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[tokio::test]
    async fn pending_pod_is_not_a_terminal_target() {
        let mut api = MockClusterApi::new();
        api.expect_get().returning(|_, _| Ok(pod("Pending")));
        let (proxy, client) = proxy_for(api).await;

        let err = proxy
            .validate_pod_target(&client, deadline(), "default", "web-0", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Pending"));
    }

    #[tokio::test]
    async fn node_without_internal_ip_is_rejected() {
        let mut api = MockClusterApi::new();
        api.expect_get().returning(|_, name| {
            let addresses = if name == "worker-1" {
                json!([{"type": "InternalIP", "address": "192.168.1.11"}])
            } else {
                json!([{"type": "Hostname", "address": "edge"}])
            };
            Ok(json!({"metadata": {"name": name}, "status": {"addresses": addresses}}))
        });
        let (proxy, client) = proxy_for(api).await;

        let ip = proxy.node_address(&client, deadline(), "worker-1").await.unwrap();
        assert_eq!(ip, "192.168.1.11");
        let err = proxy.node_address(&client, deadline(), "edge").await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }
}

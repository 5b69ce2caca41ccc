//! Version-independent resource summaries
//!
//! Raw objects from the cluster are decoded into the k8s-openapi types and
//! flattened into the shapes the UI consumes. Fields the object doesn't set
//! come out empty rather than missing.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Container, Namespace, Node, Pod, Secret, Service};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::upstream::{ResourceKind, UpstreamFailure};

/// Timestamp format used in summaries
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Metadata common to every summary
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceMeta {
    /// Object name
    pub name: String,
    /// Namespace; empty for cluster-scoped objects
    pub namespace: String,
    /// Labels
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Creation time, formatted
    pub creation_timestamp: String,
    /// Resource version
    pub resource_version: String,
}

impl ResourceMeta {
    fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            labels: meta.labels.clone().unwrap_or_default(),
            annotations: meta.annotations.clone().unwrap_or_default(),
            creation_timestamp: meta
                .creation_timestamp
                .as_ref()
                .map(|t| format_time(&t.0))
                .unwrap_or_default(),
            resource_version: meta.resource_version.clone().unwrap_or_default(),
        }
    }
}

/// Status condition of a pod or node
#[derive(Debug, Clone, Serialize)]
pub struct ConditionInfo {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,
    /// True, False or Unknown
    pub status: String,
    /// Machine-readable reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Requests and limits of one container
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceUsage {
    /// CPU request
    pub cpu_request: String,
    /// Memory request
    pub memory_request: String,
    /// CPU limit
    pub cpu_limit: String,
    /// Memory limit
    pub memory_limit: String,
}

/// One container of a pod
#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    /// Container name
    pub name: String,
    /// Image reference
    pub image: String,
    /// Readiness
    pub ready: bool,
    /// Restart count
    pub restart_count: i32,
    /// `Running`, `Waiting: <reason>` or `Terminated: <reason>`
    pub state: String,
    /// Requests and limits
    pub resources: ResourceUsage,
}

/// Pod summary
#[derive(Debug, Clone, Serialize)]
pub struct PodInfo {
    /// Metadata
    #[serde(flatten)]
    pub meta: ResourceMeta,
    /// Pod phase
    pub status: String,
    /// Pod IP
    pub pod_ip: String,
    /// Node the pod runs on
    pub node_name: String,
    /// Containers in spec order
    pub containers: Vec<ContainerInfo>,
    /// Pod conditions
    pub conditions: Vec<ConditionInfo>,
}

/// Deployment summary
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentInfo {
    /// Metadata
    #[serde(flatten)]
    pub meta: ResourceMeta,
    /// Desired replicas
    pub replicas: i32,
    /// Ready replicas
    pub ready_replicas: i32,
    /// Replicas at the current template
    pub updated_replicas: i32,
    /// Available replicas
    pub available_replicas: i32,
    /// Rollout strategy type
    pub strategy: String,
}

/// One service port
#[derive(Debug, Clone, Serialize)]
pub struct ServicePortInfo {
    /// Port name
    pub name: String,
    /// Protocol
    pub protocol: String,
    /// Service port
    pub port: i32,
    /// Target port, number or name
    pub target_port: String,
    /// Node port, if allocated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,
}

/// Service summary
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    /// Metadata
    #[serde(flatten)]
    pub meta: ResourceMeta,
    /// Service type
    #[serde(rename = "type")]
    pub type_: String,
    /// Cluster IP
    pub cluster_ip: String,
    /// External IPs
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub external_ip: Vec<String>,
    /// Ports
    pub ports: Vec<ServicePortInfo>,
    /// Pod selector
    pub selector: BTreeMap<String, String>,
}

/// CPU, memory and pod count of a node
#[derive(Debug, Clone, Default, Serialize)]
pub struct CapacityInfo {
    /// CPU
    pub cpu: String,
    /// Memory
    pub memory: String,
    /// Pod slots
    pub pods: String,
}

/// Node summary
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    /// Metadata
    #[serde(flatten)]
    pub meta: ResourceMeta,
    /// `Ready`, `NotReady` or `Unknown`
    pub status: String,
    /// InternalIP address
    pub internal_ip: String,
    /// OS image
    pub os_image: String,
    /// Kubelet version
    pub kubelet_version: String,
    /// Container runtime version
    pub container_runtime: String,
    /// Total capacity
    pub capacity: CapacityInfo,
    /// Allocatable capacity
    pub allocatable: CapacityInfo,
    /// Node conditions
    pub conditions: Vec<ConditionInfo>,
}

/// Namespace summary
#[derive(Debug, Clone, Serialize)]
pub struct NamespaceInfo {
    /// Name
    pub name: String,
    /// Phase
    pub status: String,
    /// Age, e.g. `3d`
    pub age: String,
}

/// ConfigMap summary
#[derive(Debug, Clone, Serialize)]
pub struct ConfigMapInfo {
    /// Metadata
    #[serde(flatten)]
    pub meta: ResourceMeta,
    /// Data entries
    pub data: BTreeMap<String, String>,
}

/// Secret summary
#[derive(Debug, Clone, Serialize)]
pub struct SecretInfo {
    /// Metadata
    #[serde(flatten)]
    pub meta: ResourceMeta,
    /// Secret type
    #[serde(rename = "type")]
    pub type_: String,
    /// Values, base64 unless decoded
    pub data: BTreeMap<String, String>,
}

/// Format a timestamp for summaries
pub fn format_time(time: &DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// Coarse age: `< 1m`, `5m`, `3h`, `2d`, `1w`, `4mon`, `2y`
pub fn format_age(created: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let age = now.signed_duration_since(created);
    let minutes = age.num_minutes();
    let hours = age.num_hours();
    let days = age.num_days();

    if minutes < 1 {
        "< 1m".to_string()
    } else if hours < 1 {
        format!("{}m", minutes)
    } else if days < 1 {
        format!("{}h", hours)
    } else if days < 7 {
        format!("{}d", days)
    } else if days < 30 {
        format!("{}w", days / 7)
    } else if days < 365 {
        format!("{}mon", days / 30)
    } else {
        format!("{}y", days / 365)
    }
}

fn quantity(map: Option<&BTreeMap<String, Quantity>>, key: &str) -> String {
    map.and_then(|m| m.get(key))
        .map(|q| q.0.clone())
        .unwrap_or_default()
}

fn container_info(container: &Container, pod: &Pod) -> ContainerInfo {
    let status = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|cs| cs.name == container.name));

    let state = status
        .and_then(|cs| cs.state.as_ref())
        .map(|state| {
            if state.running.is_some() {
                "Running".to_string()
            } else if let Some(waiting) = &state.waiting {
                format!("Waiting: {}", waiting.reason.as_deref().unwrap_or_default())
            } else if let Some(terminated) = &state.terminated {
                format!(
                    "Terminated: {}",
                    terminated.reason.as_deref().unwrap_or_default()
                )
            } else {
                String::new()
            }
        })
        .unwrap_or_default();

    let requests = container.resources.as_ref().and_then(|r| r.requests.as_ref());
    let limits = container.resources.as_ref().and_then(|r| r.limits.as_ref());

    ContainerInfo {
        name: container.name.clone(),
        image: container.image.clone().unwrap_or_default(),
        ready: status.map(|cs| cs.ready).unwrap_or(false),
        restart_count: status.map(|cs| cs.restart_count).unwrap_or(0),
        state,
        resources: ResourceUsage {
            cpu_request: quantity(requests, "cpu"),
            memory_request: quantity(requests, "memory"),
            cpu_limit: quantity(limits, "cpu"),
            memory_limit: quantity(limits, "memory"),
        },
    }
}

/// Summarize a pod
pub fn pod_info(pod: &Pod) -> PodInfo {
    let status = pod.status.as_ref();
    let spec = pod.spec.as_ref();
    PodInfo {
        meta: ResourceMeta::from_meta(&pod.metadata),
        status: status.and_then(|s| s.phase.clone()).unwrap_or_default(),
        pod_ip: status.and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
        node_name: spec.and_then(|s| s.node_name.clone()).unwrap_or_default(),
        containers: spec
            .map(|s| s.containers.iter().map(|c| container_info(c, pod)).collect())
            .unwrap_or_default(),
        conditions: status
            .and_then(|s| s.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .map(|c| ConditionInfo {
                        type_: c.type_.clone(),
                        status: c.status.clone(),
                        reason: c.reason.clone(),
                        message: c.message.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// Summarize a deployment
pub fn deployment_info(deployment: &Deployment) -> DeploymentInfo {
    let status = deployment.status.as_ref();
    let spec = deployment.spec.as_ref();
    DeploymentInfo {
        meta: ResourceMeta::from_meta(&deployment.metadata),
        replicas: spec.and_then(|s| s.replicas).unwrap_or(1),
        ready_replicas: status.and_then(|s| s.ready_replicas).unwrap_or(0),
        updated_replicas: status.and_then(|s| s.updated_replicas).unwrap_or(0),
        available_replicas: status.and_then(|s| s.available_replicas).unwrap_or(0),
        strategy: spec
            .and_then(|s| s.strategy.as_ref())
            .and_then(|s| s.type_.clone())
            .unwrap_or_default(),
    }
}

/// Summarize a service
pub fn service_info(service: &Service) -> ServiceInfo {
    let spec = service.spec.as_ref();
    ServiceInfo {
        meta: ResourceMeta::from_meta(&service.metadata),
        type_: spec.and_then(|s| s.type_.clone()).unwrap_or_default(),
        cluster_ip: spec.and_then(|s| s.cluster_ip.clone()).unwrap_or_default(),
        external_ip: spec.and_then(|s| s.external_ips.clone()).unwrap_or_default(),
        ports: spec
            .and_then(|s| s.ports.as_ref())
            .map(|ports| {
                ports
                    .iter()
                    .map(|p| ServicePortInfo {
                        name: p.name.clone().unwrap_or_default(),
                        protocol: p.protocol.clone().unwrap_or_default(),
                        port: p.port,
                        target_port: match &p.target_port {
                            Some(IntOrString::Int(port)) => port.to_string(),
                            Some(IntOrString::String(name)) => name.clone(),
                            None => String::new(),
                        },
                        node_port: p.node_port,
                    })
                    .collect()
            })
            .unwrap_or_default(),
        selector: spec.and_then(|s| s.selector.clone()).unwrap_or_default(),
    }
}

/// InternalIP of a node, if it reports one
pub fn node_internal_ip(node: &Node) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == "InternalIP")
        .map(|a| a.address.clone())
}

/// Summarize a node
pub fn node_info(node: &Node) -> NodeInfo {
    let status = node.status.as_ref();
    let conditions = status.and_then(|s| s.conditions.as_ref());
    let ready = conditions
        .and_then(|cs| cs.iter().find(|c| c.type_ == "Ready"))
        .map(|c| if c.status == "True" { "Ready" } else { "NotReady" })
        .unwrap_or("Unknown");
    let system = status.and_then(|s| s.node_info.as_ref());
    let capacity = |map: Option<&BTreeMap<String, Quantity>>| CapacityInfo {
        cpu: quantity(map, "cpu"),
        memory: quantity(map, "memory"),
        pods: quantity(map, "pods"),
    };

    NodeInfo {
        meta: ResourceMeta::from_meta(&node.metadata),
        status: ready.to_string(),
        internal_ip: node_internal_ip(node).unwrap_or_default(),
        os_image: system.map(|i| i.os_image.clone()).unwrap_or_default(),
        kubelet_version: system.map(|i| i.kubelet_version.clone()).unwrap_or_default(),
        container_runtime: system
            .map(|i| i.container_runtime_version.clone())
            .unwrap_or_default(),
        capacity: capacity(status.and_then(|s| s.capacity.as_ref())),
        allocatable: capacity(status.and_then(|s| s.allocatable.as_ref())),
        conditions: conditions
            .map(|cs| {
                cs.iter()
                    .map(|c| ConditionInfo {
                        type_: c.type_.clone(),
                        status: c.status.clone(),
                        reason: c.reason.clone(),
                        message: c.message.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// Summarize a namespace
pub fn namespace_info(namespace: &Namespace, now: DateTime<Utc>) -> NamespaceInfo {
    NamespaceInfo {
        name: namespace.metadata.name.clone().unwrap_or_default(),
        status: namespace
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_default(),
        age: namespace
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| format_age(t.0, now))
            .unwrap_or_default(),
    }
}

/// Summarize a configmap
pub fn configmap_info(configmap: &ConfigMap) -> ConfigMapInfo {
    ConfigMapInfo {
        meta: ResourceMeta::from_meta(&configmap.metadata),
        data: configmap.data.clone().unwrap_or_default(),
    }
}

/// Summarize a secret; values stay base64 unless `decode` is set
pub fn secret_info(secret: &Secret, decode: bool) -> SecretInfo {
    let data = secret
        .data
        .as_ref()
        .map(|data| {
            data.iter()
                .map(|(key, value)| {
                    let rendered = if decode {
                        String::from_utf8_lossy(&value.0).into_owned()
                    } else {
                        STANDARD.encode(&value.0)
                    };
                    (key.clone(), rendered)
                })
                .collect()
        })
        .unwrap_or_default();

    SecretInfo {
        meta: ResourceMeta::from_meta(&secret.metadata),
        type_: secret.type_.clone().unwrap_or_default(),
        data,
    }
}

/// Decode a raw object into a typed resource
pub fn decode<T: DeserializeOwned>(object: Value) -> Result<T, UpstreamFailure> {
    serde_json::from_value(object).map_err(|e| UpstreamFailure::Decode(e.to_string()))
}

fn render<T: Serialize>(summary: T) -> Result<Value, UpstreamFailure> {
    serde_json::to_value(summary).map_err(|e| UpstreamFailure::Decode(e.to_string()))
}

/// Summarize a raw object of a known kind
pub fn summarize(kind: ResourceKind, object: Value, now: DateTime<Utc>) -> Result<Value, UpstreamFailure> {
    match kind {
        ResourceKind::Pod => render(pod_info(&decode(object)?)),
        ResourceKind::Deployment => render(deployment_info(&decode(object)?)),
        ResourceKind::Service => render(service_info(&decode(object)?)),
        ResourceKind::Node => render(node_info(&decode(object)?)),
        ResourceKind::Namespace => render(namespace_info(&decode(object)?, now)),
        ResourceKind::ConfigMap => render(configmap_info(&decode(object)?)),
        ResourceKind::Secret => render(secret_info(&decode(object)?, false)),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn age_buckets() {
        let created = at(0);
        let cases = [
            (Duration::seconds(30), "< 1m"),
            (Duration::minutes(5), "5m"),
            (Duration::hours(3), "3h"),
            (Duration::days(2), "2d"),
            (Duration::days(15), "2w"),
            (Duration::days(95), "3mon"),
            (Duration::days(800), "2y"),
        ];
        for (elapsed, expected) in cases {
            assert_eq!(format_age(created, created + elapsed), expected);
        }
    }

    #[test]
    fn pod_summary_merges_spec_and_status() {
        let pod = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "web-0",
                "namespace": "shop",
                "creationTimestamp": "2024-03-01T10:20:30Z",
                "resourceVersion": "42"
            },
            "spec": {
                "nodeName": "worker-1",
                "containers": [
                    {
                        "name": "app",
                        "image": "nginx:1.25",
                        "resources": {"requests": {"cpu": "100m"}, "limits": {"memory": "256Mi"}}
                    },
                    {"name": "sidecar", "image": "envoy"}
                ]
            },
            "status": {
                "phase": "Running",
                "podIP": "10.244.1.7",
                "containerStatuses": [
                    {
                        "name": "app", "ready": true, "restartCount": 2, "image": "nginx:1.25",
                        "imageID": "", "state": {"running": {}}
                    },
                    {
                        "name": "sidecar", "ready": false, "restartCount": 0, "image": "envoy",
                        "imageID": "", "state": {"waiting": {"reason": "CrashLoopBackOff"}}
                    }
                ],
                "conditions": [{"type": "Ready", "status": "False", "reason": "ContainersNotReady"}]
            }
        });

        let summary = summarize(ResourceKind::Pod, pod, Utc::now()).unwrap();
        assert_eq!(summary["name"], "web-0");
        assert_eq!(summary["creation_timestamp"], "2024-03-01 10:20:30");
        assert_eq!(summary["status"], "Running");
        assert_eq!(summary["node_name"], "worker-1");
        assert_eq!(summary["containers"][0]["state"], "Running");
        assert_eq!(summary["containers"][0]["restart_count"], 2);
        assert_eq!(summary["containers"][0]["resources"]["cpu_request"], "100m");
        assert_eq!(summary["containers"][0]["resources"]["memory_limit"], "256Mi");
        assert_eq!(summary["containers"][1]["state"], "Waiting: CrashLoopBackOff");
        assert_eq!(summary["conditions"][0]["reason"], "ContainersNotReady");
    }

    #[test]
    fn service_ports_render_named_targets() {
        let svc = json!({
            "metadata": {"name": "web", "namespace": "default"},
            "spec": {
                "type": "NodePort",
                "clusterIP": "10.96.0.10",
                "selector": {"app": "web"},
                "ports": [
                    {"name": "http", "protocol": "TCP", "port": 80, "targetPort": "http", "nodePort": 30080},
                    {"port": 443, "targetPort": 8443}
                ]
            }
        });
        let summary = summarize(ResourceKind::Service, svc, Utc::now()).unwrap();
        assert_eq!(summary["type"], "NodePort");
        assert_eq!(summary["ports"][0]["target_port"], "http");
        assert_eq!(summary["ports"][0]["node_port"], 30080);
        assert_eq!(summary["ports"][1]["target_port"], "8443");
        assert!(summary["ports"][1].get("node_port").is_none());
    }

    #[test]
    fn node_summary_reports_readiness_and_ip() {
        let node: Node = decode(json!({
            "metadata": {"name": "worker-1"},
            "status": {
                "addresses": [
                    {"type": "Hostname", "address": "worker-1"},
                    {"type": "InternalIP", "address": "192.168.1.11"}
                ],
                "capacity": {"cpu": "4", "memory": "16Gi", "pods": "110"},
                "conditions": [{"type": "Ready", "status": "True"}]
            }
        }))
        .unwrap();
        let info = node_info(&node);
        assert_eq!(info.status, "Ready");
        assert_eq!(info.internal_ip, "192.168.1.11");
        assert_eq!(info.capacity.pods, "110");
        assert_eq!(info.allocatable.cpu, "");
    }

    #[test]
    fn secret_values_are_encoded_unless_decoding() {
        let secret: Secret = decode(json!({
            "metadata": {"name": "db", "namespace": "default"},
            "type": "Opaque",
            "data": {"password": "aHVudGVyMg=="}
        }))
        .unwrap();
        assert_eq!(secret_info(&secret, false).data["password"], "aHVudGVyMg==");
        assert_eq!(secret_info(&secret, true).data["password"], "hunter2");
    }

    #[test]
    fn namespace_age_uses_creation_time() {
        let ns: Namespace = decode(json!({
            "metadata": {"name": "shop", "creationTimestamp": "2024-01-01T00:00:00Z"},
            "status": {"phase": "Active"}
        }))
        .unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 5, 0, 0).unwrap();
        let info = namespace_info(&ns, now);
        assert_eq!(info.status, "Active");
        assert_eq!(info.age, "5h");
    }

    #[test]
    fn undecodable_objects_are_decode_failures() {
        let err = summarize(ResourceKind::Pod, json!({"spec": "nope"}), Utc::now()).unwrap_err();
        assert!(matches!(err, UpstreamFailure::Decode(_)));
    }
}

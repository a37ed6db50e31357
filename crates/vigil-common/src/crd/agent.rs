//! DesiredAgent Custom Resource Definition
//!
//! A DesiredAgent declares which monitoring workloads should run in the
//! cluster: a node-level agent daemon, a cluster agent, cluster-checks
//! runners and OpenTelemetry gateways. Optional capabilities are switched on
//! in `spec.features`; per-component tweaks live in `spec.override` and are
//! always applied last.
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: agent.vigil.dev/v1alpha1
//! kind: DesiredAgent
//! metadata:
//!   name: agent
//!   namespace: monitoring
//! spec:
//!   global:
//!     site: eu1.vigil.io
//!     credentials:
//!       secretRef:
//!         name: agent-keys
//!   features:
//!     logCollection:
//!       enabled: true
//!     clusterChecks:
//!       enabled: true
//!       useClusterChecksRunners: true
//!   override:
//!     clusterAgent:
//!       replicas: 2
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Affinity, EnvVar, ResourceRequirements, Toleration, Volume, VolumeMount,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use crate::Error;

// =============================================================================
// Components
// =============================================================================

/// Fixed set of top-level workload roles
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "camelCase")]
pub enum ComponentName {
    /// Per-node agent daemon
    NodeAgent,
    /// Cluster-level agent deployment
    ClusterAgent,
    /// Runners executing cluster checks dispatched by the cluster agent
    ClusterChecksRunner,
    /// OpenTelemetry gateway built on the agent distribution
    OtelAgentGateway,
    /// Upstream OpenTelemetry collector gateway
    OtelCollectorGateway,
}

impl ComponentName {
    /// Every component, in registration order
    pub const ALL: [ComponentName; 5] = [
        ComponentName::NodeAgent,
        ComponentName::ClusterAgent,
        ComponentName::ClusterChecksRunner,
        ComponentName::OtelAgentGateway,
        ComponentName::OtelCollectorGateway,
    ];

    /// Name as it appears in `spec.override`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NodeAgent => "nodeAgent",
            Self::ClusterAgent => "clusterAgent",
            Self::ClusterChecksRunner => "clusterChecksRunner",
            Self::OtelAgentGateway => "otelAgentGateway",
            Self::OtelCollectorGateway => "otelCollectorGateway",
        }
    }

    /// Suffix appended to the DesiredAgent name to build workload names,
    /// also used as the component label value
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::NodeAgent => "agent",
            Self::ClusterAgent => "cluster-agent",
            Self::ClusterChecksRunner => "cluster-checks-runner",
            Self::OtelAgentGateway => "otel-agent-gateway",
            Self::OtelCollectorGateway => "otel-collector-gateway",
        }
    }

    /// Condition type recording this component's last reconcile outcome
    pub fn condition_type(&self) -> String {
        let name = self.as_str();
        let mut chars = name.chars();
        match chars.next() {
            Some(first) => format!("{}{}Reconcile", first.to_ascii_uppercase(), chars.as_str()),
            None => "Reconcile".to_string(),
        }
    }
}

impl std::fmt::Display for ComponentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Global configuration
// =============================================================================

/// Node agent container layout
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ContainerStrategy {
    /// One container per agent process
    #[default]
    Optimized,
    /// Every agent process runs in a single container
    Single,
}

/// Reference to a Secret holding API credentials
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsSecretRef {
    /// Secret name, in the DesiredAgent namespace
    pub name: String,
    /// Key holding the API key
    #[serde(default = "default_api_key_key")]
    pub api_key_key: String,
    /// Key holding the application key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_key_key: Option<String>,
}

fn default_api_key_key() -> String {
    "api-key".to_string()
}

/// API credentials, given inline or by Secret reference
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// Inline API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Inline application key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_key: Option<String>,
    /// Secret reference, preferred over inline keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<CredentialsSecretRef>,
}

/// FIPS proxy sidecar configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FipsConfig {
    /// Inject the FIPS proxy sidecar into every component
    #[serde(default)]
    pub enabled: bool,
    /// Proxy image (defaults to `<registry>/fips-proxy:<tag>`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// First local port the proxy listens on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

/// Kubelet connection settings for the node agent
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeletConfig {
    /// Path of the kubelet CA on the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ca_path: Option<String>,
    /// Path the CA is mounted at inside the agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_ca_path: Option<String>,
    /// Verify the kubelet TLS certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_verify: Option<bool>,
}

/// Settings shared by every component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    /// Intake site (e.g. `vigil.io`, `eu1.vigil.io`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    /// Image registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    /// Name reported for this cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    /// API credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    /// Tags attached to all emitted data
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// FIPS proxy sidecar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fips: Option<FipsConfig>,
    /// Kubelet connection settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubelet: Option<KubeletConfig>,
    /// Host path of the container runtime socket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cri_socket_path: Option<String>,
    /// Agent log level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    /// Node agent container layout
    #[serde(default)]
    pub container_strategy: ContainerStrategy,
    /// Shared token between node agents and the cluster agent.
    ///
    /// Generated and persisted in status when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_agent_token: Option<String>,
}

// =============================================================================
// Features
// =============================================================================

/// Toggle-only feature block
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeatureToggle {
    /// Enable the feature
    #[serde(default)]
    pub enabled: bool,
}

/// Log collection
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogCollectionFeature {
    /// Enable log collection
    #[serde(default)]
    pub enabled: bool,
    /// Collect logs from every container, not only annotated ones
    #[serde(default)]
    pub container_collect_all: bool,
}

/// Trace intake
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApmFeature {
    /// Enable the trace agent
    #[serde(default)]
    pub enabled: bool,
    /// Host port to expose the trace intake on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<i32>,
}

/// Admission controller served by the cluster agent
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionControllerFeature {
    /// Enable the admission controller
    #[serde(default)]
    pub enabled: bool,
    /// Mutate pods that do not carry the opt-in label
    #[serde(default)]
    pub mutate_unlabelled: bool,
}

/// Cluster state metrics
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeStateMetricsCoreFeature {
    /// Enable the check
    #[serde(default)]
    pub enabled: bool,
    /// Run the check through cluster checks instead of inside the cluster agent
    #[serde(default)]
    pub collect_via_cluster_checks: bool,
}

/// Cluster checks dispatching
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterChecksFeature {
    /// Enable cluster checks
    #[serde(default)]
    pub enabled: bool,
    /// Dispatch to dedicated runners instead of node agents
    #[serde(default)]
    pub use_cluster_checks_runners: bool,
}

/// Every optional capability, one block per feature
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeaturesConfig {
    /// Log collection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_collection: Option<LogCollectionFeature>,
    /// Trace intake
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apm: Option<ApmFeature>,
    /// Live process collection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_processes: Option<FeatureToggle>,
    /// Admission controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admission_controller: Option<AdmissionControllerFeature>,
    /// Kubernetes event collection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_collection: Option<FeatureToggle>,
    /// Cluster state metrics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_state_metrics_core: Option<KubeStateMetricsCoreFeature>,
    /// Cluster checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_checks: Option<ClusterChecksFeature>,
    /// OpenTelemetry collector inside the node agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otel_collector: Option<FeatureToggle>,
    /// OpenTelemetry agent gateway deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otel_agent_gateway: Option<FeatureToggle>,
    /// OpenTelemetry collector gateway deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otel_collector_gateway: Option<FeatureToggle>,
}

// =============================================================================
// Overrides
// =============================================================================

/// Image override
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageOverride {
    /// Image name, or a full reference when it contains `:` or `@`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Image tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// Per-container override
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOverride {
    /// Extra or replacement environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    /// Resource requests and limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    /// Extra or replacement volume mounts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    /// Replacement arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
}

/// User override for one component, applied after every feature
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentOverride {
    /// Disable the component regardless of what features require
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
    /// Replacement workload name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Replica count (deployments only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Image override, applied to the component's main containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageOverride>,
    /// Environment variables added to every container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    /// Extra or replacement volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    /// Affinity, merged over the computed one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    /// Node selector
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    /// Tolerations, replacing computed ones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,
    /// Priority class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
    /// Pod template labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Pod template annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Per-container overrides keyed by container name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub containers: BTreeMap<String, ContainerOverride>,
}

impl ComponentOverride {
    /// True when the override explicitly disables the component
    pub fn is_disabled(&self) -> bool {
        self.disabled == Some(true)
    }
}

// =============================================================================
// DesiredAgent
// =============================================================================

/// Specification for a DesiredAgent
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "agent.vigil.dev",
    version = "v1alpha1",
    kind = "DesiredAgent",
    plural = "desiredagents",
    shortname = "dagent",
    namespaced,
    status = "DesiredAgentStatus",
    printcolumn = r#"{"name":"Agent","type":"string","jsonPath":".status.agent.status"}"#,
    printcolumn = r#"{"name":"Cluster-Agent","type":"string","jsonPath":".status.clusterAgent.status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DesiredAgentSpec {
    /// Settings shared by every component
    #[serde(default)]
    pub global: GlobalConfig,

    /// Optional capabilities
    #[serde(default)]
    pub features: FeaturesConfig,

    /// Per-component overrides, applied last
    #[serde(default, rename = "override", skip_serializing_if = "BTreeMap::is_empty")]
    pub override_: BTreeMap<ComponentName, ComponentOverride>,
}

impl DesiredAgentSpec {
    /// Override for a component, if any
    pub fn override_for(&self, component: ComponentName) -> Option<&ComponentOverride> {
        self.override_.get(&component)
    }

    /// True when the user explicitly disabled the component
    pub fn is_disabled_by_override(&self, component: ComponentName) -> bool {
        self.override_for(component)
            .is_some_and(ComponentOverride::is_disabled)
    }

    /// Validate the spec before anything is applied.
    ///
    /// `resource` is the `namespace/name` used in error messages.
    pub fn validate(&self, resource: &str) -> Result<(), Error> {
        let credentials = self.global.credentials.as_ref().ok_or_else(|| {
            Error::validation_for_field(
                resource,
                "spec.global.credentials",
                "credentials are required",
            )
        })?;

        let inline_key = credentials
            .api_key
            .as_deref()
            .is_some_and(|k| !k.trim().is_empty());
        let secret_key = credentials
            .secret_ref
            .as_ref()
            .is_some_and(|s| !s.name.is_empty() && !s.api_key_key.is_empty());
        if !inline_key && !secret_key {
            return Err(Error::validation_for_field(
                resource,
                "spec.global.credentials",
                "an API key must be set inline or through secretRef",
            ));
        }

        for (component, ovr) in &self.override_ {
            if let Some(replicas) = ovr.replicas {
                if replicas < 0 {
                    return Err(Error::validation_for_field(
                        resource,
                        format!("spec.override.{}.replicas", component),
                        format!("replicas must be non-negative, got {}", replicas),
                    ));
                }
                if *component == ComponentName::NodeAgent {
                    return Err(Error::validation_for_field(
                        resource,
                        "spec.override.nodeAgent.replicas",
                        "replicas cannot be set on the node agent",
                    ));
                }
            }
            if ovr.name.as_deref().is_some_and(str::is_empty) {
                return Err(Error::validation_for_field(
                    resource,
                    format!("spec.override.{}.name", component),
                    "name override cannot be empty",
                ));
            }
        }

        if let Some(apm) = &self.features.apm {
            if let Some(port) = apm.host_port {
                if !(1..=65535).contains(&port) {
                    return Err(Error::validation_for_field(
                        resource,
                        "spec.features.apm.hostPort",
                        format!("port {} out of range", port),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Observed state of one managed workload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    /// Workload name
    pub name: String,
    /// Workload kind (DaemonSet, Deployment, ExtendedDaemonSet)
    pub kind: String,
    /// Desired pods (or scheduled nodes for daemons)
    #[serde(default)]
    pub desired: i32,
    /// Current pods
    #[serde(default)]
    pub current: i32,
    /// Ready pods
    #[serde(default)]
    pub ready: i32,
    /// Available pods
    #[serde(default)]
    pub available: i32,
    /// Pods running the latest template
    #[serde(default)]
    pub up_to_date: i32,
    /// Short state (Progressing, Running, Updating, Failed)
    #[serde(default)]
    pub state: String,
    /// Human-readable summary, e.g. `Running (3/3/3)`
    #[serde(default)]
    pub status: String,
    /// Content hash of the applied spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_hash: Option<String>,
    /// Last time this block changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

/// Status of a DesiredAgent
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DesiredAgentStatus {
    /// Per-component, override-conflict and reconcile-error conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Combined node agent status across every daemon workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<WorkloadStatus>,

    /// Node agent status per daemon workload (profile/provider)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agent_list: Vec<WorkloadStatus>,

    /// Cluster agent deployment status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_agent: Option<WorkloadStatus>,

    /// Cluster-checks runner deployment status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_checks_runner: Option<WorkloadStatus>,

    /// OpenTelemetry agent gateway status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otel_agent_gateway: Option<WorkloadStatus>,

    /// OpenTelemetry collector gateway status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otel_collector_gateway: Option<WorkloadStatus>,

    /// Generated cluster agent token, reused across reconciles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_agent_token: Option<String>,

    /// Generation observed by the last reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl DesiredAgentStatus {
    /// Status slot of a deployment-backed component.
    ///
    /// The node agent is tracked through `agent`/`agent_list` instead and
    /// maps to `agent` here.
    pub fn component_mut(&mut self, component: ComponentName) -> &mut Option<WorkloadStatus> {
        match component {
            ComponentName::NodeAgent => &mut self.agent,
            ComponentName::ClusterAgent => &mut self.cluster_agent,
            ComponentName::ClusterChecksRunner => &mut self.cluster_checks_runner,
            ComponentName::OtelAgentGateway => &mut self.otel_agent_gateway,
            ComponentName::OtelCollectorGateway => &mut self.otel_collector_gateway,
        }
    }

    /// Drop every status field of a component, including its condition
    pub fn clear_component(&mut self, component: ComponentName) {
        if component == ComponentName::NodeAgent {
            self.agent_list.clear();
        }
        *self.component_mut(component) = None;
        super::types::remove_condition(&mut self.conditions, &component.condition_type());
    }

    /// Upsert a per-workload node agent entry and recompute the combined one
    pub fn upsert_agent(&mut self, entry: WorkloadStatus) {
        match self.agent_list.iter_mut().find(|s| s.name == entry.name) {
            Some(existing) => *existing = entry,
            None => self.agent_list.push(entry),
        }
        self.agent_list.sort_by(|a, b| a.name.cmp(&b.name));
        self.agent = combine_agent_status(&self.agent_list);
    }
}

/// Sum per-workload node agent statuses into one
pub fn combine_agent_status(list: &[WorkloadStatus]) -> Option<WorkloadStatus> {
    let first = list.first()?;
    let mut combined = WorkloadStatus {
        name: list
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(","),
        kind: first.kind.clone(),
        ..Default::default()
    };
    for s in list {
        combined.desired += s.desired;
        combined.current += s.current;
        combined.ready += s.ready;
        combined.available += s.available;
        combined.up_to_date += s.up_to_date;
        combined.last_update = combined.last_update.max(s.last_update);
    }
    combined.state = if list.iter().any(|s| s.state == "Failed") {
        "Failed".to_string()
    } else if list.iter().any(|s| s.state == "Updating") {
        "Updating".to_string()
    } else if list.iter().all(|s| s.state == "Running") {
        "Running".to_string()
    } else {
        "Progressing".to_string()
    };
    combined.status = format!(
        "{} ({}/{}/{})",
        combined.state, combined.desired, combined.ready, combined.up_to_date
    );
    Some(combined)
}

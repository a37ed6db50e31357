//! Canary-capable daemon rollout objects
//!
//! `ExtendedDaemonSet` and `ExtendedDaemonSetReplicaSet` belong to an
//! external rollout controller. The operator creates the node agent
//! ExtendedDaemonSet for the default profile and reads the canary fields of
//! both kinds before updating a profile's workload.

use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation set to `"true"` when a canary has been paused by hand
pub const ANNOTATION_CANARY_PAUSED: &str = "rollout.vigil.dev/canary-paused";

/// Annotation naming the replica set whose canary was validated by hand
pub const ANNOTATION_CANARY_VALID: &str = "rollout.vigil.dev/canary-valid";

/// Label put on every replica set, naming its parent ExtendedDaemonSet
pub const LABEL_EDS_NAME: &str = "rollout.vigil.dev/extendeddaemonset-name";

/// Canary settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanaryStrategy {
    /// Number of nodes the canary runs on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Observation window, e.g. `10m`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    /// Automatically pause on restarts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_pause: Option<bool>,
}

/// Rolling update settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdateStrategy {
    /// Maximum pods updated in parallel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_pods_creation: Option<i32>,
    /// Maximum unavailable pods during the rollout, as count or percentage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<String>,
}

/// Update strategy of an ExtendedDaemonSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedDaemonSetStrategy {
    /// Canary phase, skipped when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary: Option<CanaryStrategy>,
    /// Rolling phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdateStrategy>,
}

/// Specification of an ExtendedDaemonSet
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "rollout.vigil.dev",
    version = "v1alpha1",
    kind = "ExtendedDaemonSet",
    plural = "extendeddaemonsets",
    shortname = "eds",
    namespaced,
    status = "ExtendedDaemonSetStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedDaemonSetSpec {
    /// Pod selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    /// Pod template
    pub template: PodTemplateSpec,
    /// Update strategy
    #[serde(default)]
    pub strategy: ExtendedDaemonSetStrategy,
}

/// In-flight canary
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanaryStatus {
    /// Replica set under canary
    pub replica_set: String,
    /// Nodes running the canary
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
}

/// Status of an ExtendedDaemonSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedDaemonSetStatus {
    /// Pods that should be running
    #[serde(default)]
    pub desired: i32,
    /// Pods running
    #[serde(default)]
    pub current: i32,
    /// Pods ready
    #[serde(default)]
    pub ready: i32,
    /// Pods available
    #[serde(default)]
    pub available: i32,
    /// Pods on the active replica set
    #[serde(default)]
    pub up_to_date: i32,
    /// Rollout state (Running, Canary, Paused, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Replica set currently serving all non-canary nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_replica_set: Option<String>,
    /// Canary in progress, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary: Option<CanaryStatus>,
}

/// Specification of an ExtendedDaemonSetReplicaSet
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "rollout.vigil.dev",
    version = "v1alpha1",
    kind = "ExtendedDaemonSetReplicaSet",
    plural = "extendeddaemonsetreplicasets",
    shortname = "ers",
    namespaced,
    status = "ExtendedDaemonSetReplicaSetStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedDaemonSetReplicaSetSpec {
    /// Pod selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    /// Pod template
    pub template: PodTemplateSpec,
    /// Hash of the parent template this replica set was cut from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_generation: Option<String>,
}

/// Status of an ExtendedDaemonSetReplicaSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedDaemonSetReplicaSetStatus {
    /// Replica set state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Pods ready
    #[serde(default)]
    pub ready: i32,
    /// Pods available
    #[serde(default)]
    pub available: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    #[test]
    fn rollout_kinds_live_in_their_own_group() {
        assert_eq!(ExtendedDaemonSet::group(&()), "rollout.vigil.dev");
        assert_eq!(ExtendedDaemonSet::kind(&()), "ExtendedDaemonSet");
        assert_eq!(
            ExtendedDaemonSetReplicaSet::plural(&()),
            "extendeddaemonsetreplicasets"
        );
    }

    #[test]
    fn status_reads_canary_fields() {
        let status: ExtendedDaemonSetStatus = serde_json::from_value(serde_json::json!({
            "desired": 3,
            "activeReplicaSet": "agent-abcde",
            "canary": {"replicaSet": "agent-fghij", "nodes": ["n1"]}
        }))
        .expect("parse");
        assert_eq!(status.active_replica_set.as_deref(), Some("agent-abcde"));
        assert_eq!(
            status.canary.map(|c| c.replica_set),
            Some("agent-fghij".to_string())
        );
    }
}

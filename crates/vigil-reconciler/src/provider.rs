//! Node provider introspection
//!
//! With introspection on, nodes are grouped by provider and each group gets
//! its own node agent workload pinned by node affinity.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
};

/// Provider of nodes without a more specific match
pub const DEFAULT_PROVIDER: &str = "default";

/// GKE Container-Optimized OS with docker
pub const GCP_COS: &str = "gcp-cos";

/// GKE Container-Optimized OS with containerd
pub const GCP_COS_CONTAINERD: &str = "gcp-cos-containerd";

/// GKE node label carrying the OS distribution
pub const GKE_OS_DISTRIBUTION_LABEL: &str = "cloud.google.com/gke-os-distribution";

const GKE_COS: &str = "cos";
const GKE_COS_CONTAINERD: &str = "cos_containerd";

/// Provider of a node from its labels
pub fn provider_for_node(labels: &BTreeMap<String, String>) -> &'static str {
    match labels.get(GKE_OS_DISTRIBUTION_LABEL).map(String::as_str) {
        Some(GKE_COS) => GCP_COS,
        Some(GKE_COS_CONTAINERD) => GCP_COS_CONTAINERD,
        _ => DEFAULT_PROVIDER,
    }
}

/// Distinct providers across nodes, sorted.
///
/// Falls back to the default provider so a cluster without nodes still gets
/// one node agent workload.
pub fn provider_list<'a>(nodes: impl IntoIterator<Item = &'a BTreeMap<String, String>>) -> Vec<String> {
    let providers: BTreeSet<&str> = nodes.into_iter().map(provider_for_node).collect();
    if providers.is_empty() {
        return vec![DEFAULT_PROVIDER.to_string()];
    }
    providers.into_iter().map(str::to_string).collect()
}

/// Workload name for a provider; the default provider keeps the base name
pub fn workload_name_with_provider(base: &str, provider: &str) -> String {
    if provider.is_empty() || provider == DEFAULT_PROVIDER {
        base.to_string()
    } else {
        format!("{}-{}", base, provider)
    }
}

/// Node affinity pinning a workload to its provider's nodes
pub fn provider_affinity(provider: &str) -> Option<Affinity> {
    let requirement = match provider {
        "" => return None,
        GCP_COS => requirement("In", &[GKE_COS]),
        GCP_COS_CONTAINERD => requirement("In", &[GKE_COS_CONTAINERD]),
        _ => requirement("NotIn", &[GKE_COS, GKE_COS_CONTAINERD]),
    };
    Some(Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![requirement]),
                    match_fields: None,
                }],
            }),
            preferred_during_scheduling_ignored_during_execution: None,
        }),
        ..Default::default()
    })
}

fn requirement(operator: &str, values: &[&str]) -> NodeSelectorRequirement {
    NodeSelectorRequirement {
        key: GKE_OS_DISTRIBUTION_LABEL.to_string(),
        operator: operator.to_string(),
        values: Some(values.iter().map(|v| v.to_string()).collect()),
    }
}

/// Container runtime socket used when the spec sets none
pub fn default_runtime_socket(provider: &str) -> &'static str {
    match provider {
        GCP_COS => "/var/run/docker.sock",
        _ => "/var/run/containerd/containerd.sock",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(os: Option<&str>) -> BTreeMap<String, String> {
        os.map(|v| (GKE_OS_DISTRIBUTION_LABEL.to_string(), v.to_string()))
            .into_iter()
            .collect()
    }

    #[test]
    fn providers_from_node_labels() {
        assert_eq!(provider_for_node(&labels(Some("cos"))), GCP_COS);
        assert_eq!(provider_for_node(&labels(Some("cos_containerd"))), GCP_COS_CONTAINERD);
        assert_eq!(provider_for_node(&labels(Some("ubuntu"))), DEFAULT_PROVIDER);
        assert_eq!(provider_for_node(&labels(None)), DEFAULT_PROVIDER);
    }

    #[test]
    fn provider_list_is_distinct_and_never_empty() {
        let nodes = [labels(Some("cos")), labels(None), labels(Some("cos")), labels(None)];
        assert_eq!(provider_list(nodes.iter()), vec!["default", "gcp-cos"]);
        assert_eq!(provider_list(std::iter::empty()), vec!["default"]);
    }

    #[test]
    fn names_and_affinity() {
        assert_eq!(workload_name_with_provider("vigil-agent", ""), "vigil-agent");
        assert_eq!(workload_name_with_provider("vigil-agent", "default"), "vigil-agent");
        assert_eq!(
            workload_name_with_provider("vigil-agent", GCP_COS),
            "vigil-agent-gcp-cos"
        );

        assert!(provider_affinity("").is_none());
        let default = provider_affinity(DEFAULT_PROVIDER).expect("affinity");
        let exprs = default
            .node_affinity
            .and_then(|n| n.required_during_scheduling_ignored_during_execution)
            .expect("required")
            .node_selector_terms[0]
            .match_expressions
            .clone()
            .unwrap_or_default();
        assert_eq!(exprs[0].operator, "NotIn");
    }
}

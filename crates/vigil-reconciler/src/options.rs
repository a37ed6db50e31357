//! Process-wide operator options
//!
//! Loaded once from flags/environment at startup and shared read-only by
//! every reconcile.

use std::time::Duration;

use vigil_common::kube_utils::KeepFilter;

/// Default requeue period after a successful reconcile
pub const DEFAULT_REQUEUE_PERIOD: Duration = Duration::from_secs(15);

/// Default canary observation window
pub const DEFAULT_CANARY_DURATION: Duration = Duration::from_secs(600);

/// Default image registry
pub const DEFAULT_REGISTRY: &str = "registry.vigil.dev";

/// Default node agent and checks runner image tag
pub const DEFAULT_AGENT_TAG: &str = "7.60.0";

/// Default cluster agent image tag
pub const DEFAULT_CLUSTER_AGENT_TAG: &str = "7.60.0";

/// Default OTel collector image tag
pub const DEFAULT_OTEL_COLLECTOR_TAG: &str = "0.115.0";

/// Immutable options gating branches of the reconcile
#[derive(Clone, Debug)]
pub struct OperatorOptions {
    /// Run the default profile's node agent as an ExtendedDaemonSet
    pub extended_daemonset_enabled: bool,
    /// Minimum time a canary runs before profile workloads follow it
    pub canary_duration: Duration,
    /// Evaluate AgentProfiles and label nodes
    pub profiles_enabled: bool,
    /// Split node agents per node provider
    pub introspection_enabled: bool,
    /// Run process checks inside the core agent container
    pub process_checks_in_core_agent: bool,
    /// Requeue delay after a successful reconcile
    pub requeue_period: Duration,
    /// Previous annotations to keep on workload updates
    pub keep_annotations: KeepFilter,
    /// Previous labels to keep on workload updates
    pub keep_labels: KeepFilter,
    /// Registry used when the spec sets none
    pub default_registry: String,
    /// Node agent image tag
    pub agent_tag: String,
    /// Cluster agent image tag
    pub cluster_agent_tag: String,
    /// OTel collector image tag
    pub otel_collector_tag: String,
}

impl Default for OperatorOptions {
    fn default() -> Self {
        Self {
            extended_daemonset_enabled: false,
            canary_duration: DEFAULT_CANARY_DURATION,
            profiles_enabled: false,
            introspection_enabled: false,
            process_checks_in_core_agent: false,
            requeue_period: DEFAULT_REQUEUE_PERIOD,
            keep_annotations: KeepFilter::default(),
            keep_labels: KeepFilter::default(),
            default_registry: DEFAULT_REGISTRY.to_string(),
            agent_tag: DEFAULT_AGENT_TAG.to_string(),
            cluster_agent_tag: DEFAULT_CLUSTER_AGENT_TAG.to_string(),
            otel_collector_tag: DEFAULT_OTEL_COLLECTOR_TAG.to_string(),
        }
    }
}

impl OperatorOptions {
    /// Canary window as a chrono duration for timestamp arithmetic
    pub fn canary_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.canary_duration).unwrap_or(chrono::Duration::MAX)
    }

    /// Requeue period as a chrono duration for timestamp arithmetic
    pub fn requeue_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.requeue_period).unwrap_or(chrono::Duration::MAX)
    }
}

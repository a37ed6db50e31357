//! Common types for vigil: CRDs, errors, events and observability

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod metrics;
pub mod telemetry;

pub use error::Error;
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager and event reporter name used by the operator
pub const OPERATOR_NAME: &str = "vigil-operator";

/// Domain every operator-owned label and annotation key lives under.
///
/// Previous labels/annotations whose key contains this domain survive
/// workload updates even when no keep-filter matches them.
pub const VENDOR_DOMAIN: &str = "vigil.dev";

/// Standard `managed-by` label key
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Standard `part-of` label key, set to `<namespace>-<name>` of the owning DesiredAgent
pub const LABEL_PART_OF: &str = "app.kubernetes.io/part-of";

/// Standard `name` label key
pub const LABEL_NAME: &str = "app.kubernetes.io/name";

/// Standard `instance` label key
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";

/// Component label put on every managed workload and its pods
pub const LABEL_COMPONENT: &str = "agent.vigil.dev/component";

/// Node and pod label carrying the resolved profile name
pub const LABEL_PROFILE: &str = "agent.vigil.dev/profile";

/// Pre-1.0 profile label, removed wherever it is found
pub const LABEL_PROFILE_LEGACY: &str = "vigil.dev/profile";

/// Provider label put on per-provider node agent workloads
pub const LABEL_PROVIDER: &str = "agent.vigil.dev/provider";

/// Marks objects managed through the dependency store
pub const LABEL_STORE: &str = "operator.vigil.dev/managed-by-store";

/// Annotation holding the content hash of a managed workload spec
pub const ANNOTATION_SPEC_HASH: &str = "agent.vigil.dev/agentspechash";

/// Owner kind used by earlier operator releases, migrated on sight
pub const LEGACY_OWNER_KIND: &str = "AgentDeployment";

/// Finalizer guarding cluster-scoped dependency cleanup
pub const AGENT_FINALIZER: &str = "finalizer.agent.vigil.dev";

/// Build the `part-of` label value for a DesiredAgent
pub fn part_of_value(namespace: &str, name: &str) -> String {
    format!("{}-{}", namespace, name)
}

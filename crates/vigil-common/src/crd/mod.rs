//! Custom Resource Definitions for vigil

mod agent;
mod profile;
mod rollout;
mod types;

pub use agent::{
    combine_agent_status, AdmissionControllerFeature, ApmFeature, ClusterChecksFeature,
    ComponentName, ComponentOverride, ContainerOverride, ContainerStrategy, Credentials,
    CredentialsSecretRef, DesiredAgent, DesiredAgentSpec, DesiredAgentStatus, FeatureToggle,
    FeaturesConfig, FipsConfig, GlobalConfig, ImageOverride, KubeStateMetricsCoreFeature,
    KubeletConfig, LogCollectionFeature, WorkloadStatus,
};
pub use profile::{
    AgentProfile, AgentProfileSpec, AgentProfileStatus, ProfileAffinity, ProfileConfig,
    ProfileNodeRequirement, ProfileSelectorOperator, CONDITION_APPLIED, CONDITION_VALID,
    DEFAULT_PROFILE_NAME, MAX_PROFILE_NAME_LEN,
};
pub use rollout::{
    CanaryStatus, CanaryStrategy, ExtendedDaemonSet, ExtendedDaemonSetReplicaSet,
    ExtendedDaemonSetReplicaSetSpec, ExtendedDaemonSetReplicaSetStatus, ExtendedDaemonSetSpec,
    ExtendedDaemonSetStatus, ExtendedDaemonSetStrategy, RollingUpdateStrategy,
    ANNOTATION_CANARY_PAUSED, ANNOTATION_CANARY_VALID, LABEL_EDS_NAME,
};
pub use types::{find_condition, remove_condition, set_condition, Condition, ConditionStatus};

//! Node profile assignment
//!
//! Profiles claim nodes in priority order (creation time, then name). A
//! profile whose nodes overlap any node already claimed is rejected whole;
//! there is no partial assignment. Every unclaimed node falls to the
//! synthetic default profile.
//!
//! The assignment is made visible to the scheduler by labelling nodes, and
//! agent pods left on a node with the wrong profile are evicted so they get
//! re-placed under the right affinity.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Affinity, Node, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, Pod,
    PodAffinityTerm, PodAntiAffinity,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use vigil_common::crd::{
    set_condition, AgentProfile, AgentProfileStatus, ComponentName, ComponentOverride, Condition,
    ConditionStatus, CONDITION_APPLIED, CONDITION_VALID, DEFAULT_PROFILE_NAME,
};
use vigil_common::events::{actions, reasons};
use vigil_common::kube_utils::spec_hash;
use vigil_common::metrics::set_applied_profiles;
use vigil_common::{LABEL_COMPONENT, LABEL_PART_OF, LABEL_PROFILE, LABEL_PROFILE_LEGACY};

use crate::context::ReconcileContext;
use crate::pod_template::{apply_profile_override, PodTemplateManager};
use crate::provider::provider_list;
use crate::Result;

/// Node label identifying one agent pod per host
pub const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// Profile condition reasons
pub mod status_reasons {
    /// Profile passed validation
    pub const VALID: &str = "Valid";
    /// Profile failed validation
    pub const INVALID: &str = "Invalid";
    /// Profile claimed its nodes
    pub const APPLIED: &str = "Applied";
    /// Profile overlaps a higher-priority profile
    pub const CONFLICT: &str = "Conflict";
}

// =============================================================================
// Resolved profiles
// =============================================================================

/// A profile as the node agent pipeline sees it
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedProfile {
    name: String,
    namespace: String,
    profiles_enabled: bool,
    node_agent_override: Option<ComponentOverride>,
}

impl ResolvedProfile {
    /// The catch-all default profile
    pub fn default_profile(profiles_enabled: bool) -> Self {
        Self {
            name: DEFAULT_PROFILE_NAME.to_string(),
            namespace: String::new(),
            profiles_enabled,
            node_agent_override: None,
        }
    }

    /// An accepted user profile
    pub fn from_profile(profile: &AgentProfile) -> Self {
        Self {
            name: profile.name_any(),
            namespace: profile.namespace().unwrap_or_default(),
            profiles_enabled: true,
            node_agent_override: profile.spec.node_agent_override().cloned(),
        }
    }

    /// Profile name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace of the AgentProfile, empty for the default profile
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// True for the catch-all profile
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_PROFILE_NAME
    }

    /// Node agent override carried by the profile
    pub fn node_agent_override(&self) -> Option<&ComponentOverride> {
        self.node_agent_override.as_ref()
    }

    /// Workload name for this profile; the default profile keeps the base name
    pub fn workload_name(&self, base: &str) -> String {
        if self.is_default() {
            base.to_string()
        } else {
            format!("{}-profile-{}", base, self.name)
        }
    }

    /// Scheduling constraints of the profile's daemon, `None` when profiles are off.
    ///
    /// The default profile avoids every labelled node. Both kinds carry a
    /// hostname anti-affinity so two node agents never share a node while a
    /// node moves between profiles.
    pub fn affinity(&self) -> Option<Affinity> {
        if !self.profiles_enabled {
            return None;
        }
        let requirement = if self.is_default() {
            NodeSelectorRequirement {
                key: LABEL_PROFILE.to_string(),
                operator: "DoesNotExist".to_string(),
                values: None,
            }
        } else {
            NodeSelectorRequirement {
                key: LABEL_PROFILE.to_string(),
                operator: "In".to_string(),
                values: Some(vec![self.name.clone()]),
            }
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
            pod_anti_affinity: Some(PodAntiAffinity {
                required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                    label_selector: Some(LabelSelector {
                        match_labels: Some(BTreeMap::from([(
                            LABEL_COMPONENT.to_string(),
                            ComponentName::NodeAgent.suffix().to_string(),
                        )])),
                        match_expressions: None,
                    }),
                    topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
                    ..Default::default()
                }]),
                preferred_during_scheduling_ignored_during_execution: None,
            }),
            ..Default::default()
        })
    }

    /// Last pipeline step for profile workloads
    pub fn apply_to_template(&self, tpl: &mut PodTemplateManager) {
        if let Some(affinity) = self.affinity() {
            tpl.merge_affinity(affinity);
        }
        if !self.is_default() {
            tpl.add_label(LABEL_PROFILE, self.name.clone());
        }
        if let Some(ov) = &self.node_agent_override {
            apply_profile_override(tpl, ov);
        }
    }
}

/// One node agent workload to run: a profile on one provider's nodes
#[derive(Clone, Debug, PartialEq)]
pub struct NodeAgentTarget {
    /// Profile of the workload
    pub profile: ResolvedProfile,
    /// Node provider, empty when introspection is off
    pub provider: String,
}

// =============================================================================
// Assignment
// =============================================================================

/// Computed status of one AgentProfile
#[derive(Clone, Debug, PartialEq)]
pub struct ProfileStatusUpdate {
    /// Profile namespace
    pub namespace: String,
    /// Profile name
    pub name: String,
    /// New status
    pub status: AgentProfileStatus,
    /// True when the status differs from the stored one
    pub changed: bool,
    /// Rejection message, `None` for accepted profiles
    pub rejection: Option<String>,
}

/// Result of assigning profiles to nodes
#[derive(Clone, Debug, Default)]
pub struct ProfileAssignment {
    /// Accepted profiles in priority order, default last
    pub applicable: Vec<ResolvedProfile>,
    /// Node name to assigned profile name, default included
    pub node_to_profile: BTreeMap<String, String>,
    /// Status of every user profile
    pub statuses: Vec<ProfileStatusUpdate>,
}

fn creation_time(profile: &AgentProfile) -> Option<DateTime<Utc>> {
    profile.metadata.creation_timestamp.as_ref().map(|t| t.0)
}

/// Assign profiles to nodes.
///
/// Invalid and conflicting profiles are excluded from the applicable list
/// and reported through their status; they never abort the assignment of
/// other profiles.
pub fn assign(profiles: &[AgentProfile], nodes: &[Node], now: DateTime<Utc>) -> ProfileAssignment {
    let mut sorted: Vec<&AgentProfile> = profiles.iter().collect();
    sorted.sort_by(|a, b| {
        creation_time(a)
            .cmp(&creation_time(b))
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });

    let mut assignment = ProfileAssignment::default();
    let mut claimed: BTreeSet<String> = BTreeSet::new();

    for profile in sorted {
        let name = profile.name_any();
        let namespace = profile.namespace().unwrap_or_default();
        let resource = format!("{}/{}", namespace, name);

        let outcome = match profile.spec.validate(&name, &resource) {
            Err(e) => Err((false, e.to_string())),
            Ok(()) => {
                let matching: Vec<String> = nodes
                    .iter()
                    .filter(|n| profile.spec.matches_node(n.labels()))
                    .map(|n| n.name_any())
                    .collect();
                match matching.iter().find(|n| claimed.contains(*n)) {
                    Some(node) => Err((
                        true,
                        format!(
                            "node {} is already claimed by a higher-priority profile",
                            node
                        ),
                    )),
                    None => Ok(matching),
                }
            }
        };

        let rejection = match outcome {
            Ok(matching) => {
                debug!(profile = %resource, nodes = matching.len(), "profile accepted");
                for node in matching {
                    assignment.node_to_profile.insert(node.clone(), name.clone());
                    claimed.insert(node);
                }
                assignment.applicable.push(ResolvedProfile::from_profile(profile));
                None
            }
            Err((valid, message)) => {
                warn!(profile = %resource, valid, reason = %message, "profile rejected");
                Some((valid, message))
            }
        };

        let previous = profile.status.clone().unwrap_or_default();
        let status = profile_status(&previous, &profile.spec, rejection.as_ref(), now);
        assignment.statuses.push(ProfileStatusUpdate {
            namespace,
            name,
            changed: status != previous,
            status,
            rejection: rejection.map(|(_, m)| m),
        });
    }

    for node in nodes {
        assignment
            .node_to_profile
            .entry(node.name_any())
            .or_insert_with(|| DEFAULT_PROFILE_NAME.to_string());
    }
    assignment.applicable.push(ResolvedProfile::default_profile(true));
    assignment
}

fn profile_status(
    previous: &AgentProfileStatus,
    spec: &vigil_common::crd::AgentProfileSpec,
    rejection: Option<&(bool, String)>,
    now: DateTime<Utc>,
) -> AgentProfileStatus {
    let mut status = previous.clone();
    let hash = spec_hash(spec).ok();
    if hash != previous.current_hash {
        status.last_update = Some(now);
        status.current_hash = hash;
    }

    let (valid, applied, reason, message) = match rejection {
        None => (true, true, status_reasons::APPLIED, "profile applied".to_string()),
        Some((true, msg)) => (true, false, status_reasons::CONFLICT, msg.clone()),
        Some((false, msg)) => (false, false, status_reasons::INVALID, msg.clone()),
    };
    let (valid_reason, valid_message) = if valid {
        (status_reasons::VALID, "profile is valid".to_string())
    } else {
        (status_reasons::INVALID, message.clone())
    };

    set_condition(
        &mut status.conditions,
        Condition::at(
            CONDITION_VALID,
            ConditionStatus::from_bool(valid),
            valid_reason,
            valid_message,
            now,
        ),
    );
    set_condition(
        &mut status.conditions,
        Condition::at(
            CONDITION_APPLIED,
            ConditionStatus::from_bool(applied),
            reason,
            message,
            now,
        ),
    );
    status.valid = Some(ConditionStatus::from_bool(valid).to_string());
    status.applied = Some(ConditionStatus::from_bool(applied).to_string());
    status
}

/// Label patches bringing nodes in line with the assignment.
///
/// Nodes on the default profile lose the profile label. The legacy profile
/// label is removed wherever it is still present.
pub fn node_label_patches(
    nodes: &[Node],
    node_to_profile: &BTreeMap<String, String>,
) -> Vec<(String, BTreeMap<String, Option<String>>)> {
    let mut patches = Vec::new();
    for node in nodes {
        let name = node.name_any();
        let labels = node.labels();
        let desired = node_to_profile
            .get(&name)
            .filter(|p| p.as_str() != DEFAULT_PROFILE_NAME)
            .cloned();

        let mut patch = BTreeMap::new();
        if labels.get(LABEL_PROFILE) != desired.as_ref() {
            patch.insert(LABEL_PROFILE.to_string(), desired);
        }
        if labels.contains_key(LABEL_PROFILE_LEGACY) {
            patch.insert(LABEL_PROFILE_LEGACY.to_string(), None);
        }
        if !patch.is_empty() {
            patches.push((name, patch));
        }
    }
    patches
}

/// Agent pods running on a node whose profile no longer matches theirs
pub fn pods_to_evict<'a>(
    pods: &'a [Pod],
    node_to_profile: &BTreeMap<String, String>,
) -> Vec<&'a Pod> {
    pods.iter()
        .filter(|pod| {
            let Some(node) = pod.spec.as_ref().and_then(|s| s.node_name.as_ref()) else {
                return false;
            };
            let Some(assigned) = node_to_profile.get(node) else {
                return false;
            };
            let current = pod
                .labels()
                .get(LABEL_PROFILE)
                .map(String::as_str)
                .unwrap_or(DEFAULT_PROFILE_NAME);
            current != assigned
        })
        .collect()
}

// =============================================================================
// Sync
// =============================================================================

/// Resolve the node agent workloads to run for this reconcile.
///
/// With profiles on, this also writes profile statuses, labels nodes and
/// evicts misplaced agent pods. Profile status write failures are logged
/// and do not fail the reconcile; node and pod errors do.
pub async fn sync_profiles(ctx: &ReconcileContext<'_>) -> Result<Vec<NodeAgentTarget>> {
    let options = ctx.options;
    if !options.profiles_enabled && !options.introspection_enabled {
        return Ok(vec![NodeAgentTarget {
            profile: ResolvedProfile::default_profile(false),
            provider: String::new(),
        }]);
    }

    let nodes = ctx.client.list_nodes().await?;

    let profiles = if options.profiles_enabled {
        let profiles = ctx.client.list_profiles().await?;
        let assignment = assign(&profiles, &nodes, ctx.now);
        apply_assignment(ctx, &nodes, &assignment).await?;
        assignment.applicable
    } else {
        vec![ResolvedProfile::default_profile(false)]
    };

    let providers = if options.introspection_enabled {
        provider_list(nodes.iter().map(|n| n.labels()))
    } else {
        vec![String::new()]
    };

    let mut targets = Vec::new();
    for profile in &profiles {
        for provider in &providers {
            targets.push(NodeAgentTarget {
                profile: profile.clone(),
                provider: provider.clone(),
            });
        }
    }
    Ok(targets)
}

async fn apply_assignment(
    ctx: &ReconcileContext<'_>,
    nodes: &[Node],
    assignment: &ProfileAssignment,
) -> Result<()> {
    for update in &assignment.statuses {
        if let Some(message) = &update.rejection {
            let reason = if update.status.valid.as_deref() == Some("True") {
                reasons::PROFILE_CONFLICT
            } else {
                reasons::PROFILE_INVALID
            };
            ctx.events
                .publish(
                    &ctx.object_ref,
                    EventType::Warning,
                    reason,
                    actions::ASSIGN_PROFILES,
                    Some(format!("{}/{}: {}", update.namespace, update.name, message)),
                )
                .await;
        }
        if !update.changed {
            continue;
        }
        if let Err(e) = ctx
            .client
            .patch_profile_status(&update.namespace, &update.name, &update.status)
            .await
        {
            warn!(profile = %update.name, error = %e, "failed to update profile status");
        }
    }

    for (node, labels) in node_label_patches(nodes, &assignment.node_to_profile) {
        info!(node = %node, "updating node profile label");
        ctx.client.patch_node_labels(&node, &labels).await?;
    }

    let selector = format!(
        "{}={},{}={}",
        LABEL_COMPONENT,
        ComponentName::NodeAgent.suffix(),
        LABEL_PART_OF,
        ctx.part_of()
    );
    let pods = ctx.client.list_pods(&ctx.namespace, &selector).await?;
    for pod in pods_to_evict(&pods, &assignment.node_to_profile) {
        let name = pod.name_any();
        info!(pod = %name, "evicting agent pod on a node with a different profile");
        ctx.client.delete_pod(&ctx.namespace, &name).await?;
    }

    let accepted = assignment.applicable.iter().filter(|p| !p.is_default()).count();
    set_applied_profiles(&ctx.name, accepted as i64);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockAgentKubeClient;
    use crate::test_support::{node, now, TestContext};
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use vigil_common::crd::{
        find_condition, AgentProfileSpec, ProfileAffinity, ProfileConfig, ProfileNodeRequirement,
        ProfileSelectorOperator,
    };

    fn profile(name: &str, minutes: i64, pool: &[&str]) -> AgentProfile {
        let mut override_ = BTreeMap::new();
        override_.insert(
            ComponentName::NodeAgent,
            ComponentOverride {
                priority_class_name: Some("high".to_string()),
                ..Default::default()
            },
        );
        AgentProfile {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("monitoring".to_string()),
                creation_timestamp: Some(Time(now() + chrono::Duration::minutes(minutes))),
                ..Default::default()
            },
            spec: AgentProfileSpec {
                profile_affinity: Some(ProfileAffinity {
                    profile_node_affinity: vec![ProfileNodeRequirement {
                        key: "pool".to_string(),
                        operator: ProfileSelectorOperator::In,
                        values: pool.iter().map(|p| p.to_string()).collect(),
                    }],
                }),
                config: Some(ProfileConfig { override_ }),
            },
            status: None,
        }
    }

    fn nodes() -> Vec<Node> {
        vec![
            node("n1", &[("pool", "a")]),
            node("n2", &[("pool", "b")]),
            node("n3", &[("pool", "c")]),
            node("n4", &[("pool", "d")]),
        ]
    }

    fn names(assignment: &ProfileAssignment) -> Vec<&str> {
        assignment.applicable.iter().map(|p| p.name()).collect()
    }

    // =========================================================================
    // Assignment
    // =========================================================================

    /// Story: The oldest of two overlapping profiles wins and the other is excluded
    #[test]
    fn story_three_profiles_first_claim_wins() {
        // profile-2 is the oldest; profile-1 overlaps both others
        let profiles = vec![
            profile("profile-1", 2, &["a", "b"]),
            profile("profile-2", 1, &["a"]),
            profile("profile-3", 3, &["b", "c"]),
        ];
        let assignment = assign(&profiles, &nodes(), now());

        assert_eq!(names(&assignment), vec!["profile-2", "profile-3", "default"]);
        assert_eq!(assignment.node_to_profile["n1"], "profile-2");
        assert_eq!(assignment.node_to_profile["n2"], "profile-3");
        assert_eq!(assignment.node_to_profile["n3"], "profile-3");
        assert_eq!(assignment.node_to_profile["n4"], "default");

        let rejected = assignment
            .statuses
            .iter()
            .find(|s| s.name == "profile-1")
            .expect("status");
        let applied = find_condition(&rejected.status.conditions, CONDITION_APPLIED)
            .expect("applied condition");
        assert_eq!(applied.status, ConditionStatus::False);
        assert_eq!(applied.reason, status_reasons::CONFLICT);
        assert_eq!(rejected.status.valid.as_deref(), Some("True"));
    }

    #[test]
    fn name_breaks_creation_time_ties() {
        let profiles = vec![profile("b", 1, &["a"]), profile("a", 1, &["a"])];
        let assignment = assign(&profiles, &nodes(), now());
        assert_eq!(names(&assignment), vec!["a", "default"]);
    }

    #[test]
    fn invalid_profile_is_excluded_without_blocking_others() {
        let mut invalid = profile("broken", 1, &["a"]);
        invalid.spec.profile_affinity = None;
        let profiles = vec![invalid, profile("ok", 2, &["a"])];
        let assignment = assign(&profiles, &nodes(), now());

        assert_eq!(names(&assignment), vec!["ok", "default"]);
        let broken = &assignment.statuses[0];
        assert_eq!(broken.status.valid.as_deref(), Some("False"));
        assert!(broken.rejection.is_some());
    }

    #[test]
    fn status_unchanged_when_nothing_moved() {
        let mut p = profile("gpu", 1, &["a"]);
        let first = assign(std::slice::from_ref(&p), &nodes(), now());
        assert!(first.statuses[0].changed);

        p.status = Some(first.statuses[0].status.clone());
        let later = now() + chrono::Duration::minutes(10);
        let second = assign(&[p], &nodes(), later);
        assert!(!second.statuses[0].changed);
        assert_eq!(second.statuses[0].status.last_update, Some(now()));
    }

    // =========================================================================
    // Node labels and pods
    // =========================================================================

    #[test]
    fn node_labels_follow_assignment() {
        let nodes = vec![
            node("n1", &[("pool", "a")]),
            node("n2", &[(LABEL_PROFILE, "gpu"), (LABEL_PROFILE_LEGACY, "gpu")]),
            node("n3", &[(LABEL_PROFILE, "gpu")]),
        ];
        let mapping = BTreeMap::from([
            ("n1".to_string(), "gpu".to_string()),
            ("n2".to_string(), "default".to_string()),
            ("n3".to_string(), "gpu".to_string()),
        ]);
        let patches = node_label_patches(&nodes, &mapping);

        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].0, "n1");
        assert_eq!(patches[0].1[LABEL_PROFILE], Some("gpu".to_string()));
        assert_eq!(patches[1].0, "n2");
        assert_eq!(patches[1].1[LABEL_PROFILE], None);
        assert_eq!(patches[1].1[LABEL_PROFILE_LEGACY], None);
    }

    fn pod(name: &str, node: &str, profile: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: profile
                    .map(|p| BTreeMap::from([(LABEL_PROFILE.to_string(), p.to_string())])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.to_string()),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn misplaced_pods_are_evicted() {
        let pods = vec![
            pod("agent-a", "n1", None),
            pod("agent-b", "n2", Some("gpu")),
            pod("agent-c", "n3", Some("gpu")),
        ];
        let mapping = BTreeMap::from([
            ("n1".to_string(), "gpu".to_string()),
            ("n2".to_string(), "gpu".to_string()),
            ("n3".to_string(), "default".to_string()),
        ]);
        let evicted: Vec<String> = pods_to_evict(&pods, &mapping)
            .into_iter()
            .map(|p| p.name_any())
            .collect();
        assert_eq!(evicted, vec!["agent-a", "agent-c"]);
    }

    // =========================================================================
    // Templates
    // =========================================================================

    #[test]
    fn default_profile_avoids_labelled_nodes() {
        let affinity = ResolvedProfile::default_profile(true)
            .affinity()
            .expect("affinity");
        let term = &affinity
            .node_affinity
            .and_then(|n| n.required_during_scheduling_ignored_during_execution)
            .expect("required")
            .node_selector_terms[0];
        let req = &term.match_expressions.as_ref().expect("expressions")[0];
        assert_eq!(req.operator, "DoesNotExist");
        assert!(affinity.pod_anti_affinity.is_some());

        assert!(ResolvedProfile::default_profile(false).affinity().is_none());
    }

    #[test]
    fn profile_workloads_are_named_after_profile() {
        let gpu = ResolvedProfile::from_profile(&profile("gpu", 1, &["a"]));
        assert_eq!(gpu.workload_name("vigil-agent"), "vigil-agent-profile-gpu");
        assert_eq!(
            ResolvedProfile::default_profile(true).workload_name("vigil-agent"),
            "vigil-agent"
        );
    }

    #[test]
    fn profile_template_gets_label_and_override() {
        let gpu = ResolvedProfile::from_profile(&profile("gpu", 1, &["a"]));
        let mut tpl = PodTemplateManager::new(ComponentName::NodeAgent, Default::default());
        gpu.apply_to_template(&mut tpl);
        let template = tpl.into_template();
        let labels = template.metadata.and_then(|m| m.labels).expect("labels");
        assert_eq!(labels[LABEL_PROFILE], "gpu");
        let spec = template.spec.expect("spec");
        assert_eq!(spec.priority_class_name.as_deref(), Some("high"));
        assert!(spec.affinity.is_some());
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Story: Profiles off and introspection off yield one default target without API calls
    #[tokio::test]
    async fn story_profiles_disabled_skips_api() {
        let mut client = MockAgentKubeClient::new();
        client.expect_list_nodes().never();
        client.expect_list_profiles().never();
        let test = TestContext::new(client);
        let targets = sync_profiles(&test.ctx()).await.expect("sync");
        assert_eq!(targets.len(), 1);
        assert!(targets[0].profile.is_default());
        assert_eq!(targets[0].provider, "");
    }

    /// Story: Profiles on label nodes, patch statuses and keep going past status errors
    #[tokio::test]
    async fn story_profile_sync_labels_nodes() {
        let mut client = MockAgentKubeClient::new();
        client.expect_list_nodes().returning(|| Ok(nodes()));
        client
            .expect_list_profiles()
            .returning(|| Ok(vec![profile("gpu", 1, &["a"])]));
        client
            .expect_patch_profile_status()
            .times(1)
            .returning(|_, _, _| Err(crate::test_support::api_error(500, "InternalError")));
        client
            .expect_patch_node_labels()
            .withf(|name, labels| name == "n1" && labels[LABEL_PROFILE].as_deref() == Some("gpu"))
            .times(1)
            .returning(|_, _| Ok(()));
        client.expect_list_pods().returning(|_, _| Ok(vec![]));
        client.expect_delete_pod().never();

        let mut test = TestContext::new(client);
        test.options.profiles_enabled = true;
        let targets = sync_profiles(&test.ctx()).await.expect("sync");
        let names: Vec<&str> = targets.iter().map(|t| t.profile.name()).collect();
        assert_eq!(names, vec!["gpu", "default"]);
    }

    #[tokio::test]
    async fn introspection_multiplies_targets_by_provider() {
        let mut client = MockAgentKubeClient::new();
        client.expect_list_nodes().returning(|| {
            Ok(vec![
                node("n1", &[]),
                node("n2", &[(crate::provider::GKE_OS_DISTRIBUTION_LABEL, "cos")]),
            ])
        });
        let mut test = TestContext::new(client);
        test.options.introspection_enabled = true;
        let targets = sync_profiles(&test.ctx()).await.expect("sync");
        let providers: Vec<&str> = targets.iter().map(|t| t.provider.as_str()).collect();
        assert_eq!(providers, vec!["default", "gcp-cos"]);
    }
}

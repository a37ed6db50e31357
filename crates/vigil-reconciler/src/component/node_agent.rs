//! Node agent daemons
//!
//! One daemon workload per (profile, provider) target. The default profile
//! runs as an ExtendedDaemonSet when extended rollout is on; profile daemons
//! stay plain DaemonSets and follow the default rollout through the canary
//! gate. Daemons left over from targets that no longer exist are deleted
//! after the pass.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use vigil_common::crd::{combine_agent_status, ComponentName, DesiredAgentStatus};
use vigil_common::{LABEL_COMPONENT, LABEL_PART_OF};

use super::{delete_owned_workload, is_owned, shortest, ComponentReconciler};
use crate::context::ReconcileContext;
use crate::dependencies::{rule, stage_cluster_role, stage_service_account, unstage_cluster_role, READ};
use crate::pod_template::{build_pod_template, component_resource_name};
use crate::profile::NodeAgentTarget;
use crate::provider::workload_name_with_provider;
use crate::store::{DependencyKind, DependencyStore};
use crate::workload::{
    build_workload, reconcile_workload, record_workload_status, selector_labels, status_reasons,
    WorkloadKind, WorkloadSpecInput,
};
use crate::{Error, Result};

/// The per-node agent
pub struct NodeAgentComponent;

const COMPONENT: ComponentName = ComponentName::NodeAgent;

/// Kind of the daemon for a target
fn daemon_kind(ctx: &ReconcileContext<'_>, target: &NodeAgentTarget) -> WorkloadKind {
    if ctx.options.extended_daemonset_enabled && target.profile.is_default() {
        WorkloadKind::ExtendedDaemonSet
    } else {
        WorkloadKind::DaemonSet
    }
}

/// Name of the daemon for a target
fn daemon_name(ctx: &ReconcileContext<'_>, target: &NodeAgentTarget) -> String {
    let base = workload_name_with_provider(&ctx.workload_name(COMPONENT), &target.provider);
    target.profile.workload_name(&base)
}

/// ExtendedDaemonSet whose rollout gates updates of a profile daemon
fn canary_source(ctx: &ReconcileContext<'_>, target: &NodeAgentTarget) -> Option<String> {
    if !ctx.options.extended_daemonset_enabled || target.profile.is_default() {
        return None;
    }
    Some(workload_name_with_provider(
        &ctx.workload_name(COMPONENT),
        &target.provider,
    ))
}

/// Kinds node agent daemons may exist as
fn daemon_kinds(ctx: &ReconcileContext<'_>) -> Vec<WorkloadKind> {
    if ctx.options.extended_daemonset_enabled {
        vec![WorkloadKind::DaemonSet, WorkloadKind::ExtendedDaemonSet]
    } else {
        vec![WorkloadKind::DaemonSet]
    }
}

fn daemon_selector(ctx: &ReconcileContext<'_>) -> String {
    format!(
        "{}={},{}={}",
        LABEL_PART_OF,
        ctx.part_of(),
        LABEL_COMPONENT,
        COMPONENT.suffix()
    )
}

fn stage_rbac(store: &mut DependencyStore, name: &str) -> Result<()> {
    stage_service_account(store, name)?;
    stage_cluster_role(
        store,
        name,
        vec![
            rule(&[""], &["nodes/metrics", "nodes/spec", "nodes/stats", "nodes/proxy"], &["get"]),
            rule(&[""], &["pods", "nodes", "endpoints", "services"], READ),
            rule(&[""], &["configmaps"], &["get"]),
        ],
        name,
    )
}

fn unstage_rbac(store: &mut DependencyStore, name: &str) {
    let namespace = store.namespace().to_string();
    store.delete(DependencyKind::ServiceAccount, Some(&namespace), name);
    unstage_cluster_role(store, name);
}

/// Converge the daemon of one target and record its status
async fn reconcile_target(
    ctx: &ReconcileContext<'_>,
    target: &NodeAgentTarget,
    status: &mut DesiredAgentStatus,
) -> Result<Option<Duration>> {
    let name = daemon_name(ctx, target);
    let fail = |status: &mut DesiredAgentStatus, e: &Error| {
        record_workload_status(
            status,
            COMPONENT,
            &name,
            None,
            ctx.now,
            false,
            status_reasons::RECONCILE_FAILED,
            &e.to_string(),
        );
    };

    let template = match build_pod_template(&ctx.template_input(COMPONENT, Some(target))) {
        Ok(t) => t,
        Err(e) => {
            fail(status, &e);
            return Err(e);
        }
    };
    let desired = build_workload(
        WorkloadSpecInput {
            kind: daemon_kind(ctx, target),
            name: name.clone(),
            namespace: ctx.namespace.clone(),
            component: COMPONENT,
            selector: selector_labels(&ctx.name, COMPONENT, Some(&target.profile), &target.provider),
            part_of: ctx.part_of(),
            owner: ctx.owner.clone(),
            template,
            replicas: None,
        },
        ctx.options,
    );

    let canary = canary_source(ctx, target);
    match reconcile_workload(ctx, desired, canary.as_deref()).await {
        Ok(result) => {
            record_workload_status(
                status,
                COMPONENT,
                &name,
                result.live.as_ref(),
                ctx.now,
                true,
                result.reason(),
                &result.message,
            );
            Ok(result.requeue_after)
        }
        Err(e) => {
            fail(status, &e);
            Err(e)
        }
    }
}

/// Delete owned daemons whose (kind, name) is not in `valid`.
///
/// An empty valid set means the targets could not be computed; nothing is
/// deleted then.
async fn delete_extraneous(
    ctx: &ReconcileContext<'_>,
    valid: &BTreeSet<(WorkloadKind, String)>,
) -> Result<()> {
    if valid.is_empty() {
        warn!(agent = %ctx.name, "no valid node agent workloads, skipping extraneous cleanup");
        return Ok(());
    }
    let selector = daemon_selector(ctx);
    for kind in daemon_kinds(ctx) {
        for live in ctx.client.list_workloads(kind, &ctx.namespace, &selector).await? {
            let name = live.name().to_string();
            if valid.contains(&(kind, name.clone())) || !is_owned(ctx, &live) {
                continue;
            }
            debug!(kind = %kind, workload = %name, "deleting extraneous node agent workload");
            delete_owned_workload(ctx, kind, &name).await?;
        }
    }
    Ok(())
}

#[async_trait]
impl ComponentReconciler for NodeAgentComponent {
    fn name(&self) -> ComponentName {
        COMPONENT
    }

    async fn reconcile(
        &self,
        ctx: &ReconcileContext<'_>,
        store: &mut DependencyStore,
        status: &mut DesiredAgentStatus,
    ) -> Result<Option<Duration>> {
        stage_rbac(store, &component_resource_name(&ctx.name, COMPONENT))?;

        let mut requeue = None;
        let mut first_error: Option<Error> = None;
        let mut valid = BTreeSet::new();
        for target in &ctx.node_targets {
            valid.insert((daemon_kind(ctx, target), daemon_name(ctx, target)));
            match reconcile_target(ctx, target, status).await {
                Ok(delay) => requeue = shortest(requeue, delay),
                Err(e) if e.requires_immediate_requeue() => return Err(e),
                Err(e) => {
                    warn!(
                        profile = %target.profile.name(),
                        provider = %target.provider,
                        error = %e,
                        "node agent workload failed"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        delete_extraneous(ctx, &valid).await?;
        if !valid.is_empty() {
            let names: BTreeSet<&str> = valid.iter().map(|(_, n)| n.as_str()).collect();
            status.agent_list.retain(|s| names.contains(s.name.as_str()));
            status.agent = combine_agent_status(&status.agent_list);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(requeue),
        }
    }

    async fn cleanup(
        &self,
        ctx: &ReconcileContext<'_>,
        store: &mut DependencyStore,
        status: &mut DesiredAgentStatus,
    ) -> Result<()> {
        unstage_rbac(store, &component_resource_name(&ctx.name, COMPONENT));
        let selector = daemon_selector(ctx);
        for kind in daemon_kinds(ctx) {
            for live in ctx.client.list_workloads(kind, &ctx.namespace, &selector).await? {
                delete_owned_workload(ctx, kind, live.name()).await?;
            }
        }
        status.clear_component(COMPONENT);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockAgentKubeClient;
    use crate::crd::{
        find_condition, AgentProfile, AgentProfileSpec, CanaryStatus, ExtendedDaemonSetStatus,
    };
    use crate::options::OperatorOptions;
    use crate::profile::ResolvedProfile;
    use crate::required::{AgentContainer, RequiredComponent};
    use crate::test_support::{owner, TestContext};
    use crate::workload::Workload;
    use k8s_openapi::api::core::v1::PodTemplateSpec;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use vigil_common::ANNOTATION_SPEC_HASH;

    fn target(profile: Option<&str>, provider: &str) -> NodeAgentTarget {
        NodeAgentTarget {
            profile: match profile {
                Some(name) => ResolvedProfile::from_profile(&AgentProfile::new(
                    name,
                    AgentProfileSpec::default(),
                )),
                None => ResolvedProfile::default_profile(true),
            },
            provider: provider.to_string(),
        }
    }

    fn live(kind: WorkloadKind, name: &str, target: &NodeAgentTarget) -> Workload {
        let mut w = build_workload(
            WorkloadSpecInput {
                kind,
                name: name.to_string(),
                namespace: "monitoring".to_string(),
                component: COMPONENT,
                selector: selector_labels("vigil", COMPONENT, Some(&target.profile), &target.provider),
                part_of: "monitoring-vigil".to_string(),
                owner: owner(),
                template: PodTemplateSpec::default(),
                replicas: None,
            },
            &OperatorOptions::default(),
        );
        w.meta_mut()
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ANNOTATION_SPEC_HASH.to_string(), "stale".to_string());
        w
    }

    fn test_context(client: MockAgentKubeClient, targets: Vec<NodeAgentTarget>) -> TestContext {
        let mut test = TestContext::new(client);
        test.required.node_agent = RequiredComponent::required([AgentContainer::Core]);
        test.targets = Some(targets);
        test
    }

    fn store() -> DependencyStore {
        DependencyStore::new(owner(), "monitoring", "monitoring-vigil")
    }

    #[test]
    fn names_follow_profile_and_provider() {
        let test = TestContext::new(MockAgentKubeClient::new());
        let ctx = test.ctx();
        assert_eq!(daemon_name(&ctx, &target(None, "")), "vigil-agent");
        assert_eq!(daemon_name(&ctx, &target(None, "gcp-cos")), "vigil-agent-gcp-cos");
        assert_eq!(
            daemon_name(&ctx, &target(Some("gpu"), "gcp-cos")),
            "vigil-agent-gcp-cos-profile-gpu"
        );
    }

    #[test]
    fn only_profile_daemons_are_gated_with_extended_rollout() {
        let mut test = TestContext::new(MockAgentKubeClient::new());
        assert_eq!(canary_source(&test.ctx(), &target(Some("gpu"), "")), None);

        test.options.extended_daemonset_enabled = true;
        let ctx = test.ctx();
        assert_eq!(canary_source(&ctx, &target(None, "")), None);
        assert_eq!(
            canary_source(&ctx, &target(Some("gpu"), "gcp-cos")).as_deref(),
            Some("vigil-agent-gcp-cos")
        );
        assert_eq!(daemon_kind(&ctx, &target(None, "")), WorkloadKind::ExtendedDaemonSet);
        assert_eq!(daemon_kind(&ctx, &target(Some("gpu"), "")), WorkloadKind::DaemonSet);
    }

    /// Story: One daemon per target is created and tracked in the agent list
    #[tokio::test]
    async fn story_one_daemon_per_target() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let created_clone = created.clone();
        let mut client = MockAgentKubeClient::new();
        client.expect_get_workload().returning(|_, _, _| Ok(None));
        client.expect_create_workload().returning(move |w| {
            created_clone.lock().unwrap().push(w.name().to_string());
            Ok(w)
        });
        client.expect_list_workloads().returning(|_, _, _| Ok(vec![]));

        let test = test_context(client, vec![target(None, ""), target(Some("gpu"), "")]);
        let mut store = store();
        let mut status = DesiredAgentStatus::default();
        NodeAgentComponent
            .reconcile(&test.ctx(), &mut store, &mut status)
            .await
            .expect("reconcile");

        assert_eq!(
            *created.lock().unwrap(),
            vec!["vigil-agent", "vigil-agent-profile-gpu"]
        );
        assert_eq!(status.agent_list.len(), 2);
        assert_eq!(
            status.agent.map(|a| a.name).as_deref(),
            Some("vigil-agent,vigil-agent-profile-gpu")
        );
        assert!(store
            .get(DependencyKind::ClusterRole, None, "vigil-agent")
            .is_some());
    }

    /// Story: An active canary on the default rollout holds back a due profile
    /// update and asks for a requeue
    #[tokio::test]
    async fn story_canary_defers_profile_update() {
        let default = target(None, "");
        let gpu = target(Some("gpu"), "");
        let mut eds = live(WorkloadKind::ExtendedDaemonSet, "vigil-agent", &default);
        if let Workload::ExtendedDaemonSet(e) = &mut eds {
            e.status = Some(ExtendedDaemonSetStatus {
                active_replica_set: Some("vigil-agent-abc".to_string()),
                canary: Some(CanaryStatus {
                    replica_set: "vigil-agent-def".to_string(),
                    nodes: vec!["n1".to_string()],
                }),
                ..Default::default()
            });
        }
        let profile_ds = live(WorkloadKind::DaemonSet, "vigil-agent-profile-gpu", &gpu);

        let mut client = MockAgentKubeClient::new();
        client.expect_get_workload().returning(move |kind, _, _| {
            Ok(Some(match kind {
                WorkloadKind::ExtendedDaemonSet => eds.clone(),
                _ => profile_ds.clone(),
            }))
        });
        client
            .expect_update_workload()
            .withf(|w| w.kind() == WorkloadKind::ExtendedDaemonSet)
            .times(1)
            .returning(|w| Ok(w));
        client.expect_list_replica_sets().returning(|_, _| Ok(vec![]));
        client.expect_list_workloads().returning(|_, _, _| Ok(vec![]));

        let mut test = test_context(client, vec![default, gpu]);
        test.options.extended_daemonset_enabled = true;
        test.options.profiles_enabled = true;

        let mut status = DesiredAgentStatus::default();
        let requeue = NodeAgentComponent
            .reconcile(&test.ctx(), &mut store(), &mut status)
            .await
            .expect("reconcile");

        assert_eq!(requeue, Some(test.options.requeue_period));
        let gpu_status = status
            .agent_list
            .iter()
            .find(|s| s.name == "vigil-agent-profile-gpu")
            .expect("profile status");
        assert_eq!(gpu_status.current_hash.as_deref(), Some("stale"));
        let condition = find_condition(&status.conditions, &COMPONENT.condition_type())
            .expect("node agent condition");
        assert_eq!(condition.reason, status_reasons::UPDATE_DEFERRED);
    }

    /// Story: Daemons for targets that disappeared are deleted
    #[tokio::test]
    async fn story_extraneous_daemons_deleted() {
        let default = target(None, "");
        let old = live(WorkloadKind::DaemonSet, "vigil-agent-profile-old", &target(Some("old"), ""));
        let old_for_get = old.clone();

        let mut client = MockAgentKubeClient::new();
        client.expect_get_workload().returning(move |_, _, name| {
            Ok((name == "vigil-agent-profile-old").then(|| old_for_get.clone()))
        });
        client.expect_create_workload().returning(|w| Ok(w));
        client
            .expect_list_workloads()
            .returning(move |_, _, _| Ok(vec![old.clone()]));
        client
            .expect_delete_workload()
            .withf(|kind, _, name, orphan| {
                *kind == WorkloadKind::DaemonSet && name == "vigil-agent-profile-old" && !*orphan
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let test = test_context(client, vec![default]);
        let mut status = DesiredAgentStatus::default();
        status.upsert_agent(crate::crd::WorkloadStatus {
            name: "vigil-agent-profile-old".to_string(),
            ..Default::default()
        });
        NodeAgentComponent
            .reconcile(&test.ctx(), &mut store(), &mut status)
            .await
            .expect("reconcile");

        let names: Vec<_> = status.agent_list.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["vigil-agent"]);
    }

    #[tokio::test]
    async fn empty_target_set_deletes_nothing() {
        let mut client = MockAgentKubeClient::new();
        client.expect_list_workloads().never();
        client.expect_delete_workload().never();

        let test = test_context(client, vec![]);
        NodeAgentComponent
            .reconcile(&test.ctx(), &mut store(), &mut DesiredAgentStatus::default())
            .await
            .expect("reconcile");
    }

    #[tokio::test]
    async fn cleanup_deletes_every_owned_daemon() {
        let default = target(None, "");
        let a = live(WorkloadKind::DaemonSet, "vigil-agent", &default);
        let b = live(WorkloadKind::DaemonSet, "vigil-agent-profile-gpu", &target(Some("gpu"), ""));
        let listed = vec![a.clone(), b.clone()];

        let mut client = MockAgentKubeClient::new();
        client
            .expect_list_workloads()
            .returning(move |_, _, _| Ok(listed.clone()));
        client.expect_get_workload().returning(move |_, _, name| {
            Ok(Some(if name == "vigil-agent" { a.clone() } else { b.clone() }))
        });
        client
            .expect_delete_workload()
            .times(2)
            .returning(|_, _, _, _| Ok(()));

        let test = TestContext::new(client);
        let mut status = DesiredAgentStatus::default();
        status.upsert_agent(crate::crd::WorkloadStatus {
            name: "vigil-agent".to_string(),
            ..Default::default()
        });
        NodeAgentComponent
            .cleanup(&test.ctx(), &mut store(), &mut status)
            .await
            .expect("cleanup");
        assert!(status.agent.is_none());
        assert!(status.agent_list.is_empty());
    }
}

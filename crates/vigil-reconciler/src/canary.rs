//! Canary gate for profile workloads
//!
//! Profile daemons follow the default profile's ExtendedDaemonSet: they are
//! only updated once the canary of that rollout has settled. The gate only
//! ever holds back updates; creates and deletes go through untouched.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::debug;

use vigil_common::crd::{
    ExtendedDaemonSet, ExtendedDaemonSetReplicaSet, ANNOTATION_CANARY_PAUSED,
    ANNOTATION_CANARY_VALID, LABEL_EDS_NAME,
};
use vigil_common::kube_utils::last_spec_update_time;
use vigil_common::ANNOTATION_SPEC_HASH;

use crate::context::ReconcileContext;
use crate::options::OperatorOptions;
use crate::workload::{Workload, WorkloadKind};
use crate::{Error, Result};

/// Outcome of the gate
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CanaryDecision {
    /// Update the profile workload now
    Proceed,
    /// Hold the update back for this pass
    Defer(String),
}

fn spec_hash_of(meta: &ObjectMeta) -> Option<&str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_SPEC_HASH))
        .map(String::as_str)
}

/// Decide whether a profile workload may follow the default rollout.
///
/// `agent_updated` is the last spec change of the DesiredAgent. Checks run
/// in order and the first that applies wins.
pub fn evaluate(
    eds: &ExtendedDaemonSet,
    replica_sets: &[ExtendedDaemonSetReplicaSet],
    agent_updated: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    options: &OperatorOptions,
) -> Result<CanaryDecision> {
    let eds_name = eds.name_any();
    let annotations = eds.annotations();

    if annotations.get(ANNOTATION_CANARY_PAUSED).map(String::as_str) == Some("true") {
        return Ok(CanaryDecision::Defer("canary is paused".to_string()));
    }

    let status = eds.status.clone().unwrap_or_default();
    if status.canary.is_some() {
        return Ok(CanaryDecision::Defer("canary is in progress".to_string()));
    }

    let ers = match replica_sets {
        [] => {
            return Err(Error::canary(
                &eds_name,
                "no ExtendedDaemonSetReplicaSet exists",
            ))
        }
        [ers] => ers,
        _ => {
            return Ok(CanaryDecision::Defer(
                "waiting for unused replica sets to be cleaned up".to_string(),
            ))
        }
    };
    let ers_name = ers.name_any();
    if status.active_replica_set.as_deref() != Some(ers_name.as_str()) {
        return Err(Error::canary(
            &eds_name,
            format!(
                "replica set {} is not the active replica set {}",
                ers_name,
                status.active_replica_set.as_deref().unwrap_or("<none>")
            ),
        ));
    }

    // give the rollout controller one requeue period to pick up a spec change
    if let Some(updated) = agent_updated {
        if updated + options.requeue_window() > now {
            return Ok(CanaryDecision::Defer(
                "waiting for the rollout to observe the latest spec".to_string(),
            ));
        }
    }

    let hashes_match = spec_hash_of(&eds.metadata).is_some()
        && spec_hash_of(&eds.metadata) == spec_hash_of(&ers.metadata);

    if annotations.get(ANNOTATION_CANARY_VALID) == Some(&ers_name) && hashes_match {
        debug!(eds = %eds_name, "canary validated");
        return Ok(CanaryDecision::Proceed);
    }

    if let Some(updated) = agent_updated {
        if updated + options.canary_window() > now {
            return Ok(CanaryDecision::Defer(
                "canary duration has not elapsed".to_string(),
            ));
        }
    }

    if hashes_match {
        Ok(CanaryDecision::Proceed)
    } else {
        Ok(CanaryDecision::Defer(
            "rollout has not reached the latest spec".to_string(),
        ))
    }
}

/// Run the gate against the live ExtendedDaemonSet named `eds_name`.
///
/// A missing ExtendedDaemonSet defers: the default rollout has not been
/// created yet, so there is no settled version to follow.
pub async fn gate_profile_update(ctx: &ReconcileContext<'_>, eds_name: &str) -> Result<CanaryDecision> {
    let Some(Workload::ExtendedDaemonSet(eds)) = ctx
        .client
        .get_workload(WorkloadKind::ExtendedDaemonSet, &ctx.namespace, eds_name)
        .await?
    else {
        debug!(eds = %eds_name, "no ExtendedDaemonSet yet, deferring");
        return Ok(CanaryDecision::Defer(format!(
            "ExtendedDaemonSet {} does not exist yet",
            eds_name
        )));
    };

    let selector = format!("{}={}", LABEL_EDS_NAME, eds_name);
    let replica_sets = ctx.client.list_replica_sets(&ctx.namespace, &selector).await?;
    evaluate(
        &eds,
        &replica_sets,
        last_spec_update_time(&ctx.agent.metadata),
        ctx.now,
        ctx.options,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::now;
    use std::collections::BTreeMap;
    use vigil_common::crd::{
        CanaryStatus, ExtendedDaemonSetReplicaSetSpec, ExtendedDaemonSetSpec,
        ExtendedDaemonSetStatus,
    };

    fn eds(annotations: &[(&str, &str)], canary: bool) -> ExtendedDaemonSet {
        let mut annotations: BTreeMap<String, String> = annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        annotations
            .entry(ANNOTATION_SPEC_HASH.to_string())
            .or_insert_with(|| "h1".to_string());
        ExtendedDaemonSet {
            metadata: ObjectMeta {
                name: Some("vigil-agent".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: ExtendedDaemonSetSpec::default(),
            status: Some(ExtendedDaemonSetStatus {
                active_replica_set: Some("vigil-agent-abc".to_string()),
                canary: canary.then(|| CanaryStatus {
                    replica_set: "vigil-agent-def".to_string(),
                    nodes: vec!["n1".to_string()],
                }),
                ..Default::default()
            }),
        }
    }

    fn ers(name: &str, hash: &str) -> ExtendedDaemonSetReplicaSet {
        ExtendedDaemonSetReplicaSet {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(BTreeMap::from([(
                    ANNOTATION_SPEC_HASH.to_string(),
                    hash.to_string(),
                )])),
                ..Default::default()
            },
            spec: ExtendedDaemonSetReplicaSetSpec::default(),
            status: None,
        }
    }

    fn long_ago() -> Option<DateTime<Utc>> {
        Some(now() - chrono::Duration::hours(2))
    }

    fn decide(
        eds: &ExtendedDaemonSet,
        replica_sets: &[ExtendedDaemonSetReplicaSet],
        updated: Option<DateTime<Utc>>,
    ) -> CanaryDecision {
        evaluate(eds, replica_sets, updated, now(), &OperatorOptions::default()).expect("decision")
    }

    /// Story: An active canary holds back the profile update
    #[test]
    fn story_active_canary_defers() {
        let decision = decide(&eds(&[], true), &[ers("vigil-agent-abc", "h1")], long_ago());
        assert!(matches!(decision, CanaryDecision::Defer(_)));
    }

    #[test]
    fn paused_canary_defers() {
        let paused = eds(&[(ANNOTATION_CANARY_PAUSED, "true")], false);
        let decision = decide(&paused, &[ers("vigil-agent-abc", "h1")], long_ago());
        assert_eq!(decision, CanaryDecision::Defer("canary is paused".to_string()));
    }

    #[test]
    fn several_replica_sets_defer() {
        let decision = decide(
            &eds(&[], false),
            &[ers("vigil-agent-abc", "h1"), ers("vigil-agent-old", "h0")],
            long_ago(),
        );
        assert!(matches!(decision, CanaryDecision::Defer(_)));
    }

    #[test]
    fn missing_or_foreign_replica_set_is_an_error() {
        let options = OperatorOptions::default();
        assert!(evaluate(&eds(&[], false), &[], long_ago(), now(), &options).is_err());
        assert!(evaluate(
            &eds(&[], false),
            &[ers("someone-else", "h1")],
            long_ago(),
            now(),
            &options
        )
        .is_err());
    }

    #[test]
    fn recent_spec_change_defers() {
        let decision = decide(
            &eds(&[], false),
            &[ers("vigil-agent-abc", "h1")],
            Some(now() - chrono::Duration::seconds(5)),
        );
        assert!(matches!(decision, CanaryDecision::Defer(_)));
    }

    #[test]
    fn validated_canary_skips_the_duration() {
        // inside the canary window but past the requeue buffer
        let updated = Some(now() - chrono::Duration::minutes(1));
        let validated = eds(&[(ANNOTATION_CANARY_VALID, "vigil-agent-abc")], false);
        assert_eq!(
            decide(&validated, &[ers("vigil-agent-abc", "h1")], updated),
            CanaryDecision::Proceed
        );
        assert!(matches!(
            decide(&eds(&[], false), &[ers("vigil-agent-abc", "h1")], updated),
            CanaryDecision::Defer(_)
        ));
    }

    #[test]
    fn settled_rollout_proceeds_only_on_matching_hash() {
        assert_eq!(
            decide(&eds(&[], false), &[ers("vigil-agent-abc", "h1")], long_ago()),
            CanaryDecision::Proceed
        );
        assert!(matches!(
            decide(&eds(&[], false), &[ers("vigil-agent-abc", "h0")], long_ago()),
            CanaryDecision::Defer(_)
        ));
    }

    /// Story: Without the default ExtendedDaemonSet there is nothing settled
    /// to follow, so profile updates wait
    #[tokio::test]
    async fn story_missing_extended_daemonset_defers() {
        let mut client = crate::client::MockAgentKubeClient::new();
        client
            .expect_get_workload()
            .withf(|kind, _, name| *kind == WorkloadKind::ExtendedDaemonSet && name == "vigil-agent")
            .returning(|_, _, _| Ok(None));
        client.expect_list_replica_sets().never();

        let test = crate::test_support::TestContext::new(client);
        let decision = gate_profile_update(&test.ctx(), "vigil-agent")
            .await
            .expect("gate");
        assert!(matches!(decision, CanaryDecision::Defer(why) if why.contains("vigil-agent")));
    }
}

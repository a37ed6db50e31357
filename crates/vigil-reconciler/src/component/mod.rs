//! Top-level components and the loop that drives them
//!
//! Each component is one workload role (node agent, cluster agent, ...).
//! The registry is a fixed list built once at startup; `reconcile_all`
//! walks it in order, routing every component either to its reconcile or
//! to its cleanup depending on the resolved requirements.

mod cluster_agent;
mod cluster_checks_runner;
mod node_agent;
mod otel_gateway;

pub use cluster_agent::ClusterAgentComponent;
pub use cluster_checks_runner::ClusterChecksRunnerComponent;
pub use node_agent::NodeAgentComponent;
pub use otel_gateway::OtelGatewayComponent;

use std::time::Duration;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use tracing::{debug, info, warn};

use vigil_common::crd::{
    remove_condition, set_condition, ComponentName, Condition, ConditionStatus,
    DesiredAgentStatus,
};
use vigil_common::events::{actions, reasons};
use vigil_common::kube_utils::labels_of;
use vigil_common::metrics::{record_override_conflict, record_workload_operation, WorkloadOutcome};
use vigil_common::LABEL_PART_OF;

use crate::context::ReconcileContext;
use crate::pod_template::build_pod_template;
use crate::store::DependencyStore;
use crate::workload::{
    build_workload, reconcile_workload, record_workload_status, selector_labels, status_reasons,
    Workload, WorkloadKind, WorkloadSpecInput,
};
use crate::{Error, Result};

/// Condition set while an override disables a component a feature needs
pub const CONDITION_OVERRIDE_CONFLICT: &str = "OverrideConflict";

/// One top-level workload role
#[async_trait]
pub trait ComponentReconciler: Send + Sync {
    /// Component this reconciler manages
    fn name(&self) -> ComponentName;

    /// Converge the component's workloads and stage its dependencies.
    ///
    /// Returns a requeue delay when the component needs to be looked at
    /// again sooner than the default period.
    async fn reconcile(
        &self,
        ctx: &ReconcileContext<'_>,
        store: &mut DependencyStore,
        status: &mut DesiredAgentStatus,
    ) -> Result<Option<Duration>>;

    /// Remove the component's workloads and clear its status.
    ///
    /// Idempotent: an already absent workload is success.
    async fn cleanup(
        &self,
        ctx: &ReconcileContext<'_>,
        store: &mut DependencyStore,
        status: &mut DesiredAgentStatus,
    ) -> Result<()>;
}

/// Ordered set of components
pub struct ComponentRegistry {
    components: Vec<Box<dyn ComponentReconciler>>,
}

impl ComponentRegistry {
    /// Registry over an explicit list
    pub fn new(components: Vec<Box<dyn ComponentReconciler>>) -> Self {
        Self { components }
    }

    /// Every built-in component in its fixed order
    pub fn default_set() -> Self {
        Self::new(vec![
            Box::new(NodeAgentComponent),
            Box::new(ClusterAgentComponent),
            Box::new(ClusterChecksRunnerComponent),
            Box::new(OtelGatewayComponent::new(ComponentName::OtelAgentGateway)),
            Box::new(OtelGatewayComponent::new(ComponentName::OtelCollectorGateway)),
        ])
    }

    /// Registered component names, in order
    pub fn names(&self) -> Vec<ComponentName> {
        self.components.iter().map(|c| c.name()).collect()
    }

    /// Reconcile or clean up every component.
    ///
    /// A failure that needs an immediate requeue stops the loop. Other
    /// failures are kept and the loop moves on; the first one is returned
    /// once every component had its turn.
    pub async fn reconcile_all(
        &self,
        ctx: &ReconcileContext<'_>,
        store: &mut DependencyStore,
        status: &mut DesiredAgentStatus,
    ) -> Result<Option<Duration>> {
        let mut requeue: Option<Duration> = None;
        let mut first_error: Option<Error> = None;
        let mut conflicts = Vec::new();

        for component in &self.components {
            let name = component.name();
            let enabled = ctx.required.is_enabled(name);

            let outcome = if enabled {
                component.reconcile(ctx, store, status).await
            } else {
                if is_override_conflict(ctx, name) {
                    conflicts.push(name);
                } else if ctx.required.get(name).is_enabled() {
                    debug!(component = %name, "disabled because a component it depends on is off");
                } else {
                    debug!(component = %name, "component disabled");
                }
                component.cleanup(ctx, store, status).await.map(|()| None)
            };

            match outcome {
                Ok(delay) => requeue = shortest(requeue, delay),
                Err(e) if e.requires_immediate_requeue() => {
                    warn!(component = %name, error = %e, "component needs an immediate requeue");
                    return Err(e);
                }
                Err(e) => {
                    warn!(component = %name, error = %e, "component reconcile failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        record_conflicts(ctx, status, &conflicts).await;

        match first_error {
            Some(e) => Err(e),
            None => Ok(requeue),
        }
    }
}

/// A feature asks for the component but the user's override turns it off.
///
/// A component that is only off because a component it depends on is off
/// is not a conflict.
fn is_override_conflict(ctx: &ReconcileContext<'_>, component: ComponentName) -> bool {
    ctx.agent.spec.is_disabled_by_override(component) && ctx.required.get(component).is_requested()
}

async fn record_conflicts(
    ctx: &ReconcileContext<'_>,
    status: &mut DesiredAgentStatus,
    conflicts: &[ComponentName],
) {
    if conflicts.is_empty() {
        remove_condition(&mut status.conditions, CONDITION_OVERRIDE_CONFLICT);
        return;
    }

    let message = conflicts
        .iter()
        .map(|c| format!("{} is disabled by override but required by enabled features", c))
        .collect::<Vec<_>>()
        .join("; ");
    for c in conflicts {
        warn!(component = %c, "override disables a required component");
        record_override_conflict(c.as_str());
    }
    set_condition(
        &mut status.conditions,
        Condition::at(
            CONDITION_OVERRIDE_CONFLICT,
            ConditionStatus::True,
            reasons::OVERRIDE_CONFLICT,
            message.clone(),
            ctx.now,
        ),
    );
    ctx.events
        .publish(
            &ctx.object_ref,
            EventType::Warning,
            reasons::OVERRIDE_CONFLICT,
            actions::RECONCILE,
            Some(message),
        )
        .await;
}

/// Smaller of two optional delays
pub(crate) fn shortest(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Whether a live object belongs to the DesiredAgent being reconciled
pub(crate) fn is_owned(ctx: &ReconcileContext<'_>, workload: &Workload) -> bool {
    labels_of(workload.meta()).get(LABEL_PART_OF) == Some(&ctx.part_of())
}

/// Build, diff and apply the deployment of a cluster-level component
pub(crate) async fn reconcile_deployment(
    ctx: &ReconcileContext<'_>,
    component: ComponentName,
    status: &mut DesiredAgentStatus,
) -> Result<Option<Duration>> {
    let name = ctx.workload_name(component);

    let template = match build_pod_template(&ctx.template_input(component, None)) {
        Ok(t) => t,
        Err(e) => {
            record_workload_status(
                status,
                component,
                &name,
                None,
                ctx.now,
                false,
                status_reasons::RECONCILE_FAILED,
                &e.to_string(),
            );
            return Err(e);
        }
    };

    let replicas = ctx
        .agent
        .spec
        .override_for(component)
        .and_then(|ov| ov.replicas);
    let desired = build_workload(
        WorkloadSpecInput {
            kind: WorkloadKind::Deployment,
            name: name.clone(),
            namespace: ctx.namespace.clone(),
            component,
            selector: selector_labels(&ctx.name, component, None, ""),
            part_of: ctx.part_of(),
            owner: ctx.owner.clone(),
            template,
            replicas,
        },
        ctx.options,
    );

    match reconcile_workload(ctx, desired, None).await {
        Ok(result) => {
            record_workload_status(
                status,
                component,
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
            record_workload_status(
                status,
                component,
                &name,
                None,
                ctx.now,
                false,
                status_reasons::RECONCILE_FAILED,
                &e.to_string(),
            );
            Err(e)
        }
    }
}

/// Delete a component's deployment if this agent owns it, then clear its
/// status.
///
/// Status is cleared whether or not a deployment was found.
pub(crate) async fn cleanup_deployment(
    ctx: &ReconcileContext<'_>,
    component: ComponentName,
    status: &mut DesiredAgentStatus,
) -> Result<()> {
    let name = ctx.workload_name(component);
    delete_owned_workload(ctx, WorkloadKind::Deployment, &name).await?;
    status.clear_component(component);
    Ok(())
}

/// Delete one workload if it exists and carries this agent's `part-of`
/// label. Returns whether anything was deleted.
pub(crate) async fn delete_owned_workload(
    ctx: &ReconcileContext<'_>,
    kind: WorkloadKind,
    name: &str,
) -> Result<bool> {
    let Some(live) = ctx.client.get_workload(kind, &ctx.namespace, name).await? else {
        return Ok(false);
    };
    if !is_owned(ctx, &live) {
        debug!(kind = %kind, workload = %name, "not owned by this agent, leaving it");
        return Ok(false);
    }

    ctx.client
        .delete_workload(kind, &ctx.namespace, name, false)
        .await?;
    info!(kind = %kind, workload = %name, "deleted workload");
    record_workload_operation(kind.as_str(), WorkloadOutcome::Delete);
    ctx.events
        .publish(
            &ctx.object_ref,
            EventType::Normal,
            reasons::WORKLOAD_DELETED,
            actions::DELETE,
            Some(format!("{} {}/{} deleted", kind, ctx.namespace, name)),
        )
        .await;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockAgentKubeClient;
    use crate::crd::{ComponentOverride, DesiredAgentSpec};
    use crate::required::{AgentContainer, RequiredComponent};
    use crate::test_support::{agent, api_error, now, owner, valid_spec, TestContext};
    use k8s_openapi::api::core::v1::PodTemplateSpec;
    use std::sync::{Arc, Mutex};
    use vigil_common::crd::find_condition;

    /// Records calls and returns a canned outcome
    struct FakeComponent {
        name: ComponentName,
        outcome: fn() -> Result<Option<Duration>>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ComponentReconciler for FakeComponent {
        fn name(&self) -> ComponentName {
            self.name
        }

        async fn reconcile(
            &self,
            _ctx: &ReconcileContext<'_>,
            _store: &mut DependencyStore,
            _status: &mut DesiredAgentStatus,
        ) -> Result<Option<Duration>> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("reconcile {}", self.name));
            (self.outcome)()
        }

        async fn cleanup(
            &self,
            _ctx: &ReconcileContext<'_>,
            _store: &mut DependencyStore,
            _status: &mut DesiredAgentStatus,
        ) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("cleanup {}", self.name));
            Ok(())
        }
    }

    fn fake(
        name: ComponentName,
        outcome: fn() -> Result<Option<Duration>>,
        calls: &Arc<Mutex<Vec<String>>>,
    ) -> Box<dyn ComponentReconciler> {
        Box::new(FakeComponent {
            name,
            outcome,
            calls: calls.clone(),
        })
    }

    fn store() -> DependencyStore {
        DependencyStore::new(owner(), "monitoring", "monitoring-vigil")
    }

    fn required_all() -> crate::required::RequiredComponents {
        let mut required = crate::required::RequiredComponents::default();
        required.node_agent = RequiredComponent::required([AgentContainer::Core]);
        required.cluster_agent = RequiredComponent::required([AgentContainer::ClusterAgent]);
        required.cluster_checks_runner =
            RequiredComponent::required([AgentContainer::ClusterChecksRunner]);
        required
    }

    fn spec_disabling(component: ComponentName) -> DesiredAgentSpec {
        let mut spec = valid_spec();
        spec.override_.insert(
            component,
            ComponentOverride {
                disabled: Some(true),
                ..Default::default()
            },
        );
        spec
    }

    #[test]
    fn shortest_delay_wins() {
        let a = Some(Duration::from_secs(5));
        let b = Some(Duration::from_secs(1));
        assert_eq!(shortest(a, b), b);
        assert_eq!(shortest(None, a), a);
        assert_eq!(shortest(None, None), None);
    }

    #[test]
    fn default_set_order_is_fixed() {
        assert_eq!(ComponentRegistry::default_set().names(), ComponentName::ALL.to_vec());
    }

    /// Story: Enabled components reconcile and disabled ones clean up, in order
    #[tokio::test]
    async fn story_components_routed_by_requirements() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let registry = ComponentRegistry::new(vec![
            fake(ComponentName::NodeAgent, || Ok(Some(Duration::from_secs(7))), &calls),
            fake(ComponentName::ClusterAgent, || Ok(Some(Duration::from_secs(3))), &calls),
            fake(ComponentName::OtelAgentGateway, || Ok(None), &calls),
        ]);
        let mut test = TestContext::new(MockAgentKubeClient::new());
        test.required = required_all();

        let mut status = DesiredAgentStatus::default();
        let requeue = registry
            .reconcile_all(&test.ctx(), &mut store(), &mut status)
            .await
            .expect("reconcile");

        assert_eq!(requeue, Some(Duration::from_secs(3)));
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "reconcile nodeAgent",
                "reconcile clusterAgent",
                "cleanup otelAgentGateway",
            ]
        );
        assert!(find_condition(&status.conditions, CONDITION_OVERRIDE_CONFLICT).is_none());
    }

    /// Story: A permission error stops the loop before later components run
    #[tokio::test]
    async fn story_immediate_requeue_short_circuits() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let registry = ComponentRegistry::new(vec![
            fake(ComponentName::NodeAgent, || Err(api_error(403, "Forbidden")), &calls),
            fake(ComponentName::ClusterAgent, || Ok(None), &calls),
        ]);
        let mut test = TestContext::new(MockAgentKubeClient::new());
        test.required = required_all();

        let err = registry
            .reconcile_all(&test.ctx(), &mut store(), &mut DesiredAgentStatus::default())
            .await
            .expect_err("forbidden");
        assert_eq!(err.api_code(), Some(403));
        assert_eq!(*calls.lock().unwrap(), vec!["reconcile nodeAgent"]);
    }

    /// Story: An ordinary failure does not stop sibling components
    #[tokio::test]
    async fn story_ordinary_failure_continues_loop() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let registry = ComponentRegistry::new(vec![
            fake(
                ComponentName::NodeAgent,
                || Err(Error::feature_mutation("nodeAgent", "apm: boom")),
                &calls,
            ),
            fake(ComponentName::ClusterAgent, || Ok(None), &calls),
        ]);
        let mut test = TestContext::new(MockAgentKubeClient::new());
        test.required = required_all();

        let err = registry
            .reconcile_all(&test.ctx(), &mut store(), &mut DesiredAgentStatus::default())
            .await
            .expect_err("mutation error");
        assert!(err.to_string().contains("boom"));
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    /// Story: Disabling the cluster agent by override while a feature needs it
    /// cleans it up and reports a conflict
    #[tokio::test]
    async fn story_override_conflict_reported() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let registry = ComponentRegistry::new(vec![
            fake(ComponentName::ClusterAgent, || Ok(None), &calls),
            fake(ComponentName::ClusterChecksRunner, || Ok(None), &calls),
        ]);
        let mut test = TestContext::new(MockAgentKubeClient::new());
        test.agent = agent(spec_disabling(ComponentName::ClusterAgent));
        test.required = required_all();
        test.required.cluster_agent.force_off();

        let mut status = DesiredAgentStatus::default();
        registry
            .reconcile_all(&test.ctx(), &mut store(), &mut status)
            .await
            .expect("reconcile");

        assert_eq!(
            *calls.lock().unwrap(),
            vec!["cleanup clusterAgent", "cleanup clusterChecksRunner"]
        );
        let condition =
            find_condition(&status.conditions, CONDITION_OVERRIDE_CONFLICT).expect("conflict");
        assert_eq!(condition.status, ConditionStatus::True);
        assert!(condition.message.contains("clusterAgent"));
        assert!(condition.message.contains("disabled"));
        // the runner is only off transitively
        assert!(!condition.message.contains("clusterChecksRunner"));
    }

    #[tokio::test]
    async fn conflict_condition_cleared_once_resolved() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let registry =
            ComponentRegistry::new(vec![fake(ComponentName::ClusterAgent, || Ok(None), &calls)]);
        let mut test = TestContext::new(MockAgentKubeClient::new());
        test.required = required_all();

        let mut status = DesiredAgentStatus::default();
        set_condition(
            &mut status.conditions,
            Condition::at(
                CONDITION_OVERRIDE_CONFLICT,
                ConditionStatus::True,
                reasons::OVERRIDE_CONFLICT,
                "clusterAgent is disabled",
                now(),
            ),
        );
        registry
            .reconcile_all(&test.ctx(), &mut store(), &mut status)
            .await
            .expect("reconcile");
        assert!(find_condition(&status.conditions, CONDITION_OVERRIDE_CONFLICT).is_none());
    }

    fn live_deployment(part_of: &str) -> Workload {
        build_workload(
            WorkloadSpecInput {
                kind: WorkloadKind::Deployment,
                name: "vigil-cluster-agent".to_string(),
                namespace: "monitoring".to_string(),
                component: ComponentName::ClusterAgent,
                selector: selector_labels("vigil", ComponentName::ClusterAgent, None, ""),
                part_of: part_of.to_string(),
                owner: owner(),
                template: PodTemplateSpec::default(),
                replicas: None,
            },
            &crate::options::OperatorOptions::default(),
        )
    }

    #[tokio::test]
    async fn cleanup_leaves_foreign_workloads() {
        let mut client = MockAgentKubeClient::new();
        client
            .expect_get_workload()
            .returning(|_, _, _| Ok(Some(live_deployment("other-ns-other"))));
        client.expect_delete_workload().never();

        let test = TestContext::new(client);
        let mut status = DesiredAgentStatus::default();
        cleanup_deployment(&test.ctx(), ComponentName::ClusterAgent, &mut status)
            .await
            .expect("cleanup");
    }

    /// Story: Cleanup clears status even when nothing was left to delete
    #[tokio::test]
    async fn story_cleanup_always_clears_status() {
        let mut client = MockAgentKubeClient::new();
        client.expect_get_workload().returning(|_, _, _| Ok(None));
        client.expect_delete_workload().never();

        let test = TestContext::new(client);
        let mut status = DesiredAgentStatus::default();
        record_workload_status(
            &mut status,
            ComponentName::ClusterAgent,
            "vigil-cluster-agent",
            None,
            now(),
            true,
            status_reasons::CREATE_SUCCEEDED,
            "created",
        );
        cleanup_deployment(&test.ctx(), ComponentName::ClusterAgent, &mut status)
            .await
            .expect("cleanup");
        assert!(status.cluster_agent.is_none());
        assert!(find_condition(
            &status.conditions,
            &ComponentName::ClusterAgent.condition_type()
        )
        .is_none());
    }

    #[tokio::test]
    async fn cleanup_deletes_owned_deployment() {
        let mut client = MockAgentKubeClient::new();
        client
            .expect_get_workload()
            .returning(|_, _, _| Ok(Some(live_deployment("monitoring-vigil"))));
        client
            .expect_delete_workload()
            .withf(|kind, ns, name, orphan| {
                *kind == WorkloadKind::Deployment
                    && ns == "monitoring"
                    && name == "vigil-cluster-agent"
                    && !*orphan
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let test = TestContext::new(client);
        cleanup_deployment(
            &test.ctx(),
            ComponentName::ClusterAgent,
            &mut DesiredAgentStatus::default(),
        )
        .await
        .expect("cleanup");
    }
}

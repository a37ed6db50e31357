//! DesiredAgent controller
//!
//! `reconcile` runs one full pass for one DesiredAgent: finalizer handling,
//! validation, feature resolution, dependency staging, profile assignment,
//! the component loop, and finally one status write.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, error, info, instrument, warn};

use vigil_common::crd::{
    remove_condition, set_condition, Condition, ConditionStatus, DesiredAgent, DesiredAgentStatus,
};
use vigil_common::events::{actions, reasons};
use vigil_common::metrics::ReconcileTimer;
use vigil_common::{
    part_of_value, EventPublisher, KubeEventPublisher, AGENT_FINALIZER, OPERATOR_NAME,
};

use crate::client::{AgentKubeClient, KubeAgentClient};
use crate::component::{shortest, ComponentRegistry};
use crate::context::{ContextParams, ReconcileContext};
use crate::features::FeatureRegistry;
use crate::global::global_dependencies;
use crate::options::OperatorOptions;
use crate::profile::sync_profiles;
use crate::store::{DependencyStore, KubeStoreClient, StoreClient};
use crate::Error;

/// Condition carrying the error of the last failed reconcile
pub const CONDITION_RECONCILE_ERROR: &str = "ReconcileError";

/// Requeue after a status write lost a resourceVersion race
pub const STATUS_CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Requeue after a retryable error
pub const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Length of a generated cluster agent token
pub const TOKEN_LENGTH: usize = 32;

/// Shared state of the DesiredAgent controller
pub struct AgentContext {
    /// Workload, profile, node and status access
    pub kube: Arc<dyn AgentKubeClient>,
    /// Dependency object access
    pub store_client: Arc<dyn StoreClient>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Process options
    pub options: OperatorOptions,
    /// Features, in their fixed order
    pub features: FeatureRegistry,
    /// Components, in their fixed order
    pub components: ComponentRegistry,
}

impl AgentContext {
    /// Context over explicit clients with the built-in features and components
    pub fn new(
        kube: Arc<dyn AgentKubeClient>,
        store_client: Arc<dyn StoreClient>,
        events: Arc<dyn EventPublisher>,
        options: OperatorOptions,
    ) -> Self {
        Self {
            kube,
            store_client,
            events,
            options,
            features: FeatureRegistry::default_set(),
            components: ComponentRegistry::default_set(),
        }
    }

    /// Context backed by a Kubernetes client
    pub fn from_client(client: Client, options: OperatorOptions) -> Self {
        let events = Arc::new(KubeEventPublisher::new(client.clone(), OPERATOR_NAME));
        Self::new(
            Arc::new(KubeAgentClient::new(client.clone())),
            Arc::new(KubeStoreClient::new(client)),
            events,
            options,
        )
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn AgentKubeClient>, store_client: Arc<dyn StoreClient>) -> Self {
        Self::new(
            kube,
            store_client,
            Arc::new(vigil_common::NoopEventPublisher),
            OperatorOptions::default(),
        )
    }
}

/// Reconcile a DesiredAgent
#[instrument(skip(agent, ctx), fields(agent = %agent.name_any()))]
pub async fn reconcile(agent: Arc<DesiredAgent>, ctx: Arc<AgentContext>) -> Result<Action, Error> {
    let timer = ReconcileTimer::start(agent.name_any());
    match reconcile_agent(&agent, &ctx).await {
        Ok(action) => {
            timer.success();
            Ok(action)
        }
        Err(e) => {
            timer.error(error_kind(&e));
            Err(e)
        }
    }
}

/// Error policy for the DesiredAgent controller
///
/// Retryable errors requeue after 30 seconds; everything else waits for the
/// spec to change.
pub fn error_policy(agent: Arc<DesiredAgent>, error: &Error, _ctx: Arc<AgentContext>) -> Action {
    error!(
        ?error,
        agent = %agent.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(ERROR_REQUEUE)
    } else {
        Action::await_change()
    }
}

fn error_kind(e: &Error) -> &'static str {
    match e {
        Error::Kube { .. } => "kube",
        Error::Validation { .. } => "validation",
        Error::Serialization { .. } => "serialization",
        Error::FeatureMutation { .. } => "feature_mutation",
        Error::Dependencies { .. } => "dependencies",
        Error::Profile { .. } => "profile",
        Error::Canary { .. } => "canary",
        Error::Internal { .. } => "internal",
    }
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

/// Token from the spec, else the one persisted in status, else a new one
fn cluster_agent_token(agent: &DesiredAgent, status: &mut DesiredAgentStatus) -> String {
    if let Some(token) = agent
        .spec
        .global
        .cluster_agent_token
        .as_ref()
        .filter(|t| !t.is_empty())
    {
        return token.clone();
    }
    status
        .cluster_agent_token
        .get_or_insert_with(generate_token)
        .clone()
}

async fn reconcile_agent(agent: &DesiredAgent, ctx: &AgentContext) -> Result<Action, Error> {
    let name = agent.name_any();
    let namespace = agent
        .namespace()
        .ok_or_else(|| Error::validation("DesiredAgent must be namespaced"))?;

    if agent.meta().deletion_timestamp.is_some() {
        return finalize(agent, ctx, &namespace).await;
    }

    if !agent.finalizers().iter().any(|f| f == AGENT_FINALIZER) {
        let mut finalizers = agent.finalizers().to_vec();
        finalizers.push(AGENT_FINALIZER.to_string());
        ctx.kube
            .patch_agent_finalizers(&namespace, &name, &finalizers)
            .await?;
        debug!("added finalizer");
    }

    let original = agent.status.clone().unwrap_or_default();
    let mut status = original.clone();
    status.observed_generation = agent.meta().generation;

    if let Err(e) = agent.spec.validate(&format!("{}/{}", namespace, name)) {
        warn!(error = %e, "DesiredAgent validation failed");
        record_error(&mut status, &e);
        ctx.events
            .publish(
                &agent.object_ref(&()),
                EventType::Warning,
                reasons::VALIDATION_FAILED,
                actions::RECONCILE,
                Some(e.to_string()),
            )
            .await;
        if let Some(action) = write_status(ctx, &namespace, &name, &original, &status).await? {
            return Ok(action);
        }
        // needs a spec change
        return Ok(Action::await_change());
    }

    let token = cluster_agent_token(agent, &mut status);
    let resolved = ctx.features.resolve(agent, &ctx.options);
    let mut rctx = ReconcileContext::new(
        agent,
        ContextParams {
            required: &resolved.required,
            features: &resolved.features,
            options: &ctx.options,
            client: ctx.kube.as_ref(),
            events: ctx.events.as_ref(),
            token,
            now: Utc::now(),
        },
    )?;

    let outcome = converge(&mut rctx, ctx, &mut status).await;
    match &outcome {
        Ok(_) => {
            remove_condition(&mut status.conditions, CONDITION_RECONCILE_ERROR);
        }
        Err(e) => {
            record_error(&mut status, e);
            ctx.events
                .publish(
                    &rctx.object_ref,
                    EventType::Warning,
                    reasons::RECONCILE_FAILED,
                    actions::RECONCILE,
                    Some(e.to_string()),
                )
                .await;
        }
    }

    let written = write_status(ctx, &namespace, &name, &original, &status).await;
    let requeue = outcome?;
    if let Some(action) = written? {
        return Ok(action);
    }

    let period = ctx.options.requeue_period;
    let after = shortest(requeue, Some(period)).unwrap_or(period);
    info!(requeue_after = ?after, "reconcile complete");
    Ok(Action::requeue(after))
}

/// Stage dependencies, assign profiles, run the component loop and apply
/// the staged dependencies.
///
/// Unstaged dependencies are pruned only after a pass with no staging,
/// component or apply error.
async fn converge(
    rctx: &mut ReconcileContext<'_>,
    ctx: &AgentContext,
    status: &mut DesiredAgentStatus,
) -> Result<Option<Duration>, Error> {
    let mut store = DependencyStore::new(rctx.owner.clone(), rctx.namespace.clone(), rctx.part_of());
    let mut dependency_errors = Vec::new();
    if let Err(e) = global_dependencies(rctx.agent, &mut store, &rctx.token) {
        dependency_errors.push(e);
    }
    for feature in rctx.features {
        if let Err(e) = feature.manage_dependencies(&mut store, rctx.required) {
            dependency_errors.push(e);
        }
    }

    rctx.node_targets = sync_profiles(rctx).await?;

    let components = ctx.components.reconcile_all(rctx, &mut store, status).await;
    if let Err(e) = &components {
        if e.requires_immediate_requeue() {
            return components;
        }
    }

    // pruning is only safe against a complete staged set
    let complete = dependency_errors.is_empty() && components.is_ok();
    let apply_errors = store.apply(ctx.store_client.as_ref()).await;
    if complete && apply_errors.is_empty() {
        dependency_errors.extend(store.cleanup(ctx.store_client.as_ref()).await);
    } else {
        debug!("skipping dependency cleanup after errors");
        dependency_errors.extend(apply_errors);
    }

    let requeue = components?;
    match Error::dependencies(dependency_errors) {
        Some(e) => Err(e),
        None => Ok(requeue),
    }
}

fn record_error(status: &mut DesiredAgentStatus, e: &Error) {
    set_condition(
        &mut status.conditions,
        Condition::at(
            CONDITION_RECONCILE_ERROR,
            ConditionStatus::True,
            reasons::RECONCILE_FAILED,
            e.to_string(),
            Utc::now(),
        ),
    );
}

/// Patch the status when it changed.
///
/// A conflict is not an error: the next pass re-reads fresh state, so it
/// turns into a short requeue.
async fn write_status(
    ctx: &AgentContext,
    namespace: &str,
    name: &str,
    original: &DesiredAgentStatus,
    status: &DesiredAgentStatus,
) -> Result<Option<Action>, Error> {
    if status == original {
        debug!("status unchanged");
        return Ok(None);
    }
    match ctx.kube.patch_agent_status(namespace, name, status).await {
        Ok(()) => Ok(None),
        Err(e) if e.is_conflict() => {
            debug!("status write conflicted, requeueing");
            Ok(Some(Action::requeue(STATUS_CONFLICT_REQUEUE)))
        }
        Err(e) => Err(e),
    }
}

/// Remove what owner references cannot garbage collect, then release the
/// finalizer.
async fn finalize(agent: &DesiredAgent, ctx: &AgentContext, namespace: &str) -> Result<Action, Error> {
    if !agent.finalizers().iter().any(|f| f == AGENT_FINALIZER) {
        return Ok(Action::await_change());
    }
    let name = agent.name_any();
    let owner = agent
        .controller_owner_ref(&())
        .ok_or_else(|| Error::internal("DesiredAgent has no name or uid"))?;
    let store = DependencyStore::new(owner, namespace, part_of_value(namespace, &name));
    if let Some(e) = Error::dependencies(store.delete_cluster_scoped(ctx.store_client.as_ref()).await) {
        return Err(e);
    }

    let finalizers: Vec<String> = agent
        .finalizers()
        .iter()
        .filter(|f| *f != AGENT_FINALIZER)
        .cloned()
        .collect();
    ctx.kube
        .patch_agent_finalizers(namespace, &name, &finalizers)
        .await?;
    info!("released finalizer");
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockAgentKubeClient;
    use crate::crd::{find_condition, Credentials, GlobalConfig};
    use crate::store::MockStoreClient;
    use crate::test_support::{agent as sample_agent, api_error, valid_spec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::sync::Mutex;

    fn with_finalizer(mut agent: DesiredAgent) -> DesiredAgent {
        agent.metadata.finalizers = Some(vec![AGENT_FINALIZER.to_string()]);
        agent
    }

    /// Kube mock where nothing exists yet and every write succeeds
    fn empty_cluster(statuses: Arc<Mutex<Vec<DesiredAgentStatus>>>) -> MockAgentKubeClient {
        let mut kube = MockAgentKubeClient::new();
        kube.expect_get_workload().returning(|_, _, _| Ok(None));
        kube.expect_create_workload().returning(|w| Ok(w));
        kube.expect_list_workloads().returning(|_, _, _| Ok(vec![]));
        kube.expect_patch_agent_finalizers()
            .returning(|_, _, _| Ok(()));
        kube.expect_patch_agent_status()
            .returning(move |_, _, status| {
                statuses.lock().unwrap().push(status.clone());
                Ok(())
            });
        kube
    }

    fn empty_store() -> MockStoreClient {
        let mut store = MockStoreClient::new();
        store.expect_get().returning(|_, _, _| Ok(None));
        store.expect_create().returning(|_, _| Ok(()));
        store.expect_list().returning(|_, _| Ok(vec![]));
        store
    }

    fn context(kube: MockAgentKubeClient, store: MockStoreClient) -> Arc<AgentContext> {
        Arc::new(AgentContext::for_testing(Arc::new(kube), Arc::new(store)))
    }

    // =========================================================================
    // Reconciliation Story Tests
    // =========================================================================

    /// Story: A first reconcile creates the default workloads, persists a
    /// generated token and requeues after the default period
    #[tokio::test]
    async fn story_first_reconcile_converges() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let ctx = context(empty_cluster(statuses.clone()), empty_store());

        let agent = Arc::new(with_finalizer(sample_agent(valid_spec())));
        let action = reconcile(agent, ctx.clone()).await.expect("reconcile");
        assert_eq!(action, Action::requeue(ctx.options.requeue_period));

        let statuses = statuses.lock().unwrap();
        let status = statuses.last().expect("status written");
        assert_eq!(status.cluster_agent_token.as_ref().map(String::len), Some(TOKEN_LENGTH));
        assert_eq!(status.observed_generation, Some(1));
        assert!(status.agent.is_some());
        assert!(status.cluster_agent.is_some());
        assert!(find_condition(&status.conditions, CONDITION_RECONCILE_ERROR).is_none());
    }

    /// Story: A token persisted in status is reused, never regenerated
    #[tokio::test]
    async fn story_persisted_token_reused() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let ctx = context(empty_cluster(statuses.clone()), empty_store());

        let mut agent = with_finalizer(sample_agent(valid_spec()));
        agent.status = Some(DesiredAgentStatus {
            cluster_agent_token: Some("persisted-token".to_string()),
            ..Default::default()
        });
        reconcile(Arc::new(agent), ctx).await.expect("reconcile");

        let statuses = statuses.lock().unwrap();
        let status = statuses.last().expect("status written");
        assert_eq!(status.cluster_agent_token.as_deref(), Some("persisted-token"));
    }

    #[test]
    fn spec_token_wins_and_is_not_persisted() {
        let mut spec = valid_spec();
        spec.global.cluster_agent_token = Some("from-spec".to_string());
        let agent = sample_agent(spec);
        let mut status = DesiredAgentStatus::default();
        assert_eq!(cluster_agent_token(&agent, &mut status), "from-spec");
        assert!(status.cluster_agent_token.is_none());
    }

    /// Story: An invalid spec surfaces a reconcile-error condition and touches
    /// no workload
    #[tokio::test]
    async fn story_invalid_spec_reports_and_waits() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let statuses_clone = statuses.clone();
        let mut kube = MockAgentKubeClient::new();
        kube.expect_get_workload().never();
        kube.expect_create_workload().never();
        kube.expect_patch_agent_status()
            .returning(move |_, _, status| {
                statuses_clone.lock().unwrap().push(status.clone());
                Ok(())
            });
        let ctx = context(kube, MockStoreClient::new());

        let spec = crate::crd::DesiredAgentSpec {
            global: GlobalConfig {
                credentials: Some(Credentials::default()),
                ..Default::default()
            },
            ..Default::default()
        };
        let action = reconcile(Arc::new(with_finalizer(sample_agent(spec))), ctx)
            .await
            .expect("reconcile");
        assert_eq!(action, Action::await_change());

        let statuses = statuses.lock().unwrap();
        let condition = find_condition(
            &statuses.last().expect("status written").conditions,
            CONDITION_RECONCILE_ERROR,
        )
        .cloned()
        .expect("reconcile error condition");
        assert_eq!(condition.status, ConditionStatus::True);
    }

    /// Story: Losing the status write race requeues after one second
    #[tokio::test]
    async fn story_status_conflict_requeues_quickly() {
        let mut kube = MockAgentKubeClient::new();
        kube.expect_get_workload().returning(|_, _, _| Ok(None));
        kube.expect_create_workload().returning(|w| Ok(w));
        kube.expect_list_workloads().returning(|_, _, _| Ok(vec![]));
        kube.expect_patch_agent_status()
            .returning(|_, _, _| Err(api_error(409, "Conflict")));
        let ctx = context(kube, empty_store());

        let action = reconcile(Arc::new(with_finalizer(sample_agent(valid_spec()))), ctx)
            .await
            .expect("reconcile");
        assert_eq!(action, Action::requeue(STATUS_CONFLICT_REQUEUE));
    }

    /// Story: A new agent gets the finalizer before anything else
    #[tokio::test]
    async fn story_finalizer_added() {
        let mut kube = MockAgentKubeClient::new();
        kube.expect_get_workload().returning(|_, _, _| Ok(None));
        kube.expect_create_workload().returning(|w| Ok(w));
        kube.expect_list_workloads().returning(|_, _, _| Ok(vec![]));
        kube.expect_patch_agent_status().returning(|_, _, _| Ok(()));
        kube.expect_patch_agent_finalizers()
            .withf(|_, _, finalizers: &[String]| {
                finalizers.len() == 1 && finalizers[0] == AGENT_FINALIZER
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let ctx = context(kube, empty_store());

        reconcile(Arc::new(sample_agent(valid_spec())), ctx)
            .await
            .expect("reconcile");
    }

    /// Story: Deleting an agent removes cluster-scoped dependencies and then
    /// releases the finalizer
    #[tokio::test]
    async fn story_deletion_releases_finalizer() {
        let mut kube = MockAgentKubeClient::new();
        kube.expect_get_workload().never();
        kube.expect_patch_agent_finalizers()
            .withf(|_, _, finalizers: &[String]| finalizers.is_empty())
            .times(1)
            .returning(|_, _, _| Ok(()));
        let mut store = MockStoreClient::new();
        store
            .expect_list()
            .withf(|kind, _| kind.is_cluster_scoped())
            .returning(|_, _| Ok(vec![]));
        let ctx = context(kube, store);

        let mut agent = with_finalizer(sample_agent(valid_spec()));
        agent.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let action = reconcile(Arc::new(agent), ctx).await.expect("finalize");
        assert_eq!(action, Action::await_change());
    }

    /// Story: A failed component leaves live dependencies in place instead of
    /// pruning them against a partial staged set
    #[tokio::test]
    async fn story_failed_pass_skips_dependency_cleanup() {
        let mut kube = MockAgentKubeClient::new();
        kube.expect_get_workload().returning(|_, _, _| Ok(None));
        kube.expect_create_workload()
            .returning(|_| Err(api_error(500, "InternalError")));
        kube.expect_list_workloads().returning(|_, _, _| Ok(vec![]));
        kube.expect_patch_agent_status().returning(|_, _, _| Ok(()));
        let mut store = MockStoreClient::new();
        store.expect_get().returning(|_, _, _| Ok(None));
        store.expect_create().returning(|_, _| Ok(()));
        store.expect_list().never();
        store.expect_delete().never();
        let ctx = context(kube, store);

        let result = reconcile(Arc::new(with_finalizer(sample_agent(valid_spec()))), ctx).await;
        assert!(result.is_err());
    }

    /// Story: Objects that failed to apply block pruning in the same pass
    #[tokio::test]
    async fn story_apply_failure_skips_dependency_cleanup() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let mut store = MockStoreClient::new();
        store.expect_get().returning(|_, _, _| Ok(None));
        store
            .expect_create()
            .returning(|_, _| Err(api_error(500, "InternalError")));
        store.expect_list().never();
        let ctx = context(empty_cluster(statuses), store);

        let err = reconcile(Arc::new(with_finalizer(sample_agent(valid_spec()))), ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Dependencies { .. }));
    }

    #[test]
    fn error_policy_requeues_only_retryable_errors() {
        let ctx = context(MockAgentKubeClient::new(), MockStoreClient::new());
        let agent = Arc::new(sample_agent(valid_spec()));
        assert_eq!(
            error_policy(agent.clone(), &api_error(500, "InternalError"), ctx.clone()),
            Action::requeue(ERROR_REQUEUE)
        );
        assert_eq!(
            error_policy(agent, &Error::validation("bad spec"), ctx),
            Action::await_change()
        );
    }
}

//! Workload diff/apply engine
//!
//! Every managed workload goes through the same state machine whatever its
//! kind:
//!
//! ```text
//! stamp hash → get live ─┬─ missing ──────────────────────────→ Create
//!                        ├─ selector changed ─────────────────→ Replace (orphan delete)
//!                        └─ migrate owner refs ─┬─ hash + labels equal → Noop
//!                                               ├─ canary not settled ─→ Defer
//!                                               └─ otherwise ─────────→ Update
//! ```
//!
//! Status is written through [`record_workload_status`] for every kind so the
//! component loop never needs to know which kind it is looking at.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy, Deployment, DeploymentSpec,
    RollingUpdateDaemonSet,
};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::runtime::events::EventType;
use tracing::{debug, info};

use vigil_common::crd::{
    set_condition, CanaryStrategy, ComponentName, Condition, ConditionStatus, DesiredAgentStatus,
    ExtendedDaemonSet, ExtendedDaemonSetSpec, ExtendedDaemonSetStrategy, RollingUpdateStrategy,
    WorkloadStatus,
};
use vigil_common::events::{actions, reasons};
use vigil_common::kube_utils::{
    annotations_of, labels_of, merge_annotations_labels, migrate_owner_references,
    preserve_replicas, spec_hash, strip_legacy_profile_label,
};
use vigil_common::metrics::{record_workload_operation, WorkloadOutcome};
use vigil_common::{
    ANNOTATION_SPEC_HASH, LABEL_COMPONENT, LABEL_INSTANCE, LABEL_MANAGED_BY, LABEL_NAME,
    LABEL_PART_OF, LABEL_PROFILE, LABEL_PROVIDER, LEGACY_OWNER_KIND, OPERATOR_NAME,
};

use crate::canary::{gate_profile_update, CanaryDecision};
use crate::context::ReconcileContext;
use crate::options::OperatorOptions;
use crate::profile::ResolvedProfile;
use crate::provider::DEFAULT_PROVIDER;
use crate::Result;

/// Requeue after a selector change so the replacement is created quickly
pub const REPLACE_REQUEUE: Duration = Duration::from_secs(1);

/// Status reason codes
pub mod status_reasons {
    /// Workload created
    pub const CREATE_SUCCEEDED: &str = "CreateSucceeded";
    /// Workload updated
    pub const UPDATE_SUCCEEDED: &str = "UpdateSucceeded";
    /// Nothing to change
    pub const UP_TO_DATE: &str = "UpToDate";
    /// Update held back by the canary gate
    pub const UPDATE_DEFERRED: &str = "UpdateDeferred";
    /// Workload deleted because its selector changed
    pub const SELECTOR_CHANGED: &str = "SelectorChanged";
    /// Workload could not be reconciled
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
}

// =============================================================================
// Workload kinds
// =============================================================================

/// Kind of a managed workload
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkloadKind {
    /// apps/v1 DaemonSet
    DaemonSet,
    /// apps/v1 Deployment
    Deployment,
    /// Canary-capable daemon
    ExtendedDaemonSet,
}

impl WorkloadKind {
    /// Kind name as reported in status and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DaemonSet => "DaemonSet",
            Self::Deployment => "Deployment",
            Self::ExtendedDaemonSet => "ExtendedDaemonSet",
        }
    }

    /// Daemon kinds carry their pod template labels as a separate channel
    pub fn is_daemon(&self) -> bool {
        matches!(self, Self::DaemonSet | Self::ExtendedDaemonSet)
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A managed workload object of any kind
#[derive(Clone, Debug)]
pub enum Workload {
    /// DaemonSet
    DaemonSet(DaemonSet),
    /// Deployment
    Deployment(Deployment),
    /// ExtendedDaemonSet
    ExtendedDaemonSet(ExtendedDaemonSet),
}

/// Pod counters read from a workload's status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkloadCounters {
    /// Desired pods
    pub desired: i32,
    /// Current pods
    pub current: i32,
    /// Ready pods
    pub ready: i32,
    /// Available pods
    pub available: i32,
    /// Pods on the latest template
    pub up_to_date: i32,
}

impl Workload {
    /// Kind of this workload
    pub fn kind(&self) -> WorkloadKind {
        match self {
            Self::DaemonSet(_) => WorkloadKind::DaemonSet,
            Self::Deployment(_) => WorkloadKind::Deployment,
            Self::ExtendedDaemonSet(_) => WorkloadKind::ExtendedDaemonSet,
        }
    }

    /// Object metadata
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Self::DaemonSet(o) => &o.metadata,
            Self::Deployment(o) => &o.metadata,
            Self::ExtendedDaemonSet(o) => &o.metadata,
        }
    }

    /// Mutable object metadata
    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::DaemonSet(o) => &mut o.metadata,
            Self::Deployment(o) => &mut o.metadata,
            Self::ExtendedDaemonSet(o) => &mut o.metadata,
        }
    }

    /// Object name
    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    /// Object namespace
    pub fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    /// Pod selector
    pub fn selector(&self) -> Option<&LabelSelector> {
        match self {
            Self::DaemonSet(o) => o.spec.as_ref().map(|s| &s.selector),
            Self::Deployment(o) => o.spec.as_ref().map(|s| &s.selector),
            Self::ExtendedDaemonSet(o) => o.spec.selector.as_ref(),
        }
    }

    /// Pod template
    pub fn template(&self) -> Option<&PodTemplateSpec> {
        match self {
            Self::DaemonSet(o) => o.spec.as_ref().map(|s| &s.template),
            Self::Deployment(o) => o.spec.as_ref().map(|s| &s.template),
            Self::ExtendedDaemonSet(o) => Some(&o.spec.template),
        }
    }

    /// Labels of the pod template
    pub fn template_labels(&self) -> BTreeMap<String, String> {
        self.template()
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.labels.clone())
            .unwrap_or_default()
    }

    /// Replica count, deployments only
    pub fn replicas(&self) -> Option<i32> {
        match self {
            Self::Deployment(o) => o.spec.as_ref().and_then(|s| s.replicas),
            _ => None,
        }
    }

    /// Set the replica count; ignored for daemons
    pub fn set_replicas(&mut self, replicas: Option<i32>) {
        if let Self::Deployment(o) = self {
            if let Some(spec) = o.spec.as_mut() {
                spec.replicas = replicas;
            }
        }
    }

    /// Content hash of the spec
    pub fn compute_hash(&self) -> Result<String> {
        match self {
            Self::DaemonSet(o) => spec_hash(&o.spec),
            Self::Deployment(o) => spec_hash(&o.spec),
            Self::ExtendedDaemonSet(o) => spec_hash(&o.spec),
        }
    }

    /// Compute the content hash and store it as an annotation
    pub fn stamp_hash(&mut self) -> Result<String> {
        let hash = self.compute_hash()?;
        self.meta_mut()
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ANNOTATION_SPEC_HASH.to_string(), hash.clone());
        Ok(hash)
    }

    /// Hash stored on the object, if any
    pub fn stored_hash(&self) -> Option<&str> {
        self.meta()
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_SPEC_HASH))
            .map(String::as_str)
    }

    /// Pod counters; `None` before the workload controller reported any
    pub fn counters(&self) -> Option<WorkloadCounters> {
        match self {
            Self::DaemonSet(o) => o.status.as_ref().map(|s| WorkloadCounters {
                desired: s.desired_number_scheduled,
                current: s.current_number_scheduled,
                ready: s.number_ready,
                available: s.number_available.unwrap_or_default(),
                up_to_date: s.updated_number_scheduled.unwrap_or_default(),
            }),
            Self::Deployment(o) => o.status.as_ref().map(|s| WorkloadCounters {
                desired: o.spec.as_ref().and_then(|sp| sp.replicas).unwrap_or(1),
                current: s.replicas.unwrap_or_default(),
                ready: s.ready_replicas.unwrap_or_default(),
                available: s.available_replicas.unwrap_or_default(),
                up_to_date: s.updated_replicas.unwrap_or_default(),
            }),
            Self::ExtendedDaemonSet(o) => o.status.as_ref().map(|s| WorkloadCounters {
                desired: s.desired,
                current: s.current,
                ready: s.ready,
                available: s.available,
                up_to_date: s.up_to_date,
            }),
        }
    }
}

// =============================================================================
// Desired workloads
// =============================================================================

/// Selector labels of a component workload.
///
/// Profile and provider labels are only added for non-default values, so the
/// default workload keeps the same selector whether or not profiles and
/// introspection are on.
pub fn selector_labels(
    agent_name: &str,
    component: ComponentName,
    profile: Option<&ResolvedProfile>,
    provider: &str,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (
            LABEL_INSTANCE.to_string(),
            format!("{}-{}", agent_name, component.suffix()),
        ),
        (LABEL_COMPONENT.to_string(), component.suffix().to_string()),
    ]);
    if let Some(p) = profile.filter(|p| !p.is_default()) {
        labels.insert(LABEL_PROFILE.to_string(), p.name().to_string());
    }
    if !provider.is_empty() && provider != DEFAULT_PROVIDER {
        labels.insert(LABEL_PROVIDER.to_string(), provider.to_string());
    }
    labels
}

/// Everything needed to assemble one workload object
pub struct WorkloadSpecInput {
    /// Kind to build
    pub kind: WorkloadKind,
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
    /// Component the workload runs
    pub component: ComponentName,
    /// Pod selector labels
    pub selector: BTreeMap<String, String>,
    /// `part-of` label value
    pub part_of: String,
    /// Controller owner
    pub owner: OwnerReference,
    /// Built pod template
    pub template: PodTemplateSpec,
    /// Replica count, deployments only
    pub replicas: Option<i32>,
}

/// Assemble a workload object from a built pod template.
///
/// Selector labels are copied into the pod template so the workload always
/// matches its own pods.
pub fn build_workload(input: WorkloadSpecInput, options: &OperatorOptions) -> Workload {
    let WorkloadSpecInput {
        kind,
        name,
        namespace,
        component,
        selector,
        part_of,
        owner,
        mut template,
        replicas,
    } = input;

    template
        .metadata
        .get_or_insert_with(Default::default)
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(selector.clone());

    let mut labels = selector.clone();
    labels.insert(LABEL_MANAGED_BY.to_string(), OPERATOR_NAME.to_string());
    labels.insert(LABEL_PART_OF.to_string(), part_of);
    labels.insert(LABEL_NAME.to_string(), component.suffix().to_string());

    let metadata = ObjectMeta {
        name: Some(name),
        namespace: Some(namespace),
        labels: Some(labels),
        owner_references: Some(vec![owner]),
        ..Default::default()
    };
    let label_selector = LabelSelector {
        match_labels: Some(selector),
        match_expressions: None,
    };

    match kind {
        WorkloadKind::DaemonSet => Workload::DaemonSet(DaemonSet {
            metadata,
            spec: Some(DaemonSetSpec {
                selector: label_selector,
                template,
                update_strategy: Some(DaemonSetUpdateStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    rolling_update: Some(RollingUpdateDaemonSet {
                        max_unavailable: Some(IntOrString::String("10%".to_string())),
                        max_surge: None,
                    }),
                }),
                ..Default::default()
            }),
            status: None,
        }),
        WorkloadKind::Deployment => Workload::Deployment(Deployment {
            metadata,
            spec: Some(DeploymentSpec {
                replicas,
                selector: label_selector,
                template,
                ..Default::default()
            }),
            status: None,
        }),
        WorkloadKind::ExtendedDaemonSet => Workload::ExtendedDaemonSet(ExtendedDaemonSet {
            metadata,
            spec: ExtendedDaemonSetSpec {
                selector: Some(label_selector),
                template,
                strategy: ExtendedDaemonSetStrategy {
                    canary: Some(CanaryStrategy {
                        replicas: Some(1),
                        duration: Some(format!("{}s", options.canary_duration.as_secs())),
                        auto_pause: Some(true),
                    }),
                    rolling_update: Some(RollingUpdateStrategy {
                        max_parallel_pods_creation: Some(250),
                        max_unavailable: Some("10%".to_string()),
                    }),
                },
            },
            status: None,
        }),
    }
}

// =============================================================================
// Diff/apply
// =============================================================================

/// Result of one diff/apply pass
#[derive(Clone, Debug)]
pub struct WorkloadResult {
    /// What the engine did
    pub outcome: WorkloadOutcome,
    /// Live object after the pass, `None` when it was deleted
    pub live: Option<Workload>,
    /// Requested requeue, if sooner than the default period
    pub requeue_after: Option<Duration>,
    /// Human-readable summary
    pub message: String,
}

impl WorkloadResult {
    fn new(outcome: WorkloadOutcome, live: Option<Workload>, message: String) -> Self {
        Self {
            outcome,
            live,
            requeue_after: None,
            message,
        }
    }

    /// Status reason code for the outcome
    pub fn reason(&self) -> &'static str {
        match self.outcome {
            WorkloadOutcome::Create => status_reasons::CREATE_SUCCEEDED,
            WorkloadOutcome::Update => status_reasons::UPDATE_SUCCEEDED,
            WorkloadOutcome::Noop | WorkloadOutcome::Delete => status_reasons::UP_TO_DATE,
            WorkloadOutcome::Defer => status_reasons::UPDATE_DEFERRED,
            WorkloadOutcome::Replace => status_reasons::SELECTOR_CHANGED,
        }
    }
}

/// Converge one desired workload onto the cluster.
///
/// `canary` names the ExtendedDaemonSet whose rollout gates updates of this
/// workload. Create and replace are never gated.
pub async fn reconcile_workload(
    ctx: &ReconcileContext<'_>,
    mut desired: Workload,
    canary: Option<&str>,
) -> Result<WorkloadResult> {
    let kind = desired.kind();
    let name = desired.name().to_string();
    let namespace = desired.namespace().to_string();
    let hash = desired.stamp_hash()?;

    let Some(mut live) = ctx
        .client
        .get_workload(kind, &namespace, &name)
        .await?
    else {
        let created = ctx.client.create_workload(desired).await?;
        info!(kind = %kind, workload = %name, "created workload");
        record_workload_operation(kind.as_str(), WorkloadOutcome::Create);
        ctx.events
            .publish(
                &ctx.object_ref,
                EventType::Normal,
                reasons::WORKLOAD_CREATED,
                actions::CREATE,
                Some(format!("{} {}/{} created", kind, namespace, name)),
            )
            .await;
        return Ok(WorkloadResult::new(
            WorkloadOutcome::Create,
            Some(created),
            format!("{} {} created", kind, name),
        ));
    };

    if live.selector() != desired.selector() {
        info!(kind = %kind, workload = %name, "selector changed, deleting with orphaned pods");
        ctx.client
            .delete_workload(kind, &namespace, &name, true)
            .await?;
        record_workload_operation(kind.as_str(), WorkloadOutcome::Replace);
        ctx.events
            .publish(
                &ctx.object_ref,
                EventType::Normal,
                reasons::WORKLOAD_REPLACED,
                actions::DELETE,
                Some(format!(
                    "{} {}/{} deleted for recreation, selector changed",
                    kind, namespace, name
                )),
            )
            .await;
        let mut result = WorkloadResult::new(
            WorkloadOutcome::Replace,
            None,
            format!("{} {} selector changed, recreating", kind, name),
        );
        result.requeue_after = Some(REPLACE_REQUEUE);
        return Ok(result);
    }

    if let Some(refs) = migrate_owner_references(live.meta(), LEGACY_OWNER_KIND, &ctx.owner) {
        info!(kind = %kind, workload = %name, "migrating legacy owner reference");
        ctx.client
            .patch_owner_references(kind, &namespace, &name, &refs)
            .await?;
        live.meta_mut().owner_references = Some(refs);
    }

    let hash_equal = live.stored_hash() == Some(hash.as_str());
    let labels_equal = !kind.is_daemon() || live.template_labels() == desired.template_labels();
    if hash_equal && labels_equal {
        debug!(kind = %kind, workload = %name, "workload up to date");
        record_workload_operation(kind.as_str(), WorkloadOutcome::Noop);
        return Ok(WorkloadResult::new(
            WorkloadOutcome::Noop,
            Some(live),
            format!("{} {} up to date", kind, name),
        ));
    }

    if let Some(eds_name) = canary {
        if let CanaryDecision::Defer(why) = gate_profile_update(ctx, eds_name).await? {
            info!(workload = %name, reason = %why, "update deferred by canary gate");
            record_workload_operation(kind.as_str(), WorkloadOutcome::Defer);
            let mut result = WorkloadResult::new(
                WorkloadOutcome::Defer,
                Some(live),
                format!("{} {} update deferred: {}", kind, name, why),
            );
            result.requeue_after = Some(ctx.options.requeue_period);
            return Ok(result);
        }
    }

    let replicas = preserve_replicas(desired.replicas(), live.replicas());
    desired.set_replicas(replicas);

    let mut previous_labels = labels_of(live.meta());
    strip_legacy_profile_label(&mut previous_labels);
    let labels = merge_annotations_labels(
        &previous_labels,
        &labels_of(desired.meta()),
        &ctx.options.keep_labels,
    );
    let annotations = merge_annotations_labels(
        &annotations_of(live.meta()),
        &annotations_of(desired.meta()),
        &ctx.options.keep_annotations,
    );
    let meta = desired.meta_mut();
    meta.labels = Some(labels);
    meta.annotations = Some(annotations);
    meta.resource_version = live.meta().resource_version.clone();

    let updated = ctx.client.update_workload(desired).await?;
    info!(kind = %kind, workload = %name, "updated workload");
    record_workload_operation(kind.as_str(), WorkloadOutcome::Update);
    ctx.events
        .publish(
            &ctx.object_ref,
            EventType::Normal,
            reasons::WORKLOAD_UPDATED,
            actions::UPDATE,
            Some(format!("{} {}/{} updated", kind, namespace, name)),
        )
        .await;
    Ok(WorkloadResult::new(
        WorkloadOutcome::Update,
        Some(updated),
        format!("{} {} updated", kind, name),
    ))
}

// =============================================================================
// Status
// =============================================================================

fn state_of(counters: Option<WorkloadCounters>) -> &'static str {
    match counters {
        None => "Progressing",
        Some(c) if c.up_to_date < c.desired => "Updating",
        Some(c) if c.ready == c.desired => "Running",
        Some(_) => "Progressing",
    }
}

/// Write one workload's outcome into the DesiredAgent status.
///
/// Same signature for every kind. The node agent goes through the
/// per-workload list and the combined entry; other components own a single
/// slot. `last_update` only moves when the entry actually changes.
#[allow(clippy::too_many_arguments)]
pub fn record_workload_status(
    status: &mut DesiredAgentStatus,
    component: ComponentName,
    name: &str,
    live: Option<&Workload>,
    now: DateTime<Utc>,
    ok: bool,
    reason: &str,
    message: &str,
) {
    let counters = live.and_then(Workload::counters);
    let state = if ok { state_of(counters) } else { "Failed" };
    let c = counters.unwrap_or_default();
    let mut entry = WorkloadStatus {
        name: name.to_string(),
        kind: live.map(|w| w.kind().as_str().to_string()).unwrap_or_default(),
        desired: c.desired,
        current: c.current,
        ready: c.ready,
        available: c.available,
        up_to_date: c.up_to_date,
        state: state.to_string(),
        status: format!("{} ({}/{}/{})", state, c.desired, c.ready, c.up_to_date),
        current_hash: live.and_then(Workload::stored_hash).map(str::to_string),
        last_update: Some(now),
    };

    let previous = if component == ComponentName::NodeAgent {
        status.agent_list.iter().find(|s| s.name == name).cloned()
    } else {
        status.component_mut(component).clone()
    };
    if let Some(prev) = previous {
        if entry.kind.is_empty() {
            entry.kind = prev.kind.clone();
        }
        let unchanged = WorkloadStatus {
            last_update: prev.last_update,
            ..entry.clone()
        } == prev;
        if unchanged {
            entry.last_update = prev.last_update;
        }
    }

    if component == ComponentName::NodeAgent {
        status.upsert_agent(entry);
    } else {
        *status.component_mut(component) = Some(entry);
    }

    set_condition(
        &mut status.conditions,
        Condition::at(
            &component.condition_type(),
            ConditionStatus::from_bool(ok),
            reason,
            message,
            now,
        ),
    );
}

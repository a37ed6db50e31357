//! Per-reconcile context
//!
//! Built once at the top of a reconcile and passed by reference to every
//! component, so nothing below the controller threads options, clients or
//! the resolved spec through its own signatures.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use vigil_common::crd::{ComponentName, DesiredAgent};
use vigil_common::{part_of_value, EventPublisher};

use crate::client::AgentKubeClient;
use crate::features::Feature;
use crate::options::OperatorOptions;
use crate::pod_template::{component_resource_name, TemplateInput};
use crate::profile::NodeAgentTarget;
use crate::required::RequiredComponents;
use crate::{Error, Result};

/// Everything one reconcile of one DesiredAgent needs
pub struct ReconcileContext<'a> {
    /// DesiredAgent being reconciled
    pub agent: &'a DesiredAgent,
    /// DesiredAgent name
    pub name: String,
    /// DesiredAgent namespace, also the namespace of every managed workload
    pub namespace: String,
    /// Resolved requirements
    pub required: &'a RequiredComponents,
    /// Enabled features, in registry order
    pub features: &'a [Box<dyn Feature>],
    /// Process options
    pub options: &'a OperatorOptions,
    /// Kubernetes client
    pub client: &'a dyn AgentKubeClient,
    /// Event sink
    pub events: &'a dyn EventPublisher,
    /// Controller owner reference put on every managed object
    pub owner: OwnerReference,
    /// Reference to the DesiredAgent for events
    pub object_ref: ObjectReference,
    /// Cluster agent auth token
    pub token: String,
    /// Node agent workloads to run, one per profile and provider
    pub node_targets: Vec<NodeAgentTarget>,
    /// Reconcile timestamp
    pub now: DateTime<Utc>,
}

/// Inputs for [`ReconcileContext::new`] that are not derived from the agent
pub struct ContextParams<'a> {
    /// Resolved requirements
    pub required: &'a RequiredComponents,
    /// Enabled features
    pub features: &'a [Box<dyn Feature>],
    /// Process options
    pub options: &'a OperatorOptions,
    /// Kubernetes client
    pub client: &'a dyn AgentKubeClient,
    /// Event sink
    pub events: &'a dyn EventPublisher,
    /// Cluster agent auth token
    pub token: String,
    /// Reconcile timestamp
    pub now: DateTime<Utc>,
}

impl<'a> ReconcileContext<'a> {
    /// Build the context for one DesiredAgent.
    ///
    /// Node targets start empty; the controller fills them from the profile
    /// sync before the component loop runs.
    pub fn new(agent: &'a DesiredAgent, params: ContextParams<'a>) -> Result<Self> {
        let owner = agent
            .controller_owner_ref(&())
            .ok_or_else(|| Error::internal("DesiredAgent has no name or uid"))?;
        let namespace = agent
            .namespace()
            .ok_or_else(|| Error::validation("DesiredAgent must be namespaced"))?;
        Ok(Self {
            agent,
            name: agent.name_any(),
            namespace,
            required: params.required,
            features: params.features,
            options: params.options,
            client: params.client,
            events: params.events,
            owner,
            object_ref: agent.object_ref(&()),
            token: params.token,
            node_targets: Vec::new(),
            now: params.now,
        })
    }

    /// `part-of` label value shared by everything this agent owns
    pub fn part_of(&self) -> String {
        part_of_value(&self.namespace, &self.name)
    }

    /// Name of a component's workload, honouring the override name
    pub fn workload_name(&self, component: ComponentName) -> String {
        self.agent
            .spec
            .override_for(component)
            .and_then(|ov| ov.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| component_resource_name(&self.name, component))
    }

    /// Pipeline input for a component template
    pub fn template_input<'b>(
        &'b self,
        component: ComponentName,
        target: Option<&'b NodeAgentTarget>,
    ) -> TemplateInput<'b> {
        TemplateInput {
            component,
            agent: self.agent,
            required: self.required,
            features: self.features,
            options: self.options,
            provider: target.map(|t| t.provider.as_str()).unwrap_or_default(),
            token: &self.token,
            profile: target.map(|t| &t.profile),
        }
    }
}

//! Pluggable features and the required-components resolver
//!
//! A feature inspects the DesiredAgent spec, says which components and
//! containers it needs, stages its secondary objects and mutates the pod
//! templates of the components it touches. Features are rebuilt from the spec
//! on every reconcile and hold no state across reconciles.

use std::fmt;

use tracing::debug;

use crate::crd::{ComponentName, ContainerStrategy, DesiredAgent};
use crate::options::OperatorOptions;
use crate::pod_template::PodTemplateManager;
use crate::required::RequiredComponents;
use crate::store::DependencyStore;
use crate::Result;

mod admission_controller;
mod apm;
mod cluster_checks;
mod default;
mod event_collection;
mod kube_state_metrics;
mod live_processes;
mod log_collection;
mod otel;

pub use admission_controller::AdmissionControllerFeature;
pub use apm::ApmFeature;
pub use cluster_checks::ClusterChecksFeature;
pub use default::DefaultFeature;
pub use event_collection::EventCollectionFeature;
pub use kube_state_metrics::KubeStateMetricsCoreFeature;
pub use live_processes::LiveProcessesFeature;
pub use log_collection::LogCollectionFeature;
pub use otel::{OtelAgentGatewayFeature, OtelCollectorFeature, OtelCollectorGatewayFeature};

/// Identifier of a feature
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeatureId {
    /// Base wiring every agent needs
    Default,
    /// Container log collection
    LogCollection,
    /// APM trace intake
    Apm,
    /// Live process collection
    LiveProcesses,
    /// Admission controller in the cluster agent
    AdmissionController,
    /// Kubernetes event collection
    EventCollection,
    /// Kube state metrics core check
    KubeStateMetricsCore,
    /// Cluster checks dispatching
    ClusterChecks,
    /// OTel collector inside the node agent
    OtelCollector,
    /// OTel agent gateway deployment
    OtelAgentGateway,
    /// OTel collector gateway deployment
    OtelCollectorGateway,
}

impl FeatureId {
    /// Stable identifier string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::LogCollection => "logCollection",
            Self::Apm => "apm",
            Self::LiveProcesses => "liveProcesses",
            Self::AdmissionController => "admissionController",
            Self::EventCollection => "eventCollection",
            Self::KubeStateMetricsCore => "kubeStateMetricsCore",
            Self::ClusterChecks => "clusterChecks",
            Self::OtelCollector => "otelCollector",
            Self::OtelAgentGateway => "otelAgentGateway",
            Self::OtelCollectorGateway => "otelCollectorGateway",
        }
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One optional capability of the agent.
///
/// `configure` runs first and may capture whatever it needs from the spec.
/// The other methods are only called on features whose `configure` returned
/// a non-empty value. Each `manage_*` method mutates the template of one
/// component for one provider and must be idempotent.
pub trait Feature: Send + Sync {
    /// Identifier used in logs and error messages
    fn id(&self) -> FeatureId;

    /// Components and containers this feature needs
    fn configure(&mut self, agent: &DesiredAgent, options: &OperatorOptions) -> RequiredComponents;

    /// Stage secondary objects
    fn manage_dependencies(
        &self,
        _store: &mut DependencyStore,
        _required: &RequiredComponents,
    ) -> Result<()> {
        Ok(())
    }

    /// Mutate the node agent template
    fn manage_node_agent(&self, _tpl: &mut PodTemplateManager, _provider: &str) -> Result<()> {
        Ok(())
    }

    /// Mutate the node agent template in single-container mode
    fn manage_single_container_node_agent(
        &self,
        _tpl: &mut PodTemplateManager,
        _provider: &str,
    ) -> Result<()> {
        Ok(())
    }

    /// Mutate the cluster agent template
    fn manage_cluster_agent(&self, _tpl: &mut PodTemplateManager, _provider: &str) -> Result<()> {
        Ok(())
    }

    /// Mutate the cluster checks runner template
    fn manage_cluster_checks_runner(
        &self,
        _tpl: &mut PodTemplateManager,
        _provider: &str,
    ) -> Result<()> {
        Ok(())
    }

    /// Mutate the OTel agent gateway template
    fn manage_otel_agent_gateway(&self, _tpl: &mut PodTemplateManager, _provider: &str) -> Result<()> {
        Ok(())
    }

    /// Mutate the OTel collector gateway template
    fn manage_otel_collector_gateway(
        &self,
        _tpl: &mut PodTemplateManager,
        _provider: &str,
    ) -> Result<()> {
        Ok(())
    }
}

/// Constructor of a fresh feature
pub type FeatureBuilder = fn() -> Box<dyn Feature>;

/// Constructor for any feature with a default value
pub fn builder<F: Feature + Default + 'static>() -> Box<dyn Feature> {
    Box::new(F::default())
}

/// Ordered list of feature constructors
#[derive(Clone)]
pub struct FeatureRegistry {
    builders: Vec<FeatureBuilder>,
}

/// Features enabled for one reconcile with their merged requirements
pub struct ResolvedFeatures {
    /// Enabled features, in registry order
    pub features: Vec<Box<dyn Feature>>,
    /// Merged requirements, override floor applied
    pub required: RequiredComponents,
}

impl FeatureRegistry {
    /// Registry over an explicit list of constructors
    pub fn new(builders: Vec<FeatureBuilder>) -> Self {
        Self { builders }
    }

    /// Every built-in feature in its fixed order
    pub fn default_set() -> Self {
        Self::new(vec![
            builder::<DefaultFeature> as FeatureBuilder,
            builder::<LogCollectionFeature>,
            builder::<ApmFeature>,
            builder::<LiveProcessesFeature>,
            builder::<AdmissionControllerFeature>,
            builder::<EventCollectionFeature>,
            builder::<KubeStateMetricsCoreFeature>,
            builder::<ClusterChecksFeature>,
            builder::<OtelCollectorFeature>,
            builder::<OtelAgentGatewayFeature>,
            builder::<OtelCollectorGatewayFeature>,
        ])
    }

    /// Number of registered features
    pub fn len(&self) -> usize {
        self.builders.len()
    }

    /// True when no feature is registered
    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }

    /// Resolve which features are on and what they require.
    ///
    /// Components disabled by an override are floored before any feature
    /// runs, so no feature can turn them back on.
    pub fn resolve(&self, agent: &DesiredAgent, options: &OperatorOptions) -> ResolvedFeatures {
        let mut required = RequiredComponents::default();
        for component in ComponentName::ALL {
            if agent.spec.is_disabled_by_override(component) {
                required.get_mut(component).force_off();
            }
        }

        let mut features = Vec::new();
        for build in &self.builders {
            let mut feature = build();
            let wanted = feature.configure(agent, options);
            if wanted.is_empty() {
                continue;
            }
            debug!(feature = %feature.id(), "feature enabled");
            required.merge(&wanted);
            features.push(feature);
        }

        required.single_container =
            agent.spec.global.container_strategy == ContainerStrategy::Single;

        ResolvedFeatures { features, required }
    }
}

impl Default for FeatureRegistry {
    fn default() -> Self {
        Self::default_set()
    }
}

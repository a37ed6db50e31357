//! Cluster checks dispatched by the cluster agent
//!
//! Checks run either in dedicated runner pods or, without runners, in the
//! node agents.

use super::{Feature, FeatureId};
use crate::crd::{ComponentName, DesiredAgent};
use crate::dependencies::{rule, stage_cluster_role, stage_service_account, READ};
use crate::options::OperatorOptions;
use crate::pod_template::{component_resource_name, env_var, PodTemplateManager};
use crate::required::{AgentContainer, RequiredComponent, RequiredComponents};
use crate::store::DependencyStore;
use crate::Result;

const ENV_CLUSTER_CHECKS_ENABLED: &str = "VIGIL_CLUSTER_CHECKS_ENABLED";
const ENV_EXTRA_CONFIG_PROVIDERS: &str = "VIGIL_EXTRA_CONFIG_PROVIDERS";
const ENV_EXTRA_LISTENERS: &str = "VIGIL_EXTRA_LISTENERS";
const ENV_ENABLE_METADATA_COLLECTION: &str = "VIGIL_ENABLE_METADATA_COLLECTION";

/// Cluster checks feature
#[derive(Debug, Default)]
pub struct ClusterChecksFeature {
    agent_name: String,
    use_runners: bool,
}

impl ClusterChecksFeature {
    fn node_agent(&self, tpl: &mut PodTemplateManager, container: AgentContainer) -> Result<()> {
        let providers = if self.use_runners {
            "endpointschecks"
        } else {
            "clusterchecks endpointschecks"
        };
        tpl.add_env(container.as_str(), env_var(ENV_EXTRA_CONFIG_PROVIDERS, providers))
    }
}

impl Feature for ClusterChecksFeature {
    fn id(&self) -> FeatureId {
        FeatureId::ClusterChecks
    }

    fn configure(&mut self, agent: &DesiredAgent, _options: &OperatorOptions) -> RequiredComponents {
        let Some(cfg) = agent
            .spec
            .features
            .cluster_checks
            .as_ref()
            .filter(|c| c.enabled)
        else {
            return RequiredComponents::default();
        };
        self.agent_name = agent.metadata.name.clone().unwrap_or_default();
        self.use_runners = cfg.use_cluster_checks_runners;

        let mut required = RequiredComponents {
            cluster_agent: RequiredComponent::required([AgentContainer::ClusterAgent]),
            ..Default::default()
        };
        if self.use_runners {
            required.cluster_checks_runner =
                RequiredComponent::required([AgentContainer::ClusterChecksRunner]);
        } else {
            required.node_agent = RequiredComponent::required([AgentContainer::Core]);
        }
        required
    }

    fn manage_dependencies(
        &self,
        store: &mut DependencyStore,
        required: &RequiredComponents,
    ) -> Result<()> {
        if !required.is_enabled(ComponentName::ClusterChecksRunner) {
            return Ok(());
        }
        let name = component_resource_name(&self.agent_name, ComponentName::ClusterChecksRunner);
        stage_service_account(store, &name)?;
        stage_cluster_role(
            store,
            &name,
            vec![
                rule(
                    &[""],
                    &["services", "endpoints", "pods", "nodes", "namespaces", "componentstatuses"],
                    READ,
                ),
                rule(&[""], &["nodes/metrics", "nodes/stats", "nodes/proxy"], &["get"]),
                rule(&["discovery.k8s.io"], &["endpointslices"], READ),
            ],
            &name,
        )
    }

    fn manage_node_agent(&self, tpl: &mut PodTemplateManager, _provider: &str) -> Result<()> {
        self.node_agent(tpl, AgentContainer::Core)
    }

    fn manage_single_container_node_agent(
        &self,
        tpl: &mut PodTemplateManager,
        _provider: &str,
    ) -> Result<()> {
        self.node_agent(tpl, AgentContainer::Unified)
    }

    fn manage_cluster_agent(&self, tpl: &mut PodTemplateManager, _provider: &str) -> Result<()> {
        let main = AgentContainer::ClusterAgent.as_str();
        tpl.add_env(main, env_var(ENV_CLUSTER_CHECKS_ENABLED, "true"))?;
        tpl.add_env(
            main,
            env_var(ENV_EXTRA_CONFIG_PROVIDERS, "kube_endpoints kube_services"),
        )?;
        tpl.add_env(main, env_var(ENV_EXTRA_LISTENERS, "kube_endpoints kube_services"))
    }

    fn manage_cluster_checks_runner(
        &self,
        tpl: &mut PodTemplateManager,
        _provider: &str,
    ) -> Result<()> {
        let main = AgentContainer::ClusterChecksRunner.as_str();
        tpl.add_env(main, env_var(ENV_EXTRA_CONFIG_PROVIDERS, "clusterchecks"))?;
        tpl.add_env(main, env_var(ENV_ENABLE_METADATA_COLLECTION, "false"))
    }
}

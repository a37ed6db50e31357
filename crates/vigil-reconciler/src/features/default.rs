//! Base wiring shared by every agent
//!
//! Always on. Requires the node agent and the cluster agent, exposes the
//! cluster agent through a service and points the other components at it.

use k8s_openapi::api::core::v1::ContainerPort;

use super::{Feature, FeatureId};
use crate::crd::{ComponentName, DesiredAgent};
use crate::dependencies::stage_service;
use crate::options::OperatorOptions;
use crate::pod_template::{component_resource_name, env_from_field, env_var, PodTemplateManager};
use crate::required::{AgentContainer, RequiredComponent, RequiredComponents};
use crate::store::DependencyStore;
use crate::Result;

/// Cluster agent command port
pub const CLUSTER_AGENT_PORT: i32 = 5005;

/// Node agent health port
pub const HEALTH_PORT: i32 = 5555;

const ENV_CLUSTER_AGENT_ENABLED: &str = "VIGIL_CLUSTER_AGENT_ENABLED";
const ENV_CLUSTER_AGENT_SERVICE: &str = "VIGIL_CLUSTER_AGENT_KUBERNETES_SERVICE_NAME";
const ENV_KUBELET_HOST: &str = "VIGIL_KUBERNETES_KUBELET_HOST";
const ENV_HEALTH_PORT: &str = "VIGIL_HEALTH_PORT";
const ENV_LEADER_ELECTION: &str = "VIGIL_LEADER_ELECTION";
const ENV_POD_NAMESPACE: &str = "VIGIL_POD_NAMESPACE";

/// Always-on base feature
#[derive(Debug, Default)]
pub struct DefaultFeature {
    agent_name: String,
    service_name: String,
    cluster_agent_enabled: bool,
}

impl DefaultFeature {
    fn node_agent(&self, tpl: &mut PodTemplateManager, main: AgentContainer) -> Result<()> {
        tpl.add_env_all(env_from_field(ENV_KUBELET_HOST, "status.hostIP"));
        tpl.add_env_all(env_var(
            ENV_CLUSTER_AGENT_ENABLED,
            self.cluster_agent_enabled.to_string(),
        ));
        if self.cluster_agent_enabled {
            tpl.add_env_all(env_var(ENV_CLUSTER_AGENT_SERVICE, self.service_name.clone()));
        }
        tpl.add_env(main.as_str(), env_var(ENV_HEALTH_PORT, HEALTH_PORT.to_string()))?;
        tpl.add_port(
            main.as_str(),
            ContainerPort {
                name: Some("health".to_string()),
                container_port: HEALTH_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        )
    }
}

impl Feature for DefaultFeature {
    fn id(&self) -> FeatureId {
        FeatureId::Default
    }

    fn configure(&mut self, agent: &DesiredAgent, _options: &OperatorOptions) -> RequiredComponents {
        self.agent_name = agent.metadata.name.clone().unwrap_or_default();
        self.service_name = component_resource_name(&self.agent_name, ComponentName::ClusterAgent);
        self.cluster_agent_enabled = !agent.spec.is_disabled_by_override(ComponentName::ClusterAgent);

        RequiredComponents {
            node_agent: RequiredComponent::required([AgentContainer::Core]),
            cluster_agent: RequiredComponent::required([AgentContainer::ClusterAgent]),
            ..Default::default()
        }
    }

    fn manage_dependencies(
        &self,
        store: &mut DependencyStore,
        required: &RequiredComponents,
    ) -> Result<()> {
        if !required.is_enabled(ComponentName::ClusterAgent) {
            return Ok(());
        }
        stage_service(
            store,
            &self.service_name,
            &self.agent_name,
            ComponentName::ClusterAgent,
            &[("agentport", CLUSTER_AGENT_PORT)],
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
        tpl.add_env_all(env_var(ENV_CLUSTER_AGENT_SERVICE, self.service_name.clone()));
        tpl.add_env_all(env_var(ENV_LEADER_ELECTION, "true"));
        tpl.add_env_all(env_from_field(ENV_POD_NAMESPACE, "metadata.namespace"));
        tpl.add_port(
            main,
            ContainerPort {
                name: Some("agentport".to_string()),
                container_port: CLUSTER_AGENT_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        )
    }

    fn manage_cluster_checks_runner(
        &self,
        tpl: &mut PodTemplateManager,
        _provider: &str,
    ) -> Result<()> {
        tpl.add_env_all(env_var(ENV_CLUSTER_AGENT_ENABLED, "true"));
        tpl.add_env_all(env_var(ENV_CLUSTER_AGENT_SERVICE, self.service_name.clone()));
        Ok(())
    }
}

//! Kubernetes event collection by the cluster agent

use super::{Feature, FeatureId};
use crate::crd::{ComponentName, DesiredAgent};
use crate::dependencies::{rule, stage_cluster_role, stage_role, READ};
use crate::options::OperatorOptions;
use crate::pod_template::{component_resource_name, env_var, PodTemplateManager};
use crate::required::{AgentContainer, RequiredComponent, RequiredComponents};
use crate::store::DependencyStore;
use crate::Result;

const ENV_COLLECT_EVENTS: &str = "VIGIL_COLLECT_KUBERNETES_EVENTS";
const ENV_LEADER_ELECTION: &str = "VIGIL_LEADER_ELECTION";
const ENV_TOKEN_NAME: &str = "VIGIL_CLUSTER_AGENT_EVENT_TOKEN_NAME";

/// Event collection feature
#[derive(Debug, Default)]
pub struct EventCollectionFeature {
    agent_name: String,
}

impl EventCollectionFeature {
    fn token_config_map(&self) -> String {
        format!("{}-event-token", self.agent_name)
    }
}

impl Feature for EventCollectionFeature {
    fn id(&self) -> FeatureId {
        FeatureId::EventCollection
    }

    fn configure(&mut self, agent: &DesiredAgent, _options: &OperatorOptions) -> RequiredComponents {
        if !agent
            .spec
            .features
            .event_collection
            .as_ref()
            .is_some_and(|f| f.enabled)
        {
            return RequiredComponents::default();
        }
        self.agent_name = agent.metadata.name.clone().unwrap_or_default();
        RequiredComponents {
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
        let service_account = component_resource_name(&self.agent_name, ComponentName::ClusterAgent);
        let name = format!("{}-event-collection", self.agent_name);
        stage_cluster_role(
            store,
            &name,
            vec![rule(&["", "events.k8s.io"], &["events"], READ)],
            &service_account,
        )?;
        // The resume token is kept in a config map the cluster agent owns
        stage_role(
            store,
            &name,
            vec![rule(
                &[""],
                &["configmaps"],
                &["get", "create", "update"],
            )],
            &service_account,
        )
    }

    fn manage_cluster_agent(&self, tpl: &mut PodTemplateManager, _provider: &str) -> Result<()> {
        let main = AgentContainer::ClusterAgent.as_str();
        tpl.add_env(main, env_var(ENV_COLLECT_EVENTS, "true"))?;
        tpl.add_env(main, env_var(ENV_LEADER_ELECTION, "true"))?;
        tpl.add_env(main, env_var(ENV_TOKEN_NAME, self.token_config_map()))
    }
}

//! Live process collection

use super::{Feature, FeatureId};
use crate::crd::DesiredAgent;
use crate::options::OperatorOptions;
use crate::pod_template::{env_var, host_path_volume, PodTemplateManager};
use crate::required::{AgentContainer, RequiredComponent, RequiredComponents};
use crate::Result;

const ENV_PROCESS_ENABLED: &str = "VIGIL_PROCESS_CONFIG_PROCESS_COLLECTION_ENABLED";
const ENV_RUN_IN_CORE_AGENT: &str = "VIGIL_PROCESS_CONFIG_RUN_IN_CORE_AGENT_ENABLED";

/// Live processes feature.
///
/// Runs inside the core agent when the operator is started with
/// process checks in core, otherwise in its own container.
#[derive(Debug, Default)]
pub struct LiveProcessesFeature {
    run_in_core: bool,
}

impl LiveProcessesFeature {
    fn mutate(&self, tpl: &mut PodTemplateManager, container: AgentContainer) -> Result<()> {
        let name = container.as_str();
        let (volume, mount) = host_path_volume("passwd", "/etc/passwd", "/etc/passwd");
        tpl.add_volume(volume);
        tpl.add_volume_mount(name, mount)?;
        tpl.add_env(name, env_var(ENV_PROCESS_ENABLED, "true"))?;
        tpl.add_env_all(env_var(ENV_RUN_IN_CORE_AGENT, self.run_in_core.to_string()));
        Ok(())
    }
}

impl Feature for LiveProcessesFeature {
    fn id(&self) -> FeatureId {
        FeatureId::LiveProcesses
    }

    fn configure(&mut self, agent: &DesiredAgent, options: &OperatorOptions) -> RequiredComponents {
        if !agent
            .spec
            .features
            .live_processes
            .as_ref()
            .is_some_and(|f| f.enabled)
        {
            return RequiredComponents::default();
        }
        self.run_in_core = options.process_checks_in_core_agent;
        let node_agent = if self.run_in_core {
            RequiredComponent::required([AgentContainer::Core])
        } else {
            RequiredComponent::required([AgentContainer::Core, AgentContainer::Process])
        };
        RequiredComponents {
            node_agent,
            ..Default::default()
        }
    }

    fn manage_node_agent(&self, tpl: &mut PodTemplateManager, _provider: &str) -> Result<()> {
        let target = if self.run_in_core {
            AgentContainer::Core
        } else {
            AgentContainer::Process
        };
        self.mutate(tpl, target)
    }

    fn manage_single_container_node_agent(
        &self,
        tpl: &mut PodTemplateManager,
        _provider: &str,
    ) -> Result<()> {
        self.mutate(tpl, AgentContainer::Unified)
    }
}

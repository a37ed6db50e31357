//! Trace intake through the trace agent

use k8s_openapi::api::core::v1::ContainerPort;

use super::{Feature, FeatureId};
use crate::crd::DesiredAgent;
use crate::options::OperatorOptions;
use crate::pod_template::{env_var, PodTemplateManager};
use crate::required::{AgentContainer, RequiredComponent, RequiredComponents};
use crate::Result;

/// Trace intake port
pub const TRACE_PORT: i32 = 8126;

const ENV_APM_ENABLED: &str = "VIGIL_APM_ENABLED";
const ENV_APM_NON_LOCAL_TRAFFIC: &str = "VIGIL_APM_NON_LOCAL_TRAFFIC";
const ENV_APM_RECEIVER_PORT: &str = "VIGIL_APM_RECEIVER_PORT";

/// APM feature
#[derive(Debug, Default)]
pub struct ApmFeature {
    host_port: Option<i32>,
}

impl ApmFeature {
    fn mutate(&self, tpl: &mut PodTemplateManager, container: AgentContainer) -> Result<()> {
        let name = container.as_str();
        tpl.add_env(name, env_var(ENV_APM_ENABLED, "true"))?;
        tpl.add_env(name, env_var(ENV_APM_NON_LOCAL_TRAFFIC, "true"))?;
        tpl.add_env(name, env_var(ENV_APM_RECEIVER_PORT, TRACE_PORT.to_string()))?;
        tpl.add_port(
            name,
            ContainerPort {
                name: Some("traceport".to_string()),
                container_port: TRACE_PORT,
                host_port: self.host_port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        )
    }
}

impl Feature for ApmFeature {
    fn id(&self) -> FeatureId {
        FeatureId::Apm
    }

    fn configure(&mut self, agent: &DesiredAgent, _options: &OperatorOptions) -> RequiredComponents {
        match &agent.spec.features.apm {
            Some(cfg) if cfg.enabled => {
                self.host_port = cfg.host_port;
                RequiredComponents {
                    node_agent: RequiredComponent::required([
                        AgentContainer::Core,
                        AgentContainer::Trace,
                    ]),
                    ..Default::default()
                }
            }
            _ => RequiredComponents::default(),
        }
    }

    fn manage_node_agent(&self, tpl: &mut PodTemplateManager, _provider: &str) -> Result<()> {
        self.mutate(tpl, AgentContainer::Trace)
    }

    fn manage_single_container_node_agent(
        &self,
        tpl: &mut PodTemplateManager,
        _provider: &str,
    ) -> Result<()> {
        self.mutate(tpl, AgentContainer::Unified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ApmFeature as ApmConfig, ComponentName};
    use crate::pod_template::default_template;
    use crate::test_support::{agent, valid_spec};

    #[test]
    fn trace_container_gets_port() {
        let mut spec = valid_spec();
        spec.features.apm = Some(ApmConfig {
            enabled: true,
            host_port: Some(8126),
        });
        let a = agent(spec);
        let options = OperatorOptions::default();
        let mut feature = ApmFeature::default();
        let required = feature.configure(&a, &options);
        assert!(required.node_agent.containers.contains(&AgentContainer::Trace));

        let mut tpl = PodTemplateManager::new(
            ComponentName::NodeAgent,
            default_template(ComponentName::NodeAgent, &a, &required, &options),
        );
        feature.manage_node_agent(&mut tpl, "").expect("mutate");
        let spec = tpl.into_template().spec.expect("spec");
        let trace = spec
            .containers
            .iter()
            .find(|c| c.name == "trace-agent")
            .expect("trace container");
        let port = &trace.ports.as_ref().expect("ports")[0];
        assert_eq!(port.host_port, Some(8126));
    }

    #[test]
    fn missing_trace_container_is_an_error() {
        let mut spec = valid_spec();
        spec.features.apm = Some(ApmConfig {
            enabled: true,
            host_port: None,
        });
        let a = agent(spec);
        let options = OperatorOptions::default();
        let mut feature = ApmFeature::default();
        feature.configure(&a, &options);

        // template built without the trace container
        let mut tpl = PodTemplateManager::new(
            ComponentName::NodeAgent,
            default_template(ComponentName::NodeAgent, &a, &RequiredComponents::default(), &options),
        );
        assert!(feature.manage_node_agent(&mut tpl, "").is_err());
    }
}

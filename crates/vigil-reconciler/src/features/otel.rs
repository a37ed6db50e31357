//! OpenTelemetry collection
//!
//! Three independent features: an OTel agent next to the node agent, an
//! agent-based gateway deployment and an upstream collector gateway.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ContainerPort;

use super::{Feature, FeatureId};
use crate::crd::{ComponentName, DesiredAgent, FeatureToggle};
use crate::dependencies::{stage_config_map, stage_service};
use crate::options::OperatorOptions;
use crate::pod_template::{
    component_resource_name, config_map_volume, env_var, PodTemplateManager,
};
use crate::required::{AgentContainer, RequiredComponent, RequiredComponents};
use crate::store::DependencyStore;
use crate::Result;

/// OTLP gRPC port
pub const OTLP_GRPC_PORT: i32 = 4317;

/// OTLP HTTP port
pub const OTLP_HTTP_PORT: i32 = 4318;

const ENV_OTEL_ENABLED: &str = "VIGIL_OTELCOLLECTOR_ENABLED";
const CONFIG_KEY: &str = "otel-config.yaml";
const CONFIG_VOLUME: &str = "otel-config";
const CONFIG_DIR: &str = "/etc/otel";

const DEFAULT_PIPELINE: &str = "receivers:
  otlp:
    protocols:
      grpc:
        endpoint: 0.0.0.0:4317
      http:
        endpoint: 0.0.0.0:4318
processors:
  batch: {}
exporters:
  vigil: {}
service:
  pipelines:
    traces:
      receivers: [otlp]
      processors: [batch]
      exporters: [vigil]
    metrics:
      receivers: [otlp]
      processors: [batch]
      exporters: [vigil]
    logs:
      receivers: [otlp]
      processors: [batch]
      exporters: [vigil]
";

fn enabled(toggle: &Option<FeatureToggle>) -> bool {
    toggle.as_ref().is_some_and(|t| t.enabled)
}

fn otlp_ports(tpl: &mut PodTemplateManager, container: &str) -> Result<()> {
    for (name, port) in [("otel-grpc", OTLP_GRPC_PORT), ("otel-http", OTLP_HTTP_PORT)] {
        tpl.add_port(
            container,
            ContainerPort {
                name: Some(name.to_string()),
                container_port: port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        )?;
    }
    Ok(())
}

fn mount_config(tpl: &mut PodTemplateManager, container: &str, config_map: &str) -> Result<()> {
    let (volume, mount) = config_map_volume(CONFIG_VOLUME, config_map, CONFIG_DIR);
    tpl.add_volume(volume);
    tpl.add_volume_mount(container, mount)
}

fn config_arg() -> String {
    format!("--config={}/{}", CONFIG_DIR, CONFIG_KEY)
}

// =============================================================================
// Node agent OTel collector
// =============================================================================

/// OTel agent container alongside the node agent
#[derive(Debug, Default)]
pub struct OtelCollectorFeature {
    agent_name: String,
}

impl OtelCollectorFeature {
    fn config_map_name(&self) -> String {
        format!("{}-otel-agent-config", self.agent_name)
    }
}

impl Feature for OtelCollectorFeature {
    fn id(&self) -> FeatureId {
        FeatureId::OtelCollector
    }

    fn configure(&mut self, agent: &DesiredAgent, _options: &OperatorOptions) -> RequiredComponents {
        if !enabled(&agent.spec.features.otel_collector) {
            return RequiredComponents::default();
        }
        self.agent_name = agent.metadata.name.clone().unwrap_or_default();
        RequiredComponents {
            node_agent: RequiredComponent::required([AgentContainer::Core, AgentContainer::Otel]),
            ..Default::default()
        }
    }

    fn manage_dependencies(
        &self,
        store: &mut DependencyStore,
        required: &RequiredComponents,
    ) -> Result<()> {
        if !required.is_enabled(ComponentName::NodeAgent) {
            return Ok(());
        }
        stage_config_map(
            store,
            &self.config_map_name(),
            BTreeMap::from([(CONFIG_KEY.to_string(), DEFAULT_PIPELINE.to_string())]),
        )
    }

    fn manage_node_agent(&self, tpl: &mut PodTemplateManager, _provider: &str) -> Result<()> {
        let otel = AgentContainer::Otel.as_str();
        tpl.add_env(AgentContainer::Core.as_str(), env_var(ENV_OTEL_ENABLED, "true"))?;
        tpl.add_env(otel, env_var(ENV_OTEL_ENABLED, "true"))?;
        otlp_ports(tpl, otel)?;
        mount_config(tpl, otel, &self.config_map_name())?;
        tpl.container_mut(otel)?.args = Some(vec![config_arg()]);
        Ok(())
    }

    fn manage_single_container_node_agent(
        &self,
        tpl: &mut PodTemplateManager,
        _provider: &str,
    ) -> Result<()> {
        let unified = AgentContainer::Unified.as_str();
        tpl.add_env(unified, env_var(ENV_OTEL_ENABLED, "true"))?;
        otlp_ports(tpl, unified)?;
        mount_config(tpl, unified, &self.config_map_name())
    }
}

// =============================================================================
// Gateways
// =============================================================================

/// Agent-based OTel gateway deployment
#[derive(Debug, Default)]
pub struct OtelAgentGatewayFeature {
    agent_name: String,
}

impl Feature for OtelAgentGatewayFeature {
    fn id(&self) -> FeatureId {
        FeatureId::OtelAgentGateway
    }

    fn configure(&mut self, agent: &DesiredAgent, _options: &OperatorOptions) -> RequiredComponents {
        if !enabled(&agent.spec.features.otel_agent_gateway) {
            return RequiredComponents::default();
        }
        self.agent_name = agent.metadata.name.clone().unwrap_or_default();
        RequiredComponents {
            otel_agent_gateway: RequiredComponent::required([AgentContainer::OtelAgentGateway]),
            ..Default::default()
        }
    }

    fn manage_dependencies(
        &self,
        store: &mut DependencyStore,
        required: &RequiredComponents,
    ) -> Result<()> {
        if !required.is_enabled(ComponentName::OtelAgentGateway) {
            return Ok(());
        }
        stage_service(
            store,
            &component_resource_name(&self.agent_name, ComponentName::OtelAgentGateway),
            &self.agent_name,
            ComponentName::OtelAgentGateway,
            &[("otel-grpc", OTLP_GRPC_PORT), ("otel-http", OTLP_HTTP_PORT)],
        )
    }

    fn manage_otel_agent_gateway(&self, tpl: &mut PodTemplateManager, _provider: &str) -> Result<()> {
        let main = AgentContainer::OtelAgentGateway.as_str();
        tpl.add_env(main, env_var(ENV_OTEL_ENABLED, "true"))?;
        otlp_ports(tpl, main)
    }
}

/// Upstream OTel collector gateway deployment
#[derive(Debug, Default)]
pub struct OtelCollectorGatewayFeature {
    agent_name: String,
}

impl OtelCollectorGatewayFeature {
    fn config_map_name(&self) -> String {
        format!("{}-otel-collector-gateway-config", self.agent_name)
    }
}

impl Feature for OtelCollectorGatewayFeature {
    fn id(&self) -> FeatureId {
        FeatureId::OtelCollectorGateway
    }

    fn configure(&mut self, agent: &DesiredAgent, _options: &OperatorOptions) -> RequiredComponents {
        if !enabled(&agent.spec.features.otel_collector_gateway) {
            return RequiredComponents::default();
        }
        self.agent_name = agent.metadata.name.clone().unwrap_or_default();
        RequiredComponents {
            otel_collector_gateway: RequiredComponent::required([AgentContainer::OtelCollector]),
            ..Default::default()
        }
    }

    fn manage_dependencies(
        &self,
        store: &mut DependencyStore,
        required: &RequiredComponents,
    ) -> Result<()> {
        if !required.is_enabled(ComponentName::OtelCollectorGateway) {
            return Ok(());
        }
        stage_config_map(
            store,
            &self.config_map_name(),
            BTreeMap::from([(CONFIG_KEY.to_string(), DEFAULT_PIPELINE.to_string())]),
        )?;
        stage_service(
            store,
            &component_resource_name(&self.agent_name, ComponentName::OtelCollectorGateway),
            &self.agent_name,
            ComponentName::OtelCollectorGateway,
            &[("otel-grpc", OTLP_GRPC_PORT), ("otel-http", OTLP_HTTP_PORT)],
        )
    }

    fn manage_otel_collector_gateway(
        &self,
        tpl: &mut PodTemplateManager,
        _provider: &str,
    ) -> Result<()> {
        let main = AgentContainer::OtelCollector.as_str();
        otlp_ports(tpl, main)?;
        mount_config(tpl, main, &self.config_map_name())?;
        tpl.container_mut(main)?.args = Some(vec![config_arg()]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod_template::default_template;
    use crate::store::DependencyKind;
    use crate::test_support::{agent, owner, valid_spec};

    #[test]
    fn node_agent_collector_adds_otel_container_wiring() {
        let mut spec = valid_spec();
        spec.features.otel_collector = Some(FeatureToggle { enabled: true });
        let a = agent(spec);
        let options = OperatorOptions::default();
        let mut feature = OtelCollectorFeature::default();
        let required = feature.configure(&a, &options);

        let mut tpl = PodTemplateManager::new(
            ComponentName::NodeAgent,
            default_template(ComponentName::NodeAgent, &a, &required, &options),
        );
        feature.manage_node_agent(&mut tpl, "").expect("mutate");
        let spec = tpl.into_template().spec.expect("spec");
        let otel = spec
            .containers
            .iter()
            .find(|c| c.name == "otel-agent")
            .expect("otel container");
        assert_eq!(otel.ports.as_ref().map(Vec::len), Some(2));
        assert_eq!(
            otel.args.as_deref(),
            Some(&["--config=/etc/otel/otel-config.yaml".to_string()][..])
        );
    }

    #[test]
    fn collector_gateway_stages_config_and_service() {
        let mut spec = valid_spec();
        spec.features.otel_collector_gateway = Some(FeatureToggle { enabled: true });
        let mut feature = OtelCollectorGatewayFeature::default();
        let required = feature.configure(&agent(spec), &OperatorOptions::default());
        assert!(required.is_enabled(ComponentName::OtelCollectorGateway));

        let mut store = DependencyStore::new(owner(), "monitoring", "monitoring-vigil");
        feature
            .manage_dependencies(&mut store, &required)
            .expect("dependencies");
        assert!(store
            .get(
                DependencyKind::ConfigMap,
                Some("monitoring"),
                "vigil-otel-collector-gateway-config"
            )
            .is_some());
        assert!(store
            .get(
                DependencyKind::Service,
                Some("monitoring"),
                "vigil-otel-collector-gateway"
            )
            .is_some());
    }
}

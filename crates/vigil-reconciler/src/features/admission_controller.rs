//! Admission controller served by the cluster agent

use k8s_openapi::api::core::v1::ContainerPort;

use super::{Feature, FeatureId};
use crate::crd::{ComponentName, DesiredAgent};
use crate::dependencies::{rule, stage_cluster_role, stage_service, READ};
use crate::options::OperatorOptions;
use crate::pod_template::{component_resource_name, env_var, PodTemplateManager};
use crate::required::{AgentContainer, RequiredComponent, RequiredComponents};
use crate::store::DependencyStore;
use crate::Result;

/// Webhook port of the cluster agent
pub const WEBHOOK_PORT: i32 = 8000;

const ENV_ENABLED: &str = "VIGIL_ADMISSION_CONTROLLER_ENABLED";
const ENV_MUTATE_UNLABELLED: &str = "VIGIL_ADMISSION_CONTROLLER_MUTATE_UNLABELLED";
const ENV_SERVICE_NAME: &str = "VIGIL_ADMISSION_CONTROLLER_SERVICE_NAME";
const ENV_WEBHOOK_PORT: &str = "VIGIL_ADMISSION_CONTROLLER_PORT";

/// Admission controller feature
#[derive(Debug, Default)]
pub struct AdmissionControllerFeature {
    agent_name: String,
    mutate_unlabelled: bool,
}

impl AdmissionControllerFeature {
    fn service_name(&self) -> String {
        format!("{}-admission-controller", self.agent_name)
    }
}

impl Feature for AdmissionControllerFeature {
    fn id(&self) -> FeatureId {
        FeatureId::AdmissionController
    }

    fn configure(&mut self, agent: &DesiredAgent, _options: &OperatorOptions) -> RequiredComponents {
        match &agent.spec.features.admission_controller {
            Some(cfg) if cfg.enabled => {
                self.agent_name = agent.metadata.name.clone().unwrap_or_default();
                self.mutate_unlabelled = cfg.mutate_unlabelled;
                RequiredComponents {
                    cluster_agent: RequiredComponent::required([AgentContainer::ClusterAgent]),
                    ..Default::default()
                }
            }
            _ => RequiredComponents::default(),
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
            &self.service_name(),
            &self.agent_name,
            ComponentName::ClusterAgent,
            &[("webhook", WEBHOOK_PORT)],
        )?;
        stage_cluster_role(
            store,
            &format!("{}-admission-controller", self.agent_name),
            vec![
                rule(
                    &["admissionregistration.k8s.io"],
                    &["mutatingwebhookconfigurations", "validatingwebhookconfigurations"],
                    &["get", "list", "watch", "create", "update"],
                ),
                rule(&[""], &["secrets"], &["get", "list", "watch", "create", "update"]),
                rule(&["apps", "batch"], &["replicasets", "deployments", "jobs"], READ),
            ],
            &component_resource_name(&self.agent_name, ComponentName::ClusterAgent),
        )
    }

    fn manage_cluster_agent(&self, tpl: &mut PodTemplateManager, _provider: &str) -> Result<()> {
        let main = AgentContainer::ClusterAgent.as_str();
        tpl.add_env(main, env_var(ENV_ENABLED, "true"))?;
        tpl.add_env(
            main,
            env_var(ENV_MUTATE_UNLABELLED, self.mutate_unlabelled.to_string()),
        )?;
        tpl.add_env(main, env_var(ENV_SERVICE_NAME, self.service_name()))?;
        tpl.add_env(main, env_var(ENV_WEBHOOK_PORT, WEBHOOK_PORT.to_string()))?;
        tpl.add_port(
            main,
            ContainerPort {
                name: Some("webhook".to_string()),
                container_port: WEBHOOK_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::AdmissionControllerFeature as AdmissionConfig;
    use crate::store::DependencyKind;
    use crate::test_support::{agent, owner, valid_spec};

    #[test]
    fn stages_webhook_service_and_rbac() {
        let mut spec = valid_spec();
        spec.features.admission_controller = Some(AdmissionConfig {
            enabled: true,
            mutate_unlabelled: false,
        });
        let mut feature = AdmissionControllerFeature::default();
        let required = feature.configure(&agent(spec), &OperatorOptions::default());

        let mut store = DependencyStore::new(owner(), "monitoring", "monitoring-vigil");
        feature
            .manage_dependencies(&mut store, &required)
            .expect("dependencies");
        assert!(store
            .get(DependencyKind::Service, Some("monitoring"), "vigil-admission-controller")
            .is_some());
        let binding = store
            .get(DependencyKind::ClusterRoleBinding, None, "vigil-admission-controller")
            .expect("binding");
        assert_eq!(
            binding.data["subjects"][0]["name"],
            serde_json::json!("vigil-cluster-agent")
        );
    }
}

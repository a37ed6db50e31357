//! Kube state metrics core check

use std::collections::BTreeMap;

use super::{Feature, FeatureId};
use crate::crd::{ComponentName, DesiredAgent};
use crate::dependencies::{rule, stage_cluster_role, stage_config_map, READ};
use crate::options::OperatorOptions;
use crate::pod_template::{
    component_resource_name, config_map_volume, env_var, PodTemplateManager, CONFIG_MOUNT_PATH,
};
use crate::required::{AgentContainer, RequiredComponent, RequiredComponents};
use crate::store::DependencyStore;
use crate::Result;

const ENV_ENABLED: &str = "VIGIL_KUBE_STATE_METRICS_CORE_ENABLED";
const ENV_CLUSTER_CHECK: &str = "VIGIL_KUBE_STATE_METRICS_CORE_CLUSTER_CHECK";
const CONFIG_KEY: &str = "kubernetes_state_core.yaml";
const CONFIG_VOLUME: &str = "ksm-core-config";

/// Kube state metrics core feature
#[derive(Debug, Default)]
pub struct KubeStateMetricsCoreFeature {
    agent_name: String,
    cluster_check: bool,
}

impl KubeStateMetricsCoreFeature {
    fn config_map_name(&self) -> String {
        format!("{}-kube-state-metrics-core-config", self.agent_name)
    }

    fn check_config(&self) -> String {
        format!(
            "cluster_check: {}\ninit_config:\ninstances:\n  - collectors:\n    - pods\n    - nodes\n    - deployments\n    - daemonsets\n    - statefulsets\n    - jobs\n    - cronjobs\n    - services\n    - namespaces\n    - persistentvolumeclaims\n",
            self.cluster_check
        )
    }
}

impl Feature for KubeStateMetricsCoreFeature {
    fn id(&self) -> FeatureId {
        FeatureId::KubeStateMetricsCore
    }

    fn configure(&mut self, agent: &DesiredAgent, _options: &OperatorOptions) -> RequiredComponents {
        match &agent.spec.features.kube_state_metrics_core {
            Some(cfg) if cfg.enabled => {
                self.agent_name = agent.metadata.name.clone().unwrap_or_default();
                self.cluster_check = cfg.collect_via_cluster_checks;
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
        stage_config_map(
            store,
            &self.config_map_name(),
            BTreeMap::from([(CONFIG_KEY.to_string(), self.check_config())]),
        )?;
        stage_cluster_role(
            store,
            &format!("{}-kube-state-metrics-core", self.agent_name),
            vec![
                rule(
                    &[""],
                    &[
                        "pods",
                        "nodes",
                        "services",
                        "namespaces",
                        "persistentvolumes",
                        "persistentvolumeclaims",
                        "configmaps",
                    ],
                    READ,
                ),
                rule(&["apps"], &["deployments", "daemonsets", "statefulsets", "replicasets"], READ),
                rule(&["batch"], &["jobs", "cronjobs"], READ),
            ],
            &component_resource_name(&self.agent_name, ComponentName::ClusterAgent),
        )
    }

    fn manage_cluster_agent(&self, tpl: &mut PodTemplateManager, _provider: &str) -> Result<()> {
        let main = AgentContainer::ClusterAgent.as_str();
        tpl.add_env(main, env_var(ENV_ENABLED, "true"))?;
        tpl.add_env(main, env_var(ENV_CLUSTER_CHECK, self.cluster_check.to_string()))?;
        let (volume, mount) = config_map_volume(
            CONFIG_VOLUME,
            &self.config_map_name(),
            &format!("{}/conf.d/kubernetes_state_core.d", CONFIG_MOUNT_PATH),
        );
        tpl.add_volume(volume);
        tpl.add_volume_mount(main, mount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::KubeStateMetricsCoreFeature as KsmConfig;
    use crate::store::DependencyKind;
    use crate::test_support::{agent, owner, valid_spec};

    #[test]
    fn config_map_reflects_cluster_check_mode() {
        let mut spec = valid_spec();
        spec.features.kube_state_metrics_core = Some(KsmConfig {
            enabled: true,
            collect_via_cluster_checks: true,
        });
        let mut feature = KubeStateMetricsCoreFeature::default();
        let required = feature.configure(&agent(spec), &OperatorOptions::default());

        let mut store = DependencyStore::new(owner(), "monitoring", "monitoring-vigil");
        feature
            .manage_dependencies(&mut store, &required)
            .expect("dependencies");
        let cm = store
            .get(
                DependencyKind::ConfigMap,
                Some("monitoring"),
                "vigil-kube-state-metrics-core-config",
            )
            .expect("config map");
        let body = cm.data["data"][CONFIG_KEY].as_str().unwrap_or_default();
        assert!(body.starts_with("cluster_check: true"));
    }
}

//! Container log collection from the node agent

use k8s_openapi::api::core::v1::{HostPathVolumeSource, Volume, VolumeMount};

use super::{Feature, FeatureId};
use crate::crd::DesiredAgent;
use crate::options::OperatorOptions;
use crate::pod_template::{env_var, host_path_volume, PodTemplateManager};
use crate::required::{AgentContainer, RequiredComponent, RequiredComponents};
use crate::Result;

const ENV_LOGS_ENABLED: &str = "VIGIL_LOGS_ENABLED";
const ENV_CONTAINER_COLLECT_ALL: &str = "VIGIL_LOGS_CONFIG_CONTAINER_COLLECT_ALL";

const POINTER_VOLUME: &str = "pointerdir";
const POINTER_HOST_PATH: &str = "/var/lib/vigil-agent/logs";
const POINTER_MOUNT_PATH: &str = "/opt/vigil-agent/run";

/// Log collection feature
#[derive(Debug, Default)]
pub struct LogCollectionFeature {
    container_collect_all: bool,
}

impl LogCollectionFeature {
    fn mutate(&self, tpl: &mut PodTemplateManager, container: AgentContainer) -> Result<()> {
        let name = container.as_str();
        tpl.add_env(name, env_var(ENV_LOGS_ENABLED, "true"))?;
        tpl.add_env(
            name,
            env_var(ENV_CONTAINER_COLLECT_ALL, self.container_collect_all.to_string()),
        )?;

        // Registry of tailed positions must survive pod restarts
        tpl.add_volume(Volume {
            name: POINTER_VOLUME.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: POINTER_HOST_PATH.to_string(),
                type_: Some("DirectoryOrCreate".to_string()),
            }),
            ..Default::default()
        });
        tpl.add_volume_mount(
            name,
            VolumeMount {
                name: POINTER_VOLUME.to_string(),
                mount_path: POINTER_MOUNT_PATH.to_string(),
                ..Default::default()
            },
        )?;

        for (volume_name, path) in [
            ("logpodpath", "/var/log/pods"),
            ("logcontainerpath", "/var/lib/docker/containers"),
        ] {
            let (volume, mount) = host_path_volume(volume_name, path, path);
            tpl.add_volume(volume);
            tpl.add_volume_mount(name, mount)?;
        }
        Ok(())
    }
}

impl Feature for LogCollectionFeature {
    fn id(&self) -> FeatureId {
        FeatureId::LogCollection
    }

    fn configure(&mut self, agent: &DesiredAgent, _options: &OperatorOptions) -> RequiredComponents {
        match &agent.spec.features.log_collection {
            Some(cfg) if cfg.enabled => {
                self.container_collect_all = cfg.container_collect_all;
                RequiredComponents {
                    node_agent: RequiredComponent::required([AgentContainer::Core]),
                    ..Default::default()
                }
            }
            _ => RequiredComponents::default(),
        }
    }

    fn manage_node_agent(&self, tpl: &mut PodTemplateManager, _provider: &str) -> Result<()> {
        self.mutate(tpl, AgentContainer::Core)
    }

    fn manage_single_container_node_agent(
        &self,
        tpl: &mut PodTemplateManager,
        _provider: &str,
    ) -> Result<()> {
        self.mutate(tpl, AgentContainer::Unified)
    }
}

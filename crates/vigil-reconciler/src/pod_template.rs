//! Pod template construction
//!
//! Templates are built in a fixed order, each step free to overwrite the
//! previous ones:
//!
//! 1. default template with the containers the resolver asked for
//! 2. global settings (credentials, site, tags, FIPS, kubelet, runtime socket)
//! 3. every enabled feature, in registry order
//! 4. the manifest override for the component
//! 5. the node profile, when the template is for a profile workload

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
    EnvVarSource, HostPathVolumeSource, NodeAffinity, NodeSelector, NodeSelectorTerm,
    ObjectFieldSelector, PodAffinity, PodAntiAffinity, PodSpec, PodTemplateSpec,
    SecretKeySelector, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::debug;

use crate::crd::{ComponentName, ComponentOverride, DesiredAgent, ImageOverride};
use crate::features::Feature;
use crate::options::OperatorOptions;
use crate::profile::ResolvedProfile;
use crate::required::{AgentContainer, RequiredComponents};
use crate::{global, provider, Error, Result};

/// Mount path of the shared config volume
pub const CONFIG_MOUNT_PATH: &str = "/etc/vigil-agent";

/// Host root mounted read-only into node agent containers
pub const HOST_ROOT: &str = "/host";

// =============================================================================
// Template manager
// =============================================================================

/// Mutable handle on one component's pod template.
///
/// Every helper is idempotent: adding an env var, volume or mount that
/// already exists by name replaces it.
#[derive(Clone, Debug)]
pub struct PodTemplateManager {
    component: ComponentName,
    template: PodTemplateSpec,
}

impl PodTemplateManager {
    /// Wrap a template for a component
    pub fn new(component: ComponentName, template: PodTemplateSpec) -> Self {
        Self {
            component,
            template,
        }
    }

    /// Component this template belongs to
    pub fn component(&self) -> ComponentName {
        self.component
    }

    /// Current template
    pub fn template(&self) -> &PodTemplateSpec {
        &self.template
    }

    /// Consume the manager
    pub fn into_template(self) -> PodTemplateSpec {
        self.template
    }

    /// Pod spec, created on first use
    pub fn spec_mut(&mut self) -> &mut PodSpec {
        self.template.spec.get_or_insert_with(Default::default)
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        self.template.metadata.get_or_insert_with(Default::default)
    }

    /// Names of every container, in pod order
    pub fn container_names(&self) -> Vec<String> {
        self.template
            .spec
            .as_ref()
            .map(|s| s.containers.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    /// True when the pod has a container with that name
    pub fn has_container(&self, name: &str) -> bool {
        self.template
            .spec
            .as_ref()
            .is_some_and(|s| s.containers.iter().any(|c| c.name == name))
    }

    /// Container by name; a missing container is a mutation error
    pub fn container_mut(&mut self, name: &str) -> Result<&mut Container> {
        let component = self.component;
        self.spec_mut()
            .containers
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| {
                Error::feature_mutation(
                    component.as_str(),
                    format!("container '{}' is not part of the pod", name),
                )
            })
    }

    /// Add or replace a container
    pub fn add_container(&mut self, container: Container) {
        let containers = &mut self.spec_mut().containers;
        match containers.iter_mut().find(|c| c.name == container.name) {
            Some(existing) => *existing = container,
            None => containers.push(container),
        }
    }

    /// Set an env var on one container
    pub fn add_env(&mut self, container: &str, env: EnvVar) -> Result<()> {
        let c = self.container_mut(container)?;
        upsert_by_name(c.env.get_or_insert_with(Vec::new), env, |e| &e.name);
        Ok(())
    }

    /// Set an env var on every container
    pub fn add_env_all(&mut self, env: EnvVar) {
        for c in self.spec_mut().containers.iter_mut() {
            upsert_by_name(c.env.get_or_insert_with(Vec::new), env.clone(), |e| &e.name);
        }
    }

    /// Add or replace a pod volume
    pub fn add_volume(&mut self, volume: Volume) {
        let volumes = self.spec_mut().volumes.get_or_insert_with(Vec::new);
        upsert_by_name(volumes, volume, |v| &v.name);
    }

    /// Mount a volume into one container
    pub fn add_volume_mount(&mut self, container: &str, mount: VolumeMount) -> Result<()> {
        let c = self.container_mut(container)?;
        upsert_by_name(c.volume_mounts.get_or_insert_with(Vec::new), mount, |m| {
            &m.name
        });
        Ok(())
    }

    /// Expose a port on one container, replacing any port with the same name
    pub fn add_port(&mut self, container: &str, port: ContainerPort) -> Result<()> {
        let c = self.container_mut(container)?;
        let ports = c.ports.get_or_insert_with(Vec::new);
        match ports.iter_mut().find(|p| p.name == port.name) {
            Some(existing) => *existing = port,
            None => ports.push(port),
        }
        Ok(())
    }

    /// Set a pod label
    pub fn add_label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.meta_mut()
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
    }

    /// Set a pod annotation
    pub fn add_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.meta_mut()
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
    }

    /// AND an affinity into the pod's current one
    pub fn merge_affinity(&mut self, affinity: Affinity) {
        let spec = self.spec_mut();
        spec.affinity = merge_affinity(spec.affinity.take(), Some(affinity));
    }
}

fn upsert_by_name<T>(items: &mut Vec<T>, item: T, name: impl Fn(&T) -> &String) {
    match items.iter_mut().find(|i| name(i) == name(&item)) {
        Some(existing) => *existing = item,
        None => items.push(item),
    }
}

/// Plain env var
pub fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

/// Env var read from a secret key
pub fn env_from_secret(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
    }
}

/// Env var read from a pod field such as `status.hostIP`
pub fn env_from_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                api_version: None,
            }),
            ..Default::default()
        }),
    }
}

/// Config map volume with a matching read-only mount
pub fn config_map_volume(name: &str, config_map: &str, mount_path: &str) -> (Volume, VolumeMount) {
    (
        Volume {
            name: name.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
        VolumeMount {
            name: name.to_string(),
            mount_path: mount_path.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
    )
}

/// Host path volume with a matching read-only mount
pub fn host_path_volume(name: &str, host_path: &str, mount_path: &str) -> (Volume, VolumeMount) {
    (
        Volume {
            name: name.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: host_path.to_string(),
                type_: None,
            }),
            ..Default::default()
        },
        VolumeMount {
            name: name.to_string(),
            mount_path: mount_path.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
    )
}

// =============================================================================
// Affinity merging
// =============================================================================

/// AND two affinities.
///
/// Required node selector terms are ORed within one affinity, so ANDing
/// takes the cross product of both term lists. Preferred terms and pod
/// (anti-)affinity terms are concatenated.
pub fn merge_affinity(a: Option<Affinity>, b: Option<Affinity>) -> Option<Affinity> {
    let (a, b) = match (a, b) {
        (None, x) | (x, None) => return x,
        (Some(a), Some(b)) => (a, b),
    };

    let node_affinity = match (a.node_affinity, b.node_affinity) {
        (None, x) | (x, None) => x,
        (Some(na), Some(nb)) => Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: merge_node_selectors(
                na.required_during_scheduling_ignored_during_execution,
                nb.required_during_scheduling_ignored_during_execution,
            ),
            preferred_during_scheduling_ignored_during_execution: concat(
                na.preferred_during_scheduling_ignored_during_execution,
                nb.preferred_during_scheduling_ignored_during_execution,
            ),
        }),
    };

    let pod_affinity = match (a.pod_affinity, b.pod_affinity) {
        (None, x) | (x, None) => x,
        (Some(pa), Some(pb)) => Some(PodAffinity {
            required_during_scheduling_ignored_during_execution: concat(
                pa.required_during_scheduling_ignored_during_execution,
                pb.required_during_scheduling_ignored_during_execution,
            ),
            preferred_during_scheduling_ignored_during_execution: concat(
                pa.preferred_during_scheduling_ignored_during_execution,
                pb.preferred_during_scheduling_ignored_during_execution,
            ),
        }),
    };

    let pod_anti_affinity = match (a.pod_anti_affinity, b.pod_anti_affinity) {
        (None, x) | (x, None) => x,
        (Some(pa), Some(pb)) => Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: concat(
                pa.required_during_scheduling_ignored_during_execution,
                pb.required_during_scheduling_ignored_during_execution,
            ),
            preferred_during_scheduling_ignored_during_execution: concat(
                pa.preferred_during_scheduling_ignored_during_execution,
                pb.preferred_during_scheduling_ignored_during_execution,
            ),
        }),
    };

    Some(Affinity {
        node_affinity,
        pod_affinity,
        pod_anti_affinity,
    })
}

fn merge_node_selectors(a: Option<NodeSelector>, b: Option<NodeSelector>) -> Option<NodeSelector> {
    let (a, b) = match (a, b) {
        (None, x) | (x, None) => return x,
        (Some(a), Some(b)) => (a, b),
    };
    if a.node_selector_terms.is_empty() {
        return Some(b);
    }
    if b.node_selector_terms.is_empty() {
        return Some(a);
    }

    let mut terms = Vec::with_capacity(a.node_selector_terms.len() * b.node_selector_terms.len());
    for ta in &a.node_selector_terms {
        for tb in &b.node_selector_terms {
            terms.push(NodeSelectorTerm {
                match_expressions: concat(ta.match_expressions.clone(), tb.match_expressions.clone()),
                match_fields: concat(ta.match_fields.clone(), tb.match_fields.clone()),
            });
        }
    }
    Some(NodeSelector {
        node_selector_terms: terms,
    })
}

fn concat<T>(a: Option<Vec<T>>, b: Option<Vec<T>>) -> Option<Vec<T>> {
    match (a, b) {
        (None, x) | (x, None) => x,
        (Some(mut a), Some(b)) => {
            a.extend(b);
            Some(a)
        }
    }
}

// =============================================================================
// Default templates
// =============================================================================

/// Name of a per-component resource derived from the agent name
pub fn component_resource_name(agent_name: &str, component: ComponentName) -> String {
    format!("{}-{}", agent_name, component.suffix())
}

/// Image reference from registry, repository and tag
pub fn image_ref(registry: &str, repository: &str, tag: &str) -> String {
    format!("{}/{}:{}", registry.trim_end_matches('/'), repository, tag)
}

fn default_image(component: ComponentName, registry: &str, options: &OperatorOptions) -> String {
    match component {
        ComponentName::ClusterAgent => image_ref(registry, "cluster-agent", &options.cluster_agent_tag),
        ComponentName::OtelCollectorGateway => {
            image_ref(registry, "otel-collector", &options.otel_collector_tag)
        }
        _ => image_ref(registry, "agent", &options.agent_tag),
    }
}

/// Containers the default template starts with
pub fn default_containers(component: ComponentName, required: &RequiredComponents) -> Vec<AgentContainer> {
    if component == ComponentName::NodeAgent && required.single_container {
        return vec![AgentContainer::Unified];
    }
    let main = AgentContainer::main_for(component);
    let mut containers = vec![main];
    containers.extend(
        required
            .get(component)
            .containers
            .iter()
            .copied()
            .filter(|c| *c != main && *c != AgentContainer::Unified),
    );
    containers
}

/// Default template for a component, before any mutation
pub fn default_template(
    component: ComponentName,
    agent: &DesiredAgent,
    required: &RequiredComponents,
    options: &OperatorOptions,
) -> PodTemplateSpec {
    let agent_name = agent.metadata.name.as_deref().unwrap_or_default();
    let registry = agent
        .spec
        .global
        .registry
        .as_deref()
        .unwrap_or(&options.default_registry);
    let image = default_image(component, registry, options);

    let containers = default_containers(component, required)
        .into_iter()
        .map(|c| Container {
            name: c.as_str().to_string(),
            image: Some(image.clone()),
            volume_mounts: Some(vec![VolumeMount {
                name: "config".to_string(),
                mount_path: CONFIG_MOUNT_PATH.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        })
        .collect();

    let service_account_name = match component {
        ComponentName::NodeAgent
        | ComponentName::ClusterAgent
        | ComponentName::ClusterChecksRunner => {
            Some(component_resource_name(agent_name, component))
        }
        _ => None,
    };

    let mut spec = PodSpec {
        containers,
        service_account_name,
        volumes: Some(vec![Volume {
            name: "config".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }]),
        ..Default::default()
    };
    if component == ComponentName::NodeAgent {
        let (proc_volume, _) = host_path_volume("procdir", "/proc", "/host/proc");
        let (cgroup_volume, _) = host_path_volume("cgroups", "/sys/fs/cgroup", "/host/sys/fs/cgroup");
        spec.volumes.get_or_insert_with(Vec::new).extend([proc_volume, cgroup_volume]);
        for container in spec.containers.iter_mut() {
            if container.name == AgentContainer::Core.as_str()
                || container.name == AgentContainer::Unified.as_str()
            {
                let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
                mounts.push(host_path_volume("procdir", "/proc", "/host/proc").1);
                mounts.push(host_path_volume("cgroups", "/sys/fs/cgroup", "/host/sys/fs/cgroup").1);
            }
        }
    }

    PodTemplateSpec {
        metadata: Some(ObjectMeta::default()),
        spec: Some(spec),
    }
}

// =============================================================================
// Overrides
// =============================================================================

/// Image with a manifest override applied.
///
/// A name containing `/` or `:` is taken as a full reference. Otherwise the
/// name replaces the repository under the registry, and a lone tag keeps the
/// current repository.
pub fn override_image(current: &str, image: &ImageOverride, registry: &str) -> String {
    let (repo, current_tag) = match current.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (current, "latest"),
    };
    match (&image.name, &image.tag) {
        (Some(name), _) if name.contains('/') || name.contains(':') => name.clone(),
        (Some(name), tag) => image_ref(registry, name, tag.as_deref().unwrap_or(current_tag)),
        (None, Some(tag)) => format!("{}:{}", repo, tag),
        (None, None) => current.to_string(),
    }
}

/// Apply a manifest override to a template
pub fn apply_override(tpl: &mut PodTemplateManager, ov: &ComponentOverride, registry: &str) {
    for env in &ov.env {
        tpl.add_env_all(env.clone());
    }
    for volume in &ov.volumes {
        tpl.add_volume(volume.clone());
    }
    if let Some(affinity) = &ov.affinity {
        tpl.merge_affinity(affinity.clone());
    }
    if !ov.node_selector.is_empty() {
        tpl.spec_mut()
            .node_selector
            .get_or_insert_with(BTreeMap::new)
            .extend(ov.node_selector.clone());
    }
    if let Some(tolerations) = &ov.tolerations {
        tpl.spec_mut().tolerations = Some(tolerations.clone());
    }
    if let Some(pc) = &ov.priority_class_name {
        tpl.spec_mut().priority_class_name = Some(pc.clone());
    }
    for (k, v) in &ov.labels {
        tpl.add_label(k.clone(), v.clone());
    }
    for (k, v) in &ov.annotations {
        tpl.add_annotation(k.clone(), v.clone());
    }
    if let Some(image) = &ov.image {
        for c in tpl.spec_mut().containers.iter_mut() {
            if c.name == global::FIPS_PROXY_CONTAINER {
                continue;
            }
            if let Some(current) = &c.image {
                c.image = Some(override_image(current, image, registry));
            }
        }
    }
    apply_container_overrides(tpl, ov, true);
}

/// Apply a profile's node agent override.
///
/// Profiles refine the manifest: they may only set container env and
/// resources plus the priority class.
pub fn apply_profile_override(tpl: &mut PodTemplateManager, ov: &ComponentOverride) {
    if let Some(pc) = &ov.priority_class_name {
        tpl.spec_mut().priority_class_name = Some(pc.clone());
    }
    apply_container_overrides(tpl, ov, false);
}

fn apply_container_overrides(tpl: &mut PodTemplateManager, ov: &ComponentOverride, full: bool) {
    for (name, co) in &ov.containers {
        let Ok(c) = tpl.container_mut(name) else {
            debug!(container = %name, "override targets a container that is not running");
            continue;
        };
        for env in &co.env {
            upsert_by_name(c.env.get_or_insert_with(Vec::new), env.clone(), |e| &e.name);
        }
        if let Some(resources) = &co.resources {
            c.resources = Some(resources.clone());
        }
        if !full {
            continue;
        }
        for mount in &co.volume_mounts {
            upsert_by_name(c.volume_mounts.get_or_insert_with(Vec::new), mount.clone(), |m| {
                &m.name
            });
        }
        if let Some(args) = &co.args {
            c.args = Some(args.clone());
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Everything the pipeline needs for one component template
pub struct TemplateInput<'a> {
    /// Component being built
    pub component: ComponentName,
    /// Owning DesiredAgent
    pub agent: &'a DesiredAgent,
    /// Resolved requirements
    pub required: &'a RequiredComponents,
    /// Enabled features, in registry order
    pub features: &'a [Box<dyn Feature>],
    /// Process options
    pub options: &'a OperatorOptions,
    /// Node provider, empty when introspection is off
    pub provider: &'a str,
    /// Cluster agent auth token
    pub token: &'a str,
    /// Node profile for profile-scoped node agent workloads
    pub profile: Option<&'a ResolvedProfile>,
}

/// Build a component's pod template.
///
/// Feature errors are collected across every feature and returned as one
/// [`Error::FeatureMutation`]; no partial template escapes.
pub fn build_pod_template(input: &TemplateInput<'_>) -> Result<PodTemplateSpec> {
    let component = input.component;
    let mut tpl = PodTemplateManager::new(
        component,
        default_template(component, input.agent, input.required, input.options),
    );
    if component == ComponentName::NodeAgent {
        if let Some(affinity) = provider::provider_affinity(input.provider) {
            tpl.merge_affinity(affinity);
        }
    }

    global::apply_global(&mut tpl, input)?;

    let single = input.required.single_container;
    let mut failures = Vec::new();
    for feature in input.features {
        let result = match component {
            ComponentName::NodeAgent if single => {
                feature.manage_single_container_node_agent(&mut tpl, input.provider)
            }
            ComponentName::NodeAgent => feature.manage_node_agent(&mut tpl, input.provider),
            ComponentName::ClusterAgent => feature.manage_cluster_agent(&mut tpl, input.provider),
            ComponentName::ClusterChecksRunner => {
                feature.manage_cluster_checks_runner(&mut tpl, input.provider)
            }
            ComponentName::OtelAgentGateway => {
                feature.manage_otel_agent_gateway(&mut tpl, input.provider)
            }
            ComponentName::OtelCollectorGateway => {
                feature.manage_otel_collector_gateway(&mut tpl, input.provider)
            }
        };
        if let Err(e) = result {
            failures.push(format!("{}: {}", feature.id(), e));
        }
    }
    if !failures.is_empty() {
        return Err(Error::feature_mutation(component.as_str(), failures.join("; ")));
    }

    let registry = global::registry(input.agent, input.options);
    if let Some(ov) = input.agent.spec.override_for(component) {
        apply_override(&mut tpl, ov, registry);
    }
    if let Some(profile) = input.profile {
        profile.apply_to_template(&mut tpl);
    }

    Ok(tpl.into_template())
}

//! Global settings applied to every component
//!
//! Credentials, site, tags, log level, FIPS proxy, kubelet and container
//! runtime wiring. These depend on the component and provider but never on
//! which features are enabled.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, ContainerPort, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;

use crate::crd::{ComponentName, DesiredAgent};
use crate::options::OperatorOptions;
use crate::pod_template::{
    env_from_secret, env_var, host_path_volume, image_ref, PodTemplateManager, TemplateInput,
    HOST_ROOT,
};
use crate::provider;
use crate::required::AgentContainer;
use crate::store::{DependencyKind, DependencyStore};
use crate::Result;

/// FIPS proxy sidecar container name
pub const FIPS_PROXY_CONTAINER: &str = "fips-proxy";

/// Default FIPS proxy image repository and tag
pub const FIPS_PROXY_IMAGE: (&str, &str) = ("fips-proxy", "1.1.5");

/// First FIPS proxy port
pub const DEFAULT_FIPS_PORT: i32 = 9803;

/// Key of the API key in the generated credentials secret
pub const API_KEY_KEY: &str = "api-key";

/// Key of the app key in the generated credentials secret
pub const APP_KEY_KEY: &str = "app-key";

/// Key of the token in the token secret
pub const TOKEN_KEY: &str = "token";

/// Default kubelet CA path inside agent containers
pub const DEFAULT_AGENT_CA_PATH: &str = "/var/run/host-kubelet-ca.crt";

/// Env var names shared by every component
pub mod env {
    /// Intake site
    pub const SITE: &str = "VIGIL_SITE";
    /// API key
    pub const API_KEY: &str = "VIGIL_API_KEY";
    /// App key, cluster agent only
    pub const APP_KEY: &str = "VIGIL_APP_KEY";
    /// Cluster name
    pub const CLUSTER_NAME: &str = "VIGIL_CLUSTER_NAME";
    /// Space-separated global tags
    pub const TAGS: &str = "VIGIL_TAGS";
    /// Log level
    pub const LOG_LEVEL: &str = "VIGIL_LOG_LEVEL";
    /// Node agent to cluster agent auth token
    pub const CLUSTER_AGENT_AUTH_TOKEN: &str = "VIGIL_CLUSTER_AGENT_AUTH_TOKEN";
    /// FIPS proxy toggle
    pub const FIPS_ENABLED: &str = "VIGIL_FIPS_ENABLED";
    /// FIPS proxy first port
    pub const FIPS_PORT_RANGE_START: &str = "VIGIL_FIPS_PORT_RANGE_START";
    /// Kubelet TLS verification
    pub const KUBELET_TLS_VERIFY: &str = "VIGIL_KUBELET_TLS_VERIFY";
    /// Kubelet client CA
    pub const KUBELET_CLIENT_CA: &str = "VIGIL_KUBELET_CLIENT_CA";
    /// Container runtime socket
    pub const CRI_SOCKET_PATH: &str = "VIGIL_CRI_SOCKET_PATH";
    /// Node provider
    pub const PROVIDER_KIND: &str = "VIGIL_PROVIDER_KIND";
}

/// Registry from the spec, or the operator default
pub fn registry<'a>(agent: &'a DesiredAgent, options: &'a OperatorOptions) -> &'a str {
    agent
        .spec
        .global
        .registry
        .as_deref()
        .unwrap_or(&options.default_registry)
}

/// Name of the generated credentials secret
pub fn credentials_secret_name(agent_name: &str) -> String {
    format!("{}-secret", agent_name)
}

/// Name of the token secret
pub fn token_secret_name(agent_name: &str) -> String {
    format!("{}-token", agent_name)
}

/// Wire global settings into a template
pub fn apply_global(tpl: &mut PodTemplateManager, input: &TemplateInput<'_>) -> Result<()> {
    let agent = input.agent;
    let agent_name = agent.metadata.name.as_deref().unwrap_or_default();
    let global = &agent.spec.global;
    let component = input.component;

    if let Some(site) = &global.site {
        tpl.add_env_all(env_var(env::SITE, site.clone()));
    }
    if let Some(cluster_name) = &global.cluster_name {
        tpl.add_env_all(env_var(env::CLUSTER_NAME, cluster_name.clone()));
    }
    if !global.tags.is_empty() {
        tpl.add_env_all(env_var(env::TAGS, global.tags.join(" ")));
    }
    if let Some(level) = &global.log_level {
        tpl.add_env_all(env_var(env::LOG_LEVEL, level.clone()));
    }

    let credentials = global.credentials.as_ref();
    let (secret, api_key_key, app_key_key) = match credentials.and_then(|c| c.secret_ref.as_ref()) {
        Some(r) => (
            r.name.clone(),
            r.api_key_key.clone(),
            r.app_key_key.clone(),
        ),
        None => (
            credentials_secret_name(agent_name),
            API_KEY_KEY.to_string(),
            credentials
                .and_then(|c| c.app_key.as_ref())
                .map(|_| APP_KEY_KEY.to_string()),
        ),
    };
    tpl.add_env_all(env_from_secret(env::API_KEY, &secret, &api_key_key));
    if component == ComponentName::ClusterAgent {
        if let Some(key) = app_key_key {
            tpl.add_env_all(env_from_secret(env::APP_KEY, &secret, &key));
        }
    }

    if matches!(
        component,
        ComponentName::NodeAgent | ComponentName::ClusterAgent | ComponentName::ClusterChecksRunner
    ) {
        tpl.add_env_all(env_from_secret(
            env::CLUSTER_AGENT_AUTH_TOKEN,
            &token_secret_name(agent_name),
            TOKEN_KEY,
        ));
    }

    if let Some(fips) = global.fips.as_ref().filter(|f| f.enabled) {
        if matches!(
            component,
            ComponentName::NodeAgent | ComponentName::ClusterAgent | ComponentName::ClusterChecksRunner
        ) {
            let port = fips.port.unwrap_or(DEFAULT_FIPS_PORT);
            tpl.add_env_all(env_var(env::FIPS_ENABLED, "true"));
            tpl.add_env_all(env_var(env::FIPS_PORT_RANGE_START, port.to_string()));
            let image = fips.image.clone().unwrap_or_else(|| {
                image_ref(
                    registry(agent, input.options),
                    FIPS_PROXY_IMAGE.0,
                    FIPS_PROXY_IMAGE.1,
                )
            });
            tpl.add_container(Container {
                name: FIPS_PROXY_CONTAINER.to_string(),
                image: Some(image),
                ports: Some(vec![ContainerPort {
                    name: Some("fips-proxy".to_string()),
                    container_port: port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            });
        }
    }

    if component == ComponentName::NodeAgent {
        apply_node_agent_host(tpl, input)?;
    }
    Ok(())
}

fn apply_node_agent_host(tpl: &mut PodTemplateManager, input: &TemplateInput<'_>) -> Result<()> {
    let global = &input.agent.spec.global;
    let main = if input.required.single_container {
        AgentContainer::Unified
    } else {
        AgentContainer::Core
    };

    if let Some(kubelet) = &global.kubelet {
        if let Some(verify) = kubelet.tls_verify {
            tpl.add_env_all(env_var(env::KUBELET_TLS_VERIFY, verify.to_string()));
        }
        if let Some(host_ca) = &kubelet.host_ca_path {
            let agent_ca = kubelet
                .agent_ca_path
                .clone()
                .unwrap_or_else(|| DEFAULT_AGENT_CA_PATH.to_string());
            let (volume, mount) = host_path_volume("kubelet-ca", host_ca, &agent_ca);
            tpl.add_volume(volume);
            tpl.add_volume_mount(main.as_str(), mount)?;
            tpl.add_env_all(env_var(env::KUBELET_CLIENT_CA, agent_ca));
        }
    }

    let socket = global
        .cri_socket_path
        .clone()
        .unwrap_or_else(|| provider::default_runtime_socket(input.provider).to_string());
    let socket_dir = socket
        .rsplit_once('/')
        .map(|(dir, _)| dir)
        .filter(|d| !d.is_empty())
        .unwrap_or("/");
    let mount_dir = format!("{}{}", HOST_ROOT, socket_dir);
    let (volume, mount) = host_path_volume("runtimesocketdir", socket_dir, &mount_dir);
    tpl.add_volume(volume);
    tpl.add_volume_mount(main.as_str(), mount)?;
    tpl.add_env_all(env_var(env::CRI_SOCKET_PATH, format!("{}{}", HOST_ROOT, socket)));

    if !input.provider.is_empty() {
        tpl.add_env_all(env_var(env::PROVIDER_KIND, input.provider));
    }
    Ok(())
}

/// Stage the credentials and token secrets
pub fn global_dependencies(
    agent: &DesiredAgent,
    store: &mut DependencyStore,
    token: &str,
) -> Result<()> {
    let agent_name = agent.metadata.name.as_deref().unwrap_or_default();
    let namespace = store.namespace().to_string();

    if let Some(creds) = agent.spec.global.credentials.as_ref() {
        if creds.secret_ref.is_none() {
            let mut data = BTreeMap::new();
            if let Some(api_key) = &creds.api_key {
                data.insert(API_KEY_KEY.to_string(), ByteString(api_key.clone().into_bytes()));
            }
            if let Some(app_key) = &creds.app_key {
                data.insert(APP_KEY_KEY.to_string(), ByteString(app_key.clone().into_bytes()));
            }
            store.add(
                DependencyKind::Secret,
                &secret(&credentials_secret_name(agent_name), &namespace, data),
            )?;
        }
    }

    let mut data = BTreeMap::new();
    data.insert(TOKEN_KEY.to_string(), ByteString(token.as_bytes().to_vec()));
    store.add(
        DependencyKind::Secret,
        &secret(&token_secret_name(agent_name), &namespace, data),
    )?;
    Ok(())
}

fn secret(name: &str, namespace: &str, data: BTreeMap<String, ByteString>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

//! Builders for the secondary objects features and components stage

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount, ServicePort, ServiceSpec};
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::ComponentName;
use crate::store::{DependencyKind, DependencyStore};
use crate::Result;
use vigil_common::{LABEL_COMPONENT, LABEL_INSTANCE};

fn meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        ..Default::default()
    }
}

/// Policy rule over core or named API groups
pub fn rule(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(api_groups.iter().map(|s| s.to_string()).collect()),
        resources: Some(resources.iter().map(|s| s.to_string()).collect()),
        verbs: verbs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// Read-only verbs
pub const READ: &[&str] = &["get", "list", "watch"];

/// Stage a service account
pub fn stage_service_account(store: &mut DependencyStore, name: &str) -> Result<()> {
    let namespace = store.namespace().to_string();
    store.add(
        DependencyKind::ServiceAccount,
        &ServiceAccount {
            metadata: meta(name, Some(&namespace)),
            ..Default::default()
        },
    )
}

/// Stage a cluster role and bind it to a service account of the agent namespace
pub fn stage_cluster_role(
    store: &mut DependencyStore,
    name: &str,
    rules: Vec<PolicyRule>,
    service_account: &str,
) -> Result<()> {
    let namespace = store.namespace().to_string();
    store.add(
        DependencyKind::ClusterRole,
        &ClusterRole {
            metadata: meta(name, None),
            rules: Some(rules),
            ..Default::default()
        },
    )?;
    store.add(
        DependencyKind::ClusterRoleBinding,
        &ClusterRoleBinding {
            metadata: meta(name, None),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: name.to_string(),
            },
            subjects: Some(vec![service_account_subject(service_account, &namespace)]),
        },
    )
}

/// Stage a namespaced role and its binding
pub fn stage_role(
    store: &mut DependencyStore,
    name: &str,
    rules: Vec<PolicyRule>,
    service_account: &str,
) -> Result<()> {
    let namespace = store.namespace().to_string();
    store.add(
        DependencyKind::Role,
        &Role {
            metadata: meta(name, Some(&namespace)),
            rules: Some(rules),
        },
    )?;
    store.add(
        DependencyKind::RoleBinding,
        &RoleBinding {
            metadata: meta(name, Some(&namespace)),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: name.to_string(),
            },
            subjects: Some(vec![service_account_subject(service_account, &namespace)]),
        },
    )
}

/// Unstage a cluster role and its binding
pub fn unstage_cluster_role(store: &mut DependencyStore, name: &str) {
    store.delete(DependencyKind::ClusterRole, None, name);
    store.delete(DependencyKind::ClusterRoleBinding, None, name);
}

/// Unstage a role and its binding
pub fn unstage_role(store: &mut DependencyStore, name: &str) {
    let namespace = store.namespace().to_string();
    store.delete(DependencyKind::Role, Some(&namespace), name);
    store.delete(DependencyKind::RoleBinding, Some(&namespace), name);
}

fn service_account_subject(name: &str, namespace: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: name.to_string(),
        namespace: Some(namespace.to_string()),
        api_group: None,
    }
}

/// Stage a ClusterIP service selecting one component's pods
pub fn stage_service(
    store: &mut DependencyStore,
    name: &str,
    agent_name: &str,
    component: ComponentName,
    ports: &[(&str, i32)],
) -> Result<()> {
    let namespace = store.namespace().to_string();
    let selector = BTreeMap::from([
        (
            LABEL_INSTANCE.to_string(),
            format!("{}-{}", agent_name, component.suffix()),
        ),
        (LABEL_COMPONENT.to_string(), component.suffix().to_string()),
    ]);
    store.add(
        DependencyKind::Service,
        &Service {
            metadata: meta(name, Some(&namespace)),
            spec: Some(ServiceSpec {
                selector: Some(selector),
                ports: Some(
                    ports
                        .iter()
                        .map(|(port_name, port)| ServicePort {
                            name: Some(port_name.to_string()),
                            port: *port,
                            target_port: Some(IntOrString::Int(*port)),
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        },
    )
}

/// Stage a config map in the agent namespace
pub fn stage_config_map(
    store: &mut DependencyStore,
    name: &str,
    data: BTreeMap<String, String>,
) -> Result<()> {
    let namespace = store.namespace().to_string();
    store.add(
        DependencyKind::ConfigMap,
        &ConfigMap {
            metadata: meta(name, Some(&namespace)),
            data: Some(data),
            ..Default::default()
        },
    )
}

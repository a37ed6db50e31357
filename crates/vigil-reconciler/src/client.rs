//! Kubernetes client abstraction for the reconciler
//!
//! Every API call the engine makes outside the dependency store goes through
//! [`AgentKubeClient`] so reconcile paths can be tested against mocks.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

use vigil_common::crd::{
    AgentProfile, AgentProfileStatus, DesiredAgent, DesiredAgentStatus, ExtendedDaemonSet,
    ExtendedDaemonSetReplicaSet,
};
use vigil_common::kube_utils::owner_references_patch;
use vigil_common::OPERATOR_NAME;

use crate::workload::{Workload, WorkloadKind};
use crate::{Error, Result};

/// Trait abstracting Kubernetes client operations for DesiredAgent
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AgentKubeClient: Send + Sync {
    /// Get a managed workload, `None` when it does not exist
    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>>;

    /// Create a managed workload
    async fn create_workload(&self, workload: Workload) -> Result<Workload>;

    /// Replace a managed workload; the object carries the live resourceVersion
    async fn update_workload(&self, workload: Workload) -> Result<Workload>;

    /// Merge-patch the owner references of a workload
    async fn patch_owner_references(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        owner_references: &[OwnerReference],
    ) -> Result<()>;

    /// Delete a workload, orphaning its pods when `orphan` is set.
    ///
    /// Not-found is success.
    async fn delete_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        orphan: bool,
    ) -> Result<()>;

    /// List workloads of a kind by label selector
    async fn list_workloads(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Workload>>;

    /// List ExtendedDaemonSetReplicaSets by label selector
    async fn list_replica_sets(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<ExtendedDaemonSetReplicaSet>>;

    /// List AgentProfiles across all namespaces
    async fn list_profiles(&self) -> Result<Vec<AgentProfile>>;

    /// Patch the status of an AgentProfile
    async fn patch_profile_status(
        &self,
        namespace: &str,
        name: &str,
        status: &AgentProfileStatus,
    ) -> Result<()>;

    /// List every node
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Merge-patch node labels; `None` values remove the label
    async fn patch_node_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<()>;

    /// List pods by label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    /// Delete a pod; not-found is success
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Patch the status of a DesiredAgent
    async fn patch_agent_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DesiredAgentStatus,
    ) -> Result<()>;

    /// Replace the finalizer list of a DesiredAgent
    async fn patch_agent_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: &[String],
    ) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct KubeAgentClient {
    client: Client,
}

impl KubeAgentClient {
    /// Create a new client wrapping the given kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

async fn get_opt<K>(api: Api<K>, name: &str) -> Result<Option<K>>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn delete_ignoring_missing<K>(api: Api<K>, name: &str, params: &DeleteParams) -> Result<()>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.delete(name, params).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn merge_patch<K, P>(api: Api<K>, name: &str, patch: &P) -> Result<()>
where
    K: Clone + DeserializeOwned + Debug,
    P: Serialize + Debug,
{
    api.patch(name, &PatchParams::apply(OPERATOR_NAME), &Patch::Merge(patch))
        .await?;
    Ok(())
}

fn namespace_of(workload: &Workload) -> Result<String> {
    workload
        .meta()
        .namespace
        .clone()
        .ok_or_else(|| Error::internal(format!("{} {} has no namespace", workload.kind(), workload.name())))
}

#[async_trait]
impl AgentKubeClient for KubeAgentClient {
    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>> {
        Ok(match kind {
            WorkloadKind::DaemonSet => {
                get_opt(self.api::<DaemonSet>(namespace), name).await?.map(Workload::DaemonSet)
            }
            WorkloadKind::Deployment => {
                get_opt(self.api::<Deployment>(namespace), name).await?.map(Workload::Deployment)
            }
            WorkloadKind::ExtendedDaemonSet => {
                get_opt(self.api::<ExtendedDaemonSet>(namespace), name)
                    .await?
                    .map(Workload::ExtendedDaemonSet)
            }
        })
    }

    async fn create_workload(&self, workload: Workload) -> Result<Workload> {
        let namespace = namespace_of(&workload)?;
        let pp = PostParams::default();
        Ok(match workload {
            Workload::DaemonSet(o) => {
                Workload::DaemonSet(self.api(&namespace).create(&pp, &o).await?)
            }
            Workload::Deployment(o) => {
                Workload::Deployment(self.api(&namespace).create(&pp, &o).await?)
            }
            Workload::ExtendedDaemonSet(o) => {
                Workload::ExtendedDaemonSet(self.api(&namespace).create(&pp, &o).await?)
            }
        })
    }

    async fn update_workload(&self, workload: Workload) -> Result<Workload> {
        let namespace = namespace_of(&workload)?;
        let name = workload.name().to_string();
        let pp = PostParams::default();
        Ok(match workload {
            Workload::DaemonSet(o) => {
                Workload::DaemonSet(self.api(&namespace).replace(&name, &pp, &o).await?)
            }
            Workload::Deployment(o) => {
                Workload::Deployment(self.api(&namespace).replace(&name, &pp, &o).await?)
            }
            Workload::ExtendedDaemonSet(o) => {
                Workload::ExtendedDaemonSet(self.api(&namespace).replace(&name, &pp, &o).await?)
            }
        })
    }

    async fn patch_owner_references(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        owner_references: &[OwnerReference],
    ) -> Result<()> {
        let patch = owner_references_patch(owner_references);
        match kind {
            WorkloadKind::DaemonSet => merge_patch(self.api::<DaemonSet>(namespace), name, &patch).await,
            WorkloadKind::Deployment => {
                merge_patch(self.api::<Deployment>(namespace), name, &patch).await
            }
            WorkloadKind::ExtendedDaemonSet => {
                merge_patch(self.api::<ExtendedDaemonSet>(namespace), name, &patch).await
            }
        }
    }

    async fn delete_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        orphan: bool,
    ) -> Result<()> {
        let params = if orphan {
            DeleteParams {
                propagation_policy: Some(PropagationPolicy::Orphan),
                ..Default::default()
            }
        } else {
            DeleteParams::default()
        };
        match kind {
            WorkloadKind::DaemonSet => {
                delete_ignoring_missing(self.api::<DaemonSet>(namespace), name, &params).await
            }
            WorkloadKind::Deployment => {
                delete_ignoring_missing(self.api::<Deployment>(namespace), name, &params).await
            }
            WorkloadKind::ExtendedDaemonSet => {
                delete_ignoring_missing(self.api::<ExtendedDaemonSet>(namespace), name, &params)
                    .await
            }
        }
    }

    async fn list_workloads(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Workload>> {
        let lp = ListParams::default().labels(selector);
        Ok(match kind {
            WorkloadKind::DaemonSet => self
                .api::<DaemonSet>(namespace)
                .list(&lp)
                .await?
                .items
                .into_iter()
                .map(Workload::DaemonSet)
                .collect(),
            WorkloadKind::Deployment => self
                .api::<Deployment>(namespace)
                .list(&lp)
                .await?
                .items
                .into_iter()
                .map(Workload::Deployment)
                .collect(),
            WorkloadKind::ExtendedDaemonSet => self
                .api::<ExtendedDaemonSet>(namespace)
                .list(&lp)
                .await?
                .items
                .into_iter()
                .map(Workload::ExtendedDaemonSet)
                .collect(),
        })
    }

    async fn list_replica_sets(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<ExtendedDaemonSetReplicaSet>> {
        let list = self
            .api::<ExtendedDaemonSetReplicaSet>(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    async fn list_profiles(&self) -> Result<Vec<AgentProfile>> {
        let api: Api<AgentProfile> = Api::all(self.client.clone());
        let list = api.list(&Default::default()).await?;
        Ok(list.items)
    }

    async fn patch_profile_status(
        &self,
        namespace: &str,
        name: &str,
        status: &AgentProfileStatus,
    ) -> Result<()> {
        let api: Api<AgentProfile> = self.api(namespace);
        let status_patch = serde_json::json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(OPERATOR_NAME),
            &Patch::Merge(&status_patch),
        )
        .await?;
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let list = api.list(&Default::default()).await?;
        Ok(list.items)
    }

    async fn patch_node_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        merge_patch(api, name, &patch).await
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let list = self
            .api::<Pod>(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        delete_ignoring_missing(self.api::<Pod>(namespace), name, &DeleteParams::default()).await
    }

    async fn patch_agent_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DesiredAgentStatus,
    ) -> Result<()> {
        let api: Api<DesiredAgent> = self.api(namespace);
        let status_patch = serde_json::json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(OPERATOR_NAME),
            &Patch::Merge(&status_patch),
        )
        .await?;
        Ok(())
    }

    async fn patch_agent_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: &[String],
    ) -> Result<()> {
        let api: Api<DesiredAgent> = self.api(namespace);
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        merge_patch(api, name, &patch).await
    }
}

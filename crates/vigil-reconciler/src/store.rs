//! Dependency store for secondary objects
//!
//! Features and components stage service accounts, RBAC, secrets, config
//! maps and services during a reconcile. At the end the store applies every
//! staged object in one pass and deletes anything carrying its ownership
//! labels that was not staged this time.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use tracing::{debug, info, warn};

use vigil_common::{LABEL_MANAGED_BY, LABEL_PART_OF, LABEL_STORE, OPERATOR_NAME};

use crate::{Error, Result};

/// Kinds the store knows how to manage
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DependencyKind {
    /// core/v1 ServiceAccount
    ServiceAccount,
    /// core/v1 ConfigMap
    ConfigMap,
    /// core/v1 Secret
    Secret,
    /// core/v1 Service
    Service,
    /// rbac/v1 Role
    Role,
    /// rbac/v1 RoleBinding
    RoleBinding,
    /// rbac/v1 ClusterRole
    ClusterRole,
    /// rbac/v1 ClusterRoleBinding
    ClusterRoleBinding,
    /// networking/v1 NetworkPolicy
    NetworkPolicy,
    /// policy/v1 PodDisruptionBudget
    PodDisruptionBudget,
}

impl DependencyKind {
    /// Every kind, in apply order
    pub const ALL: [DependencyKind; 10] = [
        DependencyKind::ServiceAccount,
        DependencyKind::ConfigMap,
        DependencyKind::Secret,
        DependencyKind::Service,
        DependencyKind::Role,
        DependencyKind::RoleBinding,
        DependencyKind::ClusterRole,
        DependencyKind::ClusterRoleBinding,
        DependencyKind::NetworkPolicy,
        DependencyKind::PodDisruptionBudget,
    ];

    /// Dynamic API resource for this kind
    pub fn api_resource(&self) -> ApiResource {
        match self {
            Self::ServiceAccount => ApiResource::erase::<ServiceAccount>(&()),
            Self::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
            Self::Secret => ApiResource::erase::<Secret>(&()),
            Self::Service => ApiResource::erase::<Service>(&()),
            Self::Role => ApiResource::erase::<Role>(&()),
            Self::RoleBinding => ApiResource::erase::<RoleBinding>(&()),
            Self::ClusterRole => ApiResource::erase::<ClusterRole>(&()),
            Self::ClusterRoleBinding => ApiResource::erase::<ClusterRoleBinding>(&()),
            Self::NetworkPolicy => ApiResource::erase::<NetworkPolicy>(&()),
            Self::PodDisruptionBudget => ApiResource::erase::<PodDisruptionBudget>(&()),
        }
    }

    /// True for kinds owner references cannot garbage collect
    pub fn is_cluster_scoped(&self) -> bool {
        matches!(self, Self::ClusterRole | Self::ClusterRoleBinding)
    }
}

// =============================================================================
// Client
// =============================================================================

/// Trait abstracting the API calls the store makes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Get an object, `None` when it does not exist
    async fn get(
        &self,
        kind: DependencyKind,
        namespace: Option<String>,
        name: String,
    ) -> Result<Option<DynamicObject>>;

    /// Create an object
    async fn create(&self, kind: DependencyKind, obj: DynamicObject) -> Result<()>;

    /// Replace an object; `obj` carries the live resourceVersion
    async fn update(&self, kind: DependencyKind, obj: DynamicObject) -> Result<()>;

    /// List objects of a kind across namespaces by label selector
    async fn list(&self, kind: DependencyKind, selector: String) -> Result<Vec<DynamicObject>>;

    /// Delete an object; not-found is success
    async fn delete(&self, kind: DependencyKind, namespace: Option<String>, name: String) -> Result<()>;
}

/// Real store client backed by the Kubernetes API
pub struct KubeStoreClient {
    client: Client,
}

impl KubeStoreClient {
    /// Create a new store client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: DependencyKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match namespace {
            Some(ns) if !kind.is_cluster_scoped() => {
                Api::namespaced_with(self.client.clone(), ns, &ar)
            }
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait]
impl StoreClient for KubeStoreClient {
    async fn get(
        &self,
        kind: DependencyKind,
        namespace: Option<String>,
        name: String,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.api(kind, namespace.as_deref()).get_opt(&name).await?)
    }

    async fn create(&self, kind: DependencyKind, obj: DynamicObject) -> Result<()> {
        let api = self.api(kind, obj.metadata.namespace.as_deref());
        api.create(&PostParams::default(), &obj).await?;
        Ok(())
    }

    async fn update(&self, kind: DependencyKind, obj: DynamicObject) -> Result<()> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        let api = self.api(kind, obj.metadata.namespace.as_deref());
        api.replace(&name, &PostParams::default(), &obj).await?;
        Ok(())
    }

    async fn list(&self, kind: DependencyKind, selector: String) -> Result<Vec<DynamicObject>> {
        let api = self.api(kind, None);
        let list = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(list.items)
    }

    async fn delete(&self, kind: DependencyKind, namespace: Option<String>, name: String) -> Result<()> {
        match self
            .api(kind, namespace.as_deref())
            .delete(&name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Store
// =============================================================================

type StoreKey = (DependencyKind, Option<String>, String);

/// Objects staged by one reconcile
pub struct DependencyStore {
    owner: OwnerReference,
    namespace: String,
    part_of: String,
    objects: BTreeMap<StoreKey, DynamicObject>,
}

impl DependencyStore {
    /// Empty store for the DesiredAgent described by `owner`
    pub fn new(owner: OwnerReference, namespace: impl Into<String>, part_of: impl Into<String>) -> Self {
        Self {
            owner,
            namespace: namespace.into(),
            part_of: part_of.into(),
            objects: BTreeMap::new(),
        }
    }

    /// Namespace of the owning DesiredAgent
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Label selector matching everything this store owns
    pub fn selector(&self) -> String {
        format!("{}=true,{}={}", LABEL_STORE, LABEL_PART_OF, self.part_of)
    }

    /// Stage a typed object
    pub fn add<K: Serialize>(&mut self, kind: DependencyKind, obj: &K) -> Result<()> {
        let value = serde_json::to_value(obj)
            .map_err(|e| Error::serialization_for_kind(format!("{:?}", kind), e.to_string()))?;
        let dynamic: DynamicObject = serde_json::from_value(value)
            .map_err(|e| Error::serialization_for_kind(format!("{:?}", kind), e.to_string()))?;
        self.add_or_update(kind, dynamic)
    }

    /// Stage an object, replacing any earlier version with the same key
    pub fn add_or_update(&mut self, kind: DependencyKind, mut obj: DynamicObject) -> Result<()> {
        let name = obj
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::validation(format!("{:?} staged without a name", kind)))?;
        if obj.types.is_none() {
            let ar = kind.api_resource();
            obj.types = Some(kube::core::TypeMeta {
                api_version: ar.api_version,
                kind: ar.kind,
            });
        }

        let namespace = if kind.is_cluster_scoped() {
            obj.metadata.namespace = None;
            None
        } else {
            let ns = obj
                .metadata
                .namespace
                .get_or_insert_with(|| self.namespace.clone())
                .clone();
            if ns == self.namespace {
                obj.metadata.owner_references = Some(vec![self.owner.clone()]);
            }
            Some(ns)
        };

        let labels = obj.metadata.labels.get_or_insert_with(BTreeMap::new);
        labels.insert(LABEL_STORE.to_string(), "true".to_string());
        labels.insert(LABEL_MANAGED_BY.to_string(), OPERATOR_NAME.to_string());
        labels.insert(LABEL_PART_OF.to_string(), self.part_of.clone());

        self.objects.insert((kind, namespace, name), obj);
        Ok(())
    }

    /// Staged object by key
    pub fn get(&self, kind: DependencyKind, namespace: Option<&str>, name: &str) -> Option<&DynamicObject> {
        let namespace = if kind.is_cluster_scoped() {
            None
        } else {
            namespace.map(str::to_string)
        };
        self.objects.get(&(kind, namespace, name.to_string()))
    }

    /// Unstage an object so cleanup removes it
    pub fn delete(&mut self, kind: DependencyKind, namespace: Option<&str>, name: &str) -> bool {
        let namespace = if kind.is_cluster_scoped() {
            None
        } else {
            namespace.map(str::to_string)
        };
        self.objects.remove(&(kind, namespace, name.to_string())).is_some()
    }

    /// Number of staged objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True when nothing is staged
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Create missing objects and update drifted ones.
    ///
    /// Every object is attempted; errors are returned together.
    pub async fn apply(&self, client: &dyn StoreClient) -> Vec<Error> {
        let mut errors = Vec::new();
        for ((kind, namespace, name), desired) in &self.objects {
            let result = async {
                match client.get(*kind, namespace.clone(), name.clone()).await? {
                    None => {
                        debug!(?kind, %name, "creating dependency");
                        client.create(*kind, desired.clone()).await
                    }
                    Some(live) if is_up_to_date(desired, &live) => Ok(()),
                    Some(live) => {
                        debug!(?kind, %name, "updating dependency");
                        let mut obj = desired.clone();
                        obj.metadata.resource_version = live.metadata.resource_version.clone();
                        client.update(*kind, obj).await
                    }
                }
            }
            .await;
            if let Err(e) = result {
                warn!(?kind, %name, error = %e, "failed to apply dependency");
                errors.push(e);
            }
        }
        errors
    }

    /// Delete owned objects that were not staged this reconcile
    pub async fn cleanup(&self, client: &dyn StoreClient) -> Vec<Error> {
        let selector = self.selector();
        let mut errors = Vec::new();
        for kind in DependencyKind::ALL {
            let live = match client.list(kind, selector.clone()).await {
                Ok(live) => live,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            for obj in live {
                let name = obj.metadata.name.clone().unwrap_or_default();
                let namespace = if kind.is_cluster_scoped() {
                    None
                } else {
                    obj.metadata.namespace.clone()
                };
                if self.objects.contains_key(&(kind, namespace.clone(), name.clone())) {
                    continue;
                }
                info!(?kind, %name, "deleting unstaged dependency");
                if let Err(e) = client.delete(kind, namespace, name).await {
                    if !matches!(e.api_code(), Some(404) | Some(410)) {
                        errors.push(e);
                    }
                }
            }
        }
        errors
    }

    /// Delete every cluster-scoped object this store owns
    pub async fn delete_cluster_scoped(&self, client: &dyn StoreClient) -> Vec<Error> {
        let selector = self.selector();
        let mut errors = Vec::new();
        for kind in DependencyKind::ALL.into_iter().filter(|k| k.is_cluster_scoped()) {
            match client.list(kind, selector.clone()).await {
                Ok(live) => {
                    for obj in live {
                        let name = obj.metadata.name.clone().unwrap_or_default();
                        if let Err(e) = client.delete(kind, None, name).await {
                            errors.push(e);
                        }
                    }
                }
                Err(e) => errors.push(e),
            }
        }
        errors
    }
}

/// Desired fields equal live ones and desired labels/annotations are present.
///
/// Server-populated fields (status, defaults, extra metadata) never count as
/// drift.
fn is_up_to_date(desired: &DynamicObject, live: &DynamicObject) -> bool {
    let fields_match = match desired.data.as_object() {
        Some(fields) => fields.iter().all(|(k, v)| live.data.get(k) == Some(v)),
        None => true,
    };
    let subset = |want: &Option<BTreeMap<String, String>>, have: &Option<BTreeMap<String, String>>| {
        want.iter()
            .flatten()
            .all(|(k, v)| have.as_ref().and_then(|h| h.get(k)) == Some(v))
    };
    fields_match
        && subset(&desired.metadata.labels, &live.metadata.labels)
        && subset(&desired.metadata.annotations, &live.metadata.annotations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::{Arc, Mutex};
    use crate::test_support::{api_error, owner};

    fn store() -> DependencyStore {
        DependencyStore::new(owner(), "monitoring", "monitoring-vigil")
    }

    fn config_map(name: &str, value: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: Some([("key".to_string(), value.to_string())].into()),
            ..Default::default()
        }
    }

    fn dynamic(kind: DependencyKind, name: &str, namespace: Option<&str>) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &kind.api_resource());
        obj.metadata.namespace = namespace.map(str::to_string);
        obj
    }

    #[test]
    fn staging_labels_and_owns_namespaced_objects() {
        let mut store = store();
        store
            .add(DependencyKind::ConfigMap, &config_map("cm", "v"))
            .expect("stage");
        let staged = store
            .get(DependencyKind::ConfigMap, Some("monitoring"), "cm")
            .expect("staged");
        let labels = staged.metadata.labels.clone().unwrap_or_default();
        assert_eq!(labels.get(LABEL_STORE).map(String::as_str), Some("true"));
        assert_eq!(
            labels.get(LABEL_PART_OF).map(String::as_str),
            Some("monitoring-vigil")
        );
        assert_eq!(staged.metadata.owner_references, Some(vec![owner()]));

        store
            .add(
                DependencyKind::ClusterRole,
                &ClusterRole {
                    metadata: ObjectMeta {
                        name: Some("vigil-agent".to_string()),
                        namespace: Some("ignored".to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .expect("stage");
        let role = store
            .get(DependencyKind::ClusterRole, None, "vigil-agent")
            .expect("staged");
        assert!(role.metadata.owner_references.is_none());
        assert!(role.metadata.namespace.is_none());

        assert!(store.delete(DependencyKind::ClusterRole, None, "vigil-agent"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn unnamed_objects_are_rejected() {
        let mut store = store();
        assert!(store
            .add(DependencyKind::ConfigMap, &ConfigMap::default())
            .is_err());
    }

    /// Story: Apply creates missing objects, updates drift and skips the rest
    #[tokio::test]
    async fn story_apply_creates_updates_and_skips() {
        let mut store = store();
        store
            .add(DependencyKind::ConfigMap, &config_map("missing", "v"))
            .expect("stage");
        store
            .add(DependencyKind::ConfigMap, &config_map("drifted", "new"))
            .expect("stage");
        store
            .add(DependencyKind::ConfigMap, &config_map("same", "v"))
            .expect("stage");

        let staged_same = store
            .get(DependencyKind::ConfigMap, Some("monitoring"), "same")
            .cloned()
            .expect("staged");
        let mut live_same = staged_same.clone();
        live_same.metadata.resource_version = Some("7".to_string());
        live_same
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert("extra".to_string(), "server".to_string());

        let mut live_drifted = store
            .get(DependencyKind::ConfigMap, Some("monitoring"), "drifted")
            .cloned()
            .expect("staged");
        live_drifted.data["data"]["key"] = serde_json::json!("old");
        live_drifted.metadata.resource_version = Some("3".to_string());

        let mut client = MockStoreClient::new();
        client.expect_get().returning(move |_, _, name| match name.as_str() {
            "same" => Ok(Some(live_same.clone())),
            "drifted" => Ok(Some(live_drifted.clone())),
            _ => Ok(None),
        });
        client
            .expect_create()
            .withf(|_, obj| obj.metadata.name.as_deref() == Some("missing"))
            .times(1)
            .returning(|_, _| Ok(()));
        client
            .expect_update()
            .withf(|_, obj| {
                obj.metadata.name.as_deref() == Some("drifted")
                    && obj.metadata.resource_version.as_deref() == Some("3")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let errors = store.apply(&client).await;
        assert!(errors.is_empty());
    }

    /// Story: Apply keeps going after a failure and reports every error
    #[tokio::test]
    async fn story_apply_aggregates_errors() {
        let mut store = store();
        store
            .add(DependencyKind::ConfigMap, &config_map("a", "v"))
            .expect("stage");
        store
            .add(DependencyKind::ConfigMap, &config_map("b", "v"))
            .expect("stage");

        let mut client = MockStoreClient::new();
        client.expect_get().returning(|_, _, _| Ok(None));
        client
            .expect_create()
            .times(2)
            .returning(|_, _| Err(Error::from(api_error(500, "InternalError"))));

        assert_eq!(store.apply(&client).await.len(), 2);
    }

    /// Story: Cleanup deletes only owned objects that were not staged
    #[tokio::test]
    async fn story_cleanup_prunes_unstaged_objects() {
        let mut store = store();
        store
            .add(DependencyKind::ConfigMap, &config_map("kept", "v"))
            .expect("stage");

        let deleted = Arc::new(Mutex::new(Vec::new()));
        let recorded = deleted.clone();

        let mut client = MockStoreClient::new();
        client
            .expect_list()
            .withf(|_, selector| selector.contains("operator.vigil.dev/managed-by-store=true"))
            .returning(|kind, _| match kind {
                DependencyKind::ConfigMap => Ok(vec![
                    dynamic(kind, "kept", Some("monitoring")),
                    dynamic(kind, "stale", Some("monitoring")),
                ]),
                DependencyKind::ClusterRole => Ok(vec![dynamic(kind, "gone", None)]),
                _ => Ok(vec![]),
            });
        client.expect_delete().returning(move |kind, _, name| {
            recorded.lock().expect("lock").push((kind, name.clone()));
            if name == "gone" {
                Err(Error::from(api_error(404, "NotFound")))
            } else {
                Ok(())
            }
        });

        let errors = store.cleanup(&client).await;
        assert!(errors.is_empty());
        let deleted = deleted.lock().expect("lock").clone();
        assert_eq!(
            deleted,
            vec![
                (DependencyKind::ConfigMap, "stale".to_string()),
                (DependencyKind::ClusterRole, "gone".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn delete_cluster_scoped_only_touches_cluster_kinds() {
        let store = store();
        let mut client = MockStoreClient::new();
        client
            .expect_list()
            .withf(|kind, _| kind.is_cluster_scoped())
            .times(2)
            .returning(|kind, _| Ok(vec![dynamic(kind, "vigil-agent", None)]));
        client
            .expect_delete()
            .times(2)
            .returning(|_, _, _| Ok(()));
        assert!(store.delete_cluster_scoped(&client).await.is_empty());
    }
}

//! Cluster agent deployment

use std::time::Duration;

use async_trait::async_trait;

use vigil_common::crd::{ComponentName, DesiredAgentStatus};

use super::{cleanup_deployment, reconcile_deployment, ComponentReconciler};
use crate::context::ReconcileContext;
use crate::dependencies::{
    rule, stage_cluster_role, stage_role, stage_service_account, unstage_cluster_role,
    unstage_role, READ,
};
use crate::pod_template::component_resource_name;
use crate::store::{DependencyKind, DependencyStore};
use crate::Result;

/// The cluster agent owns its service account and RBAC
pub struct ClusterAgentComponent;

fn stage_rbac(store: &mut DependencyStore, name: &str) -> Result<()> {
    stage_service_account(store, name)?;
    stage_cluster_role(
        store,
        name,
        vec![
            rule(
                &[""],
                &["services", "endpoints", "pods", "nodes", "namespaces", "componentstatuses"],
                READ,
            ),
            rule(&[""], &["events"], &["get", "list", "watch", "create"]),
            rule(&["apps"], &["deployments", "replicasets", "daemonsets", "statefulsets"], READ),
            rule(&["batch"], &["jobs", "cronjobs"], READ),
            rule(&["autoscaling"], &["horizontalpodautoscalers"], READ),
            rule(&[""], &["nodes/metrics", "nodes/stats", "nodes/proxy"], &["get"]),
        ],
        name,
    )?;
    // leader election
    stage_role(
        store,
        name,
        vec![
            rule(&["coordination.k8s.io"], &["leases"], &["get", "create", "update"]),
            rule(&[""], &["configmaps"], &["get", "create", "update"]),
        ],
        name,
    )
}

#[async_trait]
impl ComponentReconciler for ClusterAgentComponent {
    fn name(&self) -> ComponentName {
        ComponentName::ClusterAgent
    }

    async fn reconcile(
        &self,
        ctx: &ReconcileContext<'_>,
        store: &mut DependencyStore,
        status: &mut DesiredAgentStatus,
    ) -> Result<Option<Duration>> {
        stage_rbac(store, &component_resource_name(&ctx.name, self.name()))?;
        reconcile_deployment(ctx, self.name(), status).await
    }

    async fn cleanup(
        &self,
        ctx: &ReconcileContext<'_>,
        store: &mut DependencyStore,
        status: &mut DesiredAgentStatus,
    ) -> Result<()> {
        let name = component_resource_name(&ctx.name, self.name());
        let namespace = store.namespace().to_string();
        store.delete(DependencyKind::ServiceAccount, Some(&namespace), &name);
        unstage_cluster_role(store, &name);
        unstage_role(store, &name);
        cleanup_deployment(ctx, self.name(), status).await
    }
}

//! Cluster-checks runner deployment
//!
//! Its service account and cluster role come from the cluster checks
//! feature, so cleanup has no RBAC of its own to remove.

use std::time::Duration;

use async_trait::async_trait;

use vigil_common::crd::{ComponentName, DesiredAgentStatus};

use super::{cleanup_deployment, reconcile_deployment, ComponentReconciler};
use crate::context::ReconcileContext;
use crate::store::DependencyStore;
use crate::Result;

/// Runners for checks dispatched by the cluster agent
pub struct ClusterChecksRunnerComponent;

#[async_trait]
impl ComponentReconciler for ClusterChecksRunnerComponent {
    fn name(&self) -> ComponentName {
        ComponentName::ClusterChecksRunner
    }

    async fn reconcile(
        &self,
        ctx: &ReconcileContext<'_>,
        _store: &mut DependencyStore,
        status: &mut DesiredAgentStatus,
    ) -> Result<Option<Duration>> {
        reconcile_deployment(ctx, self.name(), status).await
    }

    async fn cleanup(
        &self,
        ctx: &ReconcileContext<'_>,
        _store: &mut DependencyStore,
        status: &mut DesiredAgentStatus,
    ) -> Result<()> {
        cleanup_deployment(ctx, self.name(), status).await
    }
}

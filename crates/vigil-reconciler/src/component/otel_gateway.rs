//! OpenTelemetry gateway deployments

use std::time::Duration;

use async_trait::async_trait;

use vigil_common::crd::{ComponentName, DesiredAgentStatus};

use super::{cleanup_deployment, reconcile_deployment, ComponentReconciler};
use crate::context::ReconcileContext;
use crate::store::DependencyStore;
use crate::Result;

/// One of the two gateway deployments; their config and services are staged
/// by the matching otel feature
pub struct OtelGatewayComponent {
    component: ComponentName,
}

impl OtelGatewayComponent {
    /// Gateway for `component`
    pub fn new(component: ComponentName) -> Self {
        Self { component }
    }
}

#[async_trait]
impl ComponentReconciler for OtelGatewayComponent {
    fn name(&self) -> ComponentName {
        self.component
    }

    async fn reconcile(
        &self,
        ctx: &ReconcileContext<'_>,
        _store: &mut DependencyStore,
        status: &mut DesiredAgentStatus,
    ) -> Result<Option<Duration>> {
        reconcile_deployment(ctx, self.component, status).await
    }

    async fn cleanup(
        &self,
        ctx: &ReconcileContext<'_>,
        _store: &mut DependencyStore,
        status: &mut DesiredAgentStatus,
    ) -> Result<()> {
        cleanup_deployment(ctx, self.component, status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockAgentKubeClient;
    use crate::crd::ComponentOverride;
    use crate::required::{AgentContainer, RequiredComponent};
    use crate::test_support::{agent, owner, valid_spec, TestContext};

    #[tokio::test]
    async fn gateway_honours_override_name() {
        let mut client = MockAgentKubeClient::new();
        client
            .expect_get_workload()
            .withf(|_, _, name| name == "edge-gateway")
            .returning(|_, _, _| Ok(None));
        client
            .expect_create_workload()
            .withf(|w| w.name() == "edge-gateway")
            .times(1)
            .returning(|w| Ok(w));

        let mut spec = valid_spec();
        spec.override_.insert(
            ComponentName::OtelAgentGateway,
            ComponentOverride {
                name: Some("edge-gateway".to_string()),
                ..Default::default()
            },
        );
        let mut test = TestContext::new(client);
        test.agent = agent(spec);
        test.required.otel_agent_gateway =
            RequiredComponent::required([AgentContainer::OtelAgentGateway]);

        let mut status = DesiredAgentStatus::default();
        OtelGatewayComponent::new(ComponentName::OtelAgentGateway)
            .reconcile(
                &test.ctx(),
                &mut DependencyStore::new(owner(), "monitoring", "monitoring-vigil"),
                &mut status,
            )
            .await
            .expect("reconcile");
        assert_eq!(
            status.otel_agent_gateway.map(|s| s.name).as_deref(),
            Some("edge-gateway")
        );
    }
}

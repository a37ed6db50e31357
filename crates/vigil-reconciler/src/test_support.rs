//! Fixtures shared by the unit tests

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};

use vigil_common::NoopEventPublisher;

use crate::client::MockAgentKubeClient;
use crate::context::{ContextParams, ReconcileContext};
use crate::crd::{Credentials, DesiredAgent, DesiredAgentSpec, GlobalConfig};
use crate::features::Feature;
use crate::options::OperatorOptions;
use crate::profile::{NodeAgentTarget, ResolvedProfile};
use crate::required::RequiredComponents;
use crate::Error;

/// Kubernetes API error with the given HTTP code
pub fn api_error(code: u16, reason: &str) -> Error {
    Error::from(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} error", reason),
        reason: reason.to_string(),
        code,
    }))
}

/// Owner reference of the sample DesiredAgent
pub fn owner() -> OwnerReference {
    OwnerReference {
        api_version: "agent.vigil.dev/v1alpha1".to_string(),
        kind: "DesiredAgent".to_string(),
        name: "vigil".to_string(),
        uid: "uid-1".to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Fixed reconcile time
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).single().unwrap_or_default()
}

/// Minimal valid spec
pub fn valid_spec() -> DesiredAgentSpec {
    DesiredAgentSpec {
        global: GlobalConfig {
            credentials: Some(Credentials {
                api_key: Some("0123456789abcdef".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// `monitoring/vigil` DesiredAgent with the given spec
pub fn agent(spec: DesiredAgentSpec) -> DesiredAgent {
    DesiredAgent {
        metadata: ObjectMeta {
            name: Some("vigil".to_string()),
            namespace: Some("monitoring".to_string()),
            uid: Some("uid-1".to_string()),
            generation: Some(1),
            creation_timestamp: Some(Time(now() - chrono::Duration::days(1))),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

/// Node with labels
pub fn node(name: &str, labels: &[(&str, &str)]) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Owned pieces of a [`ReconcileContext`] around a mock client
pub struct TestContext {
    pub agent: DesiredAgent,
    pub required: RequiredComponents,
    pub features: Vec<Box<dyn Feature>>,
    pub options: OperatorOptions,
    pub client: MockAgentKubeClient,
    pub events: NoopEventPublisher,
    /// Node agent targets; a single default target when unset
    pub targets: Option<Vec<NodeAgentTarget>>,
}

impl TestContext {
    /// Context for the sample agent with nothing required
    pub fn new(client: MockAgentKubeClient) -> Self {
        Self {
            agent: agent(valid_spec()),
            required: RequiredComponents::default(),
            features: Vec::new(),
            options: OperatorOptions::default(),
            client,
            events: NoopEventPublisher,
            targets: None,
        }
    }

    /// Borrowing context over the owned pieces
    pub fn ctx(&self) -> ReconcileContext<'_> {
        let mut ctx = ReconcileContext::new(
            &self.agent,
            ContextParams {
                required: &self.required,
                features: &self.features,
                options: &self.options,
                client: &self.client,
                events: &self.events,
                token: "0123456789abcdef0123456789abcdef".to_string(),
                now: now(),
            },
        )
        .expect("context");
        ctx.node_targets = self.targets.clone().unwrap_or_else(|| {
            vec![NodeAgentTarget {
                profile: ResolvedProfile::default_profile(self.options.profiles_enabled),
                provider: String::new(),
            }]
        });
        ctx
    }
}

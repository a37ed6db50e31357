//! Kubernetes Event recording for the vigil controller.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so the reconciler can emit Events on the DesiredAgent it is converging,
//! visible via `kubectl describe dagent`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "WorkloadCreated")
    /// * `action` - What action was taken (e.g. "Create")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// A managed workload was created
    pub const WORKLOAD_CREATED: &str = "WorkloadCreated";
    /// A managed workload was updated in place
    pub const WORKLOAD_UPDATED: &str = "WorkloadUpdated";
    /// A managed workload was deleted with orphaned pods because its selector changed
    pub const WORKLOAD_REPLACED: &str = "WorkloadReplaced";
    /// A managed workload was removed because its component is disabled
    pub const WORKLOAD_DELETED: &str = "WorkloadDeleted";
    /// A component is required by features but disabled by an override
    pub const OVERRIDE_CONFLICT: &str = "OverrideConflict";
    /// A profile lost a node-claim conflict
    pub const PROFILE_CONFLICT: &str = "ProfileConflict";
    /// A profile failed validation
    pub const PROFILE_INVALID: &str = "ProfileInvalid";
    /// DesiredAgent spec validation failed
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// A reconcile pass ended in error
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Creating a managed object
    pub const CREATE: &str = "Create";
    /// Updating a managed object
    pub const UPDATE: &str = "Update";
    /// Deleting a managed object
    pub const DELETE: &str = "Delete";
    /// Evaluating node profiles
    pub const ASSIGN_PROFILES: &str = "AssignProfiles";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn reason_constants_are_pascal_case() {
        for reason in [
            reasons::WORKLOAD_CREATED,
            reasons::WORKLOAD_UPDATED,
            reasons::WORKLOAD_REPLACED,
            reasons::OVERRIDE_CONFLICT,
            reasons::PROFILE_CONFLICT,
        ] {
            assert!(reason.chars().next().is_some_and(|c| c.is_ascii_uppercase()));
            assert!(!reason.contains(' '));
        }
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        let publisher = NoopEventPublisher;
        publisher
            .publish(
                &ObjectReference::default(),
                EventType::Normal,
                reasons::WORKLOAD_CREATED,
                actions::CREATE,
                Some("test".to_string()),
            )
            .await;
    }
}

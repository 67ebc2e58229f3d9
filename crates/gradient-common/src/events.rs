//! Kubernetes Event recording for the gradient controller.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so the scheduler and the advancement engine can emit standard Kubernetes
//! Events visible via `kubectl describe canary`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate. A failed event must never break a tick.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

use crate::crd::Canary;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
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
    client: Client,
    reporter: Reporter,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self { client, reporter }
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
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), resource_ref.clone());
        if let Err(e) = recorder.publish(event).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
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
        // intentionally empty
    }
}

/// Build an ObjectReference pointing at a Canary resource
pub fn canary_ref(canary: &Canary) -> ObjectReference {
    ObjectReference {
        api_version: Some("gradient.dev/v1alpha1".to_string()),
        kind: Some("Canary".to_string()),
        name: canary.metadata.name.clone(),
        namespace: canary.metadata.namespace.clone(),
        uid: canary.metadata.uid.clone(),
        ..Default::default()
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// Primary workload bootstrapped, canary initialized
    pub const INITIALIZATION_DONE: &str = "InitializationDone";
    /// A new target revision was detected
    pub const NEW_REVISION: &str = "NewRevisionDetected";
    /// First analysis tick, traffic about to shift
    pub const ANALYSIS_STARTED: &str = "AnalysisStarted";
    /// Traffic weight or iteration advanced
    pub const ADVANCE: &str = "Advance";
    /// Advancement halted by a failed check
    pub const HALT_ADVANCEMENT: &str = "HaltAdvancement";
    /// Metrics backend query failed
    pub const METRIC_QUERY_FAILED: &str = "MetricQueryFailed";
    /// Canary template copied onto the primary
    pub const PROMOTING: &str = "Promoting";
    /// Promotion finished, canary scaled down
    pub const PROMOTION_COMPLETED: &str = "PromotionCompleted";
    /// Rollback triggered by threshold or stalled rollout
    pub const ROLLING_BACK: &str = "RollingBack";
    /// Canary marked failed and scaled down
    pub const CANARY_FAILED: &str = "CanaryFailed";
    /// A collaborator call failed during the tick
    pub const SYNC_FAILED: &str = "SyncFailed";
    /// Two canaries declare the same target workload
    pub const TARGET_CONFLICT: &str = "TargetConflict";
}

/// Well-known event action strings.
pub mod actions {
    /// Scheduler reconciliation of the job set
    pub const SCHEDULE: &str = "Schedule";
    /// Advancement tick
    pub const ADVANCE: &str = "Advance";
    /// Metric and webhook analysis
    pub const ANALYZE: &str = "Analyze";
    /// Copying the canary template onto the primary
    pub const PROMOTE: &str = "Promote";
    /// Routing all traffic back to the primary
    pub const ROLLBACK: &str = "Rollback";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CanaryService, CanarySpec, TargetRef};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn canary_ref_points_at_the_resource() {
        let mut canary = Canary::new(
            "podinfo",
            CanarySpec {
                target_ref: TargetRef {
                    api_version: None,
                    kind: None,
                    name: "podinfo".to_string(),
                },
                autoscaler_ref: None,
                service: CanaryService { port: 9898 },
                progress_deadline_seconds: None,
                analysis: Default::default(),
                skip_analysis: false,
            },
        );
        canary.metadata = ObjectMeta {
            name: Some("podinfo".to_string()),
            namespace: Some("test".to_string()),
            ..Default::default()
        };

        let obj_ref = canary_ref(&canary);
        assert_eq!(obj_ref.kind.as_deref(), Some("Canary"));
        assert_eq!(obj_ref.name.as_deref(), Some("podinfo"));
        assert_eq!(obj_ref.namespace.as_deref(), Some("test"));
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        let publisher = NoopEventPublisher;
        let obj_ref = ObjectReference::default();
        publisher
            .publish(
                &obj_ref,
                EventType::Normal,
                reasons::PROMOTION_COMPLETED,
                actions::ADVANCE,
                Some("test".to_string()),
            )
            .await;
    }
}

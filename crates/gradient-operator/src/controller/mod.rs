//! Canary advancement engine
//!
//! One invocation drives one canary through a single tick of its state
//! machine. The engine holds no cross-tick memory: the persisted canary
//! status and the weights read from the mesh are re-evaluated on every
//! tick, so any partially-completed tick is safe to retry.

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use tracing::{error, info};

use gradient_common::crd::{Canary, CanaryPhase, CanaryStatus};
use gradient_common::events::{actions, canary_ref, reasons, EventPublisher};
use gradient_common::metrics;

use crate::analysis::{Analyser, AnalysisOutcome};
use crate::deploy::Deployer;
use crate::notify::Notifier;
use crate::observe::MetricsObserver;
use crate::registry::CanaryRegistry;
use crate::router::{KubernetesRouter, MeshRouter};
use crate::scheduler::Advancer;
use crate::webhook::WebhookRunner;

/// External collaborators the engine drives
pub struct Collaborators {
    /// Workload operations and status persistence
    pub deployer: Arc<dyn Deployer>,
    /// Weighted route read/write against the mesh
    pub mesh_router: Arc<dyn MeshRouter>,
    /// ClusterIP service provisioning
    pub kubernetes_router: Arc<dyn KubernetesRouter>,
    /// Metric queries backing the analysis
    pub observer: Arc<dyn MetricsObserver>,
    /// External HTTP checks
    pub webhooks: Arc<dyn WebhookRunner>,
    /// Kubernetes event sink
    pub events: Arc<dyn EventPublisher>,
    /// Chat notifications
    pub notifier: Arc<dyn Notifier>,
}

/// Drives canaries through their advancement state machine
pub struct CanaryController {
    registry: CanaryRegistry,
    deployer: Arc<dyn Deployer>,
    mesh_router: Arc<dyn MeshRouter>,
    kubernetes_router: Arc<dyn KubernetesRouter>,
    analyser: Analyser,
    events: Arc<dyn EventPublisher>,
    notifier: Arc<dyn Notifier>,
}

impl CanaryController {
    /// Create a controller over the given registry and collaborators
    pub fn new(registry: CanaryRegistry, collaborators: Collaborators) -> Self {
        let analyser = Analyser::new(
            collaborators.observer,
            collaborators.webhooks,
            collaborators.events.clone(),
        );
        Self {
            registry,
            deployer: collaborators.deployer,
            mesh_router: collaborators.mesh_router,
            kubernetes_router: collaborators.kubernetes_router,
            analyser,
            events: collaborators.events,
            notifier: collaborators.notifier,
        }
    }

    /// Run one advancement tick for the given canary.
    ///
    /// Collaborator failures record a warning event and return; the next
    /// tick retries from the persisted status and mesh state.
    pub async fn advance_canary(&self, name: &str, namespace: &str, skip_liveness_checks: bool) {
        let Some(canary) = self.registry.get(name, namespace) else {
            info!(canary = %format!("{name}.{namespace}"), "canary not found in registry");
            return;
        };
        let canary = canary.as_ref();

        if let Err(e) = canary.spec.validate() {
            self.warn(canary, reasons::SYNC_FAILED, actions::ADVANCE, e.to_string())
                .await;
            return;
        }

        // Bootstrap the primary workload, autoscaler, services, and routes
        if let Err(e) = self.deployer.sync(canary).await {
            self.warn(canary, reasons::SYNC_FAILED, actions::ADVANCE, e.to_string())
                .await;
            return;
        }
        if let Err(e) = self.kubernetes_router.sync(canary).await {
            self.warn(canary, reasons::SYNC_FAILED, actions::ADVANCE, e.to_string())
                .await;
            return;
        }
        if let Err(e) = self.mesh_router.sync(canary).await {
            self.warn(canary, reasons::SYNC_FAILED, actions::ADVANCE, e.to_string())
                .await;
            return;
        }

        let should_advance = match self.deployer.should_advance(canary).await {
            Ok(should_advance) => should_advance,
            Err(e) => {
                self.warn(canary, reasons::SYNC_FAILED, actions::ADVANCE, e.to_string())
                    .await;
                return;
            }
        };
        if !should_advance {
            return;
        }

        let max_weight = canary.max_weight();

        if !skip_liveness_checks {
            if let Err(e) = self.deployer.is_primary_ready(canary).await {
                self.warn(canary, reasons::SYNC_FAILED, actions::ADVANCE, e.to_string())
                    .await;
                return;
            }
        }

        // The mesh is the source of truth for the current split
        let (primary_weight, canary_weight) = match self.mesh_router.get_routes(canary).await {
            Ok(weights) => weights,
            Err(e) => {
                self.warn(canary, reasons::SYNC_FAILED, actions::ADVANCE, e.to_string())
                    .await;
                return;
            }
        };
        metrics::set_weight(name, namespace, primary_weight, canary_weight);

        if !self.check_canary_status(canary, should_advance).await {
            return;
        }

        if self.has_revision_changed(canary).await {
            self.record_info(
                canary,
                reasons::NEW_REVISION,
                actions::ADVANCE,
                format!(
                    "New revision detected! Restarting analysis for {}",
                    canary.target_id()
                ),
            )
            .await;

            if let Err(e) = self.mesh_router.set_routes(canary, 100, 0).await {
                self.warn(canary, reasons::SYNC_FAILED, actions::ADVANCE, e.to_string())
                    .await;
                return;
            }

            let reset = CanaryStatus::with_phase(CanaryPhase::Progressing)
                .canary_weight(0)
                .failed_checks(0)
                .iterations(0);
            if let Err(e) = self.deployer.sync_status(canary, reset).await {
                self.warn(canary, reasons::SYNC_FAILED, actions::ADVANCE, e.to_string())
                    .await;
            }
            return;
        }

        // Everything past the revision gate counts towards the tick duration
        let _timer = metrics::TickTimer::start(name, namespace);

        let mut retriable = true;
        let mut rollout_failure = None;
        if !skip_liveness_checks {
            if let Err(e) = self.deployer.is_canary_ready(canary).await {
                if e.is_retryable() {
                    self.warn(canary, reasons::SYNC_FAILED, actions::ADVANCE, e.to_string())
                        .await;
                    return;
                }
                // Unrecoverable rollout: fall through so rollback can run
                retriable = false;
                rollout_failure = Some(e.to_string());
            }
        }

        if self.skip_analysis(canary).await {
            return;
        }

        let threshold = canary.spec.analysis.threshold;
        if canary.phase() == Some(CanaryPhase::Progressing)
            && (!retriable || canary.failed_checks() >= threshold)
        {
            self.rollback(canary, retriable, rollout_failure, threshold)
                .await;
            return;
        }

        if canary_weight == 0 {
            self.record_info(
                canary,
                reasons::ANALYSIS_STARTED,
                actions::ANALYZE,
                format!("Starting canary analysis for {}", canary.target_id()),
            )
            .await;
        } else {
            match self.analyser.run_checks(canary).await {
                AnalysisOutcome::Pass => {}
                AnalysisOutcome::Fail => {
                    if let Err(e) = self
                        .deployer
                        .set_status_failed_checks(canary, canary.failed_checks() + 1)
                        .await
                    {
                        self.warn(canary, reasons::SYNC_FAILED, actions::ANALYZE, e.to_string())
                            .await;
                    }
                    return;
                }
                // Absent traffic halts the tick but is not a failed check;
                // the threshold budget stays untouched.
                AnalysisOutcome::NoTraffic => return,
            }
        }

        if canary.spec.analysis.is_ab_testing() {
            self.advance_ab(canary).await;
        } else {
            self.advance_weighted(canary, primary_weight, canary_weight, max_weight)
                .await;
        }
    }

    /// Decide whether this tick proceeds into analysis.
    ///
    /// Progressing canaries proceed. An unset phase is initialized (and the
    /// tick ends). Any other phase with a detected revision starts a new
    /// progressing run: the canary scales up and the tick ends; analysis
    /// resumes next tick.
    async fn check_canary_status(&self, canary: &Canary, should_advance: bool) -> bool {
        let name = canary.metadata.name.clone().unwrap_or_default();
        let namespace = canary.metadata.namespace.clone().unwrap_or_default();
        metrics::set_status(&name, &namespace, canary.phase());

        if canary.phase() == Some(CanaryPhase::Progressing) {
            return true;
        }

        if canary.phase().is_none() {
            let status = CanaryStatus::with_phase(CanaryPhase::Initialized);
            if let Err(e) = self.deployer.sync_status(canary, status).await {
                error!(canary = %canary.canary_id(), error = %e, "failed to initialize canary status");
                return false;
            }
            metrics::set_status(&name, &namespace, Some(CanaryPhase::Initialized));
            self.record_info(
                canary,
                reasons::INITIALIZATION_DONE,
                actions::ADVANCE,
                format!("Initialization done! {}", canary.canary_id()),
            )
            .await;
            self.notifier
                .post(
                    &name,
                    &namespace,
                    "New deployment detected, initialization completed.",
                    true,
                    false,
                )
                .await;
            return false;
        }

        if should_advance {
            self.record_info(
                canary,
                reasons::NEW_REVISION,
                actions::ADVANCE,
                format!("New revision detected! Scaling up {}", canary.target_id()),
            )
            .await;
            self.notifier
                .post(
                    &name,
                    &namespace,
                    "New revision detected, starting canary analysis.",
                    true,
                    false,
                )
                .await;

            if let Err(e) = self.deployer.scale(canary, 1).await {
                self.warn(canary, reasons::SYNC_FAILED, actions::ADVANCE, e.to_string())
                    .await;
                return false;
            }
            let status = CanaryStatus::with_phase(CanaryPhase::Progressing);
            if let Err(e) = self.deployer.sync_status(canary, status).await {
                error!(canary = %canary.canary_id(), error = %e, "failed to persist progressing status");
                return false;
            }
            metrics::set_status(&name, &namespace, Some(CanaryPhase::Progressing));
            return false;
        }

        false
    }

    /// True when the target revision or its config changed mid-analysis.
    /// Diff errors read as "no change"; the next tick re-checks.
    async fn has_revision_changed(&self, canary: &Canary) -> bool {
        if canary.phase() != Some(CanaryPhase::Progressing) {
            return false;
        }
        if self.deployer.is_new_spec(canary).await.unwrap_or(false) {
            return true;
        }
        self.deployer
            .has_config_changed(canary)
            .await
            .unwrap_or(false)
    }

    /// Fast path for `skipAnalysis`: promote and finish in a single tick
    async fn skip_analysis(&self, canary: &Canary) -> bool {
        if !canary.spec.skip_analysis {
            return false;
        }

        let name = canary.metadata.name.clone().unwrap_or_default();
        let namespace = canary.metadata.namespace.clone().unwrap_or_default();

        if let Err(e) = self.mesh_router.set_routes(canary, 100, 0).await {
            self.warn(canary, reasons::SYNC_FAILED, actions::PROMOTE, e.to_string())
                .await;
            return false;
        }
        metrics::set_weight(&name, &namespace, 100, 0);

        self.record_info(
            canary,
            reasons::PROMOTING,
            actions::PROMOTE,
            format!(
                "Copying {} template spec to {}.{namespace}",
                canary.target_id(),
                canary.primary_name()
            ),
        )
        .await;
        if let Err(e) = self.deployer.promote(canary).await {
            self.warn(canary, reasons::SYNC_FAILED, actions::PROMOTE, e.to_string())
                .await;
            return false;
        }

        if let Err(e) = self.deployer.scale(canary, 0).await {
            self.warn(canary, reasons::SYNC_FAILED, actions::PROMOTE, e.to_string())
                .await;
            return false;
        }

        if let Err(e) = self
            .deployer
            .set_status_phase(canary, CanaryPhase::Succeeded)
            .await
        {
            self.warn(canary, reasons::SYNC_FAILED, actions::PROMOTE, e.to_string())
                .await;
            return false;
        }
        metrics::set_status(&name, &namespace, Some(CanaryPhase::Succeeded));

        self.record_info(
            canary,
            reasons::PROMOTION_COMPLETED,
            actions::PROMOTE,
            format!(
                "Promotion completed! Canary analysis was skipped for {}",
                canary.target_id()
            ),
        )
        .await;
        self.notifier
            .post(
                &name,
                &namespace,
                "Canary analysis was skipped, promotion finished.",
                false,
                false,
            )
            .await;

        true
    }

    /// Route everything back to the primary, scale the canary down, and mark
    /// the run failed
    async fn rollback(
        &self,
        canary: &Canary,
        retriable: bool,
        rollout_failure: Option<String>,
        threshold: u32,
    ) {
        let name = canary.metadata.name.clone().unwrap_or_default();
        let namespace = canary.metadata.namespace.clone().unwrap_or_default();
        let canary_id = canary.canary_id();

        if canary.failed_checks() >= threshold {
            self.warn(
                canary,
                reasons::ROLLING_BACK,
                actions::ROLLBACK,
                format!(
                    "Rolling back {canary_id} failed checks threshold reached {}",
                    canary.failed_checks()
                ),
            )
            .await;
            self.notifier
                .post(
                    &name,
                    &namespace,
                    &format!("Failed checks threshold reached {}", canary.failed_checks()),
                    false,
                    true,
                )
                .await;
        }

        if !retriable {
            let detail = rollout_failure.unwrap_or_default();
            self.warn(
                canary,
                reasons::ROLLING_BACK,
                actions::ROLLBACK,
                format!("Rolling back {canary_id} progress deadline exceeded: {detail}"),
            )
            .await;
            self.notifier
                .post(
                    &name,
                    &namespace,
                    &format!("Progress deadline exceeded: {detail}"),
                    false,
                    true,
                )
                .await;
        }

        if let Err(e) = self.mesh_router.set_routes(canary, 100, 0).await {
            self.warn(canary, reasons::SYNC_FAILED, actions::ROLLBACK, e.to_string())
                .await;
            return;
        }
        metrics::set_weight(&name, &namespace, 100, 0);

        self.warn(
            canary,
            reasons::CANARY_FAILED,
            actions::ROLLBACK,
            format!("Canary failed! Scaling down {canary_id}"),
        )
        .await;

        if let Err(e) = self.deployer.scale(canary, 0).await {
            self.warn(canary, reasons::SYNC_FAILED, actions::ROLLBACK, e.to_string())
                .await;
            return;
        }

        let status = CanaryStatus::with_phase(CanaryPhase::Failed).canary_weight(0);
        if let Err(e) = self.deployer.sync_status(canary, status).await {
            error!(canary = %canary_id, error = %e, "failed to persist failed status");
            return;
        }
        metrics::set_status(&name, &namespace, Some(CanaryPhase::Failed));
    }

    /// A/B mode: run the configured number of full-traffic iterations, then
    /// promote and shut down.
    ///
    /// The iteration counter is also incremented on the promoting tick, so
    /// the shutdown branch becomes reachable on the tick after it.
    async fn advance_ab(&self, canary: &Canary) {
        let name = canary.metadata.name.clone().unwrap_or_default();
        let namespace = canary.metadata.namespace.clone().unwrap_or_default();
        let canary_id = canary.canary_id();
        let spec_iterations = canary.spec.analysis.iterations;
        let iterations = canary.iterations();

        if spec_iterations > iterations {
            if let Err(e) = self.mesh_router.set_routes(canary, 0, 100).await {
                self.warn(canary, reasons::SYNC_FAILED, actions::ADVANCE, e.to_string())
                    .await;
                return;
            }
            metrics::set_weight(&name, &namespace, 0, 100);

            if let Err(e) = self
                .deployer
                .set_status_iterations(canary, iterations + 1)
                .await
            {
                self.warn(canary, reasons::SYNC_FAILED, actions::ADVANCE, e.to_string())
                    .await;
                return;
            }
            self.record_info(
                canary,
                reasons::ADVANCE,
                actions::ADVANCE,
                format!(
                    "Advance {canary_id} canary iteration {}/{spec_iterations}",
                    iterations + 1
                ),
            )
            .await;
            return;
        }

        if spec_iterations == iterations {
            self.record_info(
                canary,
                reasons::PROMOTING,
                actions::PROMOTE,
                format!(
                    "Copying {} template spec to {}.{namespace}",
                    canary.target_id(),
                    canary.primary_name()
                ),
            )
            .await;
            if let Err(e) = self.deployer.promote(canary).await {
                self.warn(canary, reasons::SYNC_FAILED, actions::PROMOTE, e.to_string())
                    .await;
                return;
            }
            if let Err(e) = self
                .deployer
                .set_status_iterations(canary, iterations + 1)
                .await
            {
                self.warn(canary, reasons::SYNC_FAILED, actions::PROMOTE, e.to_string())
                    .await;
            }
            return;
        }

        // iterations ran past the spec: promotion done, shut the canary down
        if let Err(e) = self.mesh_router.set_routes(canary, 100, 0).await {
            self.warn(canary, reasons::SYNC_FAILED, actions::PROMOTE, e.to_string())
                .await;
            return;
        }
        metrics::set_weight(&name, &namespace, 100, 0);

        self.record_info(
            canary,
            reasons::PROMOTION_COMPLETED,
            actions::PROMOTE,
            format!("Promotion completed! Scaling down {}", canary.target_id()),
        )
        .await;

        if let Err(e) = self.deployer.scale(canary, 0).await {
            self.warn(canary, reasons::SYNC_FAILED, actions::PROMOTE, e.to_string())
                .await;
            return;
        }
        if let Err(e) = self
            .deployer
            .set_status_phase(canary, CanaryPhase::Succeeded)
            .await
        {
            self.warn(canary, reasons::SYNC_FAILED, actions::PROMOTE, e.to_string())
                .await;
            return;
        }
        metrics::set_status(&name, &namespace, Some(CanaryPhase::Succeeded));
        self.notifier
            .post(
                &name,
                &namespace,
                "Canary analysis completed successfully, promotion finished.",
                false,
                false,
            )
            .await;
    }

    /// Weighted mode: step the canary share towards `max_weight`, promote on
    /// the step that reaches it, and shut down on the following tick.
    async fn advance_weighted(
        &self,
        canary: &Canary,
        primary_weight: i32,
        canary_weight: i32,
        max_weight: i32,
    ) {
        let name = canary.metadata.name.clone().unwrap_or_default();
        let namespace = canary.metadata.namespace.clone().unwrap_or_default();
        let canary_id = canary.canary_id();

        if canary_weight < max_weight {
            let (new_primary, new_canary) =
                step_weights(primary_weight, canary_weight, canary.spec.analysis.step_weight);

            if let Err(e) = self
                .mesh_router
                .set_routes(canary, new_primary, new_canary)
                .await
            {
                self.warn(canary, reasons::SYNC_FAILED, actions::ADVANCE, e.to_string())
                    .await;
                return;
            }
            if let Err(e) = self.deployer.set_status_weight(canary, new_canary).await {
                self.warn(canary, reasons::SYNC_FAILED, actions::ADVANCE, e.to_string())
                    .await;
                return;
            }
            metrics::set_weight(&name, &namespace, new_primary, new_canary);
            self.record_info(
                canary,
                reasons::ADVANCE,
                actions::ADVANCE,
                format!("Advance {canary_id} canary weight {new_canary}"),
            )
            .await;

            // Promotion happens on the tick that reaches max weight; traffic
            // returns to the primary on the next one.
            if new_canary == max_weight {
                self.record_info(
                    canary,
                    reasons::PROMOTING,
                    actions::PROMOTE,
                    format!(
                        "Copying {} template spec to {}.{namespace}",
                        canary.target_id(),
                        canary.primary_name()
                    ),
                )
                .await;
                if let Err(e) = self.deployer.promote(canary).await {
                    self.warn(canary, reasons::SYNC_FAILED, actions::PROMOTE, e.to_string())
                        .await;
                }
            }
            return;
        }

        if let Err(e) = self.mesh_router.set_routes(canary, 100, 0).await {
            self.warn(canary, reasons::SYNC_FAILED, actions::PROMOTE, e.to_string())
                .await;
            return;
        }
        metrics::set_weight(&name, &namespace, 100, 0);

        self.record_info(
            canary,
            reasons::PROMOTION_COMPLETED,
            actions::PROMOTE,
            format!("Promotion completed! Scaling down {}", canary.target_id()),
        )
        .await;

        if let Err(e) = self.deployer.scale(canary, 0).await {
            self.warn(canary, reasons::SYNC_FAILED, actions::PROMOTE, e.to_string())
                .await;
            return;
        }
        if let Err(e) = self
            .deployer
            .set_status_phase(canary, CanaryPhase::Succeeded)
            .await
        {
            self.warn(canary, reasons::SYNC_FAILED, actions::PROMOTE, e.to_string())
                .await;
            return;
        }
        metrics::set_status(&name, &namespace, Some(CanaryPhase::Succeeded));
        self.notifier
            .post(
                &name,
                &namespace,
                "Canary analysis completed successfully, promotion finished.",
                false,
                false,
            )
            .await;
    }

    async fn warn(&self, canary: &Canary, reason: &str, action: &str, note: String) {
        self.events
            .publish(
                &canary_ref(canary),
                EventType::Warning,
                reason,
                action,
                Some(note),
            )
            .await;
    }

    async fn record_info(&self, canary: &Canary, reason: &str, action: &str, note: String) {
        self.events
            .publish(
                &canary_ref(canary),
                EventType::Normal,
                reason,
                action,
                Some(note),
            )
            .await;
    }
}

#[async_trait]
impl Advancer for CanaryController {
    async fn advance(&self, name: &str, namespace: &str, skip_liveness_checks: bool) {
        self.advance_canary(name, namespace, skip_liveness_checks)
            .await;
    }
}

/// Compute the next weight pair for one weighted step.
///
/// The primary weight is clamped into [0, 100]; the canary weight is bounded
/// by the loop exiting at `max_weight`.
fn step_weights(primary_weight: i32, canary_weight: i32, step_weight: i32) -> (i32, i32) {
    let new_primary = (primary_weight - step_weight).clamp(0, 100);
    (new_primary, canary_weight + step_weight)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::MockDeployer;
    use crate::notify::MockNotifier;
    use crate::observe::MockMetricsObserver;
    use crate::router::{MockKubernetesRouter, MockMeshRouter};
    use crate::webhook::MockWebhookRunner;
    use gradient_common::crd::{
        CanaryAnalysis, CanaryService, CanarySpec, MetricCheck, RequestMatch, StringMatch,
        TargetRef,
    };
    use gradient_common::events::NoopEventPublisher;
    use gradient_common::Error;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn weighted_canary() -> Canary {
        let mut canary = Canary::new(
            "podinfo",
            CanarySpec {
                target_ref: TargetRef {
                    api_version: Some("apps/v1".to_string()),
                    kind: Some("Deployment".to_string()),
                    name: "podinfo".to_string(),
                },
                autoscaler_ref: None,
                service: CanaryService { port: 9898 },
                progress_deadline_seconds: None,
                analysis: CanaryAnalysis {
                    interval: Some("10s".to_string()),
                    threshold: 2,
                    max_weight: Some(60),
                    step_weight: 20,
                    metrics: vec![MetricCheck {
                        name: crate::analysis::ISTIO_REQUEST_METRIC.to_string(),
                        interval: None,
                        threshold: 99.0,
                        query: None,
                    }],
                    ..Default::default()
                },
                skip_analysis: false,
            },
        );
        canary.metadata = ObjectMeta {
            name: Some("podinfo".to_string()),
            namespace: Some("test".to_string()),
            ..Default::default()
        };
        canary
    }

    fn ab_canary(spec_iterations: u32) -> Canary {
        let mut canary = weighted_canary();
        let mut headers = BTreeMap::new();
        headers.insert(
            "x-canary".to_string(),
            StringMatch {
                exact: Some("insider".to_string()),
                ..Default::default()
            },
        );
        canary.spec.analysis.match_ = vec![RequestMatch { headers }];
        canary.spec.analysis.iterations = spec_iterations;
        canary.spec.analysis.metrics.clear();
        canary
    }

    fn with_status(
        mut canary: Canary,
        phase: Option<CanaryPhase>,
        weight: i32,
        failed_checks: u32,
        iterations: u32,
    ) -> Canary {
        canary.status = Some(CanaryStatus {
            phase,
            canary_weight: weight,
            failed_checks,
            iterations,
            last_applied_spec: Some("abc123".to_string()),
            ..Default::default()
        });
        canary
    }

    struct Harness {
        registry: CanaryRegistry,
        deployer: MockDeployer,
        mesh: MockMeshRouter,
        kubernetes: MockKubernetesRouter,
        observer: MockMetricsObserver,
        webhooks: MockWebhookRunner,
        notifier: MockNotifier,
    }

    impl Harness {
        fn new(canary: Canary) -> Self {
            let registry = CanaryRegistry::new();
            registry.insert(canary);
            Self {
                registry,
                deployer: MockDeployer::new(),
                mesh: MockMeshRouter::new(),
                kubernetes: MockKubernetesRouter::new(),
                observer: MockMetricsObserver::new(),
                webhooks: MockWebhookRunner::new(),
                notifier: MockNotifier::new(),
            }
        }

        fn empty() -> Self {
            Self {
                registry: CanaryRegistry::new(),
                deployer: MockDeployer::new(),
                mesh: MockMeshRouter::new(),
                kubernetes: MockKubernetesRouter::new(),
                observer: MockMetricsObserver::new(),
                webhooks: MockWebhookRunner::new(),
                notifier: MockNotifier::new(),
            }
        }

        /// Let the tick pass phases A-C with the given mesh weights
        fn pass_gates(&mut self, routes: (i32, i32)) {
            self.deployer.expect_sync().returning(|_| Ok(()));
            self.kubernetes.expect_sync().returning(|_| Ok(()));
            self.mesh.expect_sync().returning(|_| Ok(()));
            self.deployer
                .expect_should_advance()
                .returning(|_| Ok(true));
            self.deployer
                .expect_is_primary_ready()
                .returning(|_| Ok(()));
            self.mesh
                .expect_get_routes()
                .returning(move |_| Ok(routes));
        }

        fn steady_revision(&mut self) {
            self.deployer.expect_is_new_spec().returning(|_| Ok(false));
            self.deployer
                .expect_has_config_changed()
                .returning(|_| Ok(false));
        }

        fn canary_ready(&mut self) {
            self.deployer.expect_is_canary_ready().returning(|_| Ok(()));
        }

        fn controller(self) -> CanaryController {
            let Harness {
                registry,
                deployer,
                mesh,
                kubernetes,
                observer,
                webhooks,
                notifier,
            } = self;
            CanaryController::new(
                registry,
                Collaborators {
                    deployer: Arc::new(deployer),
                    mesh_router: Arc::new(mesh),
                    kubernetes_router: Arc::new(kubernetes),
                    observer: Arc::new(observer),
                    webhooks: Arc::new(webhooks),
                    events: Arc::new(NoopEventPublisher),
                    notifier: Arc::new(notifier),
                },
            )
        }
    }

    async fn advance(harness: Harness) {
        harness
            .controller()
            .advance_canary("podinfo", "test", false)
            .await;
    }

    #[tokio::test]
    async fn missing_canary_is_a_noop() {
        advance(Harness::empty()).await;
    }

    #[tokio::test]
    async fn deployer_sync_failure_halts_the_tick() {
        // No expectations beyond sync: reaching the routers would panic
        let mut harness = Harness::new(weighted_canary());
        harness
            .deployer
            .expect_sync()
            .returning(|c| Err(Error::deployment(c.canary_id(), "deployment not found")));
        advance(harness).await;
    }

    #[tokio::test]
    async fn unset_phase_is_initialized_and_the_tick_ends() {
        let mut canary = weighted_canary();
        canary.status = None;
        let mut harness = Harness::new(canary);
        harness.pass_gates((100, 0));

        harness
            .deployer
            .expect_sync_status()
            .withf(|_, status| status.phase == Some(CanaryPhase::Initialized))
            .times(1)
            .returning(|_, _| Ok(()));
        harness
            .notifier
            .expect_post()
            .withf(|_, _, _, is_init, is_warning| *is_init && !is_warning)
            .times(1)
            .returning(|_, _, _, _, _| ());

        advance(harness).await;
    }

    #[tokio::test]
    async fn new_revision_scales_up_and_enters_progressing() {
        let canary = with_status(weighted_canary(), Some(CanaryPhase::Succeeded), 0, 0, 0);
        let mut harness = Harness::new(canary);
        harness.pass_gates((100, 0));

        harness
            .deployer
            .expect_scale()
            .withf(|_, replicas| *replicas == 1)
            .times(1)
            .returning(|_, _| Ok(()));
        harness
            .deployer
            .expect_sync_status()
            .withf(|_, status| status.phase == Some(CanaryPhase::Progressing))
            .times(1)
            .returning(|_, _| Ok(()));
        harness
            .notifier
            .expect_post()
            .times(1)
            .returning(|_, _, _, _, _| ());

        advance(harness).await;
    }

    #[tokio::test]
    async fn first_progressing_tick_skips_analysis_and_steps_weight() {
        let canary = with_status(weighted_canary(), Some(CanaryPhase::Progressing), 0, 0, 0);
        let mut harness = Harness::new(canary);
        harness.pass_gates((100, 0));
        harness.steady_revision();
        harness.canary_ready();

        // Observer carries no expectations: running analysis would panic
        harness
            .mesh
            .expect_set_routes()
            .withf(|_, primary, canary| *primary == 80 && *canary == 20)
            .times(1)
            .returning(|_, _, _| Ok(()));
        harness
            .deployer
            .expect_set_status_weight()
            .withf(|_, weight| *weight == 20)
            .times(1)
            .returning(|_, _| Ok(()));

        advance(harness).await;
    }

    #[tokio::test]
    async fn passing_analysis_advances_the_weight() {
        let canary = with_status(weighted_canary(), Some(CanaryPhase::Progressing), 20, 0, 0);
        let mut harness = Harness::new(canary);
        harness.pass_gates((80, 20));
        harness.steady_revision();
        harness.canary_ready();

        harness
            .observer
            .expect_istio_success_rate()
            .returning(|_, _, _, _| Ok(99.9));
        harness
            .mesh
            .expect_set_routes()
            .withf(|_, primary, canary| *primary == 60 && *canary == 40)
            .times(1)
            .returning(|_, _, _| Ok(()));
        harness
            .deployer
            .expect_set_status_weight()
            .withf(|_, weight| *weight == 40)
            .times(1)
            .returning(|_, _| Ok(()));

        advance(harness).await;
    }

    #[tokio::test]
    async fn failing_analysis_increments_failed_checks() {
        let canary = with_status(weighted_canary(), Some(CanaryPhase::Progressing), 20, 0, 0);
        let mut harness = Harness::new(canary);
        harness.pass_gates((80, 20));
        harness.steady_revision();
        harness.canary_ready();

        harness
            .observer
            .expect_istio_success_rate()
            .returning(|_, _, _, _| Ok(42.0));
        harness
            .deployer
            .expect_set_status_failed_checks()
            .withf(|_, count| *count == 1)
            .times(1)
            .returning(|_, _| Ok(()));

        advance(harness).await;
    }

    #[tokio::test]
    async fn missing_traffic_halts_without_consuming_the_threshold() {
        let canary = with_status(weighted_canary(), Some(CanaryPhase::Progressing), 20, 1, 0);
        let mut harness = Harness::new(canary);
        harness.pass_gates((80, 20));
        harness.steady_revision();
        harness.canary_ready();

        harness
            .observer
            .expect_istio_success_rate()
            .returning(|_, _, metric, _| Err(Error::no_metric_values(metric)));

        // The tick ends here: no failed-checks write, no routing change
        advance(harness).await;
    }

    #[tokio::test]
    async fn reaching_max_weight_promotes_without_scaling_down() {
        let canary = with_status(weighted_canary(), Some(CanaryPhase::Progressing), 40, 0, 0);
        let mut harness = Harness::new(canary);
        harness.pass_gates((60, 40));
        harness.steady_revision();
        harness.canary_ready();

        harness
            .observer
            .expect_istio_success_rate()
            .returning(|_, _, _, _| Ok(99.9));
        harness
            .mesh
            .expect_set_routes()
            .withf(|_, primary, canary| *primary == 40 && *canary == 60)
            .times(1)
            .returning(|_, _, _| Ok(()));
        harness
            .deployer
            .expect_set_status_weight()
            .withf(|_, weight| *weight == 60)
            .times(1)
            .returning(|_, _| Ok(()));
        harness
            .deployer
            .expect_promote()
            .times(1)
            .returning(|_| Ok(()));

        advance(harness).await;
    }

    #[tokio::test]
    async fn tick_after_max_weight_finishes_the_promotion() {
        let canary = with_status(weighted_canary(), Some(CanaryPhase::Progressing), 60, 0, 0);
        let mut harness = Harness::new(canary);
        harness.pass_gates((40, 60));
        harness.steady_revision();
        harness.canary_ready();

        harness
            .observer
            .expect_istio_success_rate()
            .returning(|_, _, _, _| Ok(99.9));
        harness
            .mesh
            .expect_set_routes()
            .withf(|_, primary, canary| *primary == 100 && *canary == 0)
            .times(1)
            .returning(|_, _, _| Ok(()));
        harness
            .deployer
            .expect_scale()
            .withf(|_, replicas| *replicas == 0)
            .times(1)
            .returning(|_, _| Ok(()));
        harness
            .deployer
            .expect_set_status_phase()
            .withf(|_, phase| *phase == CanaryPhase::Succeeded)
            .times(1)
            .returning(|_, _| Ok(()));
        harness
            .notifier
            .expect_post()
            .withf(|_, _, _, is_init, is_warning| !is_init && !is_warning)
            .times(1)
            .returning(|_, _, _, _, _| ());

        advance(harness).await;
    }

    #[tokio::test]
    async fn failed_checks_threshold_triggers_rollback() {
        let canary = with_status(weighted_canary(), Some(CanaryPhase::Progressing), 40, 2, 0);
        let mut harness = Harness::new(canary);
        harness.pass_gates((60, 40));
        harness.steady_revision();
        harness.canary_ready();

        // Observer has no expectations: analysis must not run during rollback
        harness
            .mesh
            .expect_set_routes()
            .withf(|_, primary, canary| *primary == 100 && *canary == 0)
            .times(1)
            .returning(|_, _, _| Ok(()));
        harness
            .deployer
            .expect_scale()
            .withf(|_, replicas| *replicas == 0)
            .times(1)
            .returning(|_, _| Ok(()));
        harness
            .deployer
            .expect_sync_status()
            .withf(|_, status| {
                status.phase == Some(CanaryPhase::Failed) && status.canary_weight == 0
            })
            .times(1)
            .returning(|_, _| Ok(()));
        harness
            .notifier
            .expect_post()
            .withf(|_, _, _, _, is_warning| *is_warning)
            .times(1)
            .returning(|_, _, _, _, _| ());

        advance(harness).await;
    }

    #[tokio::test]
    async fn exceeded_progress_deadline_triggers_rollback() {
        let canary = with_status(weighted_canary(), Some(CanaryPhase::Progressing), 20, 0, 0);
        let mut harness = Harness::new(canary);
        harness.pass_gates((80, 20));
        harness.steady_revision();

        harness.deployer.expect_is_canary_ready().returning(|c| {
            Err(Error::deployment_permanent(
                c.canary_id(),
                "deployment podinfo exceeded its progress deadline",
            ))
        });

        harness
            .mesh
            .expect_set_routes()
            .withf(|_, primary, canary| *primary == 100 && *canary == 0)
            .times(1)
            .returning(|_, _, _| Ok(()));
        harness
            .deployer
            .expect_scale()
            .withf(|_, replicas| *replicas == 0)
            .times(1)
            .returning(|_, _| Ok(()));
        harness
            .deployer
            .expect_sync_status()
            .withf(|_, status| status.phase == Some(CanaryPhase::Failed))
            .times(1)
            .returning(|_, _| Ok(()));
        harness
            .notifier
            .expect_post()
            .withf(|_, _, message, _, is_warning| {
                *is_warning && message.contains("deadline")
            })
            .times(1)
            .returning(|_, _, _, _, _| ());

        advance(harness).await;
    }

    #[tokio::test]
    async fn retryable_readiness_error_waits_for_the_next_tick() {
        let canary = with_status(weighted_canary(), Some(CanaryPhase::Progressing), 20, 0, 0);
        let mut harness = Harness::new(canary);
        harness.pass_gates((80, 20));
        harness.steady_revision();

        harness.deployer.expect_is_canary_ready().returning(|c| {
            Err(Error::deployment(c.canary_id(), "waiting for rollout"))
        });

        // Nothing else may happen this tick
        advance(harness).await;
    }

    #[tokio::test]
    async fn revision_change_resets_the_run() {
        let canary = with_status(weighted_canary(), Some(CanaryPhase::Progressing), 40, 1, 0);
        let mut harness = Harness::new(canary);
        harness.pass_gates((60, 40));

        harness.deployer.expect_is_new_spec().returning(|_| Ok(true));

        // Readiness and analysis are skipped on the reset tick
        harness
            .mesh
            .expect_set_routes()
            .withf(|_, primary, canary| *primary == 100 && *canary == 0)
            .times(1)
            .returning(|_, _, _| Ok(()));
        harness
            .deployer
            .expect_sync_status()
            .withf(|_, status| {
                status.phase == Some(CanaryPhase::Progressing)
                    && status.canary_weight == 0
                    && status.failed_checks == 0
                    && status.iterations == 0
            })
            .times(1)
            .returning(|_, _| Ok(()));

        advance(harness).await;
    }

    #[tokio::test]
    async fn ab_mode_advances_iterations_under_full_canary_traffic() {
        let canary = with_status(ab_canary(3), Some(CanaryPhase::Progressing), 0, 0, 1);
        let mut harness = Harness::new(canary);
        harness.pass_gates((0, 100));
        harness.steady_revision();
        harness.canary_ready();

        harness
            .mesh
            .expect_set_routes()
            .withf(|_, primary, canary| *primary == 0 && *canary == 100)
            .times(1)
            .returning(|_, _, _| Ok(()));
        harness
            .deployer
            .expect_set_status_iterations()
            .withf(|_, iterations| *iterations == 2)
            .times(1)
            .returning(|_, _| Ok(()));

        advance(harness).await;
    }

    #[tokio::test]
    async fn ab_mode_promotes_when_iterations_complete() {
        let canary = with_status(ab_canary(3), Some(CanaryPhase::Progressing), 0, 0, 3);
        let mut harness = Harness::new(canary);
        harness.pass_gates((0, 100));
        harness.steady_revision();
        harness.canary_ready();

        harness
            .deployer
            .expect_promote()
            .times(1)
            .returning(|_| Ok(()));
        // The extra increment keeps the shutdown branch reachable next tick
        harness
            .deployer
            .expect_set_status_iterations()
            .withf(|_, iterations| *iterations == 4)
            .times(1)
            .returning(|_, _| Ok(()));

        advance(harness).await;
    }

    #[tokio::test]
    async fn ab_mode_shuts_down_after_promotion() {
        let canary = with_status(ab_canary(3), Some(CanaryPhase::Progressing), 0, 0, 4);
        let mut harness = Harness::new(canary);
        harness.pass_gates((0, 100));
        harness.steady_revision();
        harness.canary_ready();

        harness
            .mesh
            .expect_set_routes()
            .withf(|_, primary, canary| *primary == 100 && *canary == 0)
            .times(1)
            .returning(|_, _, _| Ok(()));
        harness
            .deployer
            .expect_scale()
            .withf(|_, replicas| *replicas == 0)
            .times(1)
            .returning(|_, _| Ok(()));
        harness
            .deployer
            .expect_set_status_phase()
            .withf(|_, phase| *phase == CanaryPhase::Succeeded)
            .times(1)
            .returning(|_, _| Ok(()));
        harness
            .notifier
            .expect_post()
            .times(1)
            .returning(|_, _, _, _, _| ());

        advance(harness).await;
    }

    #[tokio::test]
    async fn skip_analysis_promotes_in_a_single_tick() {
        let mut canary = with_status(weighted_canary(), Some(CanaryPhase::Progressing), 40, 0, 0);
        canary.spec.skip_analysis = true;
        let mut harness = Harness::new(canary);
        harness.pass_gates((60, 40));
        harness.steady_revision();
        harness.canary_ready();

        // Observer has no expectations: the analyser must not run
        harness
            .mesh
            .expect_set_routes()
            .withf(|_, primary, canary| *primary == 100 && *canary == 0)
            .times(1)
            .returning(|_, _, _| Ok(()));
        harness
            .deployer
            .expect_promote()
            .times(1)
            .returning(|_| Ok(()));
        harness
            .deployer
            .expect_scale()
            .withf(|_, replicas| *replicas == 0)
            .times(1)
            .returning(|_, _| Ok(()));
        harness
            .deployer
            .expect_set_status_phase()
            .withf(|_, phase| *phase == CanaryPhase::Succeeded)
            .times(1)
            .returning(|_, _| Ok(()));
        harness
            .notifier
            .expect_post()
            .withf(|_, _, _, is_init, is_warning| !is_init && !is_warning)
            .times(1)
            .returning(|_, _, _, _, _| ());

        advance(harness).await;
    }

    #[tokio::test]
    async fn settled_canary_is_a_repeatable_noop() {
        let canary = with_status(weighted_canary(), Some(CanaryPhase::Succeeded), 0, 0, 0);
        let mut harness = Harness::new(canary);

        harness.deployer.expect_sync().times(2).returning(|_| Ok(()));
        harness
            .kubernetes
            .expect_sync()
            .times(2)
            .returning(|_| Ok(()));
        harness.mesh.expect_sync().times(2).returning(|_| Ok(()));
        harness
            .deployer
            .expect_should_advance()
            .times(2)
            .returning(|_| Ok(false));

        let controller = harness.controller();
        controller.advance_canary("podinfo", "test", false).await;
        controller.advance_canary("podinfo", "test", false).await;
    }

    #[test]
    fn step_weights_clamps_the_primary() {
        assert_eq!(step_weights(100, 0, 20), (80, 20));
        assert_eq!(step_weights(60, 40, 20), (40, 60));
        assert_eq!(step_weights(10, 90, 20), (0, 110));
        assert_eq!(step_weights(0, 100, 20), (0, 120));
    }
}

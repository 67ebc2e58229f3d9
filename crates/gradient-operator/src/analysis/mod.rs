//! Canary analysis
//!
//! One analysis run evaluates the configured webhooks and metric checks in
//! order and answers pass/fail for the tick. Webhooks run first; the first
//! failing check halts the run. Metric checks select their query strategy by
//! well-known metric name or explicit query.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::events::EventType;
use tracing::warn;

use gradient_common::crd::Canary;
use gradient_common::events::{actions, canary_ref, reasons, EventPublisher};
use gradient_common::Error;

use crate::observe::MetricsObserver;
use crate::webhook::WebhookRunner;

/// Envoy upstream request counter, checked as a success rate
pub const ENVOY_REQUEST_METRIC: &str = "envoy_cluster_upstream_rq";
/// Istio request counter, checked as a success rate
pub const ISTIO_REQUEST_METRIC: &str = "istio_requests_total";
/// Istio request duration histogram, checked against a latency bound
pub const ISTIO_DURATION_METRIC: &str = "istio_request_duration_seconds_bucket";

/// Result of one analysis run.
///
/// `NoTraffic` halts the tick like `Fail` does, but the failed-checks
/// counter is not incremented: an empty metric result means the target
/// is not receiving traffic, not that it is unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisOutcome {
    /// Every webhook and metric check passed
    Pass,
    /// A check failed; counts towards the rollback threshold
    Fail,
    /// The observer found no samples; halt without penalty
    NoTraffic,
}

/// Evaluates the configured checks for one canary
pub struct Analyser {
    observer: Arc<dyn MetricsObserver>,
    webhooks: Arc<dyn WebhookRunner>,
    events: Arc<dyn EventPublisher>,
}

impl Analyser {
    /// Create an analyser over the given observer and webhook runner
    pub fn new(
        observer: Arc<dyn MetricsObserver>,
        webhooks: Arc<dyn WebhookRunner>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            observer,
            webhooks,
            events,
        }
    }

    /// Run all webhooks and metric checks in order.
    ///
    /// Returns [`AnalysisOutcome::Pass`] only when everything passes; the
    /// first failing check halts the run.
    pub async fn run_checks(&self, canary: &Canary) -> AnalysisOutcome {
        let name = canary.metadata.name.clone().unwrap_or_default();
        let namespace = canary.metadata.namespace.clone().unwrap_or_default();
        let canary_id = canary.canary_id();
        let target = &canary.spec.target_ref.name;

        for webhook in &canary.spec.analysis.webhooks {
            if let Err(e) = self
                .webhooks
                .call(&name, &namespace, canary.phase(), webhook)
                .await
            {
                self.halt(
                    canary,
                    format!(
                        "Halt {canary_id} advancement external check {} failed: {e}",
                        webhook.name
                    ),
                )
                .await;
                return AnalysisOutcome::Fail;
            }
        }

        for metric in &canary.spec.analysis.metrics {
            let interval = metric
                .interval
                .clone()
                .unwrap_or_else(|| canary.metric_interval());

            if metric.name == ENVOY_REQUEST_METRIC {
                match self
                    .observer
                    .envoy_success_rate(target, &namespace, &metric.name, &interval)
                    .await
                {
                    Ok(value) if value < metric.threshold => {
                        self.halt(
                            canary,
                            format!(
                                "Halt {canary_id} advancement success rate {value:.2}% < {}%",
                                metric.threshold
                            ),
                        )
                        .await;
                        return AnalysisOutcome::Fail;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        return self.report_observer_error(canary, &metric.name, e).await;
                    }
                }
            }

            if metric.name == ISTIO_REQUEST_METRIC {
                match self
                    .observer
                    .istio_success_rate(target, &namespace, &metric.name, &interval)
                    .await
                {
                    Ok(value) if value < metric.threshold => {
                        self.halt(
                            canary,
                            format!(
                                "Halt {canary_id} advancement success rate {value:.2}% < {}%",
                                metric.threshold
                            ),
                        )
                        .await;
                        return AnalysisOutcome::Fail;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        return self.report_observer_error(canary, &metric.name, e).await;
                    }
                }
            }

            if metric.name == ISTIO_DURATION_METRIC {
                match self
                    .observer
                    .request_duration(target, &namespace, &metric.name, &interval)
                    .await
                {
                    Ok(value) => {
                        let limit = Duration::from_millis(metric.threshold as u64);
                        if value > limit {
                            self.halt(
                                canary,
                                format!(
                                    "Halt {canary_id} advancement request duration {value:?} > {limit:?}"
                                ),
                            )
                            .await;
                            return AnalysisOutcome::Fail;
                        }
                    }
                    Err(e) => {
                        self.query_failed(canary, e).await;
                        return AnalysisOutcome::Fail;
                    }
                }
            }

            if let Some(query) = &metric.query {
                match self.observer.scalar(query).await {
                    Ok(value) if value > metric.threshold => {
                        self.halt(
                            canary,
                            format!(
                                "Halt {canary_id} advancement {} {value:.2} > {}",
                                metric.name, metric.threshold
                            ),
                        )
                        .await;
                        return AnalysisOutcome::Fail;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        return self.report_observer_error(canary, &metric.name, e).await;
                    }
                }
            }
        }

        AnalysisOutcome::Pass
    }

    /// Turn an observer error into the outcome the caller acts on: empty
    /// results halt without penalty, query failures count as a failed check.
    async fn report_observer_error(
        &self,
        canary: &Canary,
        metric: &str,
        error: Error,
    ) -> AnalysisOutcome {
        if error.is_no_traffic() {
            self.halt(
                canary,
                format!(
                    "Halt advancement no values found for metric {metric} probably {} is not receiving traffic",
                    canary.target_id()
                ),
            )
            .await;
            AnalysisOutcome::NoTraffic
        } else {
            self.query_failed(canary, error).await;
            AnalysisOutcome::Fail
        }
    }

    async fn halt(&self, canary: &Canary, note: String) {
        warn!(canary = %canary.canary_id(), "{note}");
        self.events
            .publish(
                &canary_ref(canary),
                EventType::Warning,
                reasons::HALT_ADVANCEMENT,
                actions::ANALYZE,
                Some(note),
            )
            .await;
    }

    async fn query_failed(&self, canary: &Canary, error: Error) {
        warn!(canary = %canary.canary_id(), error = %error, "metric query failed");
        self.events
            .publish(
                &canary_ref(canary),
                EventType::Warning,
                reasons::METRIC_QUERY_FAILED,
                actions::ANALYZE,
                Some(error.to_string()),
            )
            .await;
    }
}

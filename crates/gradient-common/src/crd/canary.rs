//! Canary Custom Resource Definition
//!
//! A Canary declares how a workload is progressively delivered: the target
//! Deployment, the tick interval, and the analysis that gates each traffic
//! shift. Status is the controller's only cross-tick memory.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::analysis::CanaryAnalysis;
use crate::error::Error;

/// Default tick and metric interval applied when the spec leaves it unset
pub const DEFAULT_ANALYSIS_INTERVAL: Duration = Duration::from_secs(60);

/// Specification for a Canary
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gradient.dev",
    version = "v1alpha1",
    kind = "Canary",
    plural = "canaries",
    shortname = "cn",
    status = "CanaryStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Weight","type":"integer","jsonPath":".status.canaryWeight"}"#,
    printcolumn = r#"{"name":"FailedChecks","type":"integer","jsonPath":".status.failedChecks"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CanarySpec {
    /// Workload this canary governs
    pub target_ref: TargetRef,

    /// Optional autoscaler mirrored onto the primary workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaler_ref: Option<TargetRef>,

    /// Port exposed by the generated ClusterIP services
    pub service: CanaryService,

    /// Seconds the canary rollout may stall before it is considered
    /// unrecoverable; defaults to 600
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_deadline_seconds: Option<i32>,

    /// Analysis configuration driving traffic shifts
    #[serde(default)]
    pub analysis: CanaryAnalysis,

    /// Skip the analysis entirely and promote on the next tick
    #[serde(default)]
    pub skip_analysis: bool,
}

/// Reference to a namespace-local workload or autoscaler
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    /// API version of the referenced object (e.g. "apps/v1")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Kind of the referenced object (e.g. "Deployment")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Name of the referenced object
    pub name: String,
}

/// Service settings for the generated ClusterIP services
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanaryService {
    /// Container port receiving traffic
    pub port: i32,
}

/// Coarse lifecycle phase persisted in the canary status
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CanaryPhase {
    /// Primary workload bootstrapped, waiting for a new revision
    Initialized,
    /// Analysis in progress, traffic shifting towards the canary
    Progressing,
    /// Promotion finished, canary scaled down
    Succeeded,
    /// Rolled back after failed checks or a stalled rollout
    Failed,
}

impl CanaryPhase {
    /// Phase label value for metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "Initialized",
            Self::Progressing => "Progressing",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        }
    }

    /// Numeric gauge value: 0 initialized, 1 progressing, 2 succeeded, 3 failed
    pub fn status_code(&self) -> i64 {
        match self {
            Self::Initialized => 0,
            Self::Progressing => 1,
            Self::Succeeded => 2,
            Self::Failed => 3,
        }
    }
}

impl std::fmt::Display for CanaryPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status for a Canary
///
/// Written exclusively through the deployer; read at the start of every tick.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanaryStatus {
    /// Current lifecycle phase; absent until the first tick initializes it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<CanaryPhase>,

    /// Last canary traffic share applied by the controller
    #[serde(default)]
    pub canary_weight: i32,

    /// Consecutive failed checks in the current progressing run
    #[serde(default)]
    pub failed_checks: u32,

    /// Completed iterations in A/B mode
    #[serde(default)]
    pub iterations: u32,

    /// Hash of the last applied target pod template, for revision detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_spec: Option<String>,

    /// Hash over referenced ConfigMaps and Secrets, for config-change detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracked_config_hash: Option<String>,

    /// When the phase last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl CanaryStatus {
    /// Create a status with the given phase and everything else zeroed
    pub fn with_phase(phase: CanaryPhase) -> Self {
        Self {
            phase: Some(phase),
            ..Default::default()
        }
    }

    /// Set the canary weight and return self for chaining
    pub fn canary_weight(mut self, weight: i32) -> Self {
        self.canary_weight = weight;
        self
    }

    /// Set the failed-checks counter and return self for chaining
    pub fn failed_checks(mut self, count: u32) -> Self {
        self.failed_checks = count;
        self
    }

    /// Set the iteration counter and return self for chaining
    pub fn iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }
}

impl CanarySpec {
    /// Validate the canary specification
    pub fn validate(&self) -> Result<(), Error> {
        if self.target_ref.name.is_empty() {
            return Err(Error::validation("targetRef.name cannot be empty"));
        }

        if !(1..=65535).contains(&self.service.port) {
            return Err(Error::validation(format!(
                "service.port {} is out of range",
                self.service.port
            )));
        }

        if let Some(max) = self.analysis.max_weight {
            if max > 100 {
                return Err(Error::validation(format!(
                    "analysis.maxWeight {max} exceeds 100"
                )));
            }
        }

        if self.analysis.is_ab_testing() {
            if self.analysis.iterations == 0 {
                return Err(Error::validation(
                    "analysis.iterations must be positive in A/B mode",
                ));
            }
        } else if !self.skip_analysis && self.analysis.step_weight <= 0 {
            return Err(Error::validation(
                "analysis.stepWeight must be positive in weighted mode",
            ));
        }

        Ok(())
    }
}

impl Canary {
    /// Canary identity: `name.namespace`
    pub fn canary_id(&self) -> String {
        format!("{}.{}", self.meta_name(), self.meta_namespace())
    }

    /// Target identity: `targetName.namespace`
    pub fn target_id(&self) -> String {
        format!("{}.{}", self.spec.target_ref.name, self.meta_namespace())
    }

    /// Name of the primary workload derived from the target
    pub fn primary_name(&self) -> String {
        format!("{}-primary", self.spec.target_ref.name)
    }

    /// Tick period, defaulting when the spec leaves it unset or unparsable
    pub fn analysis_interval(&self) -> Duration {
        self.spec
            .analysis
            .interval
            .as_deref()
            .and_then(|s| humantime::parse_duration(s).ok())
            .unwrap_or(DEFAULT_ANALYSIS_INTERVAL)
    }

    /// Default range for metric queries that don't set their own interval
    pub fn metric_interval(&self) -> String {
        self.spec
            .analysis
            .interval
            .clone()
            .unwrap_or_else(|| "1m".to_string())
    }

    /// Effective maximum canary weight (100 when unset or non-positive)
    pub fn max_weight(&self) -> i32 {
        match self.spec.analysis.max_weight {
            Some(w) if w > 0 => w,
            _ => 100,
        }
    }

    /// Current phase, if the status has been initialized
    pub fn phase(&self) -> Option<CanaryPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// Last applied canary weight
    pub fn canary_weight(&self) -> i32 {
        self.status.as_ref().map(|s| s.canary_weight).unwrap_or(0)
    }

    /// Consecutive failed checks in the current run
    pub fn failed_checks(&self) -> u32 {
        self.status.as_ref().map(|s| s.failed_checks).unwrap_or(0)
    }

    /// Completed A/B iterations
    pub fn iterations(&self) -> u32 {
        self.status.as_ref().map(|s| s.iterations).unwrap_or(0)
    }

    fn meta_name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    fn meta_namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn sample_canary(name: &str, namespace: &str) -> Canary {
        let mut canary = Canary::new(
            name,
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
                    interval: Some("30s".to_string()),
                    threshold: 2,
                    max_weight: Some(60),
                    step_weight: 20,
                    ..Default::default()
                },
                skip_analysis: false,
            },
        );
        canary.metadata = ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        };
        canary
    }

    #[test]
    fn identity_helpers() {
        let canary = sample_canary("podinfo", "test");
        assert_eq!(canary.canary_id(), "podinfo.test");
        assert_eq!(canary.target_id(), "podinfo.test");
        assert_eq!(canary.primary_name(), "podinfo-primary");
    }

    #[test]
    fn interval_parses_and_defaults() {
        let mut canary = sample_canary("podinfo", "test");
        assert_eq!(canary.analysis_interval(), Duration::from_secs(30));
        assert_eq!(canary.metric_interval(), "30s");

        canary.spec.analysis.interval = None;
        assert_eq!(canary.analysis_interval(), DEFAULT_ANALYSIS_INTERVAL);
        assert_eq!(canary.metric_interval(), "1m");

        canary.spec.analysis.interval = Some("not a duration".to_string());
        assert_eq!(canary.analysis_interval(), DEFAULT_ANALYSIS_INTERVAL);
    }

    #[test]
    fn max_weight_defaults_to_full_traffic() {
        let mut canary = sample_canary("podinfo", "test");
        assert_eq!(canary.max_weight(), 60);

        canary.spec.analysis.max_weight = None;
        assert_eq!(canary.max_weight(), 100);

        canary.spec.analysis.max_weight = Some(0);
        assert_eq!(canary.max_weight(), 100);

        canary.spec.analysis.max_weight = Some(-10);
        assert_eq!(canary.max_weight(), 100);
    }

    #[test]
    fn status_accessors_default_to_zero() {
        let mut canary = sample_canary("podinfo", "test");
        assert_eq!(canary.phase(), None);
        assert_eq!(canary.canary_weight(), 0);
        assert_eq!(canary.failed_checks(), 0);

        canary.status = Some(
            CanaryStatus::with_phase(CanaryPhase::Progressing)
                .canary_weight(40)
                .failed_checks(1),
        );
        assert_eq!(canary.phase(), Some(CanaryPhase::Progressing));
        assert_eq!(canary.canary_weight(), 40);
        assert_eq!(canary.failed_checks(), 1);
    }

    #[test]
    fn validation_rejects_bad_specs() {
        let mut canary = sample_canary("podinfo", "test");
        assert!(canary.spec.validate().is_ok());

        canary.spec.analysis.step_weight = 0;
        assert!(canary.spec.validate().is_err());

        canary.spec.analysis.step_weight = 20;
        canary.spec.analysis.max_weight = Some(150);
        assert!(canary.spec.validate().is_err());

        canary.spec.analysis.max_weight = Some(60);
        canary.spec.target_ref.name = String::new();
        assert!(canary.spec.validate().is_err());
    }

    #[test]
    fn validation_ab_mode_requires_iterations() {
        let mut canary = sample_canary("podinfo", "test");
        canary.spec.analysis.match_.push(super::super::RequestMatch::default());
        canary.spec.analysis.iterations = 0;
        assert!(canary.spec.validate().is_err());

        canary.spec.analysis.iterations = 3;
        assert!(canary.spec.validate().is_ok());
    }

    #[test]
    fn phase_codes_are_stable() {
        assert_eq!(CanaryPhase::Initialized.status_code(), 0);
        assert_eq!(CanaryPhase::Progressing.status_code(), 1);
        assert_eq!(CanaryPhase::Succeeded.status_code(), 2);
        assert_eq!(CanaryPhase::Failed.status_code(), 3);
        assert_eq!(CanaryPhase::Progressing.to_string(), "Progressing");
    }
}

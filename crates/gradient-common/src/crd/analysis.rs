//! Analysis configuration for the Canary CRD
//!
//! The analysis block drives the advancement state machine: how often to
//! tick, how traffic is shifted (weighted steps or A/B iterations), and
//! which metric and webhook checks gate each step.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Canary analysis configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanaryAnalysis {
    /// Tick period as a duration string (e.g. "30s", "1m").
    /// Also the default interval for metric queries. Defaults to one minute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Consecutive failed checks tolerated before rolling back
    #[serde(default)]
    pub threshold: u32,

    /// Upper bound of the canary traffic share, in [0, 100].
    /// Unset or non-positive values fall back to 100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_weight: Option<i32>,

    /// Traffic share increment applied on each successful tick (weighted mode)
    #[serde(default)]
    pub step_weight: i32,

    /// Number of analysis iterations (A/B mode)
    #[serde(default)]
    pub iterations: u32,

    /// Request matchers routing matched traffic to the canary.
    /// Non-empty switches the analysis into A/B mode.
    #[serde(default, rename = "match", skip_serializing_if = "Vec::is_empty")]
    pub match_: Vec<RequestMatch>,

    /// Ordered metric checks evaluated on each tick
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MetricCheck>,

    /// Ordered external HTTP checks evaluated before the metrics
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub webhooks: Vec<CanaryWebhook>,
}

/// Request matcher for A/B mode
///
/// Matchers are handed to the mesh router as-is; the engine only cares
/// whether any are present.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestMatch {
    /// Header name to matcher mapping
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, StringMatch>,
}

/// String matching predicate used by request matchers
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StringMatch {
    /// Exact string match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact: Option<String>,

    /// Prefix match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Regular expression match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

/// A single metric check
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricCheck {
    /// Metric identifier. Well-known names select a built-in query;
    /// anything else requires an explicit `query`.
    pub name: String,

    /// Query range as a duration string; falls back to the canary's
    /// default metric interval when empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Pass/fail threshold. Success-rate checks pass at or above it,
    /// duration checks interpret it as milliseconds and pass at or below,
    /// custom queries pass at or below.
    #[serde(default)]
    pub threshold: f64,

    /// Explicit PromQL query evaluated as a scalar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// An external HTTP check
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanaryWebhook {
    /// Name of the check, used in events
    pub name: String,

    /// Endpoint receiving the check payload
    pub url: String,

    /// Request timeout as a duration string (e.g. "10s")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Opaque metadata forwarded in the payload
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl CanaryAnalysis {
    /// True when request matchers put the analysis in A/B mode
    pub fn is_ab_testing(&self) -> bool {
        !self.match_.is_empty()
    }
}

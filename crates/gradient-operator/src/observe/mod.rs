//! Metric observation seam
//!
//! The observer answers the analyser's questions against a time-series
//! backend. An empty result set is a distinct outcome (`NoMetricValues`)
//! from a failed query: it usually means the target simply receives no
//! traffic yet.

mod prometheus;

pub use prometheus::PrometheusObserver;

use std::time::Duration;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use gradient_common::Result;

/// Metric queries the analyser depends on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetricsObserver: Send + Sync {
    /// Percentage of non-5xx requests reported by Envoy for the target pods
    async fn envoy_success_rate(
        &self,
        target: &str,
        namespace: &str,
        metric: &str,
        interval: &str,
    ) -> Result<f64>;

    /// Percentage of non-5xx requests reported by the Istio telemetry
    async fn istio_success_rate(
        &self,
        target: &str,
        namespace: &str,
        metric: &str,
        interval: &str,
    ) -> Result<f64>;

    /// P99 request duration for the target workload
    async fn request_duration(
        &self,
        target: &str,
        namespace: &str,
        metric: &str,
        interval: &str,
    ) -> Result<Duration>;

    /// Evaluate an arbitrary query to a scalar
    async fn scalar(&self, query: &str) -> Result<f64>;
}

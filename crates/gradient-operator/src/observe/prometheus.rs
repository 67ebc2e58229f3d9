//! Prometheus-backed metrics observer

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use gradient_common::{Error, Result};

use super::MetricsObserver;

/// Observer evaluating queries against the Prometheus HTTP API
pub struct PrometheusObserver {
    client: reqwest::Client,
    server: String,
}

impl PrometheusObserver {
    /// Create an observer against the given Prometheus base URL
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            server: server.into(),
        }
    }

    async fn query(&self, query: &str, metric: &str) -> Result<f64> {
        let url = format!("{}/api/v1/query", self.server.trim_end_matches('/'));
        debug!(%query, "running prometheus query");

        let response = self
            .client
            .get(&url)
            .query(&[("query", query)])
            .send()
            .await
            .map_err(|e| Error::observer(&self.server, e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::observer(
                &self.server,
                format!("unexpected status {}", response.status()),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::observer(&self.server, e.to_string()))?;

        parse_scalar_response(&body, metric, &self.server)
    }
}

#[async_trait]
impl MetricsObserver for PrometheusObserver {
    async fn envoy_success_rate(
        &self,
        target: &str,
        namespace: &str,
        metric: &str,
        interval: &str,
    ) -> Result<f64> {
        self.query(&envoy_query(target, namespace, metric, interval), metric)
            .await
    }

    async fn istio_success_rate(
        &self,
        target: &str,
        namespace: &str,
        metric: &str,
        interval: &str,
    ) -> Result<f64> {
        self.query(&istio_query(target, namespace, metric, interval), metric)
            .await
    }

    async fn request_duration(
        &self,
        target: &str,
        namespace: &str,
        metric: &str,
        interval: &str,
    ) -> Result<Duration> {
        let seconds = self
            .query(&duration_query(target, namespace, metric, interval), metric)
            .await?;
        Ok(Duration::from_secs_f64(seconds.max(0.0)))
    }

    async fn scalar(&self, query: &str) -> Result<f64> {
        self.query(query, query).await
    }
}

/// Success rate of the target's pods from Envoy cluster telemetry
fn envoy_query(target: &str, namespace: &str, metric: &str, interval: &str) -> String {
    let pods = format!("{target}-[0-9a-zA-Z]+(-[0-9a-zA-Z]+)");
    format!(
        "sum(rate({metric}{{kubernetes_namespace=\"{namespace}\",\
kubernetes_pod_name=~\"{pods}\",envoy_response_code!~\"5.*\"}}[{interval}])) / \
sum(rate({metric}{{kubernetes_namespace=\"{namespace}\",\
kubernetes_pod_name=~\"{pods}\"}}[{interval}])) * 100"
    )
}

/// Success rate of the target workload from Istio telemetry
fn istio_query(target: &str, namespace: &str, metric: &str, interval: &str) -> String {
    format!(
        "sum(rate({metric}{{reporter=\"destination\",\
destination_workload_namespace=\"{namespace}\",destination_workload=\"{target}\",\
response_code!~\"5.*\"}}[{interval}])) / \
sum(rate({metric}{{reporter=\"destination\",\
destination_workload_namespace=\"{namespace}\",destination_workload=\"{target}\"}}[{interval}])) \
* 100"
    )
}

/// P99 latency of the target workload from the Istio duration histogram
fn duration_query(target: &str, namespace: &str, metric: &str, interval: &str) -> String {
    format!(
        "histogram_quantile(0.99, sum(rate({metric}{{reporter=\"destination\",\
destination_workload_namespace=\"{namespace}\",\
destination_workload=\"{target}\"}}[{interval}])) by (le))"
    )
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: QueryData,
}

#[derive(Debug, Default, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<QueryResult>,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    #[serde(default)]
    value: Vec<serde_json::Value>,
}

/// Parse a Prometheus instant-query response into a scalar.
///
/// An empty result vector is the no-values outcome; NaN samples count as
/// empty too, since Prometheus returns NaN for 0/0 rate divisions.
fn parse_scalar_response(body: &str, metric: &str, server: &str) -> Result<f64> {
    let response: QueryResponse = serde_json::from_str(body)
        .map_err(|e| Error::observer(server, format!("invalid response: {e}")))?;

    if response.status != "success" {
        return Err(Error::observer(
            server,
            format!("query status {}", response.status),
        ));
    }

    let Some(first) = response.data.result.first() else {
        return Err(Error::no_metric_values(metric));
    };

    let value = first
        .value
        .get(1)
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or_else(|| Error::observer(server, "malformed sample value"))?;

    if value.is_nan() {
        return Err(Error::no_metric_values(metric));
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER: &str = "http://prometheus:9090";

    #[test]
    fn parses_a_scalar_sample() {
        let body = r#"{
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    { "metric": {}, "value": [1721720400.0, "99.52"] }
                ]
            }
        }"#;
        let value = parse_scalar_response(body, "istio_requests_total", SERVER).unwrap();
        assert!((value - 99.52).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_result_is_no_values() {
        let body = r#"{ "status": "success", "data": { "resultType": "vector", "result": [] } }"#;
        let err = parse_scalar_response(body, "istio_requests_total", SERVER).unwrap_err();
        assert!(err.is_no_traffic());
    }

    #[test]
    fn nan_sample_is_no_values() {
        let body = r#"{
            "status": "success",
            "data": { "result": [ { "value": [1721720400.0, "NaN"] } ] }
        }"#;
        let err = parse_scalar_response(body, "envoy_cluster_upstream_rq", SERVER).unwrap_err();
        assert!(err.is_no_traffic());
    }

    #[test]
    fn error_status_is_a_query_failure() {
        let body = r#"{ "status": "error", "data": { "result": [] } }"#;
        let err = parse_scalar_response(body, "m", SERVER).unwrap_err();
        assert!(!err.is_no_traffic());
        assert!(err.to_string().contains("query status error"));
    }

    #[test]
    fn queries_scope_to_workload_and_namespace() {
        let q = istio_query("podinfo", "test", "istio_requests_total", "1m");
        assert!(q.contains("destination_workload=\"podinfo\""));
        assert!(q.contains("destination_workload_namespace=\"test\""));
        assert!(q.contains("[1m]"));
        assert!(q.contains("response_code!~\"5.*\""));

        let q = envoy_query("podinfo", "test", "envoy_cluster_upstream_rq", "30s");
        assert!(q.contains("kubernetes_namespace=\"test\""));
        assert!(q.contains("envoy_response_code!~\"5.*\""));

        let q = duration_query("podinfo", "test", "istio_request_duration_seconds_bucket", "1m");
        assert!(q.starts_with("histogram_quantile(0.99"));
        assert!(q.contains("by (le)"));
    }
}

//! Weighted routing over Kubernetes Gateway API HTTPRoutes
//!
//! Mesh-agnostic mesh router: the primary/canary split is materialized as
//! `backendRefs` weights on an HTTPRoute attached to the apex Service, which
//! any Gateway API mesh implementation reconciles into its own dataplane.

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

use gradient_common::crd::{Canary, RequestMatch};
use gradient_common::{Error, Result};

use super::MeshRouter;

const FIELD_MANAGER: &str = "gradient-controller";

/// MeshRouter implementation backed by Gateway API HTTPRoutes
pub struct HttpRouteRouter {
    client: Client,
}

impl HttpRouteRouter {
    /// Create a router using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_resource() -> ApiResource {
        ApiResource {
            group: "gateway.networking.k8s.io".to_string(),
            version: "v1".to_string(),
            api_version: "gateway.networking.k8s.io/v1".to_string(),
            kind: "HTTPRoute".to_string(),
            plural: "httproutes".to_string(),
        }
    }

    fn routes(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &Self::api_resource())
    }

    async fn apply_route(
        &self,
        canary: &Canary,
        primary_weight: i32,
        canary_weight: i32,
    ) -> Result<()> {
        let namespace = canary.metadata.namespace.clone().unwrap_or_default();
        let target = &canary.spec.target_ref.name;

        let route = build_route(canary, primary_weight, canary_weight);
        let obj: DynamicObject = serde_json::from_value(route)
            .map_err(|e| Error::routing(canary.canary_id(), format!("invalid route: {e}")))?;

        self.routes(&namespace)
            .patch(
                target,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&obj),
            )
            .await?;

        debug!(
            canary = %canary.canary_id(),
            primary_weight,
            canary_weight,
            "applied weighted route"
        );
        Ok(())
    }
}

#[async_trait]
impl MeshRouter for HttpRouteRouter {
    async fn sync(&self, canary: &Canary) -> Result<()> {
        let namespace = canary.metadata.namespace.clone().unwrap_or_default();
        let target = &canary.spec.target_ref.name;

        match self.routes(&namespace).get(target).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                info!(canary = %canary.canary_id(), route = %target, "creating weighted route");
                self.apply_route(canary, 100, 0).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_routes(&self, canary: &Canary) -> Result<(i32, i32)> {
        let namespace = canary.metadata.namespace.clone().unwrap_or_default();
        let target = &canary.spec.target_ref.name;

        let route = self.routes(&namespace).get(target).await?;
        parse_weights(
            &route.data,
            &canary.primary_name(),
            &format!("{target}-canary"),
        )
        .ok_or_else(|| {
            Error::routing(
                canary.canary_id(),
                format!("route {target} has no weighted primary/canary backends"),
            )
        })
    }

    async fn set_routes(
        &self,
        canary: &Canary,
        primary_weight: i32,
        canary_weight: i32,
    ) -> Result<()> {
        self.apply_route(canary, primary_weight, canary_weight).await
    }
}

/// Render the HTTPRoute for a canary with the given weight pair.
///
/// In A/B mode the request matchers constrain the weighted rule and a
/// fallback rule keeps unmatched traffic on the primary.
fn build_route(canary: &Canary, primary_weight: i32, canary_weight: i32) -> Value {
    let namespace = canary.metadata.namespace.clone().unwrap_or_default();
    let target = &canary.spec.target_ref.name;
    let primary_service = canary.primary_name();
    let canary_service = format!("{target}-canary");
    let port = canary.spec.service.port;

    let weighted_backends = json!([
        { "name": primary_service, "port": port, "weight": primary_weight },
        { "name": canary_service, "port": port, "weight": canary_weight },
    ]);

    let rules = if canary.spec.analysis.is_ab_testing() {
        json!([
            {
                "matches": render_matches(&canary.spec.analysis.match_),
                "backendRefs": weighted_backends,
            },
            {
                "backendRefs": [
                    { "name": primary_service, "port": port, "weight": 100 },
                ],
            },
        ])
    } else {
        json!([{ "backendRefs": weighted_backends }])
    };

    json!({
        "apiVersion": "gateway.networking.k8s.io/v1",
        "kind": "HTTPRoute",
        "metadata": {
            "name": target,
            "namespace": namespace,
            "labels": { "app.kubernetes.io/managed-by": "gradient" },
        },
        "spec": {
            "parentRefs": [
                { "group": "", "kind": "Service", "name": target, "port": port },
            ],
            "rules": rules,
        },
    })
}

/// Render canary request matchers as HTTPRoute header matches
fn render_matches(matches: &[RequestMatch]) -> Value {
    let rendered: Vec<Value> = matches
        .iter()
        .map(|request| {
            let headers: Vec<Value> = request
                .headers
                .iter()
                .map(|(name, string_match)| {
                    if let Some(exact) = &string_match.exact {
                        json!({ "type": "Exact", "name": name, "value": exact })
                    } else if let Some(regex) = &string_match.regex {
                        json!({ "type": "RegularExpression", "name": name, "value": regex })
                    } else if let Some(prefix) = &string_match.prefix {
                        json!({
                            "type": "RegularExpression",
                            "name": name,
                            "value": format!("^{prefix}.*"),
                        })
                    } else {
                        json!({ "type": "Exact", "name": name, "value": "" })
                    }
                })
                .collect();
            json!({ "headers": headers })
        })
        .collect();
    Value::Array(rendered)
}

/// Extract the `(primary_weight, canary_weight)` pair from a route's first rule
fn parse_weights(data: &Value, primary_service: &str, canary_service: &str) -> Option<(i32, i32)> {
    let backends = data
        .get("spec")?
        .get("rules")?
        .as_array()?
        .first()?
        .get("backendRefs")?
        .as_array()?;

    let mut primary_weight = None;
    let mut canary_weight = None;
    for backend in backends {
        let name = backend.get("name").and_then(Value::as_str)?;
        let weight = backend.get("weight").and_then(Value::as_i64).unwrap_or(1) as i32;
        if name == primary_service {
            primary_weight = Some(weight);
        } else if name == canary_service {
            canary_weight = Some(weight);
        }
    }

    Some((primary_weight?, canary_weight?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gradient_common::crd::{
        CanaryAnalysis, CanaryService, CanarySpec, StringMatch, TargetRef,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn canary(ab: bool) -> Canary {
        let mut match_ = Vec::new();
        if ab {
            let mut headers = BTreeMap::new();
            headers.insert(
                "x-canary".to_string(),
                StringMatch {
                    exact: Some("insider".to_string()),
                    ..Default::default()
                },
            );
            match_.push(RequestMatch { headers });
        }

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
                    iterations: if ab { 3 } else { 0 },
                    step_weight: if ab { 0 } else { 10 },
                    match_,
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

    #[test]
    fn weighted_route_has_two_backends() {
        let route = build_route(&canary(false), 80, 20);
        let backends = &route["spec"]["rules"][0]["backendRefs"];
        assert_eq!(backends[0]["name"], "podinfo-primary");
        assert_eq!(backends[0]["weight"], 80);
        assert_eq!(backends[1]["name"], "podinfo-canary");
        assert_eq!(backends[1]["weight"], 20);
        assert_eq!(route["spec"]["rules"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn ab_route_adds_matches_and_fallback() {
        let route = build_route(&canary(true), 0, 100);
        let rules = route["spec"]["rules"].as_array().unwrap();
        assert_eq!(rules.len(), 2);

        let header = &rules[0]["matches"][0]["headers"][0];
        assert_eq!(header["type"], "Exact");
        assert_eq!(header["name"], "x-canary");
        assert_eq!(header["value"], "insider");

        assert_eq!(rules[1]["backendRefs"][0]["name"], "podinfo-primary");
        assert_eq!(rules[1]["backendRefs"][0]["weight"], 100);
    }

    #[test]
    fn parse_weights_round_trips_build() {
        let route = build_route(&canary(false), 60, 40);
        let weights = parse_weights(&route, "podinfo-primary", "podinfo-canary");
        assert_eq!(weights, Some((60, 40)));
    }

    #[test]
    fn parse_weights_missing_backends_is_none() {
        let data = json!({ "spec": { "rules": [ { "backendRefs": [
            { "name": "something-else", "weight": 100 },
        ]}]}});
        assert_eq!(parse_weights(&data, "podinfo-primary", "podinfo-canary"), None);
    }
}

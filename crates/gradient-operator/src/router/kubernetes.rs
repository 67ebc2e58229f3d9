//! ClusterIP service provisioning
//!
//! Creates the three services fronting a canary target: the apex service
//! (mesh routes split its traffic), the primary service, and the canary
//! service. Existing services are left untouched.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, info};

use gradient_common::crd::Canary;
use gradient_common::Result;

use super::KubernetesRouter;

/// Provisions ClusterIP services for the target, primary, and canary
pub struct ClusterIpRouter {
    client: Client,
}

impl ClusterIpRouter {
    /// Create a router using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn ensure_service(
        &self,
        namespace: &str,
        name: &str,
        selector: &str,
        port: i32,
    ) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);

        match api.get(name).await {
            Ok(_) => {
                debug!(service = %name, "service already exists");
                return Ok(());
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        let mut selector_labels = std::collections::BTreeMap::new();
        selector_labels.insert("app".to_string(), selector.to_string());

        let service = Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(selector_labels),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port,
                    target_port: Some(IntOrString::Int(port)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        info!(service = %name, namespace = %namespace, "creating ClusterIP service");
        api.create(&PostParams::default(), &service).await?;
        Ok(())
    }
}

#[async_trait]
impl KubernetesRouter for ClusterIpRouter {
    async fn sync(&self, canary: &Canary) -> Result<()> {
        let namespace = canary.metadata.namespace.clone().unwrap_or_default();
        let target = canary.spec.target_ref.name.clone();
        let primary = canary.primary_name();
        let canary_svc = format!("{target}-canary");
        let port = canary.spec.service.port;

        // Apex service starts out selecting the primary; the mesh route
        // splits its traffic between the primary and canary services.
        self.ensure_service(&namespace, &target, &primary, port)
            .await?;
        self.ensure_service(&namespace, &primary, &primary, port)
            .await?;
        self.ensure_service(&namespace, &canary_svc, &target, port)
            .await?;

        Ok(())
    }
}

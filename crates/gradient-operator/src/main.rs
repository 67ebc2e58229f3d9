//! Gradient operator entrypoint
//!
//! Wires the production collaborators together: installs the Canary CRD,
//! starts the registry watcher and the scheduler driver loop, and runs
//! until a shutdown signal arrives. Configuration is environment-driven:
//!
//! - `GRADIENT_METRICS_SERVER`: Prometheus base URL
//! - `GRADIENT_NOTIFIER_URL`: optional incoming-webhook URL for notifications
//! - `GRADIENT_SYNC_INTERVAL_SECONDS`: scheduler reconcile cadence

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};
use tokio::sync::watch;

use gradient_common::crd::Canary;
use gradient_common::events::KubeEventPublisher;
use gradient_common::telemetry::{init_telemetry, TelemetryConfig};
use gradient_operator::controller::{CanaryController, Collaborators};
use gradient_operator::deploy::KubeDeployer;
use gradient_operator::notify::{HttpNotifier, NoopNotifier, Notifier};
use gradient_operator::observe::PrometheusObserver;
use gradient_operator::registry::{run_registry_watcher, CanaryRegistry};
use gradient_operator::router::{ClusterIpRouter, HttpRouteRouter};
use gradient_operator::scheduler::JobSet;
use gradient_operator::webhook::HttpWebhookRunner;

const CONTROLLER_NAME: &str = "gradient-controller";

const DEFAULT_METRICS_SERVER: &str = "http://prometheus.istio-system:9090";
const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("failed to initialize telemetry: {e}"))?;

    tracing::info!("gradient controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;

    // The operator installs its own CRD so the schema always matches the binary
    ensure_crd_installed(&client).await?;

    let metrics_server = std::env::var("GRADIENT_METRICS_SERVER")
        .unwrap_or_else(|_| DEFAULT_METRICS_SERVER.to_string());

    let sync_interval = std::env::var("GRADIENT_SYNC_INTERVAL_SECONDS")
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_SYNC_INTERVAL);

    let notifier: Arc<dyn Notifier> = match std::env::var("GRADIENT_NOTIFIER_URL") {
        Ok(url) if !url.is_empty() => {
            tracing::info!("notifications enabled");
            Arc::new(HttpNotifier::new(url))
        }
        _ => Arc::new(NoopNotifier),
    };

    let registry = CanaryRegistry::new();
    let events = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));

    let controller = Arc::new(CanaryController::new(
        registry.clone(),
        Collaborators {
            deployer: Arc::new(KubeDeployer::new(client.clone())),
            mesh_router: Arc::new(HttpRouteRouter::new(client.clone())),
            kubernetes_router: Arc::new(ClusterIpRouter::new(client.clone())),
            observer: Arc::new(PrometheusObserver::new(metrics_server)),
            webhooks: Arc::new(HttpWebhookRunner::new()),
            events: events.clone(),
            notifier,
        },
    ));

    let job_set = JobSet::new(registry.clone(), controller, events);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watcher = tokio::spawn(run_registry_watcher(client, registry));
    let scheduler = tokio::spawn(job_set.run(sync_interval, shutdown_rx));

    tracing::info!(?sync_interval, "gradient controller started");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        result = watcher => {
            match result {
                Ok(Err(e)) => tracing::error!(error = %e, "canary watcher failed"),
                Err(e) => tracing::error!(error = %e, "canary watcher panicked"),
                Ok(Ok(())) => tracing::info!("canary watcher completed"),
            }
        }
    }

    // Stop the scheduler and every canary job before exiting
    let _ = shutdown_tx.send(true);
    let _ = scheduler.await;

    tracing::info!("gradient controller stopped");
    Ok(())
}

/// Install or update the Canary CRD using server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    tracing::info!("installing Canary CRD...");
    crds.patch(
        "canaries.gradient.dev",
        &PatchParams::apply(CONTROLLER_NAME).force(),
        &Patch::Apply(&Canary::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to install Canary CRD: {e}"))?;

    tracing::info!("Canary CRD installed/updated");
    Ok(())
}

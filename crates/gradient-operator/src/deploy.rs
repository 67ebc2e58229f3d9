//! Workload deployment operations
//!
//! The [`Deployer`] trait is the engine's seam to the workload layer: it
//! bootstraps and promotes the primary Deployment, probes rollout health,
//! scales the canary, detects new revisions, and persists canary status.
//! [`KubeDeployer`] is the production implementation over the Kubernetes
//! API; tests mock the trait.

use std::collections::BTreeSet;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use gradient_common::crd::{Canary, CanaryPhase, CanaryStatus};
use gradient_common::{Error, Result};

/// Label key used to select pods of the target and primary workloads
const APP_LABEL: &str = "app";

/// Workload operations the advancement engine depends on.
///
/// Status writers are the only path through which the engine mutates canary
/// status; the implementation serializes writes per canary by patching the
/// status subresource.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Ensure the primary workload and any referenced autoscaler exist
    async fn sync(&self, canary: &Canary) -> Result<()>;

    /// Gating predicate: should this tick proceed into the state machine
    async fn should_advance(&self, canary: &Canary) -> Result<bool>;

    /// Probe the primary workload; an error halts the tick
    async fn is_primary_ready(&self, canary: &Canary) -> Result<()>;

    /// Probe the canary workload. A retryable error means "try again next
    /// tick"; a non-retryable one means the rollout stalled for good and
    /// rollback should run.
    async fn is_canary_ready(&self, canary: &Canary) -> Result<()>;

    /// Copy the canary template and replica count onto the primary workload
    async fn promote(&self, canary: &Canary) -> Result<()>;

    /// Scale the canary workload to the given replica count
    async fn scale(&self, canary: &Canary, replicas: i32) -> Result<()>;

    /// True when the target pod template differs from the last applied one
    async fn is_new_spec(&self, canary: &Canary) -> Result<bool>;

    /// True when a referenced ConfigMap or Secret changed since last applied
    async fn has_config_changed(&self, canary: &Canary) -> Result<bool>;

    /// Replace the whole canary status, refreshing the revision hashes
    async fn sync_status(&self, canary: &Canary, status: CanaryStatus) -> Result<()>;

    /// Persist the applied canary weight
    async fn set_status_weight(&self, canary: &Canary, weight: i32) -> Result<()>;

    /// Persist the completed iteration count
    async fn set_status_iterations(&self, canary: &Canary, iterations: u32) -> Result<()>;

    /// Persist the lifecycle phase
    async fn set_status_phase(&self, canary: &Canary, phase: CanaryPhase) -> Result<()>;

    /// Persist the consecutive failed-checks counter
    async fn set_status_failed_checks(&self, canary: &Canary, count: u32) -> Result<()>;
}

/// Production deployer over the Kubernetes API.
///
/// Assumes target workloads select their pods with the `app` label; the
/// generated primary rewrites it to `{target}-primary`.
pub struct KubeDeployer {
    client: Client,
}

impl KubeDeployer {
    /// Create a deployer using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn autoscalers(&self, namespace: &str) -> Api<HorizontalPodAutoscaler> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn canaries(&self, namespace: &str) -> Api<Canary> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn find_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        match self.deployments(namespace).get(name).await {
            Ok(deployment) => Ok(Some(deployment)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn target_deployment(&self, canary: &Canary, namespace: &str) -> Result<Deployment> {
        self.find_deployment(namespace, &canary.spec.target_ref.name)
            .await?
            .ok_or_else(|| {
                Error::deployment(
                    canary.canary_id(),
                    format!("deployment {} not found", canary.target_id()),
                )
            })
    }

    async fn ensure_primary_autoscaler(&self, canary: &Canary, namespace: &str) -> Result<()> {
        let Some(ref autoscaler_ref) = canary.spec.autoscaler_ref else {
            return Ok(());
        };

        let api = self.autoscalers(namespace);
        let source = match api.get(&autoscaler_ref.name).await {
            Ok(hpa) => hpa,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Err(Error::deployment(
                    canary.canary_id(),
                    format!("autoscaler {} not found", autoscaler_ref.name),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        let primary_name = format!("{}-primary", autoscaler_ref.name);
        match api.get(&primary_name).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                let primary = build_primary_autoscaler(&source, &primary_name, &canary.primary_name());
                info!(canary = %canary.canary_id(), autoscaler = %primary_name, "creating primary autoscaler");
                api.create(&PostParams::default(), &primary).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn config_hash(&self, deployment: &Deployment, namespace: &str) -> Result<Option<String>> {
        let (config_maps, secrets) = config_refs(deployment);
        if config_maps.is_empty() && secrets.is_empty() {
            return Ok(None);
        }

        let mut hasher = Sha256::new();

        let cm_api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        for name in &config_maps {
            hasher.update(name.as_bytes());
            if let Ok(cm) = cm_api.get(name).await {
                if let Some(data) = &cm.data {
                    for (key, value) in data {
                        hasher.update(key.as_bytes());
                        hasher.update(value.as_bytes());
                    }
                }
                if let Some(binary) = &cm.binary_data {
                    for (key, value) in binary {
                        hasher.update(key.as_bytes());
                        hasher.update(&value.0);
                    }
                }
            }
        }

        let secret_api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        for name in &secrets {
            hasher.update(name.as_bytes());
            if let Ok(secret) = secret_api.get(name).await {
                if let Some(data) = &secret.data {
                    for (key, value) in data {
                        hasher.update(key.as_bytes());
                        hasher.update(&value.0);
                    }
                }
            }
        }

        Ok(Some(format!("{:x}", hasher.finalize())))
    }

    fn namespace(canary: &Canary) -> String {
        canary.metadata.namespace.clone().unwrap_or_default()
    }

    fn name(canary: &Canary) -> String {
        canary.metadata.name.clone().unwrap_or_default()
    }
}

#[async_trait]
impl Deployer for KubeDeployer {
    async fn sync(&self, canary: &Canary) -> Result<()> {
        let namespace = Self::namespace(canary);
        let target = self.target_deployment(canary, &namespace).await?;

        let primary_name = canary.primary_name();
        if self.find_deployment(&namespace, &primary_name).await?.is_none() {
            let primary = build_primary(
                &target,
                &primary_name,
                canary.spec.progress_deadline_seconds,
            );
            info!(canary = %canary.canary_id(), primary = %primary_name, "creating primary deployment");
            self.deployments(&namespace)
                .create(&PostParams::default(), &primary)
                .await?;

            // The fresh primary serves all traffic; the canary pods are
            // not needed until a new revision shows up.
            self.scale(canary, 0).await?;
        }

        self.ensure_primary_autoscaler(canary, &namespace).await
    }

    async fn should_advance(&self, canary: &Canary) -> Result<bool> {
        let bootstrapping = canary
            .status
            .as_ref()
            .and_then(|s| s.last_applied_spec.as_ref())
            .is_none();
        if bootstrapping || canary.phase() == Some(CanaryPhase::Progressing) {
            return Ok(true);
        }

        Ok(self.is_new_spec(canary).await? || self.has_config_changed(canary).await?)
    }

    async fn is_primary_ready(&self, canary: &Canary) -> Result<()> {
        let namespace = Self::namespace(canary);
        let primary_name = canary.primary_name();
        let primary = self
            .find_deployment(&namespace, &primary_name)
            .await?
            .ok_or_else(|| {
                Error::deployment(
                    canary.canary_id(),
                    format!("primary deployment {primary_name} not found"),
                )
            })?;

        match classify_rollout(&primary) {
            RolloutStatus::Ready => {}
            RolloutStatus::InProgress(reason) | RolloutStatus::DeadlineExceeded(reason) => {
                return Err(Error::deployment(
                    canary.canary_id(),
                    format!("primary not ready: {reason}"),
                ));
            }
        }

        if primary.spec.as_ref().and_then(|s| s.replicas) == Some(0) {
            return Err(Error::deployment(
                canary.canary_id(),
                format!("halt advancement: primary {primary_name} is scaled to zero"),
            ));
        }

        Ok(())
    }

    async fn is_canary_ready(&self, canary: &Canary) -> Result<()> {
        let namespace = Self::namespace(canary);
        let target = self.target_deployment(canary, &namespace).await?;

        match classify_rollout(&target) {
            RolloutStatus::Ready => Ok(()),
            RolloutStatus::InProgress(reason) => {
                Err(Error::deployment(canary.canary_id(), reason))
            }
            RolloutStatus::DeadlineExceeded(reason) => {
                Err(Error::deployment_permanent(canary.canary_id(), reason))
            }
        }
    }

    async fn promote(&self, canary: &Canary) -> Result<()> {
        let namespace = Self::namespace(canary);
        let target = self.target_deployment(canary, &namespace).await?;

        let primary_name = canary.primary_name();
        let mut primary = self
            .find_deployment(&namespace, &primary_name)
            .await?
            .ok_or_else(|| {
                Error::deployment(
                    canary.canary_id(),
                    format!("primary deployment {primary_name} not found"),
                )
            })?;

        if let Some(target_spec) = &target.spec {
            let template = relabel_template(target_spec.template.clone(), &primary_name);
            let primary_spec = primary.spec.get_or_insert_with(Default::default);
            primary_spec.template = template;
            primary_spec.replicas = target_spec.replicas;
        }

        debug!(canary = %canary.canary_id(), primary = %primary_name, "promoting canary template");
        self.deployments(&namespace)
            .replace(&primary_name, &PostParams::default(), &primary)
            .await?;
        Ok(())
    }

    async fn scale(&self, canary: &Canary, replicas: i32) -> Result<()> {
        let namespace = Self::namespace(canary);
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        self.deployments(&namespace)
            .patch(
                &canary.spec.target_ref.name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        debug!(canary = %canary.canary_id(), replicas, "scaled canary workload");
        Ok(())
    }

    async fn is_new_spec(&self, canary: &Canary) -> Result<bool> {
        let namespace = Self::namespace(canary);
        let target = self.target_deployment(canary, &namespace).await?;
        let hash = hash_pod_template(&target)?;

        Ok(canary
            .status
            .as_ref()
            .and_then(|s| s.last_applied_spec.as_ref())
            .map(|applied| applied != &hash)
            .unwrap_or(true))
    }

    async fn has_config_changed(&self, canary: &Canary) -> Result<bool> {
        let namespace = Self::namespace(canary);
        let target = self.target_deployment(canary, &namespace).await?;

        let Some(hash) = self.config_hash(&target, &namespace).await? else {
            return Ok(false);
        };

        Ok(canary
            .status
            .as_ref()
            .and_then(|s| s.tracked_config_hash.as_ref())
            .map(|tracked| tracked != &hash)
            .unwrap_or(true))
    }

    async fn sync_status(&self, canary: &Canary, status: CanaryStatus) -> Result<()> {
        let namespace = Self::namespace(canary);
        let target = self.target_deployment(canary, &namespace).await?;

        let mut status = status;
        status.last_applied_spec = Some(hash_pod_template(&target)?);
        status.tracked_config_hash = self.config_hash(&target, &namespace).await?;
        status.last_transition_time = Some(chrono::Utc::now());

        let patch = serde_json::json!({ "status": status });
        self.canaries(&namespace)
            .patch_status(
                &Self::name(canary),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn set_status_weight(&self, canary: &Canary, weight: i32) -> Result<()> {
        let namespace = Self::namespace(canary);
        let patch = serde_json::json!({ "status": { "canaryWeight": weight } });
        self.canaries(&namespace)
            .patch_status(
                &Self::name(canary),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn set_status_iterations(&self, canary: &Canary, iterations: u32) -> Result<()> {
        let namespace = Self::namespace(canary);
        let patch = serde_json::json!({ "status": { "iterations": iterations } });
        self.canaries(&namespace)
            .patch_status(
                &Self::name(canary),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn set_status_phase(&self, canary: &Canary, phase: CanaryPhase) -> Result<()> {
        let namespace = Self::namespace(canary);
        let patch = serde_json::json!({
            "status": {
                "phase": phase,
                "lastTransitionTime": chrono::Utc::now(),
            }
        });
        self.canaries(&namespace)
            .patch_status(
                &Self::name(canary),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn set_status_failed_checks(&self, canary: &Canary, count: u32) -> Result<()> {
        let namespace = Self::namespace(canary);
        let patch = serde_json::json!({ "status": { "failedChecks": count } });
        self.canaries(&namespace)
            .patch_status(
                &Self::name(canary),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

/// Rollout health of a Deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RolloutStatus {
    /// All replicas updated and available
    Ready,
    /// Rollout still converging; retry next tick
    InProgress(String),
    /// The deployment controller gave up on the rollout
    DeadlineExceeded(String),
}

/// Classify a Deployment's rollout state from its status.
///
/// Mirrors the checks `kubectl rollout status` performs.
pub(crate) fn classify_rollout(deployment: &Deployment) -> RolloutStatus {
    let name = deployment.metadata.name.as_deref().unwrap_or_default();

    let Some(status) = &deployment.status else {
        return RolloutStatus::InProgress(format!("deployment {name} has no status yet"));
    };

    if let (Some(generation), Some(observed)) =
        (deployment.metadata.generation, status.observed_generation)
    {
        if observed < generation {
            return RolloutStatus::InProgress(format!(
                "waiting for deployment {name} spec update to be observed"
            ));
        }
    }

    if let Some(conditions) = &status.conditions {
        let deadline_exceeded = conditions.iter().any(|c| {
            c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded")
        });
        if deadline_exceeded {
            return RolloutStatus::DeadlineExceeded(format!(
                "deployment {name} exceeded its progress deadline"
            ));
        }
    }

    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let updated = status.updated_replicas.unwrap_or(0);
    let total = status.replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);

    if updated < desired {
        RolloutStatus::InProgress(format!(
            "waiting for rollout to finish: {updated} out of {desired} new replicas have been updated"
        ))
    } else if total > updated {
        RolloutStatus::InProgress(format!(
            "waiting for rollout to finish: {} old replicas are pending termination",
            total - updated
        ))
    } else if available < updated {
        RolloutStatus::InProgress(format!(
            "waiting for rollout to finish: {available} of {updated} updated replicas are available"
        ))
    } else {
        RolloutStatus::Ready
    }
}

/// Build the primary Deployment from the target's current template
fn build_primary(
    target: &Deployment,
    primary_name: &str,
    progress_deadline_seconds: Option<i32>,
) -> Deployment {
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    let target_spec = target.spec.clone().unwrap_or_default();
    let template = relabel_template(target_spec.template, primary_name);

    let mut match_labels = std::collections::BTreeMap::new();
    match_labels.insert(APP_LABEL.to_string(), primary_name.to_string());

    Deployment {
        metadata: ObjectMeta {
            name: Some(primary_name.to_string()),
            namespace: target.metadata.namespace.clone(),
            labels: Some(match_labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: target_spec.replicas,
            selector: LabelSelector {
                match_labels: Some(match_labels),
                ..Default::default()
            },
            template,
            progress_deadline_seconds: progress_deadline_seconds
                .or(target_spec.progress_deadline_seconds),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Rewrite the pod template's app label so the primary selects its own pods
fn relabel_template(
    mut template: k8s_openapi::api::core::v1::PodTemplateSpec,
    primary_name: &str,
) -> k8s_openapi::api::core::v1::PodTemplateSpec {
    let metadata = template.metadata.get_or_insert_with(Default::default);
    metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(APP_LABEL.to_string(), primary_name.to_string());
    template
}

/// Build the primary autoscaler pointing at the primary workload
fn build_primary_autoscaler(
    source: &HorizontalPodAutoscaler,
    primary_name: &str,
    primary_target: &str,
) -> HorizontalPodAutoscaler {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    let mut spec = source.spec.clone().unwrap_or_default();
    spec.scale_target_ref.name = primary_target.to_string();

    HorizontalPodAutoscaler {
        metadata: ObjectMeta {
            name: Some(primary_name.to_string()),
            namespace: source.metadata.namespace.clone(),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    }
}

/// Names of ConfigMaps and Secrets the pod template references
fn config_refs(deployment: &Deployment) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut config_maps = BTreeSet::new();
    let mut secrets = BTreeSet::new();

    let Some(pod_spec) = deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
    else {
        return (config_maps, secrets);
    };

    if let Some(volumes) = &pod_spec.volumes {
        for volume in volumes {
            if let Some(cm) = &volume.config_map {
                config_maps.insert(cm.name.clone());
            }
            if let Some(secret) = volume.secret.as_ref().and_then(|s| s.secret_name.clone()) {
                secrets.insert(secret);
            }
        }
    }

    for container in &pod_spec.containers {
        if let Some(env) = &container.env {
            for var in env {
                if let Some(source) = &var.value_from {
                    if let Some(cm) = &source.config_map_key_ref {
                        config_maps.insert(cm.name.clone());
                    }
                    if let Some(secret) = &source.secret_key_ref {
                        secrets.insert(secret.name.clone());
                    }
                }
            }
        }
        if let Some(env_from) = &container.env_from {
            for source in env_from {
                if let Some(cm) = &source.config_map_ref {
                    config_maps.insert(cm.name.clone());
                }
                if let Some(secret) = &source.secret_ref {
                    secrets.insert(secret.name.clone());
                }
            }
        }
    }

    (config_maps, secrets)
}

/// Stable hash of the target's pod template
fn hash_pod_template(deployment: &Deployment) -> Result<String> {
    let template = deployment
        .spec
        .as_ref()
        .map(|s| &s.template)
        .ok_or_else(|| Error::internal("deployer", "deployment has no spec"))?;

    let bytes = serde_json::to_vec(template)
        .map_err(|e| Error::internal("deployer", format!("failed to serialize template: {e}")))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

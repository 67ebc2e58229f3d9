//! Canary job scheduling
//!
//! The job set owns the mapping canary-id -> running periodic job and keeps
//! it synchronized with the registry: new canaries get a job, canaries whose
//! interval changed get their job replaced, deleted canaries get theirs
//! stopped and removed. It also publishes per-namespace totals and warns
//! when two canaries declare the same target workload.

mod job;

pub use job::{Advancer, CanaryJob};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kube::runtime::events::EventType;
use tokio::sync::watch;
use tracing::{info, warn};

use gradient_common::crd::Canary;
use gradient_common::events::{actions, canary_ref, reasons, EventPublisher};
use gradient_common::metrics;

use crate::registry::CanaryRegistry;

/// Owns the per-canary jobs and reconciles them against the registry.
///
/// The job set has a single writer: the scheduler driver loop calling
/// [`JobSet::sync`] on a fixed cadence.
pub struct JobSet {
    jobs: HashMap<String, CanaryJob>,
    registry: CanaryRegistry,
    advancer: Arc<dyn Advancer>,
    events: Arc<dyn EventPublisher>,
}

impl JobSet {
    /// Create an empty job set over the given registry
    pub fn new(
        registry: CanaryRegistry,
        advancer: Arc<dyn Advancer>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            jobs: HashMap::new(),
            registry,
            advancer,
            events,
        }
    }

    /// Reconcile the job map against the current registry content
    pub async fn sync(&mut self) {
        let snapshot = self.registry.snapshot();

        // canary id -> target id, the view conflict detection works on
        let mut current: HashMap<String, String> = HashMap::with_capacity(snapshot.len());

        for canary in &snapshot {
            let id = canary.canary_id();
            current.insert(id.clone(), canary.target_id());

            let interval = canary.analysis_interval();
            match self.jobs.get(&id).map(|job| job.interval()) {
                Some(existing) if existing == interval => {}
                Some(existing) => {
                    // Interval changed: the old job stops before the
                    // replacement starts accepting ticks.
                    if let Some(job) = self.jobs.remove(&id) {
                        job.stop();
                    }
                    info!(
                        canary = %id,
                        old_interval = ?existing,
                        new_interval = ?interval,
                        "restarting canary job with new interval"
                    );
                    self.start_job(canary, interval);
                }
                None => {
                    info!(canary = %id, ?interval, "starting canary job");
                    self.start_job(canary, interval);
                }
            }
        }

        // Stop and remove jobs whose canary is gone
        let stale: Vec<String> = self
            .jobs
            .keys()
            .filter(|id| !current.contains_key(*id))
            .cloned()
            .collect();
        for id in stale {
            if let Some(job) = self.jobs.remove(&id) {
                job.stop();
                info!(canary = %id, "stopped canary job");
            }
        }

        for (namespace, count) in namespace_totals(&snapshot) {
            metrics::set_total(&namespace, count as i64);
        }

        self.report_conflicts(&snapshot, &current).await;
    }

    /// Number of running jobs
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// True when no jobs are running
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Stop every job and clear the map
    pub fn stop_all(&mut self) {
        for (id, job) in self.jobs.drain() {
            job.stop();
            info!(canary = %id, "stopped canary job");
        }
    }

    /// Drive the job set until shutdown is signalled, syncing on a fixed
    /// cadence. All jobs are stopped before returning.
    pub async fn run(mut self, sync_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(sync_interval);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.sync().await,
            }
        }
        self.stop_all();
    }

    fn start_job(&mut self, canary: &Canary, interval: Duration) {
        let job = CanaryJob::spawn(
            canary.metadata.name.clone().unwrap_or_default(),
            canary.metadata.namespace.clone().unwrap_or_default(),
            interval,
            self.advancer.clone(),
        );
        self.jobs.insert(canary.canary_id(), job);
    }

    async fn report_conflicts(&self, snapshot: &[Arc<Canary>], current: &HashMap<String, String>) {
        let conflicts = target_conflicts(current);
        if conflicts.is_empty() {
            return;
        }

        let by_id: HashMap<String, &Arc<Canary>> = snapshot
            .iter()
            .map(|canary| (canary.canary_id(), canary))
            .collect();

        for (canary_id, target) in conflicts {
            warn!(canary = %canary_id, target = %target, "multiple canaries declare the same target");
            if let Some(canary) = by_id.get(&canary_id) {
                self.events
                    .publish(
                        &canary_ref(canary),
                        EventType::Warning,
                        reasons::TARGET_CONFLICT,
                        actions::SCHEDULE,
                        Some(format!(
                            "canary {canary_id} shares target {target} with another canary"
                        )),
                    )
                    .await;
            }
        }
    }
}

/// Count canaries per namespace
fn namespace_totals(canaries: &[Arc<Canary>]) -> HashMap<String, usize> {
    let mut totals = HashMap::new();
    for canary in canaries {
        let namespace = canary.metadata.namespace.clone().unwrap_or_default();
        *totals.entry(namespace).or_insert(0) += 1;
    }
    totals
}

/// Find canaries sharing a target with another canary.
///
/// Returns one `(canary_id, target_id)` pair per ordered pair of distinct
/// canaries with the same target, so both sides of a conflict are reported.
fn target_conflicts(current: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut conflicts = Vec::new();
    for (canary_id, target) in current {
        for (other_id, other_target) in current {
            if canary_id != other_id && target == other_target {
                conflicts.push((canary_id.clone(), target.clone()));
            }
        }
    }
    conflicts.sort();
    conflicts
}

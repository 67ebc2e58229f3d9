//! Shared canary registry
//!
//! The registry is the controller's read view over the declared `Canary`
//! resources: a concurrently-readable map keyed by canary id, fed by a
//! single watcher task. The scheduler and every advancement tick read from
//! it; the watcher is the sole writer.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use kube::runtime::watcher::{watcher, Config as WatcherConfig, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use tracing::{debug, info};

use gradient_common::crd::Canary;
use gradient_common::{Error, Result};

/// Concurrently-readable map of declared canaries, keyed by canary id
#[derive(Clone, Default)]
pub struct CanaryRegistry {
    inner: Arc<DashMap<String, Arc<Canary>>>,
}

impl CanaryRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a canary by name and namespace
    pub fn get(&self, name: &str, namespace: &str) -> Option<Arc<Canary>> {
        self.inner
            .get(&format!("{name}.{namespace}"))
            .map(|entry| entry.value().clone())
    }

    /// Insert or replace a canary
    pub fn insert(&self, canary: Canary) {
        self.inner.insert(canary.canary_id(), Arc::new(canary));
    }

    /// Remove a canary by id
    pub fn remove(&self, canary_id: &str) {
        self.inner.remove(canary_id);
    }

    /// Replace the whole registry content with the given listing
    ///
    /// Used when the watcher replays its initial sync, so resources deleted
    /// while the watch was down are dropped.
    pub fn replace_all(&self, canaries: Vec<Canary>) {
        let keep: HashSet<String> = canaries.iter().map(|c| c.canary_id()).collect();
        self.inner.retain(|id, _| keep.contains(id));
        for canary in canaries {
            self.insert(canary);
        }
    }

    /// Snapshot of all registered canaries
    pub fn snapshot(&self) -> Vec<Arc<Canary>> {
        self.inner
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of registered canaries
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True when no canaries are registered
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Watch `Canary` resources across all namespaces into the registry.
///
/// Runs until the watch stream ends or fails terminally; transient API
/// errors are retried with backoff.
pub async fn run_registry_watcher(client: Client, registry: CanaryRegistry) -> Result<()> {
    let api: Api<Canary> = Api::all(client);
    let mut stream = watcher(api, WatcherConfig::default())
        .default_backoff()
        .boxed();

    let mut init_buffer: Vec<Canary> = Vec::new();

    while let Some(event) = stream
        .try_next()
        .await
        .map_err(|e| Error::internal("watcher", e.to_string()))?
    {
        match event {
            Event::Init => {
                init_buffer.clear();
            }
            Event::InitApply(canary) => {
                init_buffer.push(canary);
            }
            Event::InitDone => {
                let canaries = std::mem::take(&mut init_buffer);
                info!(count = canaries.len(), "canary registry synchronized");
                registry.replace_all(canaries);
            }
            Event::Apply(canary) => {
                debug!(canary = %canary.canary_id(), "canary applied");
                registry.insert(canary);
            }
            Event::Delete(canary) => {
                let id = canary.canary_id();
                debug!(canary = %id, "canary deleted");
                registry.remove(&id);
            }
        }
    }

    Ok(())
}

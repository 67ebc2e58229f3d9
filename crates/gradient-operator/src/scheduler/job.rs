//! Per-canary periodic job
//!
//! A job is a spawned task that invokes the advancement function for one
//! canary at its configured interval. Ticks for a single job never overlap:
//! the advancement runs to completion before the next tick is consumed, and
//! ticks that fire in the meantime are dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Advancement entry point invoked on every tick.
///
/// Implemented by the canary controller; mocked in scheduler tests. The
/// implementation must tolerate concurrent calls for different canaries but
/// is never called concurrently for the same one.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Advancer: Send + Sync {
    /// Run one advancement tick for the given canary
    async fn advance(&self, name: &str, namespace: &str, skip_liveness_checks: bool);
}

/// A running periodic job for a single canary.
///
/// Owned exclusively by the job set. Dropping the job closes the stop
/// channel and ends the task; the job set still stops explicitly before
/// removal so the handoff is visible in the logs.
pub struct CanaryJob {
    name: String,
    namespace: String,
    interval: Duration,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl CanaryJob {
    /// Spawn a job ticking at `interval`. Non-blocking; the first tick fires
    /// one full interval after the spawn.
    pub fn spawn(
        name: impl Into<String>,
        namespace: impl Into<String>,
        interval: Duration,
        advancer: Arc<dyn Advancer>,
    ) -> Self {
        let name = name.into();
        let namespace = namespace.into();
        let (stop, mut stopped) = watch::channel(false);

        let task_name = name.clone();
        let task_namespace = namespace.clone();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            // A tick that fires while the previous advancement is still
            // running is dropped, never queued.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = stopped.changed() => {
                        debug!(
                            canary = %format!("{task_name}.{task_namespace}"),
                            "canary job stopped"
                        );
                        break;
                    }
                    _ = ticker.tick() => {
                        advancer
                            .advance(&task_name, &task_namespace, false)
                            .await;
                    }
                }
            }
        });

        Self {
            name,
            namespace,
            interval,
            stop,
            handle,
        }
    }

    /// Signal the job to stop. Idempotent; an in-flight tick finishes
    /// best-effort.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// The configured tick interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Canary id this job drives
    pub fn canary_id(&self) -> String {
        format!("{}.{}", self.name, self.namespace)
    }

    /// True once the job task has exited
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

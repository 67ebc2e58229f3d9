//! Error types for the gradient controller
//!
//! Errors carry enough context to be logged and turned into Kubernetes
//! events without re-deriving it at the call site: the canary id, the
//! collaborator that failed, and whether retrying next tick can help.

use thiserror::Error;

/// Default context value when no specific canary is associated with an error
pub const UNKNOWN_CANARY: &str = "unknown";

/// Main error type for gradient operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid canary specification
    #[error("validation error for {canary}: {message}")]
    Validation {
        /// Canary id (`name.namespace`) with the invalid configuration
        canary: String,
        /// Description of what's invalid
        message: String,
    },

    /// Workload deployment error reported by the deployer
    #[error("deployment error for {canary}: {message}")]
    Deployment {
        /// Canary id the failure belongs to
        canary: String,
        /// Description of what failed
        message: String,
        /// False when the workload can no longer make progress
        /// (e.g. progress deadline exceeded) and rollback should start
        retryable: bool,
    },

    /// Traffic routing error from the mesh or Kubernetes router
    #[error("routing error for {canary}: {message}")]
    Routing {
        /// Canary id the failure belongs to
        canary: String,
        /// Description of what failed
        message: String,
    },

    /// The observer found no samples for a metric query
    ///
    /// This is a distinct outcome from a query failure: it usually means
    /// the target is not receiving traffic yet. Advancement halts but the
    /// failed-checks budget is not consumed.
    #[error("no values found for metric {metric}")]
    NoMetricValues {
        /// The metric that produced an empty result
        metric: String,
    },

    /// Metrics backend query failure
    #[error("metrics server {server} query failed: {message}")]
    Observer {
        /// Address of the metrics server
        server: String,
        /// Description of what failed
        message: String,
    },

    /// External webhook check failure
    #[error("webhook {name} failed: {message}")]
    Webhook {
        /// Name of the webhook from the canary analysis spec
        name: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Context where the error occurred (e.g. "scheduler", "watcher")
        context: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a validation error without canary context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            canary: UNKNOWN_CANARY.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error with canary context
    pub fn validation_for(canary: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            canary: canary.into(),
            message: msg.into(),
        }
    }

    /// Create a retryable deployment error
    pub fn deployment(canary: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Deployment {
            canary: canary.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable deployment error (progress deadline exceeded)
    pub fn deployment_permanent(canary: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Deployment {
            canary: canary.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a routing error
    pub fn routing(canary: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Routing {
            canary: canary.into(),
            message: msg.into(),
        }
    }

    /// Create a no-values observer outcome for the given metric
    pub fn no_metric_values(metric: impl Into<String>) -> Self {
        Self::NoMetricValues {
            metric: metric.into(),
        }
    }

    /// Create an observer query error
    pub fn observer(server: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Observer {
            server: server.into(),
            message: msg.into(),
        }
    }

    /// Create a webhook failure
    pub fn webhook(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Webhook {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Check whether retrying on the next tick can recover from this error
    ///
    /// Validation errors require an operator fix. A non-retryable deployment
    /// error means the canary workload can no longer make progress and the
    /// rollback path should run. Everything else is assumed transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // 4xx responses won't improve by retrying the same request
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Validation { .. } => false,
            Error::Deployment { retryable, .. } => *retryable,
            Error::Routing { .. } => true,
            Error::NoMetricValues { .. } => false,
            Error::Observer { .. } => true,
            Error::Webhook { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// True when the observer reported an empty result set for a metric
    pub fn is_no_traffic(&self) -> bool {
        matches!(self, Error::NoMetricValues { .. })
    }

    /// Get the canary id if this error is associated with one
    pub fn canary(&self) -> Option<&str> {
        match self {
            Error::Validation { canary, .. }
            | Error::Deployment { canary, .. }
            | Error::Routing { canary, .. } => Some(canary),
            _ => None,
        }
    }
}

/// Convenience result alias used across the workspace
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_not_retryable() {
        let err = Error::validation("stepWeight must be positive");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("stepWeight must be positive"));
        assert_eq!(err.canary(), Some(UNKNOWN_CANARY));
    }

    #[test]
    fn deployment_errors_carry_retryability() {
        let transient = Error::deployment("podinfo.test", "waiting for rollout");
        assert!(transient.is_retryable());
        assert_eq!(transient.canary(), Some("podinfo.test"));

        let deadline = Error::deployment_permanent("podinfo.test", "progress deadline exceeded");
        assert!(!deadline.is_retryable());
        assert!(deadline.to_string().contains("progress deadline exceeded"));
    }

    #[test]
    fn no_metric_values_is_a_distinct_outcome() {
        let err = Error::no_metric_values("istio_requests_total");
        assert!(err.is_no_traffic());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("no values found"));

        let query = Error::observer("http://prometheus:9090", "connection refused");
        assert!(!query.is_no_traffic());
        assert!(query.is_retryable());
    }

    #[test]
    fn webhook_errors_name_the_check() {
        let err = Error::webhook("load-test", "status 500");
        assert!(err.to_string().contains("load-test"));
        assert!(err.is_retryable());
    }

    #[test]
    fn routing_errors_keep_canary_context() {
        let err = Error::routing("podinfo.prod", "virtual service not found");
        assert_eq!(err.canary(), Some("podinfo.prod"));
        assert!(err.is_retryable());
    }
}

//! External chat notifications
//!
//! The notifier mirrors the lifecycle events humans care about (analysis
//! started, promotion finished, rollback) to an incoming-webhook endpoint.
//! Like Kubernetes events, notifications are fire-and-forget.

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

/// Posts canary lifecycle notifications
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Post a message about the given canary.
    ///
    /// `is_init` marks bootstrap messages, `is_warning` failure messages.
    async fn post(
        &self,
        canary_name: &str,
        namespace: &str,
        message: &str,
        is_init: bool,
        is_warning: bool,
    );
}

/// Slack-compatible incoming-webhook notifier
pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
}

impl HttpNotifier {
    /// Create a notifier posting to the given webhook URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn post(
        &self,
        canary_name: &str,
        namespace: &str,
        message: &str,
        is_init: bool,
        is_warning: bool,
    ) {
        let color = if is_warning {
            "danger"
        } else if is_init {
            "#3aa3e3"
        } else {
            "good"
        };

        let payload = json!({
            "attachments": [{
                "color": color,
                "title": format!("{canary_name}.{namespace}"),
                "text": message,
            }]
        });

        let result = self.client.post(&self.url).json(&payload).send().await;
        match result {
            Ok(response) if !response.status().is_success() => {
                warn!(
                    canary = %format!("{canary_name}.{namespace}"),
                    status = %response.status(),
                    "notification rejected"
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    canary = %format!("{canary_name}.{namespace}"),
                    error = %e,
                    "failed to send notification"
                );
            }
        }
    }
}

/// No-op notifier used when no webhook URL is configured
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn post(
        &self,
        _canary_name: &str,
        _namespace: &str,
        _message: &str,
        _is_init: bool,
        _is_warning: bool,
    ) {
        // intentionally empty
    }
}

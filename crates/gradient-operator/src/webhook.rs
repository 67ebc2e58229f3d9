//! External HTTP checks
//!
//! Webhooks are the extension point of the analysis: each configured check
//! receives the canary identity and its metadata, and any non-2xx response
//! or transport error halts advancement for the tick.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

use gradient_common::crd::{CanaryPhase, CanaryWebhook};
use gradient_common::{Error, Result};

/// Default timeout applied when the webhook spec leaves it unset
const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs one external check for a canary
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WebhookRunner: Send + Sync {
    /// Call the webhook; an error halts advancement
    async fn call(
        &self,
        name: &str,
        namespace: &str,
        phase: Option<CanaryPhase>,
        webhook: &CanaryWebhook,
    ) -> Result<()>;
}

/// Payload POSTed to webhook endpoints
#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    /// Canary name
    pub name: &'a str,
    /// Canary namespace
    pub namespace: &'a str,
    /// Lifecycle phase at the time of the check; empty until initialized
    pub phase: &'a str,
    /// Opaque metadata from the webhook spec
    pub metadata: &'a BTreeMap<String, String>,
}

/// HTTP implementation of the webhook runner
pub struct HttpWebhookRunner {
    client: reqwest::Client,
}

impl HttpWebhookRunner {
    /// Create a runner with a fresh HTTP client
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpWebhookRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookRunner for HttpWebhookRunner {
    async fn call(
        &self,
        name: &str,
        namespace: &str,
        phase: Option<CanaryPhase>,
        webhook: &CanaryWebhook,
    ) -> Result<()> {
        let timeout = webhook
            .timeout
            .as_deref()
            .and_then(|t| humantime::parse_duration(t).ok())
            .unwrap_or(DEFAULT_WEBHOOK_TIMEOUT);

        let payload = WebhookPayload {
            name,
            namespace,
            phase: phase.map(|p| p.as_str()).unwrap_or_default(),
            metadata: &webhook.metadata,
        };

        let response = self
            .client
            .post(&webhook.url)
            .timeout(timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::webhook(&webhook.name, e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::webhook(
                &webhook.name,
                format!("unexpected status {}", response.status()),
            ));
        }

        Ok(())
    }
}

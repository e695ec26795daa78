//! HTTP webhook sink for stream relays.
//!
//! Each relayed stream payload is sent as a JSON `PUT` to the configured
//! URL. Non-2xx responses count as delivery failures.

use crate::message::StreamPacket;
use crate::relay::RelaySink;
use async_trait::async_trait;
use drp_types::{DrpError, DrpResult, WebhookConfig};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Validates that the webhook URL has an http(s) scheme and a host.
pub fn validate_webhook_url(url: &str) -> DrpResult<()> {
    let parsed = url::Url::parse(url)
        .map_err(|e| DrpError::InvalidParams(format!("invalid webhook URL '{url}': {e}")))?;

    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(DrpError::InvalidParams(format!(
            "webhook URL scheme must be http or https, got: {scheme}"
        )));
    }
    if parsed.host_str().is_none() {
        return Err(DrpError::InvalidParams(
            "webhook URL must have a host".to_string(),
        ));
    }
    Ok(())
}

/// Delivers stream payloads to an HTTP endpoint.
#[derive(Clone)]
pub struct WebhookSink {
    http: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: &str, config: &WebhookConfig) -> DrpResult<Self> {
        validate_webhook_url(url)?;
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| DrpError::Webhook(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RelaySink for WebhookSink {
    async fn deliver(&self, packet: &StreamPacket) -> DrpResult<()> {
        let resp = self
            .http
            .put(&self.url)
            .json(&packet.payload)
            .send()
            .await
            .map_err(|e| DrpError::Webhook(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            debug!(url = %self.url, status = %status, "Webhook delivered");
            Ok(())
        } else {
            Err(DrpError::Webhook(format!(
                "{} returned {status}",
                self.url
            )))
        }
    }

    fn describe(&self) -> String {
        format!("webhook {}", self.url)
    }
}

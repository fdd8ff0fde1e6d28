//! Critical alerts delivered to an HTTP webhook.

use std::time::Duration;

use async_trait::async_trait;
use saga::{AlertSender, CriticalAlert, EscalationError};

/// Upper bound on one webhook delivery.
pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Posts each [`CriticalAlert`] as JSON to a fixed URL.
///
/// Transport errors and non-success statuses surface as
/// [`EscalationError::SendFailed`]; the escalator logs them and moves on.
pub struct WebhookAlertSender {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSender {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        Self::with_timeout(url, DEFAULT_WEBHOOK_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl AlertSender for WebhookAlertSender {
    async fn send(&self, alert: &CriticalAlert) -> Result<(), EscalationError> {
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| EscalationError::SendFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EscalationError::SendFailed(format!(
                "webhook {} answered {status}",
                self.url
            )));
        }

        tracing::info!(channel = %alert.channel, title = %alert.title, "critical alert delivered");
        Ok(())
    }
}

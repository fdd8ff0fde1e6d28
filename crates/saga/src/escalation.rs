//! Dead-letter and operator alert escalation for sagas whose compensation failed.
//!
//! Escalation is best-effort. Publish and send failures are logged and
//! swallowed so an alerting outage never masks the original saga failure.
//! Both collaborators are optional; without them escalation is a log line.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use common::SagaId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

/// Severity carried by every saga alert.
pub const ALERT_LEVEL_CRITICAL: &str = "CRITICAL";

/// Errors raised by escalation channels.
#[derive(Debug, Error)]
pub enum EscalationError {
    #[error("Failed to publish dead letter: {0}")]
    PublishFailed(String),

    #[error("Failed to send alert: {0}")]
    SendFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Everything the orchestrator knows about a saga that could not be compensated.
#[derive(Debug, Clone)]
pub struct EscalationReport {
    pub saga_id: SagaId,
    pub saga_type: String,
    /// The full declared step list of the saga type.
    pub declared_steps: Vec<String>,
    pub error_details: String,
    pub snapshot: serde_json::Value,
    pub participants: BTreeMap<String, String>,
}

/// Durable record of a saga requiring manual reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    pub saga_id: String,
    pub saga_type: String,
    pub failed_steps: Vec<String>,
    pub error_details: String,
    /// Serialized context snapshot.
    pub payload: String,
    pub requires_manual_intervention: bool,
}

impl DeadLetterMessage {
    /// Builds the dead letter for a report.
    pub fn from_report(report: &EscalationReport) -> Result<Self, EscalationError> {
        Ok(Self {
            saga_id: report.saga_id.to_string(),
            saga_type: report.saga_type.clone(),
            failed_steps: report.declared_steps.clone(),
            error_details: report.error_details.clone(),
            payload: serde_json::to_string(&report.snapshot)?,
            requires_manual_intervention: true,
        })
    }
}

/// Real-time operator notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalAlert {
    pub channel: String,
    pub title: String,
    pub message: String,
    pub level: String,
    pub metadata: BTreeMap<String, String>,
}

impl CriticalAlert {
    /// Builds the alert for a report, addressed to `channel`.
    pub fn from_report(channel: &str, report: &EscalationReport) -> Self {
        let participants = report
            .participants
            .iter()
            .map(|(role, id)| format!("{role}={id}"))
            .collect::<Vec<_>>()
            .join(", ");

        let mut metadata = report.participants.clone();
        metadata.insert("sagaId".to_string(), report.saga_id.to_string());
        metadata.insert("sagaType".to_string(), report.saga_type.clone());
        metadata.insert("error".to_string(), report.error_details.clone());

        Self {
            channel: channel.to_string(),
            title: format!("{} compensation failed", report.saga_type),
            message: format!(
                "Saga {} ({}) could not be compensated and requires manual intervention. \
                 Participants: [{}]. Error: {}",
                report.saga_id, report.saga_type, participants, report.error_details
            ),
            level: ALERT_LEVEL_CRITICAL.to_string(),
            metadata,
        }
    }
}

/// Publishes dead letters to a durable destination.
#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    async fn publish(&self, message: &DeadLetterMessage) -> Result<(), EscalationError>;
}

/// Delivers alerts to an operator channel.
#[async_trait]
pub trait AlertSender: Send + Sync {
    async fn send(&self, alert: &CriticalAlert) -> Result<(), EscalationError>;
}

/// Fans a failed saga out to the dead-letter publisher and the alert sender.
pub struct Escalator {
    dead_letters: Option<Arc<dyn DeadLetterPublisher>>,
    alerts: Option<Arc<dyn AlertSender>>,
    channel: String,
}

impl Escalator {
    /// Creates an escalator with no collaborators, alerting on `channel`.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            dead_letters: None,
            alerts: None,
            channel: channel.into(),
        }
    }

    /// Sets the dead-letter publisher.
    pub fn with_dead_letter_publisher(mut self, publisher: Arc<dyn DeadLetterPublisher>) -> Self {
        self.dead_letters = Some(publisher);
        self
    }

    /// Sets the alert sender.
    pub fn with_alert_sender(mut self, sender: Arc<dyn AlertSender>) -> Self {
        self.alerts = Some(sender);
        self
    }

    /// Publishes the dead letter and sends the alert concurrently. Never fails.
    #[tracing::instrument(skip(self, report), fields(saga_id = %report.saga_id, saga_type = %report.saga_type))]
    pub async fn escalate(&self, report: &EscalationReport) {
        metrics::counter!("saga_escalations_total").increment(1);
        tokio::join!(self.publish_dead_letter(report), self.send_alert(report));
    }

    async fn publish_dead_letter(&self, report: &EscalationReport) {
        let Some(publisher) = &self.dead_letters else {
            tracing::error!(
                error = %report.error_details,
                "no dead-letter publisher configured; saga requires manual intervention"
            );
            return;
        };

        let result = match DeadLetterMessage::from_report(report) {
            Ok(message) => publisher.publish(&message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            metrics::counter!("saga_escalation_failures_total", "channel" => "dead_letter")
                .increment(1);
            tracing::error!(error = %e, "failed to publish dead letter");
        }
    }

    async fn send_alert(&self, report: &EscalationReport) {
        let Some(sender) = &self.alerts else {
            tracing::error!(
                error = %report.error_details,
                "no alert sender configured; saga requires manual intervention"
            );
            return;
        };

        let alert = CriticalAlert::from_report(&self.channel, report);
        if let Err(e) = sender.send(&alert).await {
            metrics::counter!("saga_escalation_failures_total", "channel" => "alert").increment(1);
            tracing::error!(error = %e, "failed to send critical alert");
        }
    }
}

/// Dead-letter publisher that keeps messages in memory, for testing.
#[derive(Clone, Default)]
pub struct RecordingDeadLetterPublisher {
    messages: Arc<RwLock<Vec<DeadLetterMessage>>>,
    fail_on_publish: Arc<AtomicBool>,
}

impl RecordingDeadLetterPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the publisher to fail.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    /// Returns the published messages.
    pub async fn messages(&self) -> Vec<DeadLetterMessage> {
        self.messages.read().await.clone()
    }
}

#[async_trait]
impl DeadLetterPublisher for RecordingDeadLetterPublisher {
    async fn publish(&self, message: &DeadLetterMessage) -> Result<(), EscalationError> {
        if self.fail_on_publish.load(Ordering::SeqCst) {
            return Err(EscalationError::PublishFailed("injected failure".to_string()));
        }
        self.messages.write().await.push(message.clone());
        Ok(())
    }
}

/// Alert sender that keeps alerts in memory, for testing.
#[derive(Clone, Default)]
pub struct RecordingAlertSender {
    alerts: Arc<RwLock<Vec<CriticalAlert>>>,
    fail_on_send: Arc<AtomicBool>,
}

impl RecordingAlertSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the sender to fail.
    pub fn set_fail_on_send(&self, fail: bool) {
        self.fail_on_send.store(fail, Ordering::SeqCst);
    }

    /// Returns the sent alerts.
    pub async fn alerts(&self) -> Vec<CriticalAlert> {
        self.alerts.read().await.clone()
    }
}

#[async_trait]
impl AlertSender for RecordingAlertSender {
    async fn send(&self, alert: &CriticalAlert) -> Result<(), EscalationError> {
        if self.fail_on_send.load(Ordering::SeqCst) {
            return Err(EscalationError::SendFailed("injected failure".to_string()));
        }
        self.alerts.write().await.push(alert.clone());
        Ok(())
    }
}

//! Outbox poller: the slow path that republishes whatever capture missed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use store::{OutboxReader, OutboxRecord};
use tokio::time::MissedTickBehavior;

use crate::broker::{BrokerMessage, MessageBroker};
use crate::error::Result;
use crate::registry::{CURRENT_SCHEMA_VERSION, EventRegistry};

/// Default time between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of rows fetched per poll.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Counts from one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub fetched: usize,
    pub relayed: usize,
    /// Rows that cannot be decoded. They stay unprocessed.
    pub skipped: usize,
    /// Rows whose publish failed. They are retried on the next poll.
    pub failed: usize,
}

/// Periodically relays unprocessed outbox rows to the broker.
pub struct OutboxPoller<R, B> {
    outbox: Arc<R>,
    broker: Arc<B>,
    registry: Arc<EventRegistry>,
    poll_interval: Duration,
    batch_size: usize,
    retention: Option<chrono::Duration>,
}

impl<R: OutboxReader, B: MessageBroker> OutboxPoller<R, B> {
    pub fn new(outbox: Arc<R>, broker: Arc<B>, registry: Arc<EventRegistry>) -> Self {
        Self {
            outbox,
            broker,
            registry,
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            retention: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Purges processed rows older than `retention` after every poll.
    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Relays one batch of unprocessed rows, oldest first.
    #[tracing::instrument(skip(self))]
    pub async fn poll_once(&self) -> Result<PollReport> {
        let rows = self.outbox.fetch_unprocessed(self.batch_size).await?;
        let mut report = PollReport {
            fetched: rows.len(),
            ..PollReport::default()
        };

        for row in &rows {
            match self.relay(row).await {
                Ok(()) => report.relayed += 1,
                Err(e) if e.is_unrelayable() => {
                    report.skipped += 1;
                    metrics::counter!("relay_events_skipped_total", "path" => "poller")
                        .increment(1);
                    tracing::warn!(outbox_id = %row.id, error = %e, "outbox row skipped");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(outbox_id = %row.id, error = %e, "outbox row relay failed");
                }
            }
        }

        metrics::counter!("relay_events_relayed_total", "path" => "poller")
            .increment(report.relayed as u64);
        if report.relayed > 0 {
            tracing::info!(relayed = report.relayed, "outbox rows relayed by poller");
        }
        Ok(report)
    }

    async fn relay(&self, row: &OutboxRecord) -> Result<()> {
        let descriptor = self
            .registry
            .resolve(&row.event.event_type, CURRENT_SCHEMA_VERSION)?;
        let event = descriptor.decode(&row.event.payload)?;

        self.broker
            .publish(BrokerMessage::relayed(
                &descriptor.topic,
                row.event.saga_id.as_str(),
                &event,
            )?)
            .await?;

        // A concurrent capture delivery may have marked it first
        if !self.outbox.mark_processed_by_id(row.id).await? {
            tracing::debug!(outbox_id = %row.id, "outbox row already processed");
        }
        Ok(())
    }

    async fn housekeeping(&self) -> Result<()> {
        let pending = self.outbox.count_unprocessed().await?;
        metrics::gauge!("outbox_unprocessed").set(pending as f64);

        if let Some(retention) = self.retention {
            let purged = self.outbox.purge_processed(Utc::now() - retention).await?;
            if purged > 0 {
                tracing::info!(purged, "processed outbox rows purged");
            }
        }
        Ok(())
    }

    /// Polls every interval until `shutdown` resolves.
    pub async fn run<F: Future<Output = ()>>(&self, shutdown: F) {
        let mut shutdown = std::pin::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = self.poll_interval.as_millis() as u64,
            batch_size = self.batch_size,
            "outbox poller started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::error!(error = %e, "outbox poll failed");
                    }
                    if let Err(e) = self.housekeeping().await {
                        tracing::error!(error = %e, "outbox housekeeping failed");
                    }
                }
            }
        }

        tracing::info!("outbox poller stopped");
    }
}

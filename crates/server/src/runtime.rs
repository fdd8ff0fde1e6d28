//! Composition of the saga core with its relays.

use std::sync::Arc;

use relay::{
    BrokerDeadLetterPublisher, CaptureConsumer, EventRegistry, InMemoryBroker, OutboxPoller,
    subscription_feed,
};
use saga::{Escalator, FriendRequestSaga, MessageSaga};
use store::{MessageStore, OutboxReader, RelationalStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::alert::WebhookAlertSender;
use crate::config::Config;
use crate::error::ServerError;

/// Sagas and relays sharing one relational store and one broker.
///
/// The request-handling layer drives [`ChatRuntime::message_saga`] and
/// [`ChatRuntime::friend_request_saga`]; the relays started by
/// [`ChatRuntime::spawn_relays`] move their outbox rows onto the broker.
pub struct ChatRuntime<S: RelationalStore> {
    store: Arc<S>,
    broker: Arc<InMemoryBroker>,
    message_saga: MessageSaga<S>,
    friend_request_saga: FriendRequestSaga<S>,
    capture: Arc<CaptureConsumer<S, InMemoryBroker>>,
    poller: Arc<OutboxPoller<S, InMemoryBroker>>,
}

impl<S> ChatRuntime<S>
where
    S: RelationalStore + OutboxReader + 'static,
{
    /// Wires everything from `config`.
    ///
    /// Fails only if the alert webhook client cannot be built.
    pub fn new<M: MessageStore + 'static>(
        config: &Config,
        messages: Arc<M>,
        store: Arc<S>,
        broker: Arc<InMemoryBroker>,
    ) -> Result<Self, ServerError> {
        let mut escalator = Escalator::new(config.alert_channel.as_str()).with_dead_letter_publisher(
            Arc::new(BrokerDeadLetterPublisher::new(
                Arc::clone(&broker),
                config.dead_letter_topic.as_str(),
            )),
        );
        match &config.alert_webhook_url {
            Some(url) => {
                escalator = escalator.with_alert_sender(Arc::new(WebhookAlertSender::new(url)?));
            }
            None => tracing::warn!("ALERT_WEBHOOK_URL not set; critical alerts are only logged"),
        }
        let escalator = Arc::new(escalator);

        let message_saga = MessageSaga::new(messages, Arc::clone(&store))
            .with_escalator(Arc::clone(&escalator));
        let friend_request_saga =
            FriendRequestSaga::new(Arc::clone(&store)).with_escalator(escalator);

        let registry = Arc::new(EventRegistry::chat_events(&config.capture_topic_prefix));
        let capture = Arc::new(CaptureConsumer::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            Arc::clone(&registry),
            config.capture_topic_prefix.as_str(),
        ));

        let mut poller = OutboxPoller::new(Arc::clone(&store), Arc::clone(&broker), registry)
            .with_poll_interval(config.outbox_poll_interval)
            .with_batch_size(config.outbox_poll_batch_size);
        if let Some(hours) = config.outbox_retention_hours {
            poller = poller.with_retention(chrono::Duration::hours(i64::from(hours)));
        }

        Ok(Self {
            store,
            broker,
            message_saga,
            friend_request_saga,
            capture,
            poller: Arc::new(poller),
        })
    }

    pub fn message_saga(&self) -> &MessageSaga<S> {
        &self.message_saga
    }

    pub fn friend_request_saga(&self) -> &FriendRequestSaga<S> {
        &self.friend_request_saga
    }

    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }

    /// The outbox as seen by the HTTP handlers.
    pub fn outbox(&self) -> Arc<dyn OutboxReader> {
        Arc::clone(&self.store) as Arc<dyn OutboxReader>
    }

    /// Starts the capture consumer and the outbox poller.
    ///
    /// Both stop once `shutdown` observes `true` or its sender is dropped.
    pub fn spawn_relays(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let capture = Arc::clone(&self.capture);
        let feed = subscription_feed(self.broker.subscribe());
        let stop = stopped(shutdown.clone());
        let capture_task = tokio::spawn(async move { capture.run(feed, stop).await });

        let poller = Arc::clone(&self.poller);
        let stop = stopped(shutdown.clone());
        let poller_task = tokio::spawn(async move { poller.run(stop).await });

        vec![capture_task, poller_task]
    }
}

async fn stopped(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

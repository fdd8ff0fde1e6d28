use std::sync::Arc;

use async_trait::async_trait;
use common::SagaId;
use domain::{ChatMessage, MentionEvent, MessageSentEvent};
use store::{MessageStore, RelationalStore};

use super::MessageSagaContext;
use crate::error::{Result, SagaError};
use crate::outbox_writer::OutboxWriter;
use crate::step::SagaStep;

/// Step 1: write the message document and record its ID.
pub struct SaveMessageStep<M> {
    messages: Arc<M>,
}

impl<M> SaveMessageStep<M> {
    pub const NAME: &'static str = "SaveMessageStep";

    pub fn new(messages: Arc<M>) -> Self {
        Self { messages }
    }
}

#[async_trait]
impl<M, S> SagaStep<MessageSagaContext<S>> for SaveMessageStep<M>
where
    M: MessageStore + 'static,
    S: RelationalStore + 'static,
{
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn execute(&self, ctx: &mut MessageSagaContext<S>) -> Result<()> {
        let mut message = ctx.message.clone();
        message.mark_read_by_sender();

        let id = self.messages.insert(&message).await?;
        message.id = Some(id);

        tracing::debug!(saga_id = %ctx.saga.saga_id, message_id = %id, "message saved");
        ctx.saved_message = Some(message);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut MessageSagaContext<S>) -> Result<()> {
        let Some(id) = ctx.saved_message.as_ref().and_then(|m| m.id) else {
            return Ok(());
        };

        if !self.messages.delete(id).await? {
            tracing::debug!(message_id = %id, "message already absent");
        }
        Ok(())
    }
}

/// Step 2: stage the room metadata update in a new relational transaction.
pub struct UpdateChatRoomStep<S> {
    store: Arc<S>,
}

impl<S> UpdateChatRoomStep<S> {
    pub const NAME: &'static str = "UpdateChatRoomStep";

    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: RelationalStore + 'static> SagaStep<MessageSagaContext<S>> for UpdateChatRoomStep<S> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn execute(&self, ctx: &mut MessageSagaContext<S>) -> Result<()> {
        let message = ctx
            .saved_message
            .as_ref()
            .ok_or_else(|| SagaError::StepFailed {
                step: Self::NAME.to_string(),
                reason: "message has not been saved".to_string(),
            })?;
        let message_id = message.id.ok_or(domain::DomainError::MessageNotPersisted)?;

        let room = self
            .store
            .find_room(message.room_id)
            .await?
            .ok_or(SagaError::RoomNotFound(message.room_id))?;

        let mut updated = room.with_new_message(message)?;
        updated.mark_read(message.sender_id, message_id, message.sent_at)?;

        let mut tx = self.store.begin().await?;
        self.store.save_room(&mut tx, &updated).await?;

        ctx.room_before = Some(room);
        ctx.room_after = Some(updated);
        ctx.tx = Some(tx);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut MessageSagaContext<S>) -> Result<()> {
        // An uncommitted update never became visible
        if let Some(tx) = ctx.tx.take()
            && let Err(e) = self.store.rollback(tx).await
        {
            tracing::warn!(error = %e, "rollback of room transaction failed");
        }

        let (Some(before), Some(after)) = (&ctx.room_before, &ctx.room_after) else {
            return Ok(());
        };

        // Restore the snapshot only while the stored room is still our update;
        // anything else was never committed or has since been superseded.
        let current = self.store.find_room(before.id).await?;
        if current.as_ref() != Some(after) {
            tracing::debug!(
                saga_id = %ctx.saga.saga_id,
                room_id = %before.id,
                "room no longer holds this saga's update, snapshot not restored"
            );
            return Ok(());
        }

        let mut tx = self.store.begin().await?;
        self.store.save_room(&mut tx, before).await?;
        self.store.commit(tx).await?;
        Ok(())
    }
}

/// Step 3: write the message events to the outbox and commit step 2's transaction.
pub struct PublishMessageEventsStep<S> {
    store: Arc<S>,
}

impl<S> PublishMessageEventsStep<S> {
    pub const NAME: &'static str = "PublishMessageEventsStep";

    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: RelationalStore + 'static> PublishMessageEventsStep<S> {
    async fn write_events(
        &self,
        tx: &mut S::Tx,
        saga_id: &SagaId,
        message: Option<&ChatMessage>,
    ) -> Result<()> {
        let message = message.ok_or_else(|| SagaError::StepFailed {
            step: Self::NAME.to_string(),
            reason: "message has not been saved".to_string(),
        })?;
        let writer = OutboxWriter::new(self.store.as_ref());

        let sent = MessageSentEvent::from_message(message)?;
        writer.write(tx, saga_id, &sent).await?;

        if let Some(mention) = MentionEvent::from_message(message)? {
            writer.write(tx, saga_id, &mention).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<S: RelationalStore + 'static> SagaStep<MessageSagaContext<S>>
    for PublishMessageEventsStep<S>
{
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn execute(&self, ctx: &mut MessageSagaContext<S>) -> Result<()> {
        let mut tx = ctx
            .tx
            .take()
            .ok_or(SagaError::NoOpenTransaction { step: Self::NAME })?;

        let written = self
            .write_events(&mut tx, &ctx.saga.saga_id, ctx.saved_message.as_ref())
            .await;
        if let Err(e) = written {
            if let Err(rollback) = self.store.rollback(tx).await {
                tracing::warn!(error = %rollback, "rollback of room transaction failed");
            }
            return Err(e);
        }

        self.store.commit(tx).await?;
        Ok(())
    }

    async fn compensate(&self, ctx: &mut MessageSagaContext<S>) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let deleted = self
            .store
            .delete_outbox_events(&mut tx, &ctx.saga.saga_id)
            .await?;
        self.store.commit(tx).await?;

        tracing::debug!(saga_id = %ctx.saga.saga_id, deleted, "outbox events removed");
        Ok(())
    }
}

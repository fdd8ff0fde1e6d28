use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::{FriendRequestId, SagaId};
use domain::{FriendAddedEvent, Friendship};
use store::RelationalStore;

use super::FriendRequestSagaContext;
use crate::error::{Result, SagaError};
use crate::outbox_writer::OutboxWriter;
use crate::step::SagaStep;

/// Step 1: accept the pending request under an optimistic version check.
pub struct AcceptFriendRequestStep<S> {
    store: Arc<S>,
}

impl<S> AcceptFriendRequestStep<S> {
    pub const NAME: &'static str = "AcceptFriendRequestStep";

    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: RelationalStore + 'static> SagaStep<FriendRequestSagaContext<S>>
    for AcceptFriendRequestStep<S>
{
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn execute(&self, ctx: &mut FriendRequestSagaContext<S>) -> Result<()> {
        let mut request = self
            .store
            .find_friend_request(ctx.request_id)
            .await?
            .ok_or(SagaError::FriendRequestNotFound(ctx.request_id))?;

        let prior = request.accept(ctx.receiver_id, Utc::now())?;

        let mut tx = self.store.begin().await?;
        let version = self.store.update_friend_request(&mut tx, &request).await?;
        self.store.commit(tx).await?;

        tracing::debug!(request_id = %request.id, version, "friend request accepted");
        ctx.requester_id = Some(request.requester_id);
        ctx.prior = Some(prior);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut FriendRequestSagaContext<S>) -> Result<()> {
        let Some(prior) = ctx.prior else {
            return Ok(());
        };
        let Some(mut request) = self.store.find_friend_request(ctx.request_id).await? else {
            return Ok(());
        };
        if request.matches(&prior) {
            return Ok(());
        }

        request.restore(prior);
        let mut tx = self.store.begin().await?;
        self.store.update_friend_request(&mut tx, &request).await?;
        self.store.commit(tx).await?;

        tracing::debug!(request_id = %request.id, status = %prior.status, "friend request restored");
        Ok(())
    }
}

/// Step 2: stage both friendship records in a new relational transaction.
pub struct CreateFriendshipsStep<S> {
    store: Arc<S>,
}

impl<S> CreateFriendshipsStep<S> {
    pub const NAME: &'static str = "CreateFriendshipsStep";

    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: RelationalStore + 'static> SagaStep<FriendRequestSagaContext<S>>
    for CreateFriendshipsStep<S>
{
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn execute(&self, ctx: &mut FriendRequestSagaContext<S>) -> Result<()> {
        let requester_id = ctx.requester_id.ok_or_else(|| SagaError::StepFailed {
            step: Self::NAME.to_string(),
            reason: "friend request has not been accepted".to_string(),
        })?;

        let pair = Friendship::pair(requester_id, ctx.receiver_id, Utc::now());

        let mut tx = self.store.begin().await?;
        self.store.insert_friendships(&mut tx, &pair).await?;

        ctx.friendships = pair.to_vec();
        ctx.tx = Some(tx);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut FriendRequestSagaContext<S>) -> Result<()> {
        if let Some(tx) = ctx.tx.take()
            && let Err(e) = self.store.rollback(tx).await
        {
            tracing::warn!(error = %e, "rollback of friendship transaction failed");
        }

        let ids = ctx.friendship_ids();
        if ids.is_empty() {
            return Ok(());
        }

        let mut tx = self.store.begin().await?;
        let deleted = self.store.delete_friendships(&mut tx, &ids).await?;
        self.store.commit(tx).await?;

        tracing::debug!(saga_id = %ctx.saga.saga_id, deleted, "friendships removed");
        Ok(())
    }
}

/// Step 3: write one `FriendAddedEvent` per side and commit step 2's transaction.
pub struct PublishFriendEventsStep<S> {
    store: Arc<S>,
}

impl<S> PublishFriendEventsStep<S> {
    pub const NAME: &'static str = "PublishFriendEventsStep";

    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: RelationalStore + 'static> PublishFriendEventsStep<S> {
    async fn write_events(
        &self,
        tx: &mut S::Tx,
        saga_id: &SagaId,
        request_id: FriendRequestId,
        friendships: &[Friendship],
    ) -> Result<()> {
        let writer = OutboxWriter::new(self.store.as_ref());

        // Both events share a type, so each row is keyed by the user it addresses
        for friendship in friendships {
            let event = FriendAddedEvent::for_friendship(friendship, request_id);
            writer
                .write_scoped(tx, saga_id, &event, &friendship.user_id.to_string())
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<S: RelationalStore + 'static> SagaStep<FriendRequestSagaContext<S>>
    for PublishFriendEventsStep<S>
{
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn execute(&self, ctx: &mut FriendRequestSagaContext<S>) -> Result<()> {
        let mut tx = ctx
            .tx
            .take()
            .ok_or(SagaError::NoOpenTransaction { step: Self::NAME })?;

        let written = self
            .write_events(&mut tx, &ctx.saga.saga_id, ctx.request_id, &ctx.friendships)
            .await;
        if let Err(e) = written {
            if let Err(rollback) = self.store.rollback(tx).await {
                tracing::warn!(error = %rollback, "rollback of friendship transaction failed");
            }
            return Err(e);
        }

        self.store.commit(tx).await?;
        Ok(())
    }

    async fn compensate(&self, ctx: &mut FriendRequestSagaContext<S>) -> Result<()> {
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

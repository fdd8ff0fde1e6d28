//! Integration tests for the message and friend-request sagas.

use std::sync::Arc;
use std::time::Duration;

use common::{FriendRequestId, RoomId, UserId};
use domain::{ChatMessage, ChatRoom, FriendRequest, FriendRequestStatus};
use saga::friend_request::{AcceptFriendRequestStep, CreateFriendshipsStep};
use saga::message::{PublishMessageEventsStep, SaveMessageStep, UpdateChatRoomStep};
use saga::{
    Escalator, FriendRequestSaga, FriendRequestSagaContext, MessageSaga, MessageSagaContext,
    RecordingAlertSender, RecordingDeadLetterPublisher, RetryPolicy, SagaError, SagaState,
    SagaStep,
};
use store::{InMemoryMessageStore, InMemoryRelationalStore, MessageStore, RelationalStore};

struct TestHarness {
    messages: Arc<InMemoryMessageStore>,
    store: Arc<InMemoryRelationalStore>,
    dead_letters: RecordingDeadLetterPublisher,
    alerts: RecordingAlertSender,
}

impl TestHarness {
    fn new() -> Self {
        Self {
            messages: Arc::new(InMemoryMessageStore::new()),
            store: Arc::new(InMemoryRelationalStore::new()),
            dead_letters: RecordingDeadLetterPublisher::new(),
            alerts: RecordingAlertSender::new(),
        }
    }

    fn escalator(&self) -> Arc<Escalator> {
        Arc::new(
            Escalator::new("#saga-alerts")
                .with_dead_letter_publisher(Arc::new(self.dead_letters.clone()))
                .with_alert_sender(Arc::new(self.alerts.clone())),
        )
    }

    fn message_saga(&self) -> MessageSaga<InMemoryRelationalStore> {
        MessageSaga::new(Arc::clone(&self.messages), Arc::clone(&self.store))
            .with_escalator(self.escalator())
    }

    fn friend_saga(&self) -> FriendRequestSaga<InMemoryRelationalStore> {
        FriendRequestSaga::new(Arc::clone(&self.store)).with_escalator(self.escalator())
    }

    async fn seed_room(&self, members: &[UserId]) -> ChatRoom {
        let room = ChatRoom::new("general", members.iter().copied());
        self.store.insert_room(room.clone()).await;
        room
    }

    async fn seed_request(&self) -> FriendRequest {
        let request = FriendRequest::new(UserId::new(), UserId::new());
        self.store.insert_friend_request(request.clone()).await;
        request
    }

    async fn stored_request(&self, id: FriendRequestId) -> FriendRequest {
        self.store.find_friend_request(id).await.unwrap().unwrap()
    }
}

// ============================================================================
// Message saga
// ============================================================================

#[tokio::test]
async fn message_saga_happy_path() {
    let h = TestHarness::new();
    let alice = UserId::new();
    let bob = UserId::new();
    let room = h.seed_room(&[alice, bob]).await;

    let ctx = h
        .message_saga()
        .execute(ChatMessage::new(room.id, alice, "hello bob"))
        .await
        .unwrap();

    assert_eq!(ctx.saga.state, SagaState::Completed);
    assert_eq!(
        ctx.saga.executed_steps,
        vec![
            SaveMessageStep::<InMemoryMessageStore>::NAME,
            UpdateChatRoomStep::<InMemoryRelationalStore>::NAME,
            PublishMessageEventsStep::<InMemoryRelationalStore>::NAME,
        ]
    );

    let message_id = ctx.saved_message.as_ref().and_then(|m| m.id).unwrap();
    let stored = h.messages.find(message_id).await.unwrap().unwrap();
    assert!(stored.is_read_by(alice));

    let updated = h.store.find_room(room.id).await.unwrap().unwrap();
    assert_eq!(updated.message_count, 1);
    let last = updated.last_message.as_ref().unwrap();
    assert_eq!(last.message_id, message_id);
    assert_eq!(last.preview, "hello bob");
    assert_eq!(
        updated.member(alice).unwrap().last_read_message_id,
        Some(message_id)
    );
    assert_eq!(updated.member(bob).unwrap().last_read_message_id, None);

    let rows = h.store.outbox_rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].event.simple_event_type(), "MessageSentEvent");
    assert_eq!(rows[0].event.saga_id, ctx.saga.saga_id);
    assert!(rows[0].is_pending());
}

#[tokio::test]
async fn message_with_mentions_writes_mention_event() {
    let h = TestHarness::new();
    let alice = UserId::new();
    let bob = UserId::new();
    let room = h.seed_room(&[alice, bob]).await;

    let ctx = h
        .message_saga()
        .execute(ChatMessage::new(room.id, alice, "hi @bob").with_mentions([bob]))
        .await
        .unwrap();

    assert!(ctx.saga.is_completed());
    let mut types: Vec<_> = h
        .store
        .outbox_rows()
        .await
        .iter()
        .map(|r| r.event.simple_event_type().to_string())
        .collect();
    types.sort();
    assert_eq!(types, vec!["MentionEvent", "MessageSentEvent"]);
}

#[tokio::test]
async fn message_saga_outbox_failure_compensates() {
    let h = TestHarness::new();
    let alice = UserId::new();
    let room = h.seed_room(&[alice]).await;
    h.store.set_fail_on_outbox_insert(true);

    let ctx = h
        .message_saga()
        .execute(ChatMessage::new(room.id, alice, "lost"))
        .await
        .unwrap();

    assert_eq!(ctx.saga.state, SagaState::Compensated);
    assert!(matches!(ctx.saga.error, Some(SagaError::Store(_))));
    assert_eq!(ctx.saga.executed_steps.len(), 2);

    // Message deleted, room untouched, no events
    assert_eq!(h.messages.message_count().await, 0);
    let stored = h.store.find_room(room.id).await.unwrap().unwrap();
    assert_eq!(stored, room);
    assert!(h.store.outbox_rows().await.is_empty());
    assert!(h.dead_letters.messages().await.is_empty());
}

#[tokio::test]
async fn message_saga_unknown_room_deletes_message() {
    let h = TestHarness::new();

    let ctx = h
        .message_saga()
        .execute(ChatMessage::new(RoomId::new(), UserId::new(), "nowhere"))
        .await
        .unwrap();

    assert_eq!(ctx.saga.state, SagaState::Compensated);
    assert!(matches!(ctx.saga.error, Some(SagaError::RoomNotFound(_))));
    assert_eq!(h.messages.message_count().await, 0);
    assert!(
        h.store
            .outbox_rows()
            .await
            .iter()
            .all(|row| row.event.saga_id != ctx.saga.saga_id)
    );
    assert!(h.store.outbox_events_for_saga(&ctx.saga.saga_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn message_saga_sender_outside_room_fails_step_two() {
    let h = TestHarness::new();
    let room = h.seed_room(&[UserId::new()]).await;

    let ctx = h
        .message_saga()
        .execute(ChatMessage::new(room.id, UserId::new(), "intruder"))
        .await
        .unwrap();

    assert_eq!(ctx.saga.state, SagaState::Compensated);
    assert!(matches!(ctx.saga.error, Some(SagaError::Domain(_))));
    assert_eq!(h.messages.message_count().await, 0);
}

#[tokio::test]
async fn message_saga_failed_compensation_escalates() {
    let h = TestHarness::new();
    let alice = UserId::new();
    let room = h.seed_room(&[alice]).await;
    h.store.set_fail_on_outbox_insert(true);
    h.messages.set_fail_on_delete(true);

    let ctx = h
        .message_saga()
        .execute(ChatMessage::new(room.id, alice, "stuck"))
        .await
        .unwrap();

    assert_eq!(ctx.saga.state, SagaState::Failed);
    assert_eq!(h.messages.message_count().await, 1);

    let letters = h.dead_letters.messages().await;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].saga_type, "MessageSaga");
    assert!(letters[0].error_details.contains("SaveMessageStep"));
    assert_eq!(h.alerts.alerts().await.len(), 1);
}

#[tokio::test]
async fn compensation_can_run_twice() {
    let h = TestHarness::new();
    let alice = UserId::new();
    let room = h.seed_room(&[alice]).await;
    h.store.set_fail_on_outbox_insert(true);

    let mut ctx = h
        .message_saga()
        .execute(ChatMessage::new(room.id, alice, "again"))
        .await
        .unwrap();
    assert_eq!(ctx.saga.state, SagaState::Compensated);

    let update = UpdateChatRoomStep::new(Arc::clone(&h.store));
    let save = SaveMessageStep::new(Arc::clone(&h.messages));
    update.compensate(&mut ctx).await.unwrap();
    save.compensate(&mut ctx).await.unwrap();

    assert_eq!(h.store.find_room(room.id).await.unwrap().unwrap(), room);
    assert_eq!(h.messages.message_count().await, 0);
}

#[tokio::test]
async fn room_compensation_restores_snapshot_over_own_update() {
    let h = TestHarness::new();
    let alice = UserId::new();
    let room = h.seed_room(&[alice]).await;

    let save = SaveMessageStep::new(Arc::clone(&h.messages));
    let update = UpdateChatRoomStep::new(Arc::clone(&h.store));
    let mut ctx = MessageSagaContext::<InMemoryRelationalStore>::new(ChatMessage::new(
        room.id, alice, "undo me",
    ));
    save.execute(&mut ctx).await.unwrap();
    update.execute(&mut ctx).await.unwrap();
    let tx = ctx.tx.take().unwrap();
    h.store.commit(tx).await.unwrap();
    assert_eq!(h.store.find_room(room.id).await.unwrap(), ctx.room_after);

    update.compensate(&mut ctx).await.unwrap();

    assert_eq!(h.store.find_room(room.id).await.unwrap().unwrap(), room);
}

#[tokio::test]
async fn room_compensation_keeps_later_update_from_another_saga() {
    let h = TestHarness::new();
    let alice = UserId::new();
    let bob = UserId::new();
    let room = h.seed_room(&[alice, bob]).await;

    let save = SaveMessageStep::new(Arc::clone(&h.messages));
    let update = UpdateChatRoomStep::new(Arc::clone(&h.store));
    let mut ctx = MessageSagaContext::<InMemoryRelationalStore>::new(ChatMessage::new(
        room.id, alice, "first",
    ));
    save.execute(&mut ctx).await.unwrap();
    update.execute(&mut ctx).await.unwrap();
    let tx = ctx.tx.take().unwrap();
    h.store.commit(tx).await.unwrap();

    // A second message lands on the room before the first saga compensates
    let other = h
        .message_saga()
        .execute(ChatMessage::new(room.id, bob, "second"))
        .await
        .unwrap();
    assert_eq!(other.saga.state, SagaState::Completed);
    let latest = h.store.find_room(room.id).await.unwrap().unwrap();
    assert_ne!(Some(&latest), ctx.room_after.as_ref());

    update.compensate(&mut ctx).await.unwrap();

    assert_eq!(h.store.find_room(room.id).await.unwrap().unwrap(), latest);
}

#[tokio::test]
async fn publish_without_open_transaction_fails() {
    let h = TestHarness::new();
    let step = PublishMessageEventsStep::new(Arc::clone(&h.store));
    let mut ctx = MessageSagaContext::<InMemoryRelationalStore>::new(ChatMessage::new(
        RoomId::new(),
        UserId::new(),
        "orphan",
    ));

    let err = step.execute(&mut ctx).await.unwrap_err();
    assert!(matches!(err, SagaError::NoOpenTransaction { .. }));
    assert!(h.store.outbox_rows().await.is_empty());
}

// ============================================================================
// Friend-request saga
// ============================================================================

#[tokio::test]
async fn friend_request_saga_happy_path() {
    let h = TestHarness::new();
    let request = h.seed_request().await;

    let ctx = h
        .friend_saga()
        .accept(request.id, request.receiver_id)
        .await
        .unwrap();

    assert_eq!(ctx.saga.state, SagaState::Completed);
    assert_eq!(ctx.requester_id, Some(request.requester_id));

    let stored = h.stored_request(request.id).await;
    assert_eq!(stored.status, FriendRequestStatus::Accepted);
    assert!(stored.responded_at.is_some());
    assert_eq!(stored.version, request.version + 1);

    assert_eq!(h.store.friendship_count().await, 2);
    let of_requester = h
        .store
        .find_friendships_of(request.requester_id)
        .await
        .unwrap();
    assert_eq!(of_requester.len(), 1);
    assert_eq!(of_requester[0].friend_id, request.receiver_id);

    let rows = h.store.outbox_rows().await;
    assert_eq!(rows.len(), 2);
    assert!(
        rows.iter()
            .all(|r| r.event.simple_event_type() == "FriendAddedEvent")
    );
    let mut keys: Vec<_> = rows
        .iter()
        .map(|r| r.event.idempotency_key.as_str().to_string())
        .collect();
    keys.sort();
    let mut expected = vec![
        format!(
            "{}FriendAddedEvent:{}",
            ctx.saga.saga_id, request.requester_id
        ),
        format!(
            "{}FriendAddedEvent:{}",
            ctx.saga.saga_id, request.receiver_id
        ),
    ];
    expected.sort();
    assert_eq!(keys, expected);
}

#[tokio::test]
async fn friendship_failure_restores_pending_request() {
    let h = TestHarness::new();
    let request = h.seed_request().await;
    h.store.set_fail_on_insert_friendships(true);

    let ctx = h
        .friend_saga()
        .accept(request.id, request.receiver_id)
        .await
        .unwrap();

    assert_eq!(ctx.saga.state, SagaState::Compensated);
    assert_eq!(
        ctx.saga.executed_steps,
        vec![AcceptFriendRequestStep::<InMemoryRelationalStore>::NAME]
    );

    let stored = h.stored_request(request.id).await;
    assert_eq!(stored.status, FriendRequestStatus::Pending);
    assert_eq!(stored.responded_at, None);
    assert_eq!(h.store.friendship_count().await, 0);
}

#[tokio::test]
async fn friend_events_failure_with_stuck_friendships_escalates() {
    let h = TestHarness::new();
    let request = h.seed_request().await;
    h.store.set_fail_on_outbox_insert(true);
    h.store.set_fail_on_delete_friendships(true);

    let ctx = h
        .friend_saga()
        .accept(request.id, request.receiver_id)
        .await
        .unwrap();

    assert_eq!(ctx.saga.state, SagaState::Failed);

    // The shared transaction was rolled back, so nothing leaked
    assert_eq!(h.store.friendship_count().await, 0);
    assert!(h.store.outbox_rows().await.is_empty());
    assert_eq!(
        h.stored_request(request.id).await.status,
        FriendRequestStatus::Pending
    );

    let letters = h.dead_letters.messages().await;
    assert_eq!(letters.len(), 1);
    let letter = &letters[0];
    assert_eq!(letter.saga_id, ctx.saga.saga_id.to_string());
    assert_eq!(letter.saga_type, "FriendRequestSaga");
    assert_eq!(
        letter.failed_steps,
        vec![
            "AcceptFriendRequestStep",
            "CreateFriendshipsStep",
            "PublishFriendEventsStep",
        ]
    );
    assert!(letter.requires_manual_intervention);
    assert!(
        letter
            .error_details
            .contains(CreateFriendshipsStep::<InMemoryRelationalStore>::NAME)
    );

    let payload: serde_json::Value = serde_json::from_str(&letter.payload).unwrap();
    assert_eq!(payload["requestId"], request.id.to_string());
    assert_eq!(payload["friendshipIds"].as_array().unwrap().len(), 2);

    let alerts = h.alerts.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].level, "CRITICAL");
    assert_eq!(
        alerts[0].metadata.get("requesterId"),
        Some(&request.requester_id.to_string())
    );
}

#[tokio::test]
async fn wrong_receiver_is_not_retried() {
    let h = TestHarness::new();
    let request = h.seed_request().await;

    let ctx = h
        .friend_saga()
        .accept(request.id, UserId::new())
        .await
        .unwrap();

    assert_eq!(ctx.saga.state, SagaState::Compensated);
    assert!(matches!(ctx.saga.error, Some(SagaError::Domain(_))));
    assert!(ctx.saga.executed_steps.is_empty());
}

#[tokio::test]
async fn missing_request_is_reported() {
    let h = TestHarness::new();

    let ctx = h
        .friend_saga()
        .accept(FriendRequestId::new(), UserId::new())
        .await
        .unwrap();

    assert!(matches!(
        ctx.saga.error,
        Some(SagaError::FriendRequestNotFound(_))
    ));
}

#[tokio::test]
async fn already_accepted_request_is_rejected() {
    let h = TestHarness::new();
    let request = h.seed_request().await;
    let saga = h.friend_saga();

    let first = saga.accept(request.id, request.receiver_id).await.unwrap();
    assert!(first.saga.is_completed());

    let second = saga.accept(request.id, request.receiver_id).await.unwrap();
    assert_eq!(second.saga.state, SagaState::Compensated);
    assert_eq!(h.store.friendship_count().await, 2);
    assert_eq!(h.store.outbox_rows().await.len(), 2);
}

// ============================================================================
// Version-conflict retry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn version_conflict_is_retried_until_success() {
    let h = TestHarness::new();
    let request = h.seed_request().await;
    h.store.set_version_conflicts(1);

    let start = tokio::time::Instant::now();
    let ctx = h
        .friend_saga()
        .accept(request.id, request.receiver_id)
        .await
        .unwrap();

    assert!(ctx.saga.is_completed());
    assert_eq!(h.store.pending_version_conflicts(), 0);
    assert_eq!(h.store.friendship_count().await, 2);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(10));
    assert!(elapsed < Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn version_conflict_retries_are_bounded() {
    let h = TestHarness::new();
    let request = h.seed_request().await;
    h.store.set_version_conflicts(5);

    let start = tokio::time::Instant::now();
    let ctx = h
        .friend_saga()
        .accept(request.id, request.receiver_id)
        .await
        .unwrap();

    assert_eq!(ctx.saga.state, SagaState::Compensated);
    assert!(ctx.saga.error.as_ref().unwrap().is_version_conflict());
    // Three attempts consumed three of the five injected conflicts
    assert_eq!(h.store.pending_version_conflicts(), 2);
    assert!(start.elapsed() >= Duration::from_millis(110));
    assert_eq!(
        h.stored_request(request.id).await.status,
        FriendRequestStatus::Pending
    );
    assert!(h.dead_letters.messages().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn custom_retry_policy_sets_attempt_bound() {
    let h = TestHarness::new();
    let request = h.seed_request().await;
    h.store.set_version_conflicts(5);

    let saga = h
        .friend_saga()
        .with_retry_policy(RetryPolicy::new(vec![Duration::ZERO]));
    let ctx = saga.accept(request.id, request.receiver_id).await.unwrap();

    assert!(ctx.saga.error.as_ref().unwrap().is_version_conflict());
    assert_eq!(h.store.pending_version_conflicts(), 4);
}

#[tokio::test]
async fn concurrent_writer_between_read_and_update_conflicts() {
    let h = TestHarness::new();
    let request = h.seed_request().await;
    let step = AcceptFriendRequestStep::new(Arc::clone(&h.store));
    let mut ctx = FriendRequestSagaContext::<InMemoryRelationalStore>::new(
        request.id,
        request.receiver_id,
    );

    // Another writer bumps the version after our read
    let mut stale = h.stored_request(request.id).await;
    h.store.touch_friend_request(request.id).await;
    stale.accept(request.receiver_id, chrono::Utc::now()).unwrap();
    let mut tx = h.store.begin().await.unwrap();
    let err = h
        .store
        .update_friend_request(&mut tx, &stale)
        .await
        .unwrap_err();
    assert!(err.is_version_conflict());

    // A fresh read succeeds
    step.execute(&mut ctx).await.unwrap();
    assert_eq!(
        h.stored_request(request.id).await.status,
        FriendRequestStatus::Accepted
    );
}

#[tokio::test]
async fn accept_compensation_is_idempotent() {
    let h = TestHarness::new();
    let request = h.seed_request().await;
    let step = AcceptFriendRequestStep::new(Arc::clone(&h.store));
    let mut ctx = FriendRequestSagaContext::<InMemoryRelationalStore>::new(
        request.id,
        request.receiver_id,
    );

    step.execute(&mut ctx).await.unwrap();
    step.compensate(&mut ctx).await.unwrap();
    let after_first = h.stored_request(request.id).await;
    step.compensate(&mut ctx).await.unwrap();
    let after_second = h.stored_request(request.id).await;

    assert_eq!(after_first.status, FriendRequestStatus::Pending);
    assert_eq!(after_first.version, after_second.version);
}

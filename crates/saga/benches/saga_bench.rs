use std::sync::Arc;

use common::UserId;
use criterion::{Criterion, criterion_group, criterion_main};
use domain::{ChatMessage, ChatRoom, FriendRequest};
use saga::{FriendRequestSaga, MessageSaga};
use store::{InMemoryMessageStore, InMemoryRelationalStore};

fn bench_message_saga(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let messages = Arc::new(InMemoryMessageStore::new());
    let store = Arc::new(InMemoryRelationalStore::new());
    let sender = UserId::new();
    let room = ChatRoom::new("bench", [sender, UserId::new()]);
    let room_id = room.id;
    rt.block_on(store.insert_room(room));
    let saga = MessageSaga::new(messages, store);

    c.bench_function("saga/message_saga", |b| {
        b.iter(|| {
            rt.block_on(async {
                let ctx = saga
                    .execute(ChatMessage::new(room_id, sender, "benchmark message"))
                    .await
                    .unwrap();
                assert!(ctx.saga.is_completed());
            });
        });
    });
}

fn bench_message_saga_compensation(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let messages = Arc::new(InMemoryMessageStore::new());
    let store = Arc::new(InMemoryRelationalStore::new());
    let sender = UserId::new();
    let room = ChatRoom::new("bench", [sender]);
    let room_id = room.id;
    rt.block_on(store.insert_room(room));
    store.set_fail_on_outbox_insert(true);
    let saga = MessageSaga::new(messages, store);

    c.bench_function("saga/message_saga_compensated", |b| {
        b.iter(|| {
            rt.block_on(async {
                saga.execute(ChatMessage::new(room_id, sender, "rolled back"))
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_friend_request_saga(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("saga/friend_request_saga", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = Arc::new(InMemoryRelationalStore::new());
                let request = FriendRequest::new(UserId::new(), UserId::new());
                let (id, receiver) = (request.id, request.receiver_id);
                store.insert_friend_request(request).await;

                let ctx = FriendRequestSaga::new(store)
                    .accept(id, receiver)
                    .await
                    .unwrap();
                assert!(ctx.saga.is_completed());
            });
        });
    });
}

criterion_group!(
    benches,
    bench_message_saga,
    bench_message_saga_compensation,
    bench_friend_request_saga,
);
criterion_main!(benches);

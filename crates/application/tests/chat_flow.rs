mod common;

use application::topics::{room_topic, NOTIFICATIONS_TOPIC};
use application::{ApplicationError, CacheStore, Clock, SendMentionRequest, SendMessageRequest};
use chrono::Duration as ChronoDuration;
use common::{drain_events, events_of_type, Harness};
use domain::{ChatMessage, DomainError, EnrichedMessage, PipelineStatus, ReactionAction};

fn text(harness: &Harness, user_id: domain::UserId, body: &str) -> SendMessageRequest {
    SendMessageRequest {
        room_id: harness.room,
        user_id,
        message: body.to_owned(),
        sticker: None,
        reply_to: None,
    }
}

#[tokio::test]
async fn sent_message_is_broadcast_persisted_and_completed() {
    let harness = Harness::new();
    let alice = harness.user("alice").await;
    let bob = harness.user("bob").await;
    let mut bob_frames = harness.connect(bob).await;

    let message = harness.chat.send_message(text(&harness, alice, "hello room")).await.unwrap();

    let events = drain_events(&mut bob_frames);
    let delivered = events_of_type(&events, "message");
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0]["payload"]["message"]["message"], "hello room");
    assert_eq!(delivered[0]["payload"]["user"]["username"], "alice");

    let room_events = harness.bus.published_to(&room_topic(harness.room)).await;
    let message_publishes: Vec<_> = room_events
        .iter()
        .filter(|event| String::from_utf8_lossy(&event.payload).contains("hello room"))
        .collect();
    assert_eq!(message_publishes.len(), 1);
    assert_eq!(message_publishes[0].key, harness.room.to_string());

    let status = harness
        .wait_for_status(message.id, |status| status.status == PipelineStatus::Completed)
        .await;
    assert!(status.saved_to_db && status.saved_to_cache && status.notification_sent);
    assert_eq!(harness.messages.len().await, 1);

    let notifications = harness.bus.published_to(NOTIFICATIONS_TOPIC).await;
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].key, bob.to_string());
}

#[tokio::test]
async fn empty_message_is_rejected_synchronously() {
    let harness = Harness::new();
    let alice = harness.user("alice").await;

    let err = harness.chat.send_message(text(&harness, alice, "   ")).await.unwrap_err();
    assert!(matches!(err, ApplicationError::Domain(DomainError::ValidationError { .. })));
    assert!(harness.bus.published().await.is_empty());
}

#[tokio::test]
async fn reply_carries_original_message() {
    let harness = Harness::new();
    let alice = harness.user("alice").await;
    let bob = harness.user("bob").await;

    let original = harness.chat.send_message(text(&harness, alice, "question?")).await.unwrap();
    harness
        .wait_for_status(original.id, |status| status.saved_to_db)
        .await;

    let mut request = text(&harness, bob, "answer");
    request.reply_to = Some(original.id);
    let reply = harness.chat.send_message(request).await.unwrap();

    let reply_info = reply.reply_to.as_ref().expect("reply info");
    assert_eq!(reply_info.message_id, original.id);
    assert_eq!(reply_info.message, "question?");
    assert_eq!(ChatMessage::kind(&reply), domain::MessageKind::Reply);
}

#[tokio::test]
async fn mention_notifies_only_the_mentioned_user() {
    let harness = Harness::new();
    let alice = harness.user("alice").await;
    let bob = harness.user("bob").await;
    let carol = harness.user("carol").await;
    let mut bob_frames = harness.connect(bob).await;
    let mut carol_frames = harness.connect(carol).await;
    drain_events(&mut bob_frames);
    drain_events(&mut carol_frames);

    let message = harness
        .chat
        .send_mention_message(SendMentionRequest {
            room_id: harness.room,
            user_id: alice,
            message: "hey @Bob and @nobody".to_owned(),
        })
        .await
        .unwrap();

    assert_eq!(message.mentions, vec![bob]);
    assert_eq!(message.mention_info.len(), 1);
    assert_eq!(message.mention_info[0].username, "bob");

    let bob_events = drain_events(&mut bob_frames);
    let carol_events = drain_events(&mut carol_frames);
    assert_eq!(events_of_type(&bob_events, "mention").len(), 1);
    assert_eq!(events_of_type(&carol_events, "mention").len(), 1);
    assert_eq!(events_of_type(&bob_events, "mention_notice").len(), 1);
    assert!(events_of_type(&carol_events, "mention_notice").is_empty());
}

#[tokio::test]
async fn mention_all_notifies_every_member_but_the_sender() {
    let harness = Harness::new();
    let alice = harness.user("alice").await;
    let bob = harness.user("bob").await;
    let carol = harness.user("carol").await;
    let mut alice_frames = harness.connect(alice).await;
    let mut bob_frames = harness.connect(bob).await;
    let mut carol_frames = harness.connect(carol).await;
    drain_events(&mut alice_frames);
    drain_events(&mut bob_frames);
    drain_events(&mut carol_frames);

    let message = harness
        .chat
        .send_mention_message(SendMentionRequest {
            room_id: harness.room,
            user_id: alice,
            message: "@bob meeting now @All".to_owned(),
        })
        .await
        .unwrap();

    assert_eq!(message.mention_info.len(), 1);
    assert!(message.mention_info[0].is_all);
    assert!(events_of_type(&drain_events(&mut alice_frames), "mention_notice").is_empty());
    assert_eq!(events_of_type(&drain_events(&mut bob_frames), "mention_notice").len(), 1);
    assert_eq!(events_of_type(&drain_events(&mut carol_frames), "mention_notice").len(), 1);
}

#[tokio::test]
async fn reaction_toggle_adds_updates_and_removes() {
    let harness = Harness::new();
    let alice = harness.user("alice").await;
    let bob = harness.user("bob").await;
    let message = harness.chat.send_message(text(&harness, alice, "react to me")).await.unwrap();
    harness
        .wait_for_status(message.id, |status| status.saved_to_db && status.saved_to_cache)
        .await;

    let added = harness.reactions.toggle_reaction(message.id, bob, "👍").await.unwrap();
    assert_eq!(added.action, ReactionAction::Add);

    let updated = harness.reactions.toggle_reaction(message.id, bob, "❤️").await.unwrap();
    assert_eq!(updated.action, ReactionAction::Update);
    assert_eq!(updated.previous.map(|previous| previous.reaction), Some("👍".to_owned()));
    assert_eq!(harness.reactions.reactions(message.id).await.unwrap().len(), 1);

    let cached = harness.cache.room_messages(harness.room, 10).await.unwrap();
    let patched = cached.iter().find(|item| item.id() == message.id).unwrap();
    assert_eq!(patched.reactions.len(), 1);
    assert_eq!(patched.reactions[0].reaction, "❤️");

    let removed = harness.reactions.toggle_reaction(message.id, bob, "❤️").await.unwrap();
    assert_eq!(removed.action, ReactionAction::Delete);
    assert!(harness.reactions.reactions(message.id).await.unwrap().is_empty());

    let cached = harness.cache.room_messages(harness.room, 10).await.unwrap();
    let patched = cached.iter().find(|item| item.id() == message.id).unwrap();
    assert!(patched.reactions.is_empty());
}

#[tokio::test]
async fn cache_keeps_only_the_newest_thousand_messages() {
    let harness = Harness::new();
    let alice = harness.user("alice").await;
    let start = harness.clock.now();

    let mut first_id = None;
    for index in 0..1001 {
        let message = ChatMessage::text(
            harness.room,
            alice,
            format!("message {index}"),
            start + ChronoDuration::milliseconds(index),
        );
        if index == 0 {
            first_id = Some(message.id);
        }
        harness
            .cache
            .save_message(harness.room, &EnrichedMessage::new(message))
            .await
            .unwrap();
    }

    let cached = harness.cache.room_messages(harness.room, 2000).await.unwrap();
    assert_eq!(cached.len(), 1000);
    assert_eq!(cached[0].message.message, "message 1000");
    assert!(cached.iter().all(|item| Some(item.id()) != first_id));
}

#[tokio::test]
async fn history_falls_back_to_store_and_refills_cache() {
    let harness = Harness::new();
    let alice = harness.user("alice").await;
    let first = harness.chat.send_message(text(&harness, alice, "first")).await.unwrap();
    harness.clock.advance(ChronoDuration::seconds(1));
    let second = harness.chat.send_message(text(&harness, alice, "second")).await.unwrap();
    for id in [first.id, second.id] {
        harness
            .wait_for_status(id, |status| status.saved_to_db && status.saved_to_cache)
            .await;
    }

    harness.chat.delete_room_messages(harness.room).await.unwrap();
    assert!(harness.cache.room_messages(harness.room, 10).await.unwrap().is_empty());

    let history = harness.chat.get_chat_history(harness.room, 10, Some(alice)).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].message.message, "second");
    assert_eq!(history[0].user.as_ref().map(|user| user.username.as_str()), Some("alice"));

    let refilled = harness.cache.room_messages(harness.room, 10).await.unwrap();
    assert_eq!(refilled.len(), 2);
}

#[tokio::test]
async fn last_connection_closing_announces_user_left() {
    let harness = Harness::new();
    let alice = harness.user("alice").await;
    let bob = harness.user("bob").await;
    let mut bob_frames = harness.connect(bob).await;
    drain_events(&mut bob_frames);

    let (first, _first_rx) = application::ConnectionHandle::channel();
    let (second, _second_rx) = application::ConnectionHandle::channel();
    let (first_id, second_id) = (first.id(), second.id());
    harness.chat.connect(harness.room, alice, first).await.unwrap();
    harness.chat.connect(harness.room, alice, second).await.unwrap();
    assert_eq!(events_of_type(&drain_events(&mut bob_frames), "user_joined").len(), 1);

    harness.chat.disconnect(harness.room, alice, first_id).await;
    assert!(events_of_type(&drain_events(&mut bob_frames), "user_left").is_empty());

    harness.chat.disconnect(harness.room, alice, second_id).await;
    assert_eq!(events_of_type(&drain_events(&mut bob_frames), "user_left").len(), 1);
    assert!(!harness.hub.is_user_online_in_room(harness.room, alice));
}

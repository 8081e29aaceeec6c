use application::CacheStore;
use chrono::{Duration, Utc};
use config::{CacheConfig, RedisConfig};
use domain::{ChatMessage, EnrichedMessage, Reaction, ReactionAction, RoomId, UserId};
use infrastructure::RedisCacheStore;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::redis::Redis;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires local docker daemon"]
async fn redis_cache_trims_replaces_and_clears() {
    let node = Redis::default().start().await.expect("start redis");
    let port = node.get_host_port_ipv4(6379u16).await.expect("port");
    let redis = RedisConfig {
        url: format!("redis://127.0.0.1:{port}"),
    };
    let cache = CacheConfig {
        max_messages: 3,
        ..CacheConfig::default()
    };
    let store = RedisCacheStore::connect(&redis, &cache).await.expect("connect");

    let room = RoomId::generate();
    let user = UserId::generate();
    let start = Utc::now();
    let mut messages = Vec::new();
    for index in 0..5 {
        let message = EnrichedMessage::new(ChatMessage::text(
            room,
            user,
            format!("m{index}"),
            start + Duration::milliseconds(index),
        ));
        store.save_message(room, &message).await.expect("save");
        messages.push(message);
    }

    let cached = store.room_messages(room, 10).await.expect("read");
    let bodies: Vec<_> = cached.iter().map(|item| item.message.message.as_str()).collect();
    assert_eq!(bodies, vec!["m4", "m3", "m2"]);

    let mut patched = messages[4].clone();
    patched.upsert_reaction(Reaction::new(patched.id(), user, "👍", ReactionAction::Add, Utc::now()));
    store.save_message(room, &patched).await.expect("replace");
    let cached = store.room_messages(room, 10).await.expect("read");
    assert_eq!(cached.len(), 3);
    assert_eq!(cached[0].reactions.len(), 1);

    // 并发覆盖同一条消息，不能出现重复条目
    let mut first = messages[4].clone();
    first.upsert_reaction(Reaction::new(first.id(), UserId::generate(), "🔥", ReactionAction::Add, Utc::now()));
    let mut second = messages[4].clone();
    second.upsert_reaction(Reaction::new(second.id(), UserId::generate(), "👀", ReactionAction::Add, Utc::now()));
    let (left, right) = tokio::join!(store.save_message(room, &first), store.save_message(room, &second));
    left.expect("first replace");
    right.expect("second replace");
    let cached = store.room_messages(room, 10).await.expect("read");
    let ids: Vec<_> = cached.iter().map(EnrichedMessage::id).collect();
    assert_eq!(ids, vec![messages[4].id(), messages[3].id(), messages[2].id()]);
    assert!(cached[0] == first || cached[0] == second);

    let reaction = Reaction::new(patched.id(), user, "🎉", ReactionAction::Update, Utc::now());
    store.save_reaction(room, &reaction).await.expect("reaction");
    assert_eq!(store.reactions(room, patched.id()).await.expect("reactions"), vec![reaction]);

    store.clear_room(room).await.expect("clear");
    assert!(store.room_messages(room, 10).await.expect("read").is_empty());
    assert!(store.reactions(room, patched.id()).await.expect("reactions").is_empty());
}

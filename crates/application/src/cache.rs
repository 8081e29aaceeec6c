//! 房间最近消息缓存
//!
//! 每个房间一个按毫秒时间戳排序的有序集合，只保留最新的 N 条并带 TTL；
//! 单条消息的回应另存一份带 TTL 的 JSON。

use async_trait::async_trait;
use domain::{EnrichedMessage, MessageId, Reaction, RoomId, UserId};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("cache payload error: {0}")]
    Payload(String),
}

impl CacheError {
    pub fn backend(message: impl Into<String>) -> Self {
        CacheError::Backend(message.into())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Payload(err.to_string())
    }
}

pub fn room_messages_key(room_id: RoomId) -> String {
    format!("chat:room:{room_id}:messages")
}

/// 房间消息正文，HASH 字段为消息 ID
pub fn room_message_bodies_key(room_id: RoomId) -> String {
    format!("chat:room:{room_id}:bodies")
}

pub fn message_reactions_key(room_id: RoomId, message_id: MessageId) -> String {
    format!("chat:room:{room_id}:reactions:{message_id}")
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// 以消息 ID 为准覆盖写入，随后裁剪到上限并刷新 TTL
    async fn save_message(&self, room_id: RoomId, message: &EnrichedMessage) -> Result<(), CacheError>;

    async fn save_messages(&self, room_id: RoomId, messages: &[EnrichedMessage]) -> Result<(), CacheError>;

    /// 最新在前，最多 `limit` 条
    async fn room_messages(&self, room_id: RoomId, limit: usize) -> Result<Vec<EnrichedMessage>, CacheError>;

    async fn clear_room(&self, room_id: RoomId) -> Result<(), CacheError>;

    async fn save_reaction(&self, room_id: RoomId, reaction: &Reaction) -> Result<(), CacheError>;

    async fn remove_reaction(
        &self,
        room_id: RoomId,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<(), CacheError>;

    async fn reactions(&self, room_id: RoomId, message_id: MessageId) -> Result<Vec<Reaction>, CacheError>;
}

pub mod memory {
    use std::collections::HashMap;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use domain::{EnrichedMessage, MessageId, Reaction, RoomId, UserId};
    use tokio::sync::RwLock;

    use super::{CacheError, CacheStore};

    struct RoomEntry {
        /// 按时间戳升序
        messages: Vec<EnrichedMessage>,
        expires_at: Instant,
    }

    struct ReactionEntry {
        reactions: Vec<Reaction>,
        expires_at: Instant,
    }

    /// 进程内缓存，语义与 Redis 实现一致
    pub struct MemoryCacheStore {
        max_messages: usize,
        message_ttl: Duration,
        reaction_ttl: Duration,
        rooms: RwLock<HashMap<RoomId, RoomEntry>>,
        reactions: RwLock<HashMap<(RoomId, MessageId), ReactionEntry>>,
    }

    impl MemoryCacheStore {
        pub fn new(max_messages: usize, message_ttl: Duration, reaction_ttl: Duration) -> Self {
            Self {
                max_messages,
                message_ttl,
                reaction_ttl,
                rooms: RwLock::new(HashMap::new()),
                reactions: RwLock::new(HashMap::new()),
            }
        }

        fn insert(&self, entry: &mut RoomEntry, message: &EnrichedMessage) {
            entry.messages.retain(|existing| existing.id() != message.id());
            let position = entry
                .messages
                .partition_point(|existing| existing.message.timestamp <= message.message.timestamp);
            entry.messages.insert(position, message.clone());
            if entry.messages.len() > self.max_messages {
                let overflow = entry.messages.len() - self.max_messages;
                entry.messages.drain(..overflow);
            }
            entry.expires_at = Instant::now() + self.message_ttl;
        }
    }

    impl Default for MemoryCacheStore {
        fn default() -> Self {
            Self::new(1000, Duration::from_secs(86_400), Duration::from_secs(86_400))
        }
    }

    #[async_trait]
    impl CacheStore for MemoryCacheStore {
        async fn save_message(&self, room_id: RoomId, message: &EnrichedMessage) -> Result<(), CacheError> {
            self.save_messages(room_id, std::slice::from_ref(message)).await
        }

        async fn save_messages(&self, room_id: RoomId, messages: &[EnrichedMessage]) -> Result<(), CacheError> {
            let mut rooms = self.rooms.write().await;
            let entry = rooms.entry(room_id).or_insert_with(|| RoomEntry {
                messages: Vec::new(),
                expires_at: Instant::now(),
            });
            if entry.expires_at <= Instant::now() {
                entry.messages.clear();
            }
            for message in messages {
                self.insert(entry, message);
            }
            Ok(())
        }

        async fn room_messages(&self, room_id: RoomId, limit: usize) -> Result<Vec<EnrichedMessage>, CacheError> {
            let rooms = self.rooms.read().await;
            Ok(rooms
                .get(&room_id)
                .filter(|entry| entry.expires_at > Instant::now())
                .map(|entry| entry.messages.iter().rev().take(limit).cloned().collect())
                .unwrap_or_default())
        }

        async fn clear_room(&self, room_id: RoomId) -> Result<(), CacheError> {
            self.rooms.write().await.remove(&room_id);
            self.reactions
                .write()
                .await
                .retain(|(room, _), _| *room != room_id);
            Ok(())
        }

        async fn save_reaction(&self, room_id: RoomId, reaction: &Reaction) -> Result<(), CacheError> {
            let mut reactions = self.reactions.write().await;
            let entry = reactions
                .entry((room_id, reaction.message_id))
                .or_insert_with(|| ReactionEntry {
                    reactions: Vec::new(),
                    expires_at: Instant::now(),
                });
            if entry.expires_at <= Instant::now() {
                entry.reactions.clear();
            }
            entry.reactions.retain(|existing| existing.user_id != reaction.user_id);
            entry.reactions.push(reaction.clone());
            entry.expires_at = Instant::now() + self.reaction_ttl;
            Ok(())
        }

        async fn remove_reaction(
            &self,
            room_id: RoomId,
            message_id: MessageId,
            user_id: UserId,
        ) -> Result<(), CacheError> {
            if let Some(entry) = self.reactions.write().await.get_mut(&(room_id, message_id)) {
                entry.reactions.retain(|existing| existing.user_id != user_id);
            }
            Ok(())
        }

        async fn reactions(&self, room_id: RoomId, message_id: MessageId) -> Result<Vec<Reaction>, CacheError> {
            let reactions = self.reactions.read().await;
            Ok(reactions
                .get(&(room_id, message_id))
                .filter(|entry| entry.expires_at > Instant::now())
                .map(|entry| entry.reactions.clone())
                .unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{Duration as ChronoDuration, Utc};
    use domain::{ChatMessage, ReactionAction};

    use super::memory::MemoryCacheStore;
    use super::*;

    fn message_at(room: RoomId, offset_ms: i64) -> EnrichedMessage {
        let at = Utc::now() + ChronoDuration::milliseconds(offset_ms);
        EnrichedMessage::new(ChatMessage::text(room, UserId::generate(), format!("m{offset_ms}"), at))
    }

    #[test]
    fn keys_follow_room_layout() {
        let room = RoomId::generate();
        let message = MessageId::generate();
        assert_eq!(room_messages_key(room), format!("chat:room:{room}:messages"));
        assert_eq!(room_message_bodies_key(room), format!("chat:room:{room}:bodies"));
        assert_eq!(
            message_reactions_key(room, message),
            format!("chat:room:{room}:reactions:{message}")
        );
    }

    #[tokio::test]
    async fn keeps_only_newest_entries() {
        let store = MemoryCacheStore::new(3, Duration::from_secs(60), Duration::from_secs(60));
        let room = RoomId::generate();
        for offset in 0..5 {
            store.save_message(room, &message_at(room, offset)).await.unwrap();
        }
        let cached = store.room_messages(room, 10).await.unwrap();
        let bodies: Vec<_> = cached.iter().map(|m| m.message.message.as_str()).collect();
        assert_eq!(bodies, vec!["m4", "m3", "m2"]);
    }

    #[tokio::test]
    async fn resave_replaces_by_id() {
        let store = MemoryCacheStore::default();
        let room = RoomId::generate();
        let mut message = message_at(room, 0);
        store.save_message(room, &message).await.unwrap();
        message.upsert_reaction(Reaction::new(
            message.id(),
            UserId::generate(),
            "👍",
            ReactionAction::Add,
            Utc::now(),
        ));
        store.save_message(room, &message).await.unwrap();

        let cached = store.room_messages(room, 10).await.unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].reactions.len(), 1);
    }

    #[tokio::test]
    async fn reactions_are_one_per_user() {
        let store = MemoryCacheStore::default();
        let room = RoomId::generate();
        let message = MessageId::generate();
        let user = UserId::generate();
        store
            .save_reaction(room, &Reaction::new(message, user, "👍", ReactionAction::Add, Utc::now()))
            .await
            .unwrap();
        store
            .save_reaction(room, &Reaction::new(message, user, "🎉", ReactionAction::Update, Utc::now()))
            .await
            .unwrap();
        let cached = store.reactions(room, message).await.unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].reaction, "🎉");

        store.remove_reaction(room, message, user).await.unwrap();
        assert!(store.reactions(room, message).await.unwrap().is_empty());
    }
}

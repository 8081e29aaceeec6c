//! 进程内端口实现，用于测试与单机调试

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use domain::{
    ChatMessage, MessageId, MessageStatus, ModerationRecord, ModerationState, ModerationType, Reaction,
    RoomId, StatusUpdate, Timestamp, UserId, UserRecord,
};
use tokio::sync::RwLock;

use crate::event_bus::{BusError, EventBus};
use crate::repository::{
    MessageRepository, MessageStatusRepository, ModerationHistoryFilter, ModerationRepository,
    ReactionRepository, RepositoryError, UserDirectory,
};

#[derive(Default)]
pub struct MemoryMessageRepository {
    messages: RwLock<HashMap<MessageId, ChatMessage>>,
    failing: AtomicBool,
}

impl MemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟存储故障
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    fn check(&self) -> Result<(), RepositoryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RepositoryError::storage("simulated outage"));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageRepository for MemoryMessageRepository {
    async fn save(&self, message: &ChatMessage) -> Result<(), RepositoryError> {
        self.check()?;
        self.messages.write().await.insert(message.id, message.clone());
        Ok(())
    }

    async fn save_batch(&self, messages: &[ChatMessage]) -> Result<(), RepositoryError> {
        self.check()?;
        let mut stored = self.messages.write().await;
        for message in messages {
            stored.insert(message.id, message.clone());
        }
        Ok(())
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<ChatMessage>, RepositoryError> {
        self.check()?;
        Ok(self.messages.read().await.get(&id).cloned())
    }

    async fn find_room_history(&self, room_id: RoomId, limit: usize) -> Result<Vec<ChatMessage>, RepositoryError> {
        self.check()?;
        let mut history: Vec<ChatMessage> = self
            .messages
            .read()
            .await
            .values()
            .filter(|message| message.room_id == room_id)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        history.truncate(limit);
        Ok(history)
    }
}

#[derive(Default)]
pub struct MemoryStatusRepository {
    statuses: RwLock<HashMap<MessageId, MessageStatus>>,
}

impl MemoryStatusRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStatusRepository for MemoryStatusRepository {
    async fn create(&self, status: &MessageStatus) -> Result<(), RepositoryError> {
        self.statuses
            .write()
            .await
            .entry(status.message_id)
            .or_insert_with(|| status.clone());
        Ok(())
    }

    async fn update(&self, message_id: MessageId, update: StatusUpdate, at: Timestamp) -> Result<(), RepositoryError> {
        let mut statuses = self.statuses.write().await;
        let status = statuses.get_mut(&message_id).ok_or(RepositoryError::NotFound)?;
        status.apply(&update, at);
        Ok(())
    }

    async fn record_error(
        &self,
        message_id: MessageId,
        error: &str,
        retry_count: u32,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        let mut statuses = self.statuses.write().await;
        let status = statuses.get_mut(&message_id).ok_or(RepositoryError::NotFound)?;
        status.record_error(error, retry_count, at);
        Ok(())
    }

    async fn find(&self, message_id: MessageId) -> Result<Option<MessageStatus>, RepositoryError> {
        Ok(self.statuses.read().await.get(&message_id).cloned())
    }

    async fn find_phantoms(&self, cutoff: Timestamp) -> Result<Vec<MessageStatus>, RepositoryError> {
        Ok(self
            .statuses
            .read()
            .await
            .values()
            .filter(|status| status.is_phantom(cutoff))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryModerationRepository {
    records: RwLock<Vec<ModerationRecord>>,
}

impl MemoryModerationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ModerationRepository for MemoryModerationRepository {
    async fn insert(&self, record: &ModerationRecord) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        let duplicate = record.kind != ModerationType::Kick
            && records.iter().any(|existing| {
                existing.status == ModerationState::Active
                    && existing.kind == record.kind
                    && existing.user_id == record.user_id
                    && existing.room_id == record.room_id
            });
        if duplicate {
            return Err(RepositoryError::Conflict("active moderation exists".to_owned()));
        }
        records.push(record.clone());
        Ok(())
    }

    async fn find_active(
        &self,
        user_id: UserId,
        room_id: RoomId,
        kind: ModerationType,
    ) -> Result<Option<ModerationRecord>, RepositoryError> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .find(|record| {
                record.status == ModerationState::Active
                    && record.kind == kind
                    && record.user_id == user_id
                    && record.room_id == room_id
            })
            .cloned())
    }

    async fn update(&self, record: &ModerationRecord) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        let stored = records
            .iter_mut()
            .find(|existing| existing.id == record.id)
            .ok_or(RepositoryError::NotFound)?;
        *stored = record.clone();
        Ok(())
    }

    async fn history(&self, filter: &ModerationHistoryFilter) -> Result<Vec<ModerationRecord>, RepositoryError> {
        let mut history: Vec<ModerationRecord> = self
            .records
            .read()
            .await
            .iter()
            .filter(|record| filter.room_id.is_none_or(|room| record.room_id == room))
            .filter(|record| filter.user_id.is_none_or(|user| record.user_id == user))
            .cloned()
            .collect();
        history.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            history.truncate(limit);
        }
        Ok(history)
    }

    async fn expire_temporary(&self, now: Timestamp) -> Result<u64, RepositoryError> {
        let mut expired = 0;
        for record in self.records.write().await.iter_mut() {
            if record.duration == domain::ModerationDuration::Temporary && record.is_expired(now) {
                record.expire(now);
                expired += 1;
            }
        }
        Ok(expired)
    }
}

#[derive(Default)]
pub struct MemoryReactionRepository {
    reactions: RwLock<HashMap<(MessageId, UserId), Reaction>>,
}

impl MemoryReactionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReactionRepository for MemoryReactionRepository {
    async fn find(&self, message_id: MessageId, user_id: UserId) -> Result<Option<Reaction>, RepositoryError> {
        Ok(self.reactions.read().await.get(&(message_id, user_id)).cloned())
    }

    async fn insert(&self, reaction: &Reaction) -> Result<(), RepositoryError> {
        let mut reactions = self.reactions.write().await;
        let key = (reaction.message_id, reaction.user_id);
        if reactions.contains_key(&key) {
            return Err(RepositoryError::Conflict("reaction exists".to_owned()));
        }
        reactions.insert(key, reaction.clone());
        Ok(())
    }

    async fn delete(&self, message_id: MessageId, user_id: UserId) -> Result<bool, RepositoryError> {
        Ok(self
            .reactions
            .write()
            .await
            .remove(&(message_id, user_id))
            .is_some())
    }

    async fn list(&self, message_id: MessageId) -> Result<Vec<Reaction>, RepositoryError> {
        let mut reactions: Vec<Reaction> = self
            .reactions
            .read()
            .await
            .values()
            .filter(|reaction| reaction.message_id == message_id)
            .cloned()
            .collect();
        reactions.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(reactions)
    }
}

#[derive(Default)]
pub struct MemoryUserDirectory {
    users: RwLock<HashMap<UserId, UserRecord>>,
    members: RwLock<HashMap<RoomId, Vec<UserId>>>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, record: UserRecord) {
        self.users.write().await.insert(record.id, record);
    }

    pub async fn add_member(&self, room_id: RoomId, user_id: UserId) {
        let mut members = self.members.write().await;
        let room = members.entry(room_id).or_default();
        if !room.contains(&user_id) {
            room.push(user_id);
        }
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn find_user(&self, user_id: UserId) -> Result<Option<UserRecord>, RepositoryError> {
        Ok(self.users.read().await.get(&user_id).cloned())
    }

    async fn find_by_usernames(&self, usernames: &[String]) -> Result<Vec<UserRecord>, RepositoryError> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .filter(|record| {
                usernames
                    .iter()
                    .any(|name| name.eq_ignore_ascii_case(&record.username))
            })
            .cloned()
            .collect())
    }

    async fn room_members(&self, room_id: RoomId) -> Result<Vec<UserId>, RepositoryError> {
        Ok(self
            .members
            .read()
            .await
            .get(&room_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// 记录所有发布内容的总线
#[derive(Default)]
pub struct RecordingEventBus {
    published: RwLock<Vec<PublishedEvent>>,
    failing: AtomicBool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedEvent {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

impl RecordingEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<PublishedEvent> {
        self.published.read().await.clone()
    }

    pub async fn published_to(&self, topic: &str) -> Vec<PublishedEvent> {
        self.published
            .read()
            .await
            .iter()
            .filter(|event| event.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventBus for RecordingEventBus {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BusError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BusError::publish("simulated broker outage"));
        }
        self.published.write().await.push(PublishedEvent {
            topic: topic.to_owned(),
            key: key.to_owned(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn ensure_topic(&self, _topic: &str) -> Result<(), BusError> {
        Ok(())
    }
}

//! 持久化端口
//!
//! 基础设施层提供 Postgres 实现，`memory` 模块提供测试用实现。

use async_trait::async_trait;
use domain::{
    ChatMessage, MessageId, MessageStatus, ModerationRecord, ModerationType, Reaction, RoomId,
    StatusUpdate, Timestamp, UserId, UserRecord,
};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("record not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        RepositoryError::Storage(message.into())
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// 按消息 ID 幂等写入
    async fn save(&self, message: &ChatMessage) -> Result<(), RepositoryError>;

    async fn save_batch(&self, messages: &[ChatMessage]) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: MessageId) -> Result<Option<ChatMessage>, RepositoryError>;

    /// 最新在前
    async fn find_room_history(
        &self,
        room_id: RoomId,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageStatusRepository: Send + Sync {
    async fn create(&self, status: &MessageStatus) -> Result<(), RepositoryError>;

    async fn update(
        &self,
        message_id: MessageId,
        update: StatusUpdate,
        at: Timestamp,
    ) -> Result<(), RepositoryError>;

    async fn record_error(
        &self,
        message_id: MessageId,
        error: &str,
        retry_count: u32,
        at: Timestamp,
    ) -> Result<(), RepositoryError>;

    async fn find(&self, message_id: MessageId) -> Result<Option<MessageStatus>, RepositoryError>;

    async fn find_phantoms(&self, cutoff: Timestamp) -> Result<Vec<MessageStatus>, RepositoryError>;
}

/// 处罚历史查询条件
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModerationHistoryFilter {
    pub room_id: Option<RoomId>,
    pub user_id: Option<UserId>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait ModerationRepository: Send + Sync {
    async fn insert(&self, record: &ModerationRecord) -> Result<(), RepositoryError>;

    /// 状态为 active 的同类处罚，不判断是否已过期
    async fn find_active(
        &self,
        user_id: UserId,
        room_id: RoomId,
        kind: ModerationType,
    ) -> Result<Option<ModerationRecord>, RepositoryError>;

    async fn update(&self, record: &ModerationRecord) -> Result<(), RepositoryError>;

    /// 创建时间倒序
    async fn history(
        &self,
        filter: &ModerationHistoryFilter,
    ) -> Result<Vec<ModerationRecord>, RepositoryError>;

    /// 将已到期的临时处罚标记为 expired，返回条数
    async fn expire_temporary(&self, now: Timestamp) -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait ReactionRepository: Send + Sync {
    async fn find(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<Option<Reaction>, RepositoryError>;

    async fn insert(&self, reaction: &Reaction) -> Result<(), RepositoryError>;

    /// 返回是否确有删除
    async fn delete(&self, message_id: MessageId, user_id: UserId) -> Result<bool, RepositoryError>;

    async fn list(&self, message_id: MessageId) -> Result<Vec<Reaction>, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, user_id: UserId) -> Result<Option<UserRecord>, RepositoryError>;

    /// 大小写不敏感
    async fn find_by_usernames(
        &self,
        usernames: &[String],
    ) -> Result<Vec<UserRecord>, RepositoryError>;

    async fn room_members(&self, room_id: RoomId) -> Result<Vec<UserId>, RepositoryError>;
}

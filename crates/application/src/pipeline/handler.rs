//! 流水线回调接口
//!
//! worker 只负责调度，具体的存储、缓存与通知由提交任务的一方实现。

use async_trait::async_trait;
use domain::{ChatMessage, MessageId, MessageStatus, RoomId, StatusUpdate, Timestamp, UserId};

use crate::error::ApplicationResult;

/// 台账读写，失败只记录日志
#[async_trait]
pub trait StatusRecorder: Send + Sync {
    async fn update_message_status(&self, message_id: MessageId, update: StatusUpdate);

    async fn update_message_status_with_error(&self, message_id: MessageId, error: &str, retry_count: u32);

    async fn message_status(&self, message_id: MessageId) -> Option<MessageStatus>;
}

#[async_trait]
pub trait DatabaseJobHandler: StatusRecorder {
    /// 广播完成后立即登记 pending 台账
    async fn create_message_status(&self, message: &ChatMessage) -> ApplicationResult<()>;

    async fn save_message_to_db(&self, message: &ChatMessage) -> ApplicationResult<()>;

    async fn save_message_to_cache(&self, message: &ChatMessage) -> ApplicationResult<()>;

    async fn save_message_batch(&self, messages: &[ChatMessage]) -> ApplicationResult<()>;

    async fn save_message_batch_to_cache(&self, room_id: RoomId, messages: &[ChatMessage]) -> ApplicationResult<()>;
}

#[async_trait]
pub trait NotificationJobHandler: StatusRecorder {
    async fn send_notifications(&self, message: &ChatMessage, online_users: &[UserId]) -> ApplicationResult<()>;
}

#[async_trait]
pub trait PhantomDetectorHandler: DatabaseJobHandler + NotificationJobHandler {
    async fn find_phantom_statuses(&self, cutoff: Timestamp) -> ApplicationResult<Vec<MessageStatus>>;

    /// 台账没有快照时使用：先查数据库，再查缓存
    async fn retrieve_message(&self, message_id: MessageId, room_id: RoomId) -> ApplicationResult<Option<ChatMessage>>;

    fn online_users(&self, room_id: RoomId) -> Vec<UserId>;
}

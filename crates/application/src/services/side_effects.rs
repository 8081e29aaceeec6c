//! 流水线副作用的具体实现：数据库、缓存、通知与台账

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::{
    ChatMessage, EnrichedMessage, MessageId, MessageStatus, RoomId, StatusUpdate, Timestamp, UserId,
};
use tracing::{debug, warn};

use crate::cache::CacheStore;
use crate::clock::Clock;
use crate::error::{bounded, ApplicationResult};
use crate::hub::ConnectionHub;
use crate::notification::NotificationService;
use crate::pipeline::{DatabaseJobHandler, NotificationJobHandler, PhantomDetectorHandler, StatusRecorder};
use crate::repository::{MessageRepository, MessageStatusRepository};
use crate::user_info::UserInfoResolver;

pub struct MessageSideEffects {
    messages: Arc<dyn MessageRepository>,
    statuses: Arc<dyn MessageStatusRepository>,
    cache: Arc<dyn CacheStore>,
    users: UserInfoResolver,
    notifications: Arc<NotificationService>,
    hub: Arc<ConnectionHub>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    cache_scan_limit: usize,
}

impl MessageSideEffects {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        statuses: Arc<dyn MessageStatusRepository>,
        cache: Arc<dyn CacheStore>,
        users: UserInfoResolver,
        notifications: Arc<NotificationService>,
        hub: Arc<ConnectionHub>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
        cache_scan_limit: usize,
    ) -> Self {
        Self {
            messages,
            statuses,
            cache,
            users,
            notifications,
            hub,
            clock,
            timeout,
            cache_scan_limit,
        }
    }

    async fn enrich(&self, message: &ChatMessage) -> EnrichedMessage {
        EnrichedMessage::new(message.clone()).with_user(self.users.resolve(message.user_id).await)
    }
}

#[async_trait]
impl StatusRecorder for MessageSideEffects {
    async fn update_message_status(&self, message_id: MessageId, update: StatusUpdate) {
        let at = self.clock.now();
        if let Err(err) = bounded(self.timeout, "update status", self.statuses.update(message_id, update, at)).await {
            warn!(message_id = %message_id, error = %err, "更新消息状态失败");
        }
    }

    async fn update_message_status_with_error(&self, message_id: MessageId, error: &str, retry_count: u32) {
        let at = self.clock.now();
        let recorded = bounded(
            self.timeout,
            "record status error",
            self.statuses.record_error(message_id, error, retry_count, at),
        )
        .await;
        if let Err(err) = recorded {
            warn!(message_id = %message_id, error = %err, "记录消息错误失败");
        }
    }

    async fn message_status(&self, message_id: MessageId) -> Option<MessageStatus> {
        match bounded(self.timeout, "find status", self.statuses.find(message_id)).await {
            Ok(status) => status,
            Err(err) => {
                warn!(message_id = %message_id, error = %err, "读取消息状态失败");
                None
            }
        }
    }
}

#[async_trait]
impl DatabaseJobHandler for MessageSideEffects {
    async fn create_message_status(&self, message: &ChatMessage) -> ApplicationResult<()> {
        let status = MessageStatus::for_message(message, self.clock.now());
        bounded(self.timeout, "create status", self.statuses.create(&status)).await
    }

    async fn save_message_to_db(&self, message: &ChatMessage) -> ApplicationResult<()> {
        bounded(self.timeout, "save message", self.messages.save(message)).await?;
        debug!(message_id = %message.id, "消息已写入数据库");
        Ok(())
    }

    async fn save_message_to_cache(&self, message: &ChatMessage) -> ApplicationResult<()> {
        let enriched = self.enrich(message).await;
        bounded(
            self.timeout,
            "cache message",
            self.cache.save_message(message.room_id, &enriched),
        )
        .await
    }

    async fn save_message_batch(&self, messages: &[ChatMessage]) -> ApplicationResult<()> {
        bounded(self.timeout, "save message batch", self.messages.save_batch(messages)).await?;
        debug!(count = messages.len(), "消息批量写入数据库");
        Ok(())
    }

    async fn save_message_batch_to_cache(&self, room_id: RoomId, messages: &[ChatMessage]) -> ApplicationResult<()> {
        let mut enriched = Vec::with_capacity(messages.len());
        for message in messages {
            enriched.push(self.enrich(message).await);
        }
        bounded(
            self.timeout,
            "cache message batch",
            self.cache.save_messages(room_id, &enriched),
        )
        .await
    }
}

#[async_trait]
impl NotificationJobHandler for MessageSideEffects {
    async fn send_notifications(&self, message: &ChatMessage, online_users: &[UserId]) -> ApplicationResult<()> {
        self.notifications
            .notify_users_in_room(message, online_users)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl PhantomDetectorHandler for MessageSideEffects {
    async fn find_phantom_statuses(&self, cutoff: Timestamp) -> ApplicationResult<Vec<MessageStatus>> {
        bounded(self.timeout, "find phantoms", self.statuses.find_phantoms(cutoff)).await
    }

    async fn retrieve_message(&self, message_id: MessageId, room_id: RoomId) -> ApplicationResult<Option<ChatMessage>> {
        match bounded(self.timeout, "find message", self.messages.find_by_id(message_id)).await {
            Ok(Some(message)) => return Ok(Some(message)),
            Ok(None) => {}
            Err(err) => warn!(message_id = %message_id, error = %err, "从数据库读取消息失败，改查缓存"),
        }

        let cached = bounded(
            self.timeout,
            "cached messages",
            self.cache.room_messages(room_id, self.cache_scan_limit),
        )
        .await?;
        Ok(cached
            .into_iter()
            .find(|enriched| enriched.id() == message_id)
            .map(|enriched| enriched.message))
    }

    fn online_users(&self, room_id: RoomId) -> Vec<UserId> {
        self.hub.online_users_in_room(room_id)
    }
}

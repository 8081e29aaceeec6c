use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::{
    ChatMessage, ConnectionId, DomainError, EnrichedMessage, EvoucherInfo, MessageId, MessageKind, ReplyInfo, RoomId,
    StickerInfo, UserId,
};
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::clock::Clock;
use crate::emitter::EventEmitter;
use crate::error::{bounded, ApplicationError, ApplicationResult};
use crate::hub::{BroadcastReport, ConnectionHandle, RoomStats};
use crate::mention::MentionParser;
use crate::moderation::{ChatSender, ModerationEngine};
use crate::pipeline::{AsyncPipeline, DatabaseJobHandler, DatabaseJobKind, PhantomReport, WorkerPoolStatus};
use crate::repository::{MessageRepository, ReactionRepository, UserDirectory};
use crate::services::side_effects::MessageSideEffects;

#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub message: String,
    pub sticker: Option<StickerInfo>,
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Clone)]
pub struct SendMentionRequest {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct SendEvoucherRequest {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub message: String,
    pub evoucher: EvoucherInfo,
}

pub struct ChatServiceDependencies {
    pub messages: Arc<dyn MessageRepository>,
    pub reactions: Arc<dyn ReactionRepository>,
    pub directory: Arc<dyn UserDirectory>,
    pub cache: Arc<dyn CacheStore>,
    pub emitter: Arc<EventEmitter>,
    pub moderation: Arc<ModerationEngine>,
    pub mentions: MentionParser,
    pub pipeline: Arc<AsyncPipeline>,
    pub side_effects: Arc<MessageSideEffects>,
    pub clock: Arc<dyn Clock>,
    pub timeout: Duration,
    /// 历史查询单次上限，与缓存保留条数一致
    pub max_history: usize,
}

/// 广播所走的事件类型
#[derive(Debug, Clone, Copy)]
enum Route {
    Message,
    Mention,
    Evoucher,
}

pub struct ChatService {
    deps: ChatServiceDependencies,
}

impl ChatService {
    pub fn new(deps: ChatServiceDependencies) -> Self {
        Self { deps }
    }

    pub fn moderation(&self) -> &Arc<ModerationEngine> {
        &self.deps.moderation
    }

    async fn ensure_can_send(&self, room_id: RoomId, user_id: UserId) -> ApplicationResult<()> {
        if room_id.is_nil() {
            return Err(DomainError::validation_error("room_id", "room id cannot be empty").into());
        }
        if !self.deps.moderation.can_user_send_messages(user_id, room_id).await? {
            return Err(DomainError::permission_denied("send messages in this room").into());
        }
        Ok(())
    }

    pub async fn send_message(&self, request: SendMessageRequest) -> ApplicationResult<ChatMessage> {
        self.ensure_can_send(request.room_id, request.user_id).await?;
        if request.message.trim().is_empty() && request.sticker.is_none() {
            return Err(DomainError::validation_error("message", "message cannot be empty").into());
        }

        let mut message = ChatMessage::text(request.room_id, request.user_id, request.message, self.deps.clock.now());
        if let Some(sticker) = request.sticker {
            if sticker.id.trim().is_empty() {
                return Err(DomainError::validation_error("sticker", "sticker id cannot be empty").into());
            }
            message = message.with_sticker(sticker);
        }
        if let Some(reply_to) = request.reply_to {
            let original = bounded(self.deps.timeout, "find reply target", self.deps.messages.find_by_id(reply_to))
                .await?
                .ok_or_else(|| DomainError::resource_not_found("message", reply_to.to_string()))?;
            if original.room_id != message.room_id {
                return Err(DomainError::validation_error("reply_to", "reply target belongs to another room").into());
            }
            message = message.with_reply(ReplyInfo::from_message(&original));
        }

        self.dispatch(message, Route::Message).await
    }

    /// 解析 @ 提及后广播，并给每个被提及的用户单独推送提醒
    pub async fn send_mention_message(&self, request: SendMentionRequest) -> ApplicationResult<ChatMessage> {
        self.ensure_can_send(request.room_id, request.user_id).await?;
        if request.message.trim().is_empty() {
            return Err(DomainError::validation_error("message", "message cannot be empty").into());
        }

        let parsed = self.deps.mentions.parse(&request.message).await;
        let members = match bounded(
            self.deps.timeout,
            "room members",
            self.deps.directory.room_members(request.room_id),
        )
        .await
        {
            Ok(members) => members,
            Err(err) => {
                warn!(room_id = %request.room_id, error = %err, "读取房间成员失败，提及不做成员过滤");
                Vec::new()
            }
        };

        let mentioned: Vec<UserId> = if members.is_empty() {
            parsed.user_ids.clone()
        } else {
            parsed
                .user_ids
                .iter()
                .copied()
                .filter(|user| members.contains(user))
                .collect()
        };
        let recipients: Vec<UserId> = if parsed.is_all() {
            members.into_iter().filter(|user| *user != request.user_id).collect()
        } else {
            mentioned.iter().copied().filter(|user| *user != request.user_id).collect()
        };

        let message = ChatMessage::text(request.room_id, request.user_id, request.message, self.deps.clock.now())
            .with_mentions(mentioned, parsed.info);
        let message = self.dispatch(message, Route::Mention).await?;

        for recipient in &recipients {
            if let Err(err) = self.deps.emitter.emit_mention_notice(&message, *recipient).await {
                warn!(message_id = %message.id, user_id = %recipient, error = %err, "发送提及提醒失败");
            }
        }
        info!(
            message_id = %message.id,
            mentions = message.mention_info.len(),
            notified = recipients.len(),
            "提及消息已发送"
        );
        Ok(message)
    }

    pub async fn send_evoucher_message(&self, request: SendEvoucherRequest) -> ApplicationResult<ChatMessage> {
        self.ensure_can_send(request.room_id, request.user_id).await?;
        if request.evoucher.claim_url.trim().is_empty() {
            return Err(DomainError::validation_error("evoucher", "claim url cannot be empty").into());
        }
        let text = if request.message.trim().is_empty() {
            request.evoucher.message.clone()
        } else {
            request.message
        };
        let message = ChatMessage::text(request.room_id, request.user_id, text, self.deps.clock.now())
            .with_evoucher(request.evoucher);
        self.dispatch(message, Route::Evoucher).await
    }

    pub fn determine_message_type(message: &ChatMessage) -> MessageKind {
        message.kind()
    }

    /// 广播后登记台账并提交三个副作用任务；队列满时任务丢弃，由幽灵检测补做
    async fn dispatch(&self, message: ChatMessage, route: Route) -> ApplicationResult<ChatMessage> {
        let emitted = match route {
            Route::Message => self.deps.emitter.emit_message(&message).await,
            Route::Mention => self.deps.emitter.emit_mention_message(&message).await,
            Route::Evoucher => self.deps.emitter.emit_evoucher_message(&message).await,
        };
        match emitted {
            Ok(report) => debug!(message_id = %message.id, delivered = report.delivered, "消息已广播"),
            Err(err) => warn!(message_id = %message.id, error = %err, "广播消息失败"),
        }

        if let Err(err) = self.deps.side_effects.create_message_status(&message).await {
            warn!(message_id = %message.id, error = %err, "创建消息状态失败");
        }

        let shared = Arc::new(message);
        let handler: Arc<dyn DatabaseJobHandler> = self.deps.side_effects.clone();
        let pipeline = &self.deps.pipeline;
        pipeline.submit_database_job(DatabaseJobKind::SaveMessage, shared.clone(), handler.clone());
        pipeline.submit_database_job(DatabaseJobKind::CacheMessage, shared.clone(), handler);
        let online = self.deps.emitter.hub().online_users_in_room(shared.room_id);
        pipeline.submit_notification_job(shared.clone(), online, self.deps.side_effects.clone());

        Ok(Arc::unwrap_or_clone(shared))
    }

    pub async fn set_typing(&self, room_id: RoomId, user_id: UserId, typing: bool) -> ApplicationResult<BroadcastReport> {
        self.deps.emitter.emit_typing(room_id, user_id, typing).await
    }

    /// 被封禁或禁止查看的用户不能加入房间
    pub async fn connect(&self, room_id: RoomId, user_id: UserId, handle: ConnectionHandle) -> ApplicationResult<()> {
        if !self.deps.moderation.can_user_view_messages(user_id, room_id).await? {
            return Err(DomainError::permission_denied("view this room").into());
        }
        let hub = self.deps.emitter.hub();
        let first_connection = !hub.is_user_online_in_room(room_id, user_id);
        hub.register(room_id, user_id, handle);
        if first_connection {
            if let Err(err) = self.deps.emitter.emit_user_joined(room_id, user_id).await {
                warn!(room_id = %room_id, user_id = %user_id, error = %err, "广播加入事件失败");
            }
        }
        Ok(())
    }

    /// 该用户在房间内的最后一条连接断开时才广播离开
    pub async fn disconnect(&self, room_id: RoomId, user_id: UserId, connection_id: ConnectionId) {
        let hub = self.deps.emitter.hub();
        if !hub.unregister(room_id, user_id, connection_id) {
            return;
        }
        if hub.is_user_online_in_room(room_id, user_id) {
            return;
        }
        if let Err(err) = self.deps.emitter.emit_user_left(room_id, user_id).await {
            warn!(room_id = %room_id, user_id = %user_id, error = %err, "广播离开事件失败");
        }
    }

    /// 先读缓存，未命中时回源数据库并回填缓存
    pub async fn get_chat_history(
        &self,
        room_id: RoomId,
        limit: usize,
        viewer: Option<UserId>,
    ) -> ApplicationResult<Vec<EnrichedMessage>> {
        if let Some(viewer) = viewer {
            if !self.deps.moderation.can_user_view_messages(viewer, room_id).await? {
                return Err(DomainError::permission_denied("view this room").into());
            }
        }
        let limit = limit.clamp(1, self.deps.max_history.max(1));

        match bounded(self.deps.timeout, "cached history", self.deps.cache.room_messages(room_id, limit)).await {
            Ok(cached) if !cached.is_empty() => return Ok(cached),
            Ok(_) => {}
            Err(err) => warn!(room_id = %room_id, error = %err, "读取缓存历史失败，回源数据库"),
        }

        let history = bounded(
            self.deps.timeout,
            "room history",
            self.deps.messages.find_room_history(room_id, limit),
        )
        .await?;
        let mut enriched = Vec::with_capacity(history.len());
        for message in history {
            let user = self.deps.emitter.users().resolve(message.user_id).await;
            let mut item = EnrichedMessage::new(message).with_user(user);
            match bounded(self.deps.timeout, "list reactions", self.deps.reactions.list(item.id())).await {
                Ok(reactions) => item.reactions = reactions,
                Err(err) => warn!(message_id = %item.id(), error = %err, "读取消息回应失败"),
            }
            enriched.push(item);
        }

        if !enriched.is_empty() {
            if let Err(err) = self.deps.cache.save_messages(room_id, &enriched).await {
                warn!(room_id = %room_id, error = %err, "回填历史缓存失败");
            }
        }
        Ok(enriched)
    }

    pub async fn delete_room_messages(&self, room_id: RoomId) -> ApplicationResult<()> {
        bounded(self.deps.timeout, "clear room cache", self.deps.cache.clear_room(room_id)).await
    }

    /// 其他实例经房间主题转发来的事件
    pub fn handle_bus_message(&self, topic: &str, payload: &[u8]) -> ApplicationResult<BroadcastReport> {
        Ok(self.deps.emitter.hub().handle_bus_message(topic, payload)?)
    }

    pub fn room_stats(&self, room_id: RoomId) -> RoomStats {
        self.deps.emitter.hub().room_stats(room_id)
    }

    pub fn pipeline_status(&self) -> WorkerPoolStatus {
        self.deps.pipeline.worker_pool_status()
    }

    pub async fn trigger_phantom_detection(&self) -> ApplicationResult<PhantomReport> {
        self.deps.pipeline.trigger_phantom_detection().await
    }

    pub async fn shutdown(&self) {
        self.deps.pipeline.shutdown().await;
    }
}

/// 处罚系统消息不经过处罚检查
#[async_trait]
impl ChatSender for ChatService {
    async fn send_system_message(&self, message: ChatMessage) -> ApplicationResult<()> {
        if message.room_id.is_nil() {
            return Err(ApplicationError::Domain(DomainError::validation_error(
                "room_id",
                "room id cannot be empty",
            )));
        }
        self.dispatch(message, Route::Message).await.map(|_| ())
    }
}

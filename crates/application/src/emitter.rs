//! 事件发射器
//!
//! 每个事件先投递给本实例的连接，再发布到房间主题供其他实例消费。
//! 总线发布失败只记录日志，不影响本地投递。

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use domain::{
    ChatMessage, Event, EventType, MentionNoticePayload, MessageBody, MessageKind, MessagePayload,
    Reaction, ReactionPayload, ReplyPayload, RoomId, RoomInfo, RoomUserPayload, UserId,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{bounded, ApplicationResult};
use crate::event_bus::EventBus;
use crate::hub::{BroadcastReport, ConnectionHub};
use crate::topics::room_topic;
use crate::user_info::UserInfoResolver;

pub struct EventEmitter {
    hub: Arc<ConnectionHub>,
    bus: Arc<dyn EventBus>,
    users: UserInfoResolver,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    provisioned_topics: DashSet<String>,
}

impl EventEmitter {
    pub fn new(
        hub: Arc<ConnectionHub>,
        bus: Arc<dyn EventBus>,
        users: UserInfoResolver,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            hub,
            bus,
            users,
            clock,
            timeout,
            provisioned_topics: DashSet::new(),
        }
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    pub fn users(&self) -> &UserInfoResolver {
        &self.users
    }

    /// message / sticker / reply 事件
    pub async fn emit_message(&self, message: &ChatMessage) -> ApplicationResult<BroadcastReport> {
        let payload = self.message_payload(message).await;
        self.emit(message.room_id, EventType::for_message(message), &payload)
            .await
    }

    pub async fn emit_mention_message(&self, message: &ChatMessage) -> ApplicationResult<BroadcastReport> {
        let payload = self.message_payload(message).await;
        self.emit(message.room_id, EventType::Mention, &payload).await
    }

    /// 只投递给被提及用户本人
    pub async fn emit_mention_notice(
        &self,
        message: &ChatMessage,
        mentioned: UserId,
    ) -> ApplicationResult<BroadcastReport> {
        let payload = MentionNoticePayload {
            room: RoomInfo::from(message.room_id),
            sender: self.users.resolve(message.user_id).await,
            mentioned_user: self.users.resolve(mentioned).await,
            message: message_body(message),
            timestamp: message.timestamp,
        };
        let event = Event::new(EventType::MentionNotice, &payload, self.clock.now())?;
        self.emit_to_user(mentioned, &event)
    }

    pub async fn emit_evoucher_message(&self, message: &ChatMessage) -> ApplicationResult<BroadcastReport> {
        let payload = self.message_payload(message).await;
        self.emit(message.room_id, EventType::Evoucher, &payload).await
    }

    pub async fn emit_reaction(&self, room_id: RoomId, reaction: &Reaction) -> ApplicationResult<BroadcastReport> {
        let payload = self.reaction_payload(room_id, reaction).await;
        self.emit(room_id, EventType::Reaction, &payload).await
    }

    /// `removed` 为被撤销的那条回应
    pub async fn emit_reaction_removed(
        &self,
        room_id: RoomId,
        removed: &Reaction,
    ) -> ApplicationResult<BroadcastReport> {
        let payload = self.reaction_payload(room_id, removed).await;
        self.emit(room_id, EventType::ReactionRemoved, &payload).await
    }

    pub async fn emit_typing(
        &self,
        room_id: RoomId,
        user_id: UserId,
        typing: bool,
    ) -> ApplicationResult<BroadcastReport> {
        let payload = self.room_user_payload(room_id, user_id, Some(typing)).await;
        self.emit(room_id, EventType::Typing, &payload).await
    }

    pub async fn emit_user_joined(&self, room_id: RoomId, user_id: UserId) -> ApplicationResult<BroadcastReport> {
        let payload = self.room_user_payload(room_id, user_id, None).await;
        self.emit(room_id, EventType::UserJoined, &payload).await
    }

    pub async fn emit_user_left(&self, room_id: RoomId, user_id: UserId) -> ApplicationResult<BroadcastReport> {
        let payload = self.room_user_payload(room_id, user_id, None).await;
        self.emit(room_id, EventType::UserLeft, &payload).await
    }

    /// 仅本地投递到该用户的所有连接
    pub fn emit_to_user(&self, user_id: UserId, event: &Event) -> ApplicationResult<BroadcastReport> {
        if event.is_empty() {
            return Ok(BroadcastReport::default());
        }
        Ok(self.hub.broadcast_to_user(user_id, &event.to_bytes()?))
    }

    /// 仅本地投递到房间内除指定用户外的连接
    pub fn emit_to_room_except(
        &self,
        room_id: RoomId,
        excluded: UserId,
        event: &Event,
    ) -> ApplicationResult<BroadcastReport> {
        if event.is_empty() {
            return Ok(BroadcastReport::default());
        }
        Ok(self
            .hub
            .broadcast_to_room_except(room_id, excluded, &event.to_bytes()?))
    }

    async fn emit<P: Serialize>(
        &self,
        room_id: RoomId,
        event_type: EventType,
        payload: &P,
    ) -> ApplicationResult<BroadcastReport> {
        let event = Event::new(event_type, payload, self.clock.now())?;
        if event.is_empty() {
            warn!(room_id = %room_id, event_type = event_type.as_str(), "空事件不广播");
            return Ok(BroadcastReport::default());
        }
        let bytes = event.to_bytes()?;

        let report = self.hub.broadcast_to_room(room_id, &bytes);
        debug!(
            room_id = %room_id,
            event_type = event_type.as_str(),
            delivered = report.delivered,
            "本地广播完成"
        );

        self.publish(room_id, event_type, &bytes).await;
        Ok(report)
    }

    async fn publish(&self, room_id: RoomId, event_type: EventType, bytes: &[u8]) {
        let topic = room_topic(room_id);
        if !self.provisioned_topics.contains(&topic) {
            match bounded(self.timeout, "ensure topic", self.bus.ensure_topic(&topic)).await {
                Ok(()) => {
                    self.provisioned_topics.insert(topic.clone());
                }
                Err(err) => warn!(topic = %topic, error = %err, "创建房间主题失败"),
            }
        }

        let key = room_id.to_string();
        if let Err(err) = bounded(self.timeout, "publish event", self.bus.publish(&topic, &key, bytes)).await {
            warn!(
                topic = %topic,
                event_type = event_type.as_str(),
                error = %err,
                "发布事件到消息总线失败"
            );
        }
    }

    async fn message_payload(&self, message: &ChatMessage) -> MessagePayload {
        let mut payload = MessagePayload::base(message, self.users.resolve(message.user_id).await);
        if let Some(reply) = &message.reply_to {
            payload.reply_to = Some(ReplyPayload {
                message: MessageBody {
                    id: reply.message_id,
                    kind: MessageKind::Text.as_str().to_owned(),
                    message: reply.message.clone(),
                    timestamp: reply.timestamp,
                },
                user: self.users.resolve(reply.user_id).await,
            });
        }
        payload.mentions = message.mention_info.clone();
        payload.evoucher_info = message.evoucher.clone();
        payload
    }

    async fn reaction_payload(&self, room_id: RoomId, reaction: &Reaction) -> ReactionPayload {
        ReactionPayload {
            room: RoomInfo::from(room_id),
            message_id: reaction.message_id,
            user: self.users.resolve(reaction.user_id).await,
            reaction: reaction.reaction.clone(),
            action: reaction.action,
            timestamp: reaction.timestamp,
        }
    }

    async fn room_user_payload(&self, room_id: RoomId, user_id: UserId, typing: Option<bool>) -> RoomUserPayload {
        RoomUserPayload {
            room: RoomInfo::from(room_id),
            user: self.users.resolve(user_id).await,
            typing,
            timestamp: self.clock.now(),
        }
    }
}

fn message_body(message: &ChatMessage) -> MessageBody {
    MessageBody {
        id: message.id,
        kind: message.kind().as_str().to_owned(),
        message: message.message.clone(),
        timestamp: message.timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::event_bus::{BusError, MockEventBus};
    use crate::hub::ConnectionHandle;
    use crate::hub::OutboundFrame;
    use crate::repository::MockUserDirectory;
    use chrono::Utc;
    use domain::StickerInfo;

    fn emitter_with(bus: MockEventBus) -> (EventEmitter, Arc<ConnectionHub>) {
        let hub = Arc::new(ConnectionHub::new());
        let mut directory = MockUserDirectory::new();
        directory.expect_find_user().returning(|_| Ok(None));
        let users = UserInfoResolver::new(Arc::new(directory), Duration::from_secs(1));
        let emitter = EventEmitter::new(
            hub.clone(),
            Arc::new(bus),
            users,
            Arc::new(SystemClock),
            Duration::from_secs(1),
        );
        (emitter, hub)
    }

    fn received_type(frame: OutboundFrame) -> String {
        match frame {
            OutboundFrame::Text(text) => {
                let json: serde_json::Value = serde_json::from_str(&text).unwrap();
                json["type"].as_str().unwrap().to_owned()
            }
            OutboundFrame::Close => panic!("unexpected close"),
        }
    }

    #[tokio::test]
    async fn publish_failure_does_not_block_local_delivery() {
        let mut bus = MockEventBus::new();
        bus.expect_ensure_topic().returning(|_| Ok(()));
        bus.expect_publish()
            .times(1)
            .returning(|_, _, _| Err(BusError::publish("broker down")));
        let (emitter, hub) = emitter_with(bus);

        let room = RoomId::generate();
        let user = UserId::generate();
        let (handle, mut rx) = ConnectionHandle::channel();
        hub.register(room, user, handle);

        let message = ChatMessage::text(room, user, "hello", Utc::now());
        let report = emitter.emit_message(&message).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(received_type(rx.try_recv().unwrap()), "message");
    }

    #[tokio::test]
    async fn topic_is_provisioned_once() {
        let mut bus = MockEventBus::new();
        bus.expect_ensure_topic().times(1).returning(|_| Ok(()));
        bus.expect_publish().times(2).returning(|_, _, _| Ok(()));
        let (emitter, _hub) = emitter_with(bus);

        let room = RoomId::generate();
        let user = UserId::generate();
        emitter.emit_typing(room, user, true).await.unwrap();
        emitter.emit_typing(room, user, false).await.unwrap();
    }

    #[tokio::test]
    async fn sticker_message_uses_sticker_type() {
        let mut bus = MockEventBus::new();
        bus.expect_ensure_topic().returning(|_| Ok(()));
        bus.expect_publish()
            .withf(|topic, _, _| topic.starts_with("chat-room-"))
            .returning(|_, _, _| Ok(()));
        let (emitter, hub) = emitter_with(bus);

        let room = RoomId::generate();
        let user = UserId::generate();
        let (handle, mut rx) = ConnectionHandle::channel();
        hub.register(room, user, handle);

        let message = ChatMessage::text(room, user, "", Utc::now()).with_sticker(StickerInfo {
            id: "st-1".into(),
            image: "st-1.png".into(),
        });
        emitter.emit_message(&message).await.unwrap();
        assert_eq!(received_type(rx.try_recv().unwrap()), "sticker");
    }

    #[tokio::test]
    async fn mention_notice_is_unicast() {
        let mut bus = MockEventBus::new();
        bus.expect_publish().never();
        bus.expect_ensure_topic().never();
        let (emitter, hub) = emitter_with(bus);

        let room = RoomId::generate();
        let sender = UserId::generate();
        let mentioned = UserId::generate();
        let (sender_handle, mut sender_rx) = ConnectionHandle::channel();
        let (mentioned_handle, mut mentioned_rx) = ConnectionHandle::channel();
        hub.register(room, sender, sender_handle);
        hub.register(room, mentioned, mentioned_handle);

        let message = ChatMessage::text(room, sender, "hi @bob", Utc::now());
        emitter.emit_mention_notice(&message, mentioned).await.unwrap();
        assert_eq!(received_type(mentioned_rx.try_recv().unwrap()), "mention_notice");
        assert!(sender_rx.try_recv().is_err());
    }
}

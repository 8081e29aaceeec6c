//! 聊天事件信封
//!
//! 本地广播与消息总线共用同一份 `{type, payload, timestamp}` 字节。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::entities::message::{ChatMessage, EvoucherInfo, MentionInfo, StickerInfo};
use crate::entities::moderation::{ModerationAction, MuteRestriction};
use crate::entities::reaction::ReactionAction;
use crate::entities::user::{RoomInfo, UserInfo};
use crate::value_objects::{MessageId, RoomId, UserId};

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Message,
    Sticker,
    Reply,
    Mention,
    MentionNotice,
    Evoucher,
    Reaction,
    ReactionRemoved,
    Typing,
    UserJoined,
    UserLeft,
    ModerationTargeted,
    ModerationAnnouncement,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Sticker => "sticker",
            Self::Reply => "reply",
            Self::Mention => "mention",
            Self::MentionNotice => "mention_notice",
            Self::Evoucher => "evoucher",
            Self::Reaction => "reaction",
            Self::ReactionRemoved => "reaction_removed",
            Self::Typing => "typing",
            Self::UserJoined => "user_joined",
            Self::UserLeft => "user_left",
            Self::ModerationTargeted => "moderation_targeted",
            Self::ModerationAnnouncement => "moderation_announcement",
        }
    }

    /// 普通消息按附件选择事件类型
    pub fn for_message(message: &ChatMessage) -> Self {
        if message.sticker.is_some() {
            Self::Sticker
        } else if message.reply_to.is_some() {
            Self::Reply
        } else {
            Self::Message
        }
    }
}

/// 事件信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: JsonValue,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new<P: Serialize>(
        event_type: EventType,
        payload: &P,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_type,
            payload: serde_json::to_value(payload)?,
            timestamp,
        })
    }

    /// 负载为空的退化事件不应被广播
    pub fn is_empty(&self) -> bool {
        match &self.payload {
            JsonValue::Null => true,
            JsonValue::Object(map) => map.is_empty(),
            JsonValue::String(text) => text.is_empty(),
            _ => false,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// 负载中的消息主体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(rename = "_id")]
    pub id: MessageId,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub message: MessageBody,
    pub user: UserInfo,
}

/// message / sticker / reply / mention / evoucher 事件负载
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub room: RoomInfo,
    pub user: UserInfo,
    pub message: MessageBody,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticker: Option<StickerInfo>,
    #[serde(rename = "replyTo", default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyPayload>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<MentionInfo>,
    #[serde(rename = "evoucherInfo", default, skip_serializing_if = "Option::is_none")]
    pub evoucher_info: Option<EvoucherInfo>,
}

impl MessagePayload {
    pub fn base(message: &ChatMessage, user: UserInfo) -> Self {
        Self {
            room: RoomInfo::from(message.room_id),
            user,
            message: MessageBody {
                id: message.id,
                kind: message.kind().as_str().to_owned(),
                message: message.message.clone(),
                timestamp: message.timestamp,
            },
            timestamp: message.timestamp,
            sticker: message.sticker.clone(),
            reply_to: None,
            mentions: Vec::new(),
            evoucher_info: None,
        }
    }
}

/// 发给被提及用户的专属提醒
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MentionNoticePayload {
    pub room: RoomInfo,
    pub sender: UserInfo,
    #[serde(rename = "mentionedUser")]
    pub mentioned_user: UserInfo,
    pub message: MessageBody,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionPayload {
    pub room: RoomInfo,
    #[serde(rename = "messageId")]
    pub message_id: MessageId,
    pub user: UserInfo,
    pub reaction: String,
    pub action: ReactionAction,
    pub timestamp: DateTime<Utc>,
}

/// typing / user_joined / user_left 负载
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomUserPayload {
    pub room: RoomInfo,
    pub user: UserInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typing: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

/// 处罚广播的目标范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationAudience {
    Target,
    Room,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationData {
    pub target_user_id: UserId,
    pub room_id: RoomId,
    pub moderator_id: UserId,
    pub reason: String,
    pub end_time: Option<DateTime<Utc>>,
    pub restriction: Option<MuteRestriction>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announcement: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationPayload {
    pub action: ModerationAction,
    pub broadcast: ModerationAudience,
    pub data: ModerationData,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_objects::RoomId;

    #[test]
    fn envelope_uses_type_key_and_rfc3339() {
        let now = DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let payload = serde_json::json!({"room": {"_id": RoomId::generate().to_string()}});
        let event = Event::new(EventType::Typing, &payload, now).unwrap();
        let json: JsonValue = serde_json::from_slice(&event.to_bytes().unwrap()).unwrap();
        assert_eq!(json["type"], "typing");
        assert_eq!(json["timestamp"], "2024-01-02T03:04:05Z");
    }

    #[test]
    fn empty_payload_is_detected() {
        let event = Event::new(EventType::Message, &serde_json::json!({}), Utc::now()).unwrap();
        assert!(event.is_empty());
        let event = Event::new(EventType::Message, &JsonValue::Null, Utc::now()).unwrap();
        assert!(event.is_empty());
    }

    #[test]
    fn sticker_messages_use_sticker_event() {
        let msg = ChatMessage::text(RoomId::generate(), UserId::generate(), "", Utc::now())
            .with_sticker(StickerInfo {
                id: "s".into(),
                image: "s.png".into(),
            });
        assert_eq!(EventType::for_message(&msg), EventType::Sticker);
    }
}

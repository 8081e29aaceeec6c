//! 消息实体定义
//!
//! 消息 ID 在任何异步处理之前同步分配，重复提交检测与幽灵消息检测都以它为键。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::moderation::{ModerationAction, ModerationDuration, MuteRestriction};
use crate::entities::reaction::Reaction;
use crate::entities::user::UserInfo;
use crate::value_objects::{MessageId, RoomId, UserId};

/// 贴纸附件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickerInfo {
    #[serde(rename = "_id")]
    pub id: String,
    pub image: String,
}

/// 被回复消息的引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyInfo {
    pub message_id: MessageId,
    pub message: String,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
}

impl ReplyInfo {
    pub fn from_message(original: &ChatMessage) -> Self {
        Self {
            message_id: original.id,
            message: original.message.clone(),
            user_id: original.user_id,
            timestamp: original.timestamp,
        }
    }
}

/// 电子券附件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvoucherInfo {
    pub message: String,
    #[serde(rename = "claimUrl")]
    pub claim_url: String,
    #[serde(rename = "sponsorImage")]
    pub sponsor_image: String,
}

/// 单条 @ 提及
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentionInfo {
    /// `@All` 时为空
    pub user_id: Option<UserId>,
    pub username: String,
    pub position: usize,
    pub is_all: bool,
}

/// 处罚动作生成的系统消息附带信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationNotice {
    pub action: ModerationAction,
    pub target_user_id: UserId,
    pub moderator_id: UserId,
    pub reason: String,
    pub duration: ModerationDuration,
    pub end_time: Option<DateTime<Utc>>,
    pub restriction: Option<MuteRestriction>,
}

/// 通知与持久化使用的消息分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Sticker,
    Reply,
    Mention,
    Evoucher,
    Moderation,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Sticker => "sticker",
            Self::Reply => "reply",
            Self::Mention => "mention",
            Self::Evoucher => "evoucher",
            Self::Moderation => "moderation",
        }
    }
}

/// 聊天消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticker: Option<StickerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mention_info: Vec<MentionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evoucher: Option<EvoucherInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moderation: Option<ModerationNotice>,
}

impl ChatMessage {
    /// 创建文本消息并立即分配 ID
    pub fn text(room_id: RoomId, user_id: UserId, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::generate(),
            room_id,
            user_id,
            message: message.into(),
            timestamp: now,
            sticker: None,
            reply_to: None,
            mentions: Vec::new(),
            mention_info: Vec::new(),
            evoucher: None,
            moderation: None,
        }
    }

    pub fn with_sticker(mut self, sticker: StickerInfo) -> Self {
        self.sticker = Some(sticker);
        self
    }

    pub fn with_reply(mut self, reply: ReplyInfo) -> Self {
        self.reply_to = Some(reply);
        self
    }

    pub fn with_mentions(mut self, mentions: Vec<UserId>, info: Vec<MentionInfo>) -> Self {
        self.mentions = mentions;
        self.mention_info = info;
        self
    }

    pub fn with_evoucher(mut self, evoucher: EvoucherInfo) -> Self {
        self.evoucher = Some(evoucher);
        self
    }

    pub fn with_moderation(mut self, notice: ModerationNotice) -> Self {
        self.moderation = Some(notice);
        self
    }

    /// 空消息（无正文且无贴纸）或房间为空 ID 时视为无操作，所有流水线阶段都会跳过。
    pub fn is_noop(&self) -> bool {
        let empty_body = self.message.trim().is_empty() && self.sticker.is_none();
        empty_body || self.room_id.is_nil()
    }

    /// 通知分类：回复 > 贴纸 > 提及 > 电子券 > 文本
    pub fn kind(&self) -> MessageKind {
        if self.reply_to.is_some() {
            MessageKind::Reply
        } else if self.sticker.is_some() {
            MessageKind::Sticker
        } else if !self.mention_info.is_empty() {
            MessageKind::Mention
        } else if self.evoucher.is_some() {
            MessageKind::Evoucher
        } else if self.moderation.is_some() {
            MessageKind::Moderation
        } else {
            MessageKind::Text
        }
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// 缓存与历史接口返回的消息，附带作者信息与回应列表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedMessage {
    #[serde(flatten)]
    pub message: ChatMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

impl EnrichedMessage {
    pub fn new(message: ChatMessage) -> Self {
        Self {
            message,
            user: None,
            reactions: Vec::new(),
        }
    }

    pub fn with_user(mut self, user: UserInfo) -> Self {
        self.user = Some(user);
        self
    }

    pub fn id(&self) -> MessageId {
        self.message.id
    }

    /// 覆盖同一用户的旧回应
    pub fn upsert_reaction(&mut self, reaction: Reaction) {
        self.reactions.retain(|existing| existing.user_id != reaction.user_id);
        self.reactions.push(reaction);
    }

    pub fn remove_reaction(&mut self, user_id: UserId) -> bool {
        let before = self.reactions.len();
        self.reactions.retain(|existing| existing.user_id != user_id);
        before != self.reactions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::reaction::ReactionAction;

    #[test]
    fn noop_detection() {
        let room = RoomId::generate();
        let user = UserId::generate();
        assert!(ChatMessage::text(room, user, "   ", Utc::now()).is_noop());
        assert!(ChatMessage::text(RoomId::nil(), user, "hi", Utc::now()).is_noop());
        assert!(!ChatMessage::text(room, user, "hi", Utc::now()).is_noop());

        let sticker_only = ChatMessage::text(room, user, "", Utc::now()).with_sticker(StickerInfo {
            id: "s1".into(),
            image: "s1.png".into(),
        });
        assert!(!sticker_only.is_noop());
    }

    #[test]
    fn kind_prefers_reply_over_sticker() {
        let room = RoomId::generate();
        let user = UserId::generate();
        let msg = ChatMessage::text(room, user, "hey", Utc::now())
            .with_sticker(StickerInfo {
                id: "s".into(),
                image: "i".into(),
            })
            .with_reply(ReplyInfo {
                message_id: MessageId::generate(),
                message: "original".into(),
                user_id: user,
                timestamp: Utc::now(),
            });
        assert_eq!(msg.kind(), MessageKind::Reply);
        assert_eq!(ChatMessage::text(room, user, "x", Utc::now()).kind(), MessageKind::Text);
    }

    #[test]
    fn upsert_reaction_keeps_one_per_user() {
        let room = RoomId::generate();
        let user = UserId::generate();
        let msg = ChatMessage::text(room, user, "hi", Utc::now());
        let mut enriched = EnrichedMessage::new(msg.clone());
        enriched.upsert_reaction(Reaction::new(msg.id, user, "👍", ReactionAction::Add, Utc::now()));
        enriched.upsert_reaction(Reaction::new(msg.id, user, "❤️", ReactionAction::Update, Utc::now()));
        assert_eq!(enriched.reactions.len(), 1);
        assert_eq!(enriched.reactions[0].reaction, "❤️");
        assert!(enriched.remove_reaction(user));
        assert!(enriched.reactions.is_empty());
    }
}

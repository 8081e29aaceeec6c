//! 消息表情回应
//!
//! 每个 (消息, 用户) 至多一条回应：相同表情再次提交即取消，不同表情则替换。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value_objects::{MessageId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    Add,
    Update,
    Delete,
}

impl ReactionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub reaction: String,
    pub action: ReactionAction,
    pub timestamp: DateTime<Utc>,
}

impl Reaction {
    pub fn new(
        message_id: MessageId,
        user_id: UserId,
        reaction: impl Into<String>,
        action: ReactionAction,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id,
            user_id,
            reaction: reaction.into(),
            action,
            timestamp,
        }
    }
}

/// 切换规则的判定结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionToggle {
    /// 尚无回应：新增
    Insert,
    /// 已有不同表情：删除旧的并插入新的
    Replace { previous: Reaction },
    /// 相同表情：回到无回应状态
    Remove { previous: Reaction },
}

impl ReactionToggle {
    pub fn resolve(existing: Option<Reaction>, glyph: &str) -> Self {
        match existing {
            None => Self::Insert,
            Some(previous) if previous.reaction == glyph => Self::Remove { previous },
            Some(previous) => Self::Replace { previous },
        }
    }

    /// 新写入记录应带的动作标签
    pub fn action(&self) -> ReactionAction {
        match self {
            Self::Insert => ReactionAction::Add,
            Self::Replace { .. } => ReactionAction::Update,
            Self::Remove { .. } => ReactionAction::Delete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn existing(glyph: &str) -> Reaction {
        Reaction::new(
            MessageId::generate(),
            UserId::generate(),
            glyph,
            ReactionAction::Add,
            Utc::now(),
        )
    }

    #[test]
    fn same_glyph_removes() {
        let toggle = ReactionToggle::resolve(Some(existing("👍")), "👍");
        assert!(matches!(toggle, ReactionToggle::Remove { .. }));
        assert_eq!(toggle.action(), ReactionAction::Delete);
    }

    #[test]
    fn different_glyph_replaces_with_update() {
        let toggle = ReactionToggle::resolve(Some(existing("👍")), "❤️");
        assert!(matches!(toggle, ReactionToggle::Replace { ref previous } if previous.reaction == "👍"));
        assert_eq!(toggle.action(), ReactionAction::Update);
    }

    #[test]
    fn first_reaction_is_added() {
        assert_eq!(ReactionToggle::resolve(None, "🎉").action(), ReactionAction::Add);
    }
}

//! 房间内处罚（封禁/禁言/踢出）
//!
//! 每个 (用户, 房间) 同时最多一条有效封禁和一条有效禁言。
//! 过期采用读时判定：查询发现 end_time 已过即翻转为 expired。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::value_objects::{ModerationId, RoomId, UserId};

/// 处罚类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationType {
    Ban,
    Mute,
    Kick,
}

impl ModerationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ban => "ban",
            Self::Mute => "mute",
            Self::Kick => "kick",
        }
    }
}

/// 处罚时长类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationDuration {
    Instant,
    Temporary,
    Permanent,
}

impl ModerationDuration {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instant => "instant",
            Self::Temporary => "temporary",
            Self::Permanent => "permanent",
        }
    }
}

/// 处罚记录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationState {
    Active,
    Revoked,
    Expired,
}

impl ModerationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Revoked => "revoked",
            Self::Expired => "expired",
        }
    }
}

/// 禁言限制：是否仍可查看消息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MuteRestriction {
    CanView,
    CannotView,
}

impl MuteRestriction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CanView => "can_view",
            Self::CannotView => "cannot_view",
        }
    }
}

macro_rules! parse_snake_enum {
    ($ty:ty, $field:literal, { $($text:literal => $variant:expr),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim() {
                    $($text => Ok($variant),)+
                    other => Err(DomainError::validation_error(
                        $field,
                        format!("unknown value '{other}'"),
                    )),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

parse_snake_enum!(ModerationType, "type", {
    "ban" => ModerationType::Ban,
    "mute" => ModerationType::Mute,
    "kick" => ModerationType::Kick,
});
parse_snake_enum!(ModerationDuration, "duration", {
    "instant" => ModerationDuration::Instant,
    "temporary" => ModerationDuration::Temporary,
    "permanent" => ModerationDuration::Permanent,
});
parse_snake_enum!(ModerationState, "status", {
    "active" => ModerationState::Active,
    "revoked" => ModerationState::Revoked,
    "expired" => ModerationState::Expired,
});
parse_snake_enum!(MuteRestriction, "restriction", {
    "can_view" => MuteRestriction::CanView,
    "cannot_view" => MuteRestriction::CannotView,
});

/// 处罚期限：时长类别 + 可选的结束时间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModerationTerm {
    pub duration: ModerationDuration,
    pub end_time: Option<DateTime<Utc>>,
}

impl ModerationTerm {
    pub fn permanent() -> Self {
        Self {
            duration: ModerationDuration::Permanent,
            end_time: None,
        }
    }

    pub fn instant() -> Self {
        Self {
            duration: ModerationDuration::Instant,
            end_time: None,
        }
    }

    pub fn until(end_time: DateTime<Utc>) -> Self {
        Self {
            duration: ModerationDuration::Temporary,
            end_time: Some(end_time),
        }
    }

    /// 解析 `permanent`、`instant` 或 `<n><s|m|h|d|w>` 形式的时长。
    pub fn parse(spec: &str, now: DateTime<Utc>) -> DomainResult<Self> {
        let spec = spec.trim().to_ascii_lowercase();
        match spec.as_str() {
            "" | "permanent" => return Ok(Self::permanent()),
            "instant" => return Ok(Self::instant()),
            _ => {}
        }

        let invalid = || DomainError::validation_error("duration", format!("invalid duration '{spec}'"));
        let (unit_at, _) = spec.char_indices().last().ok_or_else(invalid)?;
        let (amount, unit) = spec.split_at(unit_at);
        let amount: i64 = amount.parse().map_err(|_| invalid())?;
        if amount <= 0 {
            return Err(invalid());
        }
        let span = match unit {
            "s" => Duration::try_seconds(amount),
            "m" => Duration::try_minutes(amount),
            "h" => Duration::try_hours(amount),
            "d" => Duration::try_days(amount),
            "w" => Duration::try_weeks(amount),
            _ => return Err(invalid()),
        };
        let end_time = span.and_then(|span| now.checked_add_signed(span)).ok_or_else(invalid)?;
        Ok(Self::until(end_time))
    }
}

/// 处罚记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationRecord {
    pub id: ModerationId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub moderator_id: UserId,
    #[serde(rename = "type")]
    pub kind: ModerationType,
    pub duration: ModerationDuration,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub restriction: Option<MuteRestriction>,
    pub reason: String,
    pub status: ModerationState,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModerationRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: ModerationType,
        user_id: UserId,
        room_id: RoomId,
        moderator_id: UserId,
        term: ModerationTerm,
        restriction: Option<MuteRestriction>,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ModerationId::generate(),
            room_id,
            user_id,
            moderator_id,
            kind,
            duration: term.duration,
            start_time: now,
            end_time: term.end_time,
            restriction,
            reason: reason.into(),
            status: ModerationState::Active,
            revoked_at: None,
            revoked_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 有效但已过结束时间
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ModerationState::Active
            && self.end_time.is_some_and(|end_time| end_time <= now)
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == ModerationState::Active && !self.is_expired(now)
    }

    pub fn expire(&mut self, now: DateTime<Utc>) {
        self.status = ModerationState::Expired;
        self.updated_at = now;
    }

    pub fn revoke(&mut self, by: UserId, now: DateTime<Utc>) {
        self.status = ModerationState::Revoked;
        self.revoked_at = Some(now);
        self.revoked_by = Some(by);
        self.updated_at = now;
    }
}

/// 用户在房间内的处罚概况
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModerationStatus {
    pub user_id: String,
    pub room_id: String,
    pub is_banned: bool,
    pub ban_expiry: Option<DateTime<Utc>>,
    pub is_muted: bool,
    pub mute_expiry: Option<DateTime<Utc>>,
    pub restriction: Option<MuteRestriction>,
}

/// 广播给客户端的处罚动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationAction {
    Ban,
    Mute,
    Kick,
    Unban,
    Unmute,
}

impl ModerationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ban => "ban",
            Self::Mute => "mute",
            Self::Kick => "kick",
            Self::Unban => "unban",
            Self::Unmute => "unmute",
        }
    }

    /// 写入房间消息流的系统消息
    pub fn system_message(&self, reason: &str) -> String {
        match self {
            Self::Ban => format!("🚫 User has been banned. Reason: {reason}"),
            Self::Mute => format!("🔇 User has been muted. Reason: {reason}"),
            Self::Kick => format!("👢 User has been kicked. Reason: {reason}"),
            Self::Unban => "✅ User has been unbanned".to_owned(),
            Self::Unmute => "✅ User has been unmuted".to_owned(),
        }
    }

    /// 发给被处罚用户本人的提示
    pub fn targeted_message(&self, reason: &str, end_time: Option<DateTime<Utc>>) -> String {
        let until = match end_time {
            Some(end_time) => format!(" until {}", end_time.format("%Y-%m-%d %H:%M:%S")),
            None => " permanently".to_owned(),
        };
        match self {
            Self::Ban => format!("You have been banned from this room{until}. Reason: {reason}"),
            Self::Mute => format!("You have been muted in this room{until}. Reason: {reason}"),
            Self::Kick => format!("You have been kicked from this room. Reason: {reason}"),
            Self::Unban => "Your ban has been lifted. You can now access this room again.".to_owned(),
            Self::Unmute => "Your mute has been lifted. You can now send messages again.".to_owned(),
        }
    }

    /// 发给房间其他成员的公告
    pub fn announcement(&self, reason: &str) -> String {
        match self {
            Self::Ban => format!("A user has been banned from this room. Reason: {reason}"),
            Self::Mute => format!("A user has been muted in this room. Reason: {reason}"),
            Self::Kick => format!("A user has been kicked from this room. Reason: {reason}"),
            Self::Unban => "A user's ban has been lifted.".to_owned(),
            Self::Unmute => "A user's mute has been lifted.".to_owned(),
        }
    }
}

impl fmt::Display for ModerationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

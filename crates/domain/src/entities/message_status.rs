//! 消息异步处理台账
//!
//! 消息进入流水线时创建，只由流水线 worker 修改，幽灵消息检测器读取。
//! 台账同时保存消息快照，入队失败时幽灵检测仍能据此补做。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::ChatMessage;
use crate::errors::DomainError;
use crate::value_objects::{MessageId, RoomId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Completed,
    Failed,
    Skipped,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// completed 与 skipped 都算处理完毕
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(DomainError::validation_error(
                "status",
                format!("unknown pipeline status '{other}'"),
            )),
        }
    }
}

/// 流水线阶段标志
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageFlag {
    SavedToDb,
    SavedToCache,
    NotificationSent,
}

impl StageFlag {
    pub const ALL: [StageFlag; 3] = [Self::SavedToDb, Self::SavedToCache, Self::NotificationSent];

    pub fn column(&self) -> &'static str {
        match self {
            Self::SavedToDb => "saved_to_db",
            Self::SavedToCache => "saved_to_cache",
            Self::NotificationSent => "notification_sent",
        }
    }
}

/// 对台账的单字段更新
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    Stage(StageFlag, bool),
    Status(PipelineStatus),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageStatus {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub broadcast_at: DateTime<Utc>,
    pub saved_to_db: bool,
    pub saved_to_cache: bool,
    pub notification_sent: bool,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub status: PipelineStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageStatus {
    pub fn pending(message_id: MessageId, room_id: RoomId, now: DateTime<Utc>) -> Self {
        Self {
            message_id,
            room_id,
            broadcast_at: now,
            saved_to_db: false,
            saved_to_cache: false,
            notification_sent: false,
            retry_count: 0,
            last_error: None,
            status: PipelineStatus::Pending,
            payload: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 带消息快照的 pending 台账
    pub fn for_message(message: &ChatMessage, now: DateTime<Utc>) -> Self {
        Self {
            payload: Some(message.clone()),
            ..Self::pending(message.id, message.room_id, now)
        }
    }

    pub fn stage(&self, flag: StageFlag) -> bool {
        match flag {
            StageFlag::SavedToDb => self.saved_to_db,
            StageFlag::SavedToCache => self.saved_to_cache,
            StageFlag::NotificationSent => self.notification_sent,
        }
    }

    pub fn missing_stages(&self) -> Vec<StageFlag> {
        StageFlag::ALL
            .into_iter()
            .filter(|flag| !self.stage(*flag))
            .collect()
    }

    pub fn all_stages_done(&self) -> bool {
        self.missing_stages().is_empty()
    }

    pub fn apply(&mut self, update: &StatusUpdate, now: DateTime<Utc>) {
        match update {
            StatusUpdate::Stage(StageFlag::SavedToDb, value) => self.saved_to_db = *value,
            StatusUpdate::Stage(StageFlag::SavedToCache, value) => self.saved_to_cache = *value,
            StatusUpdate::Stage(StageFlag::NotificationSent, value) => {
                self.notification_sent = *value
            }
            StatusUpdate::Status(status) => self.status = *status,
        }
        self.updated_at = now;
    }

    pub fn record_error(&mut self, error: impl Into<String>, retry_count: u32, now: DateTime<Utc>) {
        self.last_error = Some(error.into());
        self.retry_count = retry_count;
        self.updated_at = now;
    }

    /// 广播时间早于 cutoff、仍为 pending 且至少一个阶段未落地；failed 为终态
    pub fn is_phantom(&self, cutoff: DateTime<Utc>) -> bool {
        self.broadcast_at <= cutoff && !self.status.is_terminal() && !self.all_stages_done()
    }
}

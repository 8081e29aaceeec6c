use std::sync::Arc;
use std::time::Instant;

use domain::{ChatMessage, StageFlag, UserId};
use serde::Serialize;

use super::handler::{DatabaseJobHandler, NotificationJobHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseJobKind {
    SaveMessage,
    CacheMessage,
}

impl DatabaseJobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SaveMessage => "save_message",
            Self::CacheMessage => "cache_message",
        }
    }

    pub fn stage(&self) -> StageFlag {
        match self {
            Self::SaveMessage => StageFlag::SavedToDb,
            Self::CacheMessage => StageFlag::SavedToCache,
        }
    }
}

pub struct DatabaseJob {
    pub kind: DatabaseJobKind,
    pub message: Arc<ChatMessage>,
    pub handler: Arc<dyn DatabaseJobHandler>,
    pub retry_count: u32,
    pub submitted_at: Instant,
}

impl DatabaseJob {
    pub fn new(kind: DatabaseJobKind, message: Arc<ChatMessage>, handler: Arc<dyn DatabaseJobHandler>) -> Self {
        Self {
            kind,
            message,
            handler,
            retry_count: 0,
            submitted_at: Instant::now(),
        }
    }

    /// 同一批次只能合并同类型、同处理方的任务
    pub(crate) fn batches_with(&self, other: &DatabaseJob) -> bool {
        self.kind == other.kind
            && std::ptr::addr_eq(Arc::as_ptr(&self.handler), Arc::as_ptr(&other.handler))
    }
}

pub struct NotificationJob {
    pub message: Arc<ChatMessage>,
    /// 提交时刻的在线用户快照
    pub online_users: Vec<UserId>,
    pub handler: Arc<dyn NotificationJobHandler>,
    pub retry_count: u32,
    pub submitted_at: Instant,
}

impl NotificationJob {
    pub fn new(
        message: Arc<ChatMessage>,
        online_users: Vec<UserId>,
        handler: Arc<dyn NotificationJobHandler>,
    ) -> Self {
        Self {
            message,
            online_users,
            handler,
            retry_count: 0,
            submitted_at: Instant::now(),
        }
    }
}

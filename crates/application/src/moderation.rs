//! 房间处罚：封禁、禁言、踢出及其撤销
//!
//! 每个用户在每个房间同类处罚至多一条 active 记录。已过结束时间但尚未被清理的
//! 记录在读取时即视为失效，并顺带标记为 expired。

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use domain::{
    ChatMessage, DomainError, Event, EventType, ModerationAction, ModerationAudience, ModerationData,
    ModerationNotice, ModerationPayload, ModerationRecord, ModerationStatus,
    ModerationTerm, ModerationType, MuteRestriction, RoomId, UserId,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::emitter::EventEmitter;
use crate::error::{bounded, ApplicationError, ApplicationResult};
use crate::repository::{ModerationHistoryFilter, ModerationRepository, RepositoryError};

/// 处罚系统消息的写入口，由聊天服务实现
#[async_trait]
pub trait ChatSender: Send + Sync {
    async fn send_system_message(&self, message: ChatMessage) -> ApplicationResult<()>;
}

const ALREADY_BANNED: &str = "user is already banned in this room";
const ALREADY_MUTED: &str = "user is already muted in this room";
const NOT_BANNED: &str = "user is not currently banned in this room";
const NOT_MUTED: &str = "user is not currently muted in this room";

#[derive(Debug, Clone)]
pub struct BanRequest {
    pub user_id: UserId,
    pub room_id: RoomId,
    pub moderator_id: UserId,
    pub term: ModerationTerm,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct MuteRequest {
    pub user_id: UserId,
    pub room_id: RoomId,
    pub moderator_id: UserId,
    pub term: ModerationTerm,
    pub restriction: MuteRestriction,
    pub reason: String,
}

pub struct ModerationEngine {
    repository: Arc<dyn ModerationRepository>,
    emitter: Arc<EventEmitter>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    chat: OnceLock<Weak<dyn ChatSender>>,
}

impl ModerationEngine {
    pub fn new(
        repository: Arc<dyn ModerationRepository>,
        emitter: Arc<EventEmitter>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            repository,
            emitter,
            clock,
            timeout,
            chat: OnceLock::new(),
        }
    }

    /// 聊天服务构造完成后回填，避免互相持有
    pub fn attach_chat_sender(&self, sender: Weak<dyn ChatSender>) {
        if self.chat.set(sender).is_err() {
            warn!("处罚系统消息发送方已设置，忽略重复设置");
        }
    }

    pub async fn ban_user(&self, request: BanRequest) -> ApplicationResult<ModerationRecord> {
        if self
            .active_record(request.user_id, request.room_id, ModerationType::Ban)
            .await?
            .is_some()
        {
            return Err(DomainError::conflict(ALREADY_BANNED).into());
        }
        let record = ModerationRecord::new(
            ModerationType::Ban,
            request.user_id,
            request.room_id,
            request.moderator_id,
            request.term,
            None,
            request.reason,
            self.clock.now(),
        );
        self.insert_exclusive(&record, ALREADY_BANNED).await?;
        info!(user_id = %record.user_id, room_id = %record.room_id, duration = record.duration.as_str(), "用户已被封禁");
        self.broadcast_action(ModerationAction::Ban, &record, &record.reason).await;
        Ok(record)
    }

    pub async fn mute_user(&self, request: MuteRequest) -> ApplicationResult<ModerationRecord> {
        if self
            .active_record(request.user_id, request.room_id, ModerationType::Mute)
            .await?
            .is_some()
        {
            return Err(DomainError::conflict(ALREADY_MUTED).into());
        }
        let record = ModerationRecord::new(
            ModerationType::Mute,
            request.user_id,
            request.room_id,
            request.moderator_id,
            request.term,
            Some(request.restriction),
            request.reason,
            self.clock.now(),
        );
        self.insert_exclusive(&record, ALREADY_MUTED).await?;
        info!(user_id = %record.user_id, room_id = %record.room_id, duration = record.duration.as_str(), "用户已被禁言");
        self.broadcast_action(ModerationAction::Mute, &record, &record.reason).await;
        Ok(record)
    }

    /// 踢出是瞬时处罚，同时断开该用户在房间内的连接
    pub async fn kick_user(
        &self,
        user_id: UserId,
        room_id: RoomId,
        moderator_id: UserId,
        reason: String,
    ) -> ApplicationResult<ModerationRecord> {
        let record = ModerationRecord::new(
            ModerationType::Kick,
            user_id,
            room_id,
            moderator_id,
            ModerationTerm::instant(),
            None,
            reason,
            self.clock.now(),
        );
        bounded(self.timeout, "insert moderation", self.repository.insert(&record)).await?;
        self.broadcast_action(ModerationAction::Kick, &record, &record.reason).await;
        let closed = self.emitter.hub().force_disconnect(room_id, Some(user_id));
        info!(user_id = %user_id, room_id = %room_id, closed, "用户已被踢出");
        Ok(record)
    }

    pub async fn unban_user(
        &self,
        user_id: UserId,
        room_id: RoomId,
        moderator_id: UserId,
    ) -> ApplicationResult<ModerationRecord> {
        let mut record = self
            .active_record(user_id, room_id, ModerationType::Ban)
            .await?
            .ok_or_else(|| DomainError::invalid_state(NOT_BANNED))?;
        record.revoke(moderator_id, self.clock.now());
        bounded(self.timeout, "update moderation", self.repository.update(&record)).await?;
        self.broadcast_action(ModerationAction::Unban, &record, "Ban revoked").await;
        Ok(record)
    }

    pub async fn unmute_user(
        &self,
        user_id: UserId,
        room_id: RoomId,
        moderator_id: UserId,
    ) -> ApplicationResult<ModerationRecord> {
        let mut record = self
            .active_record(user_id, room_id, ModerationType::Mute)
            .await?
            .ok_or_else(|| DomainError::invalid_state(NOT_MUTED))?;
        record.revoke(moderator_id, self.clock.now());
        bounded(self.timeout, "update moderation", self.repository.update(&record)).await?;
        self.broadcast_action(ModerationAction::Unmute, &record, "Mute revoked").await;
        Ok(record)
    }

    pub async fn is_user_banned(&self, user_id: UserId, room_id: RoomId) -> ApplicationResult<bool> {
        Ok(self
            .active_record(user_id, room_id, ModerationType::Ban)
            .await?
            .is_some())
    }

    pub async fn is_user_muted(&self, user_id: UserId, room_id: RoomId) -> ApplicationResult<bool> {
        Ok(self
            .active_record(user_id, room_id, ModerationType::Mute)
            .await?
            .is_some())
    }

    pub async fn user_moderation_status(&self, user_id: UserId, room_id: RoomId) -> ApplicationResult<ModerationStatus> {
        let ban = self.active_record(user_id, room_id, ModerationType::Ban).await?;
        let mute = self.active_record(user_id, room_id, ModerationType::Mute).await?;
        Ok(ModerationStatus {
            user_id: user_id.to_string(),
            room_id: room_id.to_string(),
            is_banned: ban.is_some(),
            ban_expiry: ban.and_then(|record| record.end_time),
            is_muted: mute.is_some(),
            mute_expiry: mute.as_ref().and_then(|record| record.end_time),
            restriction: mute.and_then(|record| record.restriction),
        })
    }

    pub async fn can_user_send_messages(&self, user_id: UserId, room_id: RoomId) -> ApplicationResult<bool> {
        let status = self.user_moderation_status(user_id, room_id).await?;
        Ok(!status.is_banned && !status.is_muted)
    }

    /// 封禁不可查看；禁言仅在 cannot_view 时不可查看
    pub async fn can_user_view_messages(&self, user_id: UserId, room_id: RoomId) -> ApplicationResult<bool> {
        let status = self.user_moderation_status(user_id, room_id).await?;
        if status.is_banned {
            return Ok(false);
        }
        Ok(!(status.is_muted && status.restriction == Some(MuteRestriction::CannotView)))
    }

    pub async fn moderation_history(&self, filter: &ModerationHistoryFilter) -> ApplicationResult<Vec<ModerationRecord>> {
        bounded(self.timeout, "moderation history", self.repository.history(filter)).await
    }

    /// 将已到期的临时处罚标记为 expired
    pub async fn cleanup_expired_moderations(&self) -> ApplicationResult<u64> {
        let expired = bounded(
            self.timeout,
            "expire moderations",
            self.repository.expire_temporary(self.clock.now()),
        )
        .await?;
        if expired > 0 {
            info!(expired, "已清理过期处罚");
        }
        Ok(expired)
    }

    pub fn spawn_cleanup(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.cleanup_expired_moderations().await {
                            error!(error = %err, "清理过期处罚失败");
                        }
                    }
                }
            }
        })
    }

    /// 并发写入撞上唯一约束时按重复处罚处理
    async fn insert_exclusive(&self, record: &ModerationRecord, duplicate: &str) -> ApplicationResult<()> {
        match bounded(self.timeout, "insert moderation", self.repository.insert(record)).await {
            Err(ApplicationError::Repository(RepositoryError::Conflict(_))) => {
                Err(DomainError::conflict(duplicate).into())
            }
            other => other,
        }
    }

    /// 当前生效的处罚；过期记录顺带标记为 expired
    async fn active_record(
        &self,
        user_id: UserId,
        room_id: RoomId,
        kind: ModerationType,
    ) -> ApplicationResult<Option<ModerationRecord>> {
        let found = bounded(
            self.timeout,
            "find moderation",
            self.repository.find_active(user_id, room_id, kind),
        )
        .await?;
        let Some(mut record) = found else {
            return Ok(None);
        };
        let now = self.clock.now();
        if record.is_expired(now) {
            record.expire(now);
            if let Err(err) = bounded(self.timeout, "expire moderation", self.repository.update(&record)).await {
                warn!(moderation_id = %record.id, error = %err, "标记处罚过期失败");
            }
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// 系统消息、对本人的提示与对房间的公告，任何一步失败都只记录日志
    async fn broadcast_action(&self, action: ModerationAction, record: &ModerationRecord, reason: &str) {
        let now = self.clock.now();

        let notice = ModerationNotice {
            action,
            target_user_id: record.user_id,
            moderator_id: record.moderator_id,
            reason: reason.to_owned(),
            duration: record.duration,
            end_time: record.end_time,
            restriction: record.restriction,
        };
        let system_message =
            ChatMessage::text(record.room_id, record.moderator_id, action.system_message(reason), now)
                .with_moderation(notice);
        match self.chat.get().and_then(Weak::upgrade) {
            Some(chat) => {
                if let Err(err) = chat.send_system_message(system_message).await {
                    error!(action = action.as_str(), error = %err, "发送处罚系统消息失败");
                }
            }
            None => warn!(action = action.as_str(), "处罚系统消息发送方不可用"),
        }

        let data = ModerationData {
            target_user_id: record.user_id,
            room_id: record.room_id,
            moderator_id: record.moderator_id,
            reason: reason.to_owned(),
            end_time: record.end_time,
            restriction: record.restriction,
            timestamp: now,
            message: None,
            announcement: None,
        };

        let targeted = ModerationPayload {
            action,
            broadcast: ModerationAudience::Target,
            data: ModerationData {
                message: Some(action.targeted_message(reason, record.end_time)),
                ..data.clone()
            },
        };
        let delivered = Event::new(EventType::ModerationTargeted, &targeted, now)
            .map_err(ApplicationError::from)
            .and_then(|event| self.emitter.emit_to_user(record.user_id, &event));
        if let Err(err) = delivered {
            error!(action = action.as_str(), error = %err, "发送处罚提示失败");
        }

        let announcement = ModerationPayload {
            action,
            broadcast: ModerationAudience::Room,
            data: ModerationData {
                announcement: Some(action.announcement(reason)),
                ..data
            },
        };
        let delivered = Event::new(EventType::ModerationAnnouncement, &announcement, now)
            .map_err(ApplicationError::from)
            .and_then(|event| self.emitter.emit_to_room_except(record.room_id, record.user_id, &event));
        if let Err(err) = delivered {
            error!(action = action.as_str(), error = %err, "发送处罚公告失败");
        }
    }
}

//! 离线通知扇出
//!
//! 对房间内除发送者以外的每个成员发布一条通知到 `chat-notifications`，
//! 以接收者 ID 为分区键。同一 (接收者, 房间, 消息正文) 在去重窗口内只发一次，
//! 重试时已成功的接收者不会重复收到。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use domain::{ChatMessage, MessageId, MessageKind, RoomId, RoomInfo, UserId, UserInfo};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{bounded, ApplicationError, ApplicationResult};
use crate::event_bus::EventBus;
use crate::repository::UserDirectory;
use crate::topics::NOTIFICATIONS_TOPIC;
use crate::user_info::UserInfoResolver;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    #[serde(rename = "_id")]
    pub id: MessageId,
    pub text: String,
}

/// 发往通知主题的负载
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub room: RoomInfo,
    pub sender: UserInfo,
    pub message: NotificationMessage,
    pub receiver: UserId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NotificationReport {
    pub sent: usize,
    pub deduplicated: usize,
    pub failed: usize,
}

type DedupKey = (UserId, RoomId, String);

pub struct NotificationService {
    bus: Arc<dyn EventBus>,
    directory: Arc<dyn UserDirectory>,
    users: UserInfoResolver,
    dedup_ttl: Duration,
    timeout: Duration,
    recent: DashMap<DedupKey, Instant>,
}

impl NotificationService {
    pub fn new(
        bus: Arc<dyn EventBus>,
        directory: Arc<dyn UserDirectory>,
        users: UserInfoResolver,
        dedup_ttl: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            bus,
            directory,
            users,
            dedup_ttl,
            timeout,
            recent: DashMap::new(),
        }
    }

    /// 任一接收者发布失败时返回错误，交由流水线重试
    pub async fn notify_users_in_room(
        &self,
        message: &ChatMessage,
        online_users: &[UserId],
    ) -> ApplicationResult<NotificationReport> {
        let members = bounded(
            self.timeout,
            "room members",
            self.directory.room_members(message.room_id),
        )
        .await?;
        let kind = message.kind();
        let sender = self.users.resolve(message.user_id).await;

        let mut report = NotificationReport::default();
        let mut last_error = None;
        for member in members.into_iter().filter(|member| *member != message.user_id) {
            if online_users.contains(&member) {
                debug!(receiver = %member, "接收者在线，仍发送通知供外部系统使用");
            }
            match self.send_message_notification(member, message, kind, &sender).await {
                Ok(true) => report.sent += 1,
                Ok(false) => report.deduplicated += 1,
                Err(err) => {
                    warn!(receiver = %member, message_id = %message.id, error = %err, "发送通知失败");
                    report.failed += 1;
                    last_error = Some(err);
                }
            }
        }

        info!(
            message_id = %message.id,
            room_id = %message.room_id,
            sent = report.sent,
            deduplicated = report.deduplicated,
            failed = report.failed,
            "房间通知已发送"
        );
        match last_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// 返回 false 表示去重窗口内已发送过
    pub async fn send_message_notification(
        &self,
        receiver: UserId,
        message: &ChatMessage,
        kind: MessageKind,
        sender: &UserInfo,
    ) -> ApplicationResult<bool> {
        let key = (receiver, message.room_id, message.message.clone());
        if !self.claim(key.clone()) {
            return Ok(false);
        }

        let payload = NotificationPayload {
            kind,
            room: RoomInfo::from(message.room_id),
            sender: sender.clone(),
            message: NotificationMessage {
                id: message.id,
                text: message.message.clone(),
            },
            receiver,
            timestamp: message.timestamp,
        };
        let published = match serde_json::to_vec(&payload) {
            Ok(bytes) => {
                let partition_key = receiver.to_string();
                bounded(
                    self.timeout,
                    "publish notification",
                    self.bus.publish(NOTIFICATIONS_TOPIC, &partition_key, &bytes),
                )
                .await
            }
            Err(err) => Err(ApplicationError::from(err)),
        };

        if let Err(err) = published {
            self.recent.remove(&key);
            return Err(err);
        }
        Ok(true)
    }

    /// 清除去重窗口外的记录
    pub fn purge_expired(&self) -> usize {
        let before = self.recent.len();
        let ttl = self.dedup_ttl;
        self.recent.retain(|_, sent_at| sent_at.elapsed() < ttl);
        before - self.recent.len()
    }

    fn claim(&self, key: DedupKey) -> bool {
        let now = Instant::now();
        match self.recent.entry(key) {
            Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) < self.dedup_ttl {
                    return false;
                }
                entry.insert(now);
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::{BusError, MockEventBus};
    use crate::repository::MockUserDirectory;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn directory_with(members: Vec<UserId>) -> MockUserDirectory {
        let mut directory = MockUserDirectory::new();
        directory
            .expect_room_members()
            .returning(move |_| Ok(members.clone()));
        directory.expect_find_user().returning(|_| Ok(None));
        directory
    }

    fn service(bus: MockEventBus, members: Vec<UserId>) -> NotificationService {
        let directory: Arc<dyn UserDirectory> = Arc::new(directory_with(members));
        NotificationService::new(
            Arc::new(bus),
            directory.clone(),
            UserInfoResolver::new(directory, Duration::from_secs(1)),
            Duration::from_secs(30),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn skips_sender_and_keys_by_receiver() {
        let sender = UserId::generate();
        let receiver = UserId::generate();
        let mut bus = MockEventBus::new();
        let expected_key = receiver.to_string();
        bus.expect_publish()
            .withf(move |topic, key, _| topic == NOTIFICATIONS_TOPIC && key == expected_key)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let service = service(bus, vec![sender, receiver]);

        let message = ChatMessage::text(RoomId::generate(), sender, "hello", Utc::now());
        let report = service.notify_users_in_room(&message, &[]).await.unwrap();
        assert_eq!(report.sent, 1);
    }

    #[tokio::test]
    async fn duplicate_notifications_are_suppressed() {
        let receiver = UserId::generate();
        let mut bus = MockEventBus::new();
        bus.expect_publish().times(1).returning(|_, _, _| Ok(()));
        let service = service(bus, vec![receiver]);

        let message = ChatMessage::text(RoomId::generate(), UserId::generate(), "hello", Utc::now());
        service.notify_users_in_room(&message, &[]).await.unwrap();
        let second = service.notify_users_in_room(&message, &[]).await.unwrap();
        assert_eq!(second.deduplicated, 1);
        assert_eq!(second.sent, 0);
    }

    #[tokio::test]
    async fn failed_receivers_are_retried() {
        let receiver = UserId::generate();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let mut bus = MockEventBus::new();
        bus.expect_publish().times(2).returning(move |_, _, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(BusError::publish("leader not available"))
            } else {
                Ok(())
            }
        });
        let service = service(bus, vec![receiver]);

        let message = ChatMessage::text(RoomId::generate(), UserId::generate(), "hello", Utc::now());
        assert!(service.notify_users_in_room(&message, &[]).await.is_err());
        let retried = service.notify_users_in_room(&message, &[]).await.unwrap();
        assert_eq!(retried.sent, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn payload_uses_message_kind() {
        let message = ChatMessage::text(RoomId::generate(), UserId::generate(), "hi", Utc::now());
        let payload = NotificationPayload {
            kind: message.kind(),
            room: RoomInfo::from(message.room_id),
            sender: UserInfo::fallback(message.user_id),
            message: NotificationMessage {
                id: message.id,
                text: message.message.clone(),
            },
            receiver: UserId::generate(),
            timestamp: message.timestamp,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["message"]["text"], "hi");
    }
}

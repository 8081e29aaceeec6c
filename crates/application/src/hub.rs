//! 本实例的连接注册表
//!
//! 房间 → 用户 → 连接 三层结构，同一用户可在同一房间持有多条连接。
//! 发送不在锁内进行：先取快照，再逐个投递，失败的连接随后移除。
//! 每条连接的出站队列有界，队列写满视同写入失败。

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use domain::{ConnectionId, Event, RoomId, UserId};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::topics::room_from_topic;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),
    #[error("connection {0} outbound queue is full")]
    ConnectionBackedUp(ConnectionId),
    #[error("topic '{0}' is not a room topic")]
    InvalidTopic(String),
    #[error("invalid room in topic: {0}")]
    InvalidRoom(String),
    #[error("invalid event envelope: {0}")]
    InvalidEnvelope(String),
}

/// 发往单条 WebSocket 连接的帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(Arc<str>),
    Close,
}

/// 单条连接出站队列的默认容量
pub const OUTBOUND_BUFFER: usize = 256;

/// 连接写端句柄，读端由传输层的发送任务持有
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::Sender<OutboundFrame>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, sender: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            id,
            sender,
            closed: CancellationToken::new(),
        }
    }

    pub fn channel() -> (Self, mpsc::Receiver<OutboundFrame>) {
        Self::with_capacity(OUTBOUND_BUFFER)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self::new(ConnectionId::generate(), sender), receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// 连接被 hub 关闭时触发；队列已满、Close 帧无法入队时发送任务靠它退出
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn send_text(&self, payload: Arc<str>) -> Result<(), HubError> {
        self.sender
            .try_send(OutboundFrame::Text(payload))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => HubError::ConnectionBackedUp(self.id),
                mpsc::error::TrySendError::Closed(_) => HubError::ConnectionClosed(self.id),
            })
    }

    fn close(&self) {
        self.closed.cancel();
        let _ = self.sender.try_send(OutboundFrame::Close);
    }
}

/// 一次投递的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoomStats {
    pub users: usize,
    pub connections: usize,
}

type RoomConnections = DashMap<UserId, HashMap<ConnectionId, ConnectionHandle>>;

#[derive(Default)]
pub struct ConnectionHub {
    rooms: DashMap<RoomId, RoomConnections>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, room_id: RoomId, user_id: UserId, handle: ConnectionHandle) {
        let room = self.rooms.entry(room_id).or_default();
        room.entry(user_id)
            .or_default()
            .insert(handle.id(), handle);
        debug!(room_id = %room_id, user_id = %user_id, "连接已注册");
    }

    /// 移除单条连接；用户与房间为空时一并清理
    pub fn unregister(&self, room_id: RoomId, user_id: UserId, connection_id: ConnectionId) -> bool {
        let mut removed = false;
        let mut room_empty = false;
        if let Some(room) = self.rooms.get(&room_id) {
            let mut user_empty = false;
            if let Some(mut connections) = room.get_mut(&user_id) {
                removed = connections.remove(&connection_id).is_some();
                user_empty = connections.is_empty();
            }
            if user_empty {
                room.remove_if(&user_id, |_, connections| connections.is_empty());
            }
            room_empty = room.is_empty();
        }
        if room_empty {
            self.rooms.remove_if(&room_id, |_, room| room.is_empty());
        }
        if removed {
            debug!(room_id = %room_id, user_id = %user_id, "连接已注销");
        }
        removed
    }

    pub fn broadcast_to_room(&self, room_id: RoomId, payload: &[u8]) -> BroadcastReport {
        self.broadcast_filtered(room_id, payload, None)
    }

    pub fn broadcast_to_room_except(
        &self,
        room_id: RoomId,
        excluded: UserId,
        payload: &[u8],
    ) -> BroadcastReport {
        self.broadcast_filtered(room_id, payload, Some(excluded))
    }

    /// 投递到该用户在所有房间的连接
    pub fn broadcast_to_user(&self, user_id: UserId, payload: &[u8]) -> BroadcastReport {
        let Some(text) = outbound_text(payload) else {
            return BroadcastReport::default();
        };
        let targets: Vec<_> = self
            .rooms
            .iter()
            .filter_map(|room| {
                room.get(&user_id).map(|connections| {
                    connections
                        .values()
                        .map(|handle| (*room.key(), user_id, handle.clone()))
                        .collect::<Vec<_>>()
                })
            })
            .flatten()
            .collect();
        self.deliver(targets, text)
    }

    pub fn is_user_online_in_room(&self, room_id: RoomId, user_id: UserId) -> bool {
        self.rooms
            .get(&room_id)
            .is_some_and(|room| room.get(&user_id).is_some_and(|c| !c.is_empty()))
    }

    pub fn online_users_in_room(&self, room_id: RoomId) -> Vec<UserId> {
        self.rooms
            .get(&room_id)
            .map(|room| {
                room.iter()
                    .filter(|entry| !entry.value().is_empty())
                    .map(|entry| *entry.key())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 关闭并移除房间内的连接；指定用户时只处理该用户
    pub fn force_disconnect(&self, room_id: RoomId, user_id: Option<UserId>) -> usize {
        let mut closed = Vec::new();
        let mut room_empty = false;
        if let Some(room) = self.rooms.get(&room_id) {
            match user_id {
                Some(user_id) => {
                    if let Some((_, connections)) = room.remove(&user_id) {
                        closed.extend(connections.into_values());
                    }
                }
                None => {
                    let users: Vec<UserId> = room.iter().map(|entry| *entry.key()).collect();
                    for user in users {
                        if let Some((_, connections)) = room.remove(&user) {
                            closed.extend(connections.into_values());
                        }
                    }
                }
            }
            room_empty = room.is_empty();
        }
        if room_empty {
            self.rooms.remove_if(&room_id, |_, room| room.is_empty());
        }
        for handle in &closed {
            handle.close();
        }
        closed.len()
    }

    pub fn active_connections_count(&self) -> usize {
        self.rooms
            .iter()
            .map(|room| room.iter().map(|user| user.value().len()).sum::<usize>())
            .sum()
    }

    pub fn room_stats(&self, room_id: RoomId) -> RoomStats {
        self.rooms
            .get(&room_id)
            .map(|room| RoomStats {
                users: room.len(),
                connections: room.iter().map(|user| user.value().len()).sum(),
            })
            .unwrap_or_default()
    }

    /// 消费总线上 `chat-room-<id>` 主题的事件并投递给本地连接
    pub fn handle_bus_message(&self, topic: &str, payload: &[u8]) -> Result<BroadcastReport, HubError> {
        let room = room_from_topic(topic).ok_or_else(|| HubError::InvalidTopic(topic.to_owned()))?;
        let room_id = RoomId::parse(room).map_err(|err| HubError::InvalidRoom(err.to_string()))?;
        let event = Event::from_slice(payload).map_err(|err| HubError::InvalidEnvelope(err.to_string()))?;
        if event.is_empty() {
            return Err(HubError::InvalidEnvelope("empty payload".to_owned()));
        }
        Ok(self.broadcast_to_room(room_id, payload))
    }

    fn broadcast_filtered(
        &self,
        room_id: RoomId,
        payload: &[u8],
        excluded: Option<UserId>,
    ) -> BroadcastReport {
        let Some(text) = outbound_text(payload) else {
            return BroadcastReport::default();
        };
        let targets: Vec<_> = match self.rooms.get(&room_id) {
            Some(room) => room
                .iter()
                .filter(|entry| Some(*entry.key()) != excluded)
                .flat_map(|entry| {
                    let user_id = *entry.key();
                    entry
                        .value()
                        .values()
                        .map(|handle| (room_id, user_id, handle.clone()))
                        .collect::<Vec<_>>()
                })
                .collect(),
            None => Vec::new(),
        };
        self.deliver(targets, text)
    }

    fn deliver(
        &self,
        targets: Vec<(RoomId, UserId, ConnectionHandle)>,
        text: Arc<str>,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for (room_id, user_id, handle) in targets {
            match handle.send_text(text.clone()) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    warn!(room_id = %room_id, user_id = %user_id, error = %err, "连接写入失败，移除连接");
                    handle.close();
                    self.unregister(room_id, user_id, handle.id());
                    report.failed += 1;
                }
            }
        }
        report
    }
}

/// 空负载或退化 JSON 不投递
fn outbound_text(payload: &[u8]) -> Option<Arc<str>> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    if text.is_empty() || text == "{}" || text == "null" {
        return None;
    }
    Some(Arc::from(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use domain::EventType;

    fn event_bytes() -> Vec<u8> {
        Event::new(EventType::Typing, &serde_json::json!({"typing": true}), Utc::now())
            .unwrap()
            .to_bytes()
            .unwrap()
    }

    #[test]
    fn multiple_connections_per_user() {
        let hub = ConnectionHub::new();
        let room = RoomId::generate();
        let user = UserId::generate();
        let (first, mut first_rx) = ConnectionHandle::channel();
        let (second, mut second_rx) = ConnectionHandle::channel();
        let first_id = first.id();
        hub.register(room, user, first);
        hub.register(room, user, second);

        let report = hub.broadcast_to_room(room, &event_bytes());
        assert_eq!(report.delivered, 2);
        assert!(matches!(first_rx.try_recv(), Ok(OutboundFrame::Text(_))));
        assert!(matches!(second_rx.try_recv(), Ok(OutboundFrame::Text(_))));

        hub.unregister(room, user, first_id);
        assert!(hub.is_user_online_in_room(room, user));
        assert_eq!(hub.room_stats(room), RoomStats { users: 1, connections: 1 });
    }

    #[test]
    fn empty_room_and_user_are_pruned() {
        let hub = ConnectionHub::new();
        let room = RoomId::generate();
        let user = UserId::generate();
        let (handle, _rx) = ConnectionHandle::channel();
        let id = handle.id();
        hub.register(room, user, handle);
        assert!(hub.unregister(room, user, id));
        assert!(!hub.is_user_online_in_room(room, user));
        assert!(hub.online_users_in_room(room).is_empty());
        assert_eq!(hub.active_connections_count(), 0);
        assert!(hub.rooms.is_empty());
    }

    #[test]
    fn dead_connections_are_removed_on_broadcast() {
        let hub = ConnectionHub::new();
        let room = RoomId::generate();
        let alive_user = UserId::generate();
        let dead_user = UserId::generate();
        let (alive, _alive_rx) = ConnectionHandle::channel();
        let (dead, dead_rx) = ConnectionHandle::channel();
        hub.register(room, alive_user, alive);
        hub.register(room, dead_user, dead);
        drop(dead_rx);

        let report = hub.broadcast_to_room(room, &event_bytes());
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 1 });
        assert!(!hub.is_user_online_in_room(room, dead_user));
        assert_eq!(hub.online_users_in_room(room), vec![alive_user]);
    }

    #[test]
    fn backed_up_connection_is_closed_and_removed() {
        let hub = ConnectionHub::new();
        let room = RoomId::generate();
        let slow_user = UserId::generate();
        let (slow, mut slow_rx) = ConnectionHandle::with_capacity(1);
        let closed = slow.closed();
        hub.register(room, slow_user, slow);

        let first = hub.broadcast_to_room(room, &event_bytes());
        assert_eq!(first, BroadcastReport { delivered: 1, failed: 0 });
        assert!(!closed.is_cancelled());

        let second = hub.broadcast_to_room(room, &event_bytes());
        assert_eq!(second, BroadcastReport { delivered: 0, failed: 1 });
        assert!(closed.is_cancelled());
        assert!(!hub.is_user_online_in_room(room, slow_user));
        assert_eq!(hub.active_connections_count(), 0);

        assert!(matches!(slow_rx.try_recv(), Ok(OutboundFrame::Text(_))));
        assert!(slow_rx.try_recv().is_err());
    }

    #[test]
    fn except_skips_excluded_user() {
        let hub = ConnectionHub::new();
        let room = RoomId::generate();
        let target = UserId::generate();
        let other = UserId::generate();
        let (target_handle, mut target_rx) = ConnectionHandle::channel();
        let (other_handle, mut other_rx) = ConnectionHandle::channel();
        hub.register(room, target, target_handle);
        hub.register(room, other, other_handle);

        hub.broadcast_to_room_except(room, target, &event_bytes());
        assert!(target_rx.try_recv().is_err());
        assert!(other_rx.try_recv().is_ok());
    }

    #[test]
    fn user_broadcast_reaches_every_room() {
        let hub = ConnectionHub::new();
        let user = UserId::generate();
        let (a, mut a_rx) = ConnectionHandle::channel();
        let (b, mut b_rx) = ConnectionHandle::channel();
        hub.register(RoomId::generate(), user, a);
        hub.register(RoomId::generate(), user, b);
        assert_eq!(hub.broadcast_to_user(user, &event_bytes()).delivered, 2);
        assert!(a_rx.try_recv().is_ok());
        assert!(b_rx.try_recv().is_ok());
    }

    #[test]
    fn degenerate_payloads_are_dropped() {
        let hub = ConnectionHub::new();
        let room = RoomId::generate();
        let (handle, mut rx) = ConnectionHandle::channel();
        hub.register(room, UserId::generate(), handle);
        assert_eq!(hub.broadcast_to_room(room, b"{}").delivered, 0);
        assert_eq!(hub.broadcast_to_room(room, b"").delivered, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn force_disconnect_sends_close() {
        let hub = ConnectionHub::new();
        let room = RoomId::generate();
        let user = UserId::generate();
        let (handle, mut rx) = ConnectionHandle::channel();
        hub.register(room, user, handle);
        assert_eq!(hub.force_disconnect(room, Some(user)), 1);
        assert_eq!(rx.try_recv(), Ok(OutboundFrame::Close));
        assert_eq!(hub.active_connections_count(), 0);
    }

    #[test]
    fn bus_messages_route_by_topic() {
        let hub = ConnectionHub::new();
        let room = RoomId::generate();
        let (handle, mut rx) = ConnectionHandle::channel();
        hub.register(room, UserId::generate(), handle);

        let topic = crate::topics::room_topic(room);
        let report = hub.handle_bus_message(&topic, &event_bytes()).unwrap();
        assert_eq!(report.delivered, 1);
        assert!(rx.try_recv().is_ok());

        assert!(matches!(
            hub.handle_bus_message("room-events", &event_bytes()),
            Err(HubError::InvalidTopic(_))
        ));
        assert!(matches!(
            hub.handle_bus_message(&topic, b"not json"),
            Err(HubError::InvalidEnvelope(_))
        ));
    }
}

//! 消息总线主题命名

use domain::RoomId;

pub const ROOM_TOPIC_PREFIX: &str = "chat-room-";
/// 房间生命周期事件
pub const ROOM_EVENTS_TOPIC: &str = "room-events";
/// 离线用户通知
pub const NOTIFICATIONS_TOPIC: &str = "chat-notifications";

pub fn room_topic(room_id: RoomId) -> String {
    format!("{ROOM_TOPIC_PREFIX}{room_id}")
}

/// 从 `chat-room-<id>` 中取出房间 ID 部分
pub fn room_from_topic(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(ROOM_TOPIC_PREFIX)
        .filter(|room| !room.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_roundtrip() {
        let room = RoomId::generate();
        let topic = room_topic(room);
        assert_eq!(room_from_topic(&topic), Some(room.to_string().as_str()));
        assert_eq!(room_from_topic("chat-room-"), None);
        assert_eq!(room_from_topic("room-events"), None);
    }
}

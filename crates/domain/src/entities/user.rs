//! 用户与房间的展示信息
//!
//! 事件负载中携带的作者/房间信息。查询失败时降级为只含原始 ID 的占位信息。

use serde::{Deserialize, Serialize};

use crate::value_objects::{RoomId, UserId};

/// 目录中的用户记录（只读视图）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub role_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserName {
    pub first: String,
    pub last: String,
}

impl UserName {
    pub fn display(&self) -> String {
        format!("{} {}", self.first, self.last).trim().to_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRef {
    #[serde(rename = "_id")]
    pub id: String,
}

/// 事件中的用户信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(rename = "_id")]
    pub id: String,
    pub username: String,
    pub name: UserName,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub role: Option<RoleRef>,
}

impl UserInfo {
    /// 用户查询失败时的占位信息，保证投递不被阻塞。
    pub fn fallback(user_id: UserId) -> Self {
        let short = user_id.short();
        Self {
            id: user_id.to_string(),
            username: format!("user_{short}"),
            name: UserName {
                first: "User".to_owned(),
                last: short,
            },
            role: None,
        }
    }

    /// 由目录记录构造，空字段同样回落到占位值。
    pub fn from_record(record: &UserRecord) -> Self {
        let short = record.id.short();
        let username = if record.username.trim().is_empty() {
            format!("user_{short}")
        } else {
            record.username.clone()
        };
        let name = if record.first_name.is_empty() && record.last_name.is_empty() {
            UserName {
                first: "User".to_owned(),
                last: short,
            }
        } else {
            UserName {
                first: record.first_name.clone(),
                last: record.last_name.clone(),
            }
        };
        Self {
            id: record.id.to_string(),
            username,
            name,
            role: record.role_id.clone().map(|id| RoleRef { id }),
        }
    }
}

/// 事件中的房间信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    #[serde(rename = "_id")]
    pub id: String,
}

impl From<RoomId> for RoomInfo {
    fn from(room_id: RoomId) -> Self {
        Self {
            id: room_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn fallback_uses_short_id() {
        let id = UserId::new(Uuid::parse_str("deadbeef-0000-4000-8000-000000000000").unwrap());
        let info = UserInfo::fallback(id);
        assert_eq!(info.username, "user_deadbeef");
        assert_eq!(info.name.display(), "User deadbeef");
        assert!(info.role.is_none());
    }

    #[test]
    fn blank_record_fields_are_filled() {
        let id = UserId::generate();
        let record = UserRecord {
            id,
            username: " ".into(),
            first_name: String::new(),
            last_name: String::new(),
            role_id: Some("admin".into()),
        };
        let info = UserInfo::from_record(&record);
        assert_eq!(info.username, format!("user_{}", id.short()));
        assert_eq!(info.role.unwrap().id, "admin");
    }
}

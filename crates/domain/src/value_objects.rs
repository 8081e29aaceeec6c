use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;

/// 统一的时间戳类型。
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// 为基于 UUID 的标识生成 newtype 及常用转换。
macro_rules! uuid_identifier {
    ($(#[$meta:meta])* $name:ident, $field:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new(id: Uuid) -> Self {
                Self(id)
            }

            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn nil() -> Self {
                Self(Uuid::nil())
            }

            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }

            /// 截取前 8 位，用于日志和占位展示名。
            pub fn short(&self) -> String {
                self.0.simple().to_string()[..8].to_owned()
            }

            pub fn parse(value: &str) -> Result<Self, DomainError> {
                Uuid::parse_str(value.trim())
                    .map(Self)
                    .map_err(|_| DomainError::validation_error($field, "invalid identifier"))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

uuid_identifier!(
    /// 用户唯一标识。
    UserId,
    "user_id"
);
uuid_identifier!(
    /// 聊天室唯一标识。
    RoomId,
    "room_id"
);
uuid_identifier!(
    /// 消息唯一标识，在任何异步处理开始之前同步生成。
    MessageId,
    "message_id"
);
uuid_identifier!(
    /// 处罚记录标识。
    ModerationId,
    "moderation_id"
);
uuid_identifier!(
    /// 单条长连接的标识，同一用户可持有多条连接。
    ConnectionId,
    "connection_id"
);

//! Kafka 消息总线模块
//!
//! 生产者按房间键发布事件，消费者订阅全部房间主题并转交本地连接注册表。
//! 每条消息带来源实例头，实例不会重复投递自己发布的事件。

pub mod consumer;
pub mod error;
pub mod producer;

pub use consumer::{BusMessageHandler, RoomEventConsumer};
pub use error::{KafkaError, KafkaResult};
pub use producer::KafkaEventBus;

/// 来源实例消息头
pub const ORIGIN_HEADER: &str = "origin";

//! 基础设施层实现。
//!
//! Postgres 仓储、Redis 消息缓存与 Kafka 消息总线，实现应用层定义的端口。

pub mod builder;
pub mod db;
pub mod kafka;
pub mod redis;
pub mod retry;

pub use builder::{Infrastructure, InfrastructureError};
pub use db::{
    create_pg_pool, PgMessageRepository, PgMessageStatusRepository, PgModerationRepository, PgReactionRepository,
    PgStorage, PgUserDirectory, MIGRATOR,
};
pub use kafka::{BusMessageHandler, KafkaError, KafkaEventBus, RoomEventConsumer};
pub use redis::{RedisCacheStore, RedisError};

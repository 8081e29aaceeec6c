//! Redis 缓存模块
//!
//! 房间最近消息的有序集合与单条消息回应的 JSON 缓存。

pub mod cache_store;
pub mod error;

pub use cache_store::RedisCacheStore;
pub use error::{RedisError, RedisResult};

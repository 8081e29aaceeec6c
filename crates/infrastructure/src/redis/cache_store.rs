//! Redis 缓存实现
//!
//! 每个房间一个消息 ID 的 ZSET（score 为毫秒时间戳）加一个 ID → 正文的 HASH。
//! 写入、裁剪与 TTL 刷新在同一个 Lua 脚本里完成，同 ID 重复写入只会覆盖正文。
//! 回应以整块 JSON 存在独立的键上。

use std::sync::LazyLock;
use std::time::Duration;

use application::cache::{message_reactions_key, room_message_bodies_key, room_messages_key};
use application::{CacheError, CacheStore};
use async_trait::async_trait;
use config::{CacheConfig, RedisConfig};
use domain::{EnrichedMessage, MessageId, Reaction, RoomId, UserId};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, info, warn};

use super::error::{RedisError, RedisResult};

const SCAN_BATCH: usize = 200;

/// KEYS: 索引 ZSET、正文 HASH；ARGV: 上限、TTL 秒数，随后每条消息依次为 id、score、正文
static WRITE_MESSAGES: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local index_key = KEYS[1]
        local bodies_key = KEYS[2]
        local max = tonumber(ARGV[1])
        local ttl = tonumber(ARGV[2])

        for i = 3, #ARGV, 3 do
            redis.call('ZADD', index_key, ARGV[i + 1], ARGV[i])
            redis.call('HSET', bodies_key, ARGV[i], ARGV[i + 2])
        end

        local overflow = redis.call('ZCARD', index_key) - max
        if overflow > 0 then
            local evicted = redis.call('ZRANGE', index_key, 0, overflow - 1)
            redis.call('ZREMRANGEBYRANK', index_key, 0, overflow - 1)
            redis.call('HDEL', bodies_key, unpack(evicted))
        end

        redis.call('EXPIRE', index_key, ttl)
        redis.call('EXPIRE', bodies_key, ttl)
        return math.max(overflow, 0)
        "#,
    )
});

pub struct RedisCacheStore {
    manager: ConnectionManager,
    max_messages: usize,
    message_ttl: Duration,
    reaction_ttl: Duration,
}

impl RedisCacheStore {
    pub async fn connect(redis: &RedisConfig, cache: &CacheConfig) -> RedisResult<Self> {
        let client = redis::Client::open(redis.url.as_str()).map_err(|e| RedisError::ConfigError {
            message: format!("创建 Redis 客户端失败: {}", e),
        })?;
        let manager = ConnectionManager::new(client).await?;
        info!(url = %redis.url, "Redis 缓存连接成功");
        Ok(Self::new(manager, cache))
    }

    pub fn new(manager: ConnectionManager, cache: &CacheConfig) -> Self {
        Self {
            manager,
            max_messages: cache.max_messages.max(1),
            message_ttl: cache.message_ttl(),
            reaction_ttl: cache.reaction_ttl(),
        }
    }

    async fn write_messages(&self, room_id: RoomId, messages: &[EnrichedMessage]) -> RedisResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let mut invocation = WRITE_MESSAGES.prepare_invoke();
        invocation
            .key(room_messages_key(room_id))
            .key(room_message_bodies_key(room_id))
            .arg(self.max_messages)
            .arg(ttl_secs(self.message_ttl));
        for message in messages {
            invocation
                .arg(message.id().to_string())
                .arg(message.message.timestamp_millis())
                .arg(serde_json::to_string(message)?);
        }
        let evicted: i64 = invocation.invoke_async(&mut conn).await?;

        debug!(room_id = %room_id, count = messages.len(), evicted, "消息已写入缓存");
        Ok(())
    }

    async fn read_messages(&self, room_id: RoomId, limit: usize) -> RedisResult<Vec<EnrichedMessage>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.manager.clone();
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let ids: Vec<String> = conn.zrevrange(room_messages_key(room_id), 0, stop).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let bodies: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(room_message_bodies_key(room_id))
            .arg(&ids)
            .query_async(&mut conn)
            .await?;
        // 读取期间被裁剪的条目没有正文，直接跳过
        Ok(bodies
            .into_iter()
            .flatten()
            .filter_map(|entry| match serde_json::from_str::<EnrichedMessage>(&entry) {
                Ok(message) => Some(message),
                Err(err) => {
                    warn!(room_id = %room_id, error = %err, "跳过无法解析的缓存消息");
                    None
                }
            })
            .collect())
    }

    async fn delete_room(&self, room_id: RoomId) -> RedisResult<()> {
        let mut conn = self.manager.clone();
        let pattern = format!("chat:room:{room_id}:reactions:*");
        let mut keys = vec![room_messages_key(room_id), room_message_bodies_key(room_id)];
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        conn.del::<_, ()>(&keys).await?;
        info!(room_id = %room_id, keys = keys.len(), "房间缓存已清空");
        Ok(())
    }

    async fn read_reactions(&self, key: &str) -> RedisResult<Vec<Reaction>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    async fn write_reactions(&self, key: &str, reactions: &[Reaction]) -> RedisResult<()> {
        let mut conn = self.manager.clone();
        if reactions.is_empty() {
            conn.del::<_, ()>(key).await?;
        } else {
            let payload = serde_json::to_string(reactions)?;
            conn.set_ex::<_, _, ()>(key, payload, self.reaction_ttl.as_secs().max(1)).await?;
        }
        Ok(())
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX)
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn save_message(&self, room_id: RoomId, message: &EnrichedMessage) -> Result<(), CacheError> {
        Ok(self.write_messages(room_id, std::slice::from_ref(message)).await?)
    }

    async fn save_messages(&self, room_id: RoomId, messages: &[EnrichedMessage]) -> Result<(), CacheError> {
        Ok(self.write_messages(room_id, messages).await?)
    }

    async fn room_messages(&self, room_id: RoomId, limit: usize) -> Result<Vec<EnrichedMessage>, CacheError> {
        Ok(self.read_messages(room_id, limit).await?)
    }

    async fn clear_room(&self, room_id: RoomId) -> Result<(), CacheError> {
        Ok(self.delete_room(room_id).await?)
    }

    async fn save_reaction(&self, room_id: RoomId, reaction: &Reaction) -> Result<(), CacheError> {
        let key = message_reactions_key(room_id, reaction.message_id);
        let mut reactions = self.read_reactions(&key).await?;
        reactions.retain(|existing| existing.user_id != reaction.user_id);
        reactions.push(reaction.clone());
        Ok(self.write_reactions(&key, &reactions).await?)
    }

    async fn remove_reaction(
        &self,
        room_id: RoomId,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<(), CacheError> {
        let key = message_reactions_key(room_id, message_id);
        let mut reactions = self.read_reactions(&key).await?;
        let before = reactions.len();
        reactions.retain(|existing| existing.user_id != user_id);
        if reactions.len() != before {
            self.write_reactions(&key, &reactions).await?;
        }
        Ok(())
    }

    async fn reactions(&self, room_id: RoomId, message_id: MessageId) -> Result<Vec<Reaction>, CacheError> {
        Ok(self.read_reactions(&message_reactions_key(room_id, message_id)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_never_rounds_down_to_zero() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(86_400)), 86_400);
    }
}

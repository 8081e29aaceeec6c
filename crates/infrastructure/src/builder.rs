use std::sync::Arc;

use config::AppConfig;
use thiserror::Error;
use tracing::info;

use crate::db::{create_pg_pool, PgStorage, MIGRATOR};
use crate::kafka::{KafkaError, KafkaEventBus};
use crate::redis::{RedisCacheStore, RedisError};
use crate::retry::{retry_async, RetryConfig};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

/// 启动期建立的全部外部连接
#[derive(Clone)]
pub struct Infrastructure {
    pub storage: PgStorage,
    pub cache: Arc<RedisCacheStore>,
    pub bus: Arc<KafkaEventBus>,
}

impl Infrastructure {
    pub async fn connect(config: &AppConfig) -> Result<Self, InfrastructureError> {
        let pool = retry_async(RetryConfig::startup(), "postgres.connect", || {
            create_pg_pool(&config.database.url, config.database.max_connections)
        })
        .await?;
        MIGRATOR.run(&pool).await?;
        info!("数据库迁移完成");

        let cache = retry_async(RetryConfig::startup(), "redis.connect", || {
            RedisCacheStore::connect(&config.redis, &config.cache)
        })
        .await?;
        let bus = KafkaEventBus::new(&config.kafka)?;

        Ok(Self {
            storage: PgStorage::new(pool),
            cache: Arc::new(cache),
            bus: Arc::new(bus),
        })
    }
}

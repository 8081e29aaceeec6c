//! Postgres 仓储实现
//!
//! 运行时 `query_as` + `FromRow` 记录结构，记录到实体的转换统一走 `TryFrom`。

mod directory;
mod message_status;
mod messages;
mod moderations;
mod reactions;

use std::sync::Arc;

use application::RepositoryError;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub use directory::PgUserDirectory;
pub use message_status::PgMessageStatusRepository;
pub use messages::PgMessageRepository;
pub use moderations::PgModerationRepository;
pub use reactions::PgReactionRepository;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn create_pg_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

pub(crate) fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    match &err {
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict(db.message().to_owned()),
        _ => RepositoryError::storage(err.to_string()),
    }
}

pub(crate) fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

/// 全部仓储共享同一个连接池
#[derive(Clone)]
pub struct PgStorage {
    pub pool: PgPool,
    pub messages: Arc<PgMessageRepository>,
    pub statuses: Arc<PgMessageStatusRepository>,
    pub moderations: Arc<PgModerationRepository>,
    pub reactions: Arc<PgReactionRepository>,
    pub directory: Arc<PgUserDirectory>,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            messages: Arc::new(PgMessageRepository::new(pool.clone())),
            statuses: Arc::new(PgMessageStatusRepository::new(pool.clone())),
            moderations: Arc::new(PgModerationRepository::new(pool.clone())),
            reactions: Arc::new(PgReactionRepository::new(pool.clone())),
            directory: Arc::new(PgUserDirectory::new(pool.clone())),
            pool,
        }
    }
}

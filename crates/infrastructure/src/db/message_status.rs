use application::{MessageStatusRepository, RepositoryError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{ChatMessage, MessageId, MessageStatus, PipelineStatus, RoomId, StatusUpdate, Timestamp};
use sqlx::{types::Json, FromRow, PgPool};
use uuid::Uuid;

use super::{invalid_data, map_sqlx_err};

const STATUS_COLUMNS: &str = "message_id, room_id, broadcast_at, saved_to_db, saved_to_cache, notification_sent, retry_count, last_error, status, payload, created_at, updated_at";

#[derive(Debug, FromRow)]
struct StatusRow {
    message_id: Uuid,
    room_id: Uuid,
    broadcast_at: DateTime<Utc>,
    saved_to_db: bool,
    saved_to_cache: bool,
    notification_sent: bool,
    retry_count: i32,
    last_error: Option<String>,
    status: String,
    payload: Option<Json<ChatMessage>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<StatusRow> for MessageStatus {
    type Error = RepositoryError;

    fn try_from(row: StatusRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<PipelineStatus>()
            .map_err(|err| invalid_data(err.to_string()))?;
        Ok(MessageStatus {
            message_id: MessageId::from(row.message_id),
            room_id: RoomId::from(row.room_id),
            broadcast_at: row.broadcast_at,
            saved_to_db: row.saved_to_db,
            saved_to_cache: row.saved_to_cache,
            notification_sent: row.notification_sent,
            retry_count: u32::try_from(row.retry_count).unwrap_or_default(),
            last_error: row.last_error,
            status,
            payload: row.payload.map(|Json(message)| message),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub struct PgMessageStatusRepository {
    pool: PgPool,
}

impl PgMessageStatusRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn require_row(rows_affected: u64) -> Result<(), RepositoryError> {
    if rows_affected == 0 {
        Err(RepositoryError::NotFound)
    } else {
        Ok(())
    }
}

#[async_trait]
impl MessageStatusRepository for PgMessageStatusRepository {
    async fn create(&self, status: &MessageStatus) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO message_status (message_id, room_id, broadcast_at, saved_to_db, saved_to_cache, notification_sent, retry_count, last_error, status, payload, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (message_id) DO NOTHING
            "#,
        )
        .bind(Uuid::from(status.message_id))
        .bind(Uuid::from(status.room_id))
        .bind(status.broadcast_at)
        .bind(status.saved_to_db)
        .bind(status.saved_to_cache)
        .bind(status.notification_sent)
        .bind(i32::try_from(status.retry_count).unwrap_or(i32::MAX))
        .bind(&status.last_error)
        .bind(status.status.as_str())
        .bind(status.payload.as_ref().map(Json))
        .bind(status.created_at)
        .bind(status.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn update(&self, message_id: MessageId, update: StatusUpdate, at: Timestamp) -> Result<(), RepositoryError> {
        let result = match update {
            // 列名来自固定枚举，不会拼接外部输入
            StatusUpdate::Stage(flag, value) => sqlx::query(&format!(
                "UPDATE message_status SET {} = $2, updated_at = $3 WHERE message_id = $1",
                flag.column()
            ))
            .bind(Uuid::from(message_id))
            .bind(value)
            .bind(at)
            .execute(&self.pool)
            .await,
            StatusUpdate::Status(status) => {
                sqlx::query("UPDATE message_status SET status = $2, updated_at = $3 WHERE message_id = $1")
                    .bind(Uuid::from(message_id))
                    .bind(status.as_str())
                    .bind(at)
                    .execute(&self.pool)
                    .await
            }
        }
        .map_err(map_sqlx_err)?;
        require_row(result.rows_affected())
    }

    async fn record_error(
        &self,
        message_id: MessageId,
        error: &str,
        retry_count: u32,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE message_status SET last_error = $2, retry_count = $3, updated_at = $4 WHERE message_id = $1",
        )
        .bind(Uuid::from(message_id))
        .bind(error)
        .bind(i32::try_from(retry_count).unwrap_or(i32::MAX))
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        require_row(result.rows_affected())
    }

    async fn find(&self, message_id: MessageId) -> Result<Option<MessageStatus>, RepositoryError> {
        let row = sqlx::query_as::<_, StatusRow>(&format!(
            "SELECT {STATUS_COLUMNS} FROM message_status WHERE message_id = $1"
        ))
        .bind(Uuid::from(message_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        row.map(MessageStatus::try_from).transpose()
    }

    async fn find_phantoms(&self, cutoff: Timestamp) -> Result<Vec<MessageStatus>, RepositoryError> {
        let rows = sqlx::query_as::<_, StatusRow>(&format!(
            r#"
            SELECT {STATUS_COLUMNS} FROM message_status
            WHERE broadcast_at <= $1
              AND status = 'pending'
              AND NOT (saved_to_db AND saved_to_cache AND notification_sent)
            ORDER BY broadcast_at
            "#
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(MessageStatus::try_from).collect()
    }
}

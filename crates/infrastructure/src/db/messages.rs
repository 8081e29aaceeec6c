use application::{MessageRepository, RepositoryError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    ChatMessage, EvoucherInfo, MentionInfo, MessageId, ModerationNotice, ReplyInfo, RoomId, StickerInfo, UserId,
};
use sqlx::types::Json;
use sqlx::{FromRow, PgExecutor, PgPool};
use uuid::Uuid;

use super::map_sqlx_err;

const MESSAGE_COLUMNS: &str = "id, room_id, user_id, message, sticker, reply_to, mentions, mention_info, evoucher, moderation, created_at";

#[derive(Debug, FromRow)]
struct MessageRow {
    id: Uuid,
    room_id: Uuid,
    user_id: Uuid,
    message: String,
    sticker: Option<Json<StickerInfo>>,
    reply_to: Option<Json<ReplyInfo>>,
    mentions: Vec<Uuid>,
    mention_info: Json<Vec<MentionInfo>>,
    evoucher: Option<Json<EvoucherInfo>>,
    moderation: Option<Json<ModerationNotice>>,
    created_at: DateTime<Utc>,
}

impl From<MessageRow> for ChatMessage {
    fn from(row: MessageRow) -> Self {
        ChatMessage {
            id: MessageId::from(row.id),
            room_id: RoomId::from(row.room_id),
            user_id: UserId::from(row.user_id),
            message: row.message,
            timestamp: row.created_at,
            sticker: row.sticker.map(|Json(sticker)| sticker),
            reply_to: row.reply_to.map(|Json(reply)| reply),
            mentions: row.mentions.into_iter().map(UserId::from).collect(),
            mention_info: row.mention_info.0,
            evoucher: row.evoucher.map(|Json(evoucher)| evoucher),
            moderation: row.moderation.map(|Json(notice)| notice),
        }
    }
}

pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// 以消息 ID 为冲突键，重复写入静默忽略
async fn insert_message<'e, E>(executor: E, message: &ChatMessage) -> Result<(), RepositoryError>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO messages (id, room_id, user_id, message, message_type, sticker, reply_to, mentions, mention_info, evoucher, moderation, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(Uuid::from(message.id))
    .bind(Uuid::from(message.room_id))
    .bind(Uuid::from(message.user_id))
    .bind(&message.message)
    .bind(message.kind().as_str())
    .bind(message.sticker.as_ref().map(Json))
    .bind(message.reply_to.as_ref().map(Json))
    .bind(message.mentions.iter().copied().map(Uuid::from).collect::<Vec<_>>())
    .bind(Json(&message.mention_info))
    .bind(message.evoucher.as_ref().map(Json))
    .bind(message.moderation.as_ref().map(Json))
    .bind(message.timestamp)
    .execute(executor)
    .await
    .map_err(map_sqlx_err)?;
    Ok(())
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn save(&self, message: &ChatMessage) -> Result<(), RepositoryError> {
        insert_message(&self.pool, message).await
    }

    async fn save_batch(&self, messages: &[ChatMessage]) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        for message in messages {
            insert_message(&mut *tx, message).await?;
        }
        tx.commit().await.map_err(map_sqlx_err)
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<ChatMessage>, RepositoryError> {
        let row = sqlx::query_as::<_, MessageRow>(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"))
            .bind(Uuid::from(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(row.map(ChatMessage::from))
    }

    async fn find_room_history(&self, room_id: RoomId, limit: usize) -> Result<Vec<ChatMessage>, RepositoryError> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id = $1 ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(Uuid::from(room_id))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(rows.into_iter().map(ChatMessage::from).collect())
    }
}

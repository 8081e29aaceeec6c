use application::{ModerationHistoryFilter, ModerationRepository, RepositoryError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    ModerationDuration, ModerationId, ModerationRecord, ModerationState, ModerationType, MuteRestriction, RoomId,
    Timestamp, UserId,
};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::{invalid_data, map_sqlx_err};

const MODERATION_COLUMNS: &str = "id, room_id, user_id, moderator_id, type, duration, start_time, end_time, restriction, reason, status, revoked_at, revoked_by, created_at, updated_at";

#[derive(Debug, FromRow)]
struct ModerationRow {
    id: Uuid,
    room_id: Uuid,
    user_id: Uuid,
    moderator_id: Uuid,
    #[sqlx(rename = "type")]
    kind: String,
    duration: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    restriction: Option<String>,
    reason: String,
    status: String,
    revoked_at: Option<DateTime<Utc>>,
    revoked_by: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ModerationRow> for ModerationRecord {
    type Error = RepositoryError;

    fn try_from(row: ModerationRow) -> Result<Self, Self::Error> {
        let invalid = |err: domain::DomainError| invalid_data(err.to_string());
        Ok(ModerationRecord {
            id: ModerationId::from(row.id),
            room_id: RoomId::from(row.room_id),
            user_id: UserId::from(row.user_id),
            moderator_id: UserId::from(row.moderator_id),
            kind: row.kind.parse::<ModerationType>().map_err(invalid)?,
            duration: row.duration.parse::<ModerationDuration>().map_err(invalid)?,
            start_time: row.start_time,
            end_time: row.end_time,
            restriction: row
                .restriction
                .map(|value| value.parse::<MuteRestriction>())
                .transpose()
                .map_err(invalid)?,
            reason: row.reason,
            status: row.status.parse::<ModerationState>().map_err(invalid)?,
            revoked_at: row.revoked_at,
            revoked_by: row.revoked_by.map(UserId::from),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub struct PgModerationRepository {
    pool: PgPool,
}

impl PgModerationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ModerationRepository for PgModerationRepository {
    /// 有效封禁/禁言的唯一性由部分唯一索引保证，冲突映射为 Conflict
    async fn insert(&self, record: &ModerationRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO user_moderations (id, room_id, user_id, moderator_id, type, duration, start_time, end_time, restriction, reason, status, revoked_at, revoked_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(Uuid::from(record.id))
        .bind(Uuid::from(record.room_id))
        .bind(Uuid::from(record.user_id))
        .bind(Uuid::from(record.moderator_id))
        .bind(record.kind.as_str())
        .bind(record.duration.as_str())
        .bind(record.start_time)
        .bind(record.end_time)
        .bind(record.restriction.map(|restriction| restriction.as_str()))
        .bind(&record.reason)
        .bind(record.status.as_str())
        .bind(record.revoked_at)
        .bind(record.revoked_by.map(Uuid::from))
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn find_active(
        &self,
        user_id: UserId,
        room_id: RoomId,
        kind: ModerationType,
    ) -> Result<Option<ModerationRecord>, RepositoryError> {
        let row = sqlx::query_as::<_, ModerationRow>(&format!(
            r#"
            SELECT {MODERATION_COLUMNS} FROM user_moderations
            WHERE user_id = $1 AND room_id = $2 AND type = $3 AND status = 'active'
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(Uuid::from(user_id))
        .bind(Uuid::from(room_id))
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        row.map(ModerationRecord::try_from).transpose()
    }

    async fn update(&self, record: &ModerationRecord) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE user_moderations
            SET status = $2, end_time = $3, revoked_at = $4, revoked_by = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(Uuid::from(record.id))
        .bind(record.status.as_str())
        .bind(record.end_time)
        .bind(record.revoked_at)
        .bind(record.revoked_by.map(Uuid::from))
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn history(&self, filter: &ModerationHistoryFilter) -> Result<Vec<ModerationRecord>, RepositoryError> {
        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {MODERATION_COLUMNS} FROM user_moderations WHERE TRUE"));
        if let Some(room_id) = filter.room_id {
            query.push(" AND room_id = ").push_bind(Uuid::from(room_id));
        }
        if let Some(user_id) = filter.user_id {
            query.push(" AND user_id = ").push_bind(Uuid::from(user_id));
        }
        query.push(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = query
            .build_query_as::<ModerationRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        rows.into_iter().map(ModerationRecord::try_from).collect()
    }

    async fn expire_temporary(&self, now: Timestamp) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE user_moderations
            SET status = 'expired', updated_at = $1
            WHERE status = 'active' AND duration = 'temporary' AND end_time IS NOT NULL AND end_time <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.rows_affected())
    }
}

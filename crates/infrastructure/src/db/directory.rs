use application::{RepositoryError, UserDirectory};
use async_trait::async_trait;
use domain::{RoomId, UserId, UserRecord};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::map_sqlx_err;

#[derive(Debug, FromRow)]
struct DirectoryUserRow {
    id: Uuid,
    username: String,
    first_name: String,
    last_name: String,
    role_id: Option<String>,
}

impl From<DirectoryUserRow> for UserRecord {
    fn from(row: DirectoryUserRow) -> Self {
        UserRecord {
            id: UserId::from(row.id),
            username: row.username,
            first_name: row.first_name,
            last_name: row.last_name,
            role_id: row.role_id,
        }
    }
}

/// 用户与房间成员的只读查询
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find_user(&self, user_id: UserId) -> Result<Option<UserRecord>, RepositoryError> {
        let row = sqlx::query_as::<_, DirectoryUserRow>(
            "SELECT id, username, first_name, last_name, role_id FROM users WHERE id = $1",
        )
        .bind(Uuid::from(user_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(row.map(UserRecord::from))
    }

    async fn find_by_usernames(&self, usernames: &[String]) -> Result<Vec<UserRecord>, RepositoryError> {
        if usernames.is_empty() {
            return Ok(Vec::new());
        }
        let lowered: Vec<String> = usernames.iter().map(|name| name.to_lowercase()).collect();
        let rows = sqlx::query_as::<_, DirectoryUserRow>(
            "SELECT id, username, first_name, last_name, role_id FROM users WHERE LOWER(username) = ANY($1)",
        )
        .bind(&lowered)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(rows.into_iter().map(UserRecord::from).collect())
    }

    async fn room_members(&self, room_id: RoomId) -> Result<Vec<UserId>, RepositoryError> {
        let members: Vec<Uuid> =
            sqlx::query_scalar("SELECT user_id FROM room_members WHERE room_id = $1 ORDER BY joined_at")
                .bind(Uuid::from(room_id))
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
        Ok(members.into_iter().map(UserId::from).collect())
    }
}

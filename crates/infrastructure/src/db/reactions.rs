use application::{ReactionRepository, RepositoryError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{MessageId, Reaction, ReactionAction, UserId};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{invalid_data, map_sqlx_err};

#[derive(Debug, FromRow)]
struct ReactionRow {
    message_id: Uuid,
    user_id: Uuid,
    reaction: String,
    action: String,
    created_at: DateTime<Utc>,
}

fn parse_action(value: &str) -> Result<ReactionAction, RepositoryError> {
    match value {
        "add" => Ok(ReactionAction::Add),
        "update" => Ok(ReactionAction::Update),
        "delete" => Ok(ReactionAction::Delete),
        other => Err(invalid_data(format!("unknown reaction action '{other}'"))),
    }
}

impl TryFrom<ReactionRow> for Reaction {
    type Error = RepositoryError;

    fn try_from(row: ReactionRow) -> Result<Self, Self::Error> {
        Ok(Reaction {
            message_id: MessageId::from(row.message_id),
            user_id: UserId::from(row.user_id),
            reaction: row.reaction,
            action: parse_action(&row.action)?,
            timestamp: row.created_at,
        })
    }
}

pub struct PgReactionRepository {
    pool: PgPool,
}

impl PgReactionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReactionRepository for PgReactionRepository {
    async fn find(&self, message_id: MessageId, user_id: UserId) -> Result<Option<Reaction>, RepositoryError> {
        let row = sqlx::query_as::<_, ReactionRow>(
            "SELECT message_id, user_id, reaction, action, created_at FROM message_reactions WHERE message_id = $1 AND user_id = $2",
        )
        .bind(Uuid::from(message_id))
        .bind(Uuid::from(user_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        row.map(Reaction::try_from).transpose()
    }

    async fn insert(&self, reaction: &Reaction) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO message_reactions (message_id, user_id, reaction, action, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::from(reaction.message_id))
        .bind(Uuid::from(reaction.user_id))
        .bind(&reaction.reaction)
        .bind(reaction.action.as_str())
        .bind(reaction.timestamp)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn delete(&self, message_id: MessageId, user_id: UserId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM message_reactions WHERE message_id = $1 AND user_id = $2")
            .bind(Uuid::from(message_id))
            .bind(Uuid::from(user_id))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, message_id: MessageId) -> Result<Vec<Reaction>, RepositoryError> {
        let rows = sqlx::query_as::<_, ReactionRow>(
            "SELECT message_id, user_id, reaction, action, created_at FROM message_reactions WHERE message_id = $1 ORDER BY created_at",
        )
        .bind(Uuid::from(message_id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(Reaction::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_column_matches_domain_labels() {
        for action in [ReactionAction::Add, ReactionAction::Update, ReactionAction::Delete] {
            assert_eq!(parse_action(action.as_str()).unwrap(), action);
        }
        assert!(parse_action("toggle").is_err());
    }
}

//! 消息回应
//!
//! 每个用户对每条消息至多一个回应：再次点同一表情撤销，点不同表情替换。
//! 每次变更都会同步修补缓存中的消息副本。

use std::sync::Arc;
use std::time::Duration;

use domain::{DomainError, MessageId, Reaction, ReactionAction, ReactionToggle, RoomId, UserId};
use serde::Serialize;
use tracing::warn;

use crate::cache::CacheStore;
use crate::clock::Clock;
use crate::emitter::EventEmitter;
use crate::error::{bounded, ApplicationResult};
use crate::repository::{MessageRepository, ReactionRepository};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReactionOutcome {
    pub action: ReactionAction,
    /// 删除时为被撤销的回应
    pub reaction: Reaction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<Reaction>,
}

pub struct ReactionService {
    reactions: Arc<dyn ReactionRepository>,
    messages: Arc<dyn MessageRepository>,
    cache: Arc<dyn CacheStore>,
    emitter: Arc<EventEmitter>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    cache_scan_limit: usize,
}

impl ReactionService {
    pub fn new(
        reactions: Arc<dyn ReactionRepository>,
        messages: Arc<dyn MessageRepository>,
        cache: Arc<dyn CacheStore>,
        emitter: Arc<EventEmitter>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
        cache_scan_limit: usize,
    ) -> Self {
        Self {
            reactions,
            messages,
            cache,
            emitter,
            clock,
            timeout,
            cache_scan_limit,
        }
    }

    pub async fn toggle_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        glyph: &str,
    ) -> ApplicationResult<ReactionOutcome> {
        let glyph = glyph.trim();
        if glyph.is_empty() {
            return Err(DomainError::validation_error("reaction", "reaction cannot be empty").into());
        }
        let room_id = self.message_room(message_id).await?;
        let existing = bounded(self.timeout, "find reaction", self.reactions.find(message_id, user_id)).await?;
        let toggle = ReactionToggle::resolve(existing, glyph);
        let now = self.clock.now();

        let outcome = match toggle {
            ReactionToggle::Insert => {
                let reaction = Reaction::new(message_id, user_id, glyph, ReactionAction::Add, now);
                bounded(self.timeout, "insert reaction", self.reactions.insert(&reaction)).await?;
                ReactionOutcome {
                    action: ReactionAction::Add,
                    reaction,
                    previous: None,
                }
            }
            ReactionToggle::Replace { previous } => {
                let reaction = Reaction::new(message_id, user_id, glyph, ReactionAction::Update, now);
                bounded(self.timeout, "delete reaction", self.reactions.delete(message_id, user_id)).await?;
                bounded(self.timeout, "insert reaction", self.reactions.insert(&reaction)).await?;
                ReactionOutcome {
                    action: ReactionAction::Update,
                    reaction,
                    previous: Some(previous),
                }
            }
            ReactionToggle::Remove { previous } => {
                bounded(self.timeout, "delete reaction", self.reactions.delete(message_id, user_id)).await?;
                ReactionOutcome {
                    action: ReactionAction::Delete,
                    reaction: previous,
                    previous: None,
                }
            }
        };

        self.sync_cache(room_id, &outcome).await;
        let emitted = match outcome.action {
            ReactionAction::Delete => self.emitter.emit_reaction_removed(room_id, &outcome.reaction).await,
            _ => self.emitter.emit_reaction(room_id, &outcome.reaction).await,
        };
        if let Err(err) = emitted {
            warn!(message_id = %message_id, error = %err, "广播回应事件失败");
        }
        Ok(outcome)
    }

    /// 显式撤销，不存在时返回 NotFound
    pub async fn remove_reaction(&self, message_id: MessageId, user_id: UserId) -> ApplicationResult<ReactionOutcome> {
        let room_id = self.message_room(message_id).await?;
        let previous = bounded(self.timeout, "find reaction", self.reactions.find(message_id, user_id))
            .await?
            .ok_or_else(|| DomainError::resource_not_found("reaction", message_id.to_string()))?;
        bounded(self.timeout, "delete reaction", self.reactions.delete(message_id, user_id)).await?;

        let outcome = ReactionOutcome {
            action: ReactionAction::Delete,
            reaction: previous,
            previous: None,
        };
        self.sync_cache(room_id, &outcome).await;
        if let Err(err) = self.emitter.emit_reaction_removed(room_id, &outcome.reaction).await {
            warn!(message_id = %message_id, error = %err, "广播回应事件失败");
        }
        Ok(outcome)
    }

    pub async fn reactions(&self, message_id: MessageId) -> ApplicationResult<Vec<Reaction>> {
        bounded(self.timeout, "list reactions", self.reactions.list(message_id)).await
    }

    async fn message_room(&self, message_id: MessageId) -> ApplicationResult<RoomId> {
        let message = bounded(self.timeout, "find message", self.messages.find_by_id(message_id))
            .await?
            .ok_or_else(|| DomainError::resource_not_found("message", message_id.to_string()))?;
        Ok(message.room_id)
    }

    /// 更新回应缓存并修补缓存中的消息副本，失败只记录日志
    async fn sync_cache(&self, room_id: RoomId, outcome: &ReactionOutcome) {
        let reaction = &outcome.reaction;
        let updated = match outcome.action {
            ReactionAction::Delete => {
                self.cache
                    .remove_reaction(room_id, reaction.message_id, reaction.user_id)
                    .await
            }
            _ => self.cache.save_reaction(room_id, reaction).await,
        };
        if let Err(err) = updated {
            warn!(message_id = %reaction.message_id, error = %err, "更新回应缓存失败");
        }

        let cached = match self.cache.room_messages(room_id, self.cache_scan_limit).await {
            Ok(cached) => cached,
            Err(err) => {
                warn!(room_id = %room_id, error = %err, "读取缓存消息失败");
                return;
            }
        };
        let Some(mut message) = cached.into_iter().find(|m| m.id() == reaction.message_id) else {
            return;
        };
        match outcome.action {
            ReactionAction::Delete => {
                message.remove_reaction(reaction.user_id);
            }
            _ => message.upsert_reaction(reaction.clone()),
        }
        if let Err(err) = self.cache.save_message(room_id, &message).await {
            warn!(message_id = %reaction.message_id, error = %err, "修补缓存消息失败");
        }
    }
}

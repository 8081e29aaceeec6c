use std::sync::Arc;

use application::{ChatService, Clock, ModerationEngine, ReactionService};

#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatService>,
    pub moderation: Arc<ModerationEngine>,
    pub reactions: Arc<ReactionService>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(
        chat: Arc<ChatService>,
        moderation: Arc<ModerationEngine>,
        reactions: Arc<ReactionService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            chat,
            moderation,
            reactions,
            clock,
        }
    }
}

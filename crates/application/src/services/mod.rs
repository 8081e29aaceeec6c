mod chat_service;
mod side_effects;

pub use chat_service::{
    ChatService, ChatServiceDependencies, SendEvoucherRequest, SendMentionRequest, SendMessageRequest,
};
pub use side_effects::MessageSideEffects;

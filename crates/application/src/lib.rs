//! 应用层实现。
//!
//! 连接注册表与事件发射、异步可靠性流水线、处罚、通知、提及与回应，
//! 以及把它们组合起来的聊天服务。所有外部系统都通过这里定义的端口访问。

pub mod cache;
pub mod clock;
pub mod emitter;
pub mod error;
pub mod event_bus;
pub mod hub;
pub mod memory;
pub mod mention;
pub mod moderation;
pub mod notification;
pub mod pipeline;
pub mod reaction;
pub mod repository;
pub mod services;
pub mod topics;
pub mod user_info;

pub use cache::{CacheError, CacheStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use emitter::EventEmitter;
pub use error::{ApplicationError, ApplicationResult};
pub use event_bus::{BusError, EventBus};
pub use hub::{BroadcastReport, ConnectionHandle, ConnectionHub, HubError, OutboundFrame, RoomStats};
pub use mention::{MentionParser, ParsedMentions};
pub use moderation::{BanRequest, ChatSender, ModerationEngine, MuteRequest};
pub use notification::{NotificationPayload, NotificationReport, NotificationService};
pub use pipeline::{AsyncPipeline, PhantomReport, PipelineSettings, WorkerPoolStatus};
pub use reaction::{ReactionOutcome, ReactionService};
pub use repository::{
    MessageRepository, MessageStatusRepository, ModerationHistoryFilter, ModerationRepository,
    ReactionRepository, RepositoryError, UserDirectory,
};
pub use services::{
    ChatService, ChatServiceDependencies, MessageSideEffects, SendEvoucherRequest, SendMentionRequest,
    SendMessageRequest,
};
pub use user_info::UserInfoResolver;

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use application::cache::memory::MemoryCacheStore;
use application::memory::{
    MemoryMessageRepository, MemoryModerationRepository, MemoryReactionRepository, MemoryStatusRepository,
    MemoryUserDirectory, RecordingEventBus,
};
use application::pipeline::{PhantomDetectorHandler, PhantomSettings, RetryPolicy};
use application::{
    AsyncPipeline, ChatSender, ChatService, ChatServiceDependencies, ConnectionHandle, ConnectionHub, EventEmitter,
    ManualClock, MentionParser, MessageSideEffects, ModerationEngine, NotificationService, OutboundFrame,
    PipelineSettings, ReactionService, UserInfoResolver,
};
use domain::{MessageId, MessageStatus, RoomId, UserId, UserRecord};
use serde_json::Value;
use tokio::sync::mpsc::Receiver;

pub const TIMEOUT: Duration = Duration::from_secs(1);

pub fn fast_settings() -> PipelineSettings {
    PipelineSettings {
        database_workers: 2,
        database_queue_size: 100,
        batch_size: 10,
        flush_timeout: Duration::from_millis(20),
        notification_workers: 2,
        notification_queue_size: 100,
        retry: RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            backoff_factor: 2.0,
        },
        phantom: PhantomSettings {
            enabled: true,
            check_interval: Duration::from_secs(3600),
            max_age: Duration::from_secs(60),
            fix_automatically: true,
        },
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub hub: Arc<ConnectionHub>,
    pub bus: Arc<RecordingEventBus>,
    pub messages: Arc<MemoryMessageRepository>,
    pub statuses: Arc<MemoryStatusRepository>,
    pub moderations: Arc<MemoryModerationRepository>,
    pub reaction_store: Arc<MemoryReactionRepository>,
    pub directory: Arc<MemoryUserDirectory>,
    pub cache: Arc<MemoryCacheStore>,
    pub emitter: Arc<EventEmitter>,
    pub moderation: Arc<ModerationEngine>,
    pub reactions: ReactionService,
    pub side_effects: Arc<MessageSideEffects>,
    pub pipeline: Arc<AsyncPipeline>,
    pub chat: Arc<ChatService>,
    pub room: RoomId,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(fast_settings())
    }

    pub fn with_settings(settings: PipelineSettings) -> Self {
        let clock = Arc::new(ManualClock::default());
        let hub = Arc::new(ConnectionHub::new());
        let bus = Arc::new(RecordingEventBus::new());
        let messages = Arc::new(MemoryMessageRepository::new());
        let statuses = Arc::new(MemoryStatusRepository::new());
        let moderations = Arc::new(MemoryModerationRepository::new());
        let reaction_store = Arc::new(MemoryReactionRepository::new());
        let directory = Arc::new(MemoryUserDirectory::new());
        let cache = Arc::new(MemoryCacheStore::new(
            1000,
            Duration::from_secs(86_400),
            Duration::from_secs(86_400),
        ));

        let users = UserInfoResolver::new(directory.clone(), TIMEOUT);
        let emitter = Arc::new(EventEmitter::new(
            hub.clone(),
            bus.clone(),
            users.clone(),
            clock.clone(),
            TIMEOUT,
        ));
        let notifications = Arc::new(NotificationService::new(
            bus.clone(),
            directory.clone(),
            users.clone(),
            Duration::from_secs(30),
            TIMEOUT,
        ));
        let side_effects = Arc::new(MessageSideEffects::new(
            messages.clone(),
            statuses.clone(),
            cache.clone(),
            users,
            notifications,
            hub.clone(),
            clock.clone(),
            TIMEOUT,
            1000,
        ));
        let phantom_handler: Arc<dyn PhantomDetectorHandler> = side_effects.clone();
        let pipeline = AsyncPipeline::start(settings, Some(phantom_handler), clock.clone());

        let moderation = Arc::new(ModerationEngine::new(
            moderations.clone(),
            emitter.clone(),
            clock.clone(),
            TIMEOUT,
        ));
        let reactions = ReactionService::new(
            reaction_store.clone(),
            messages.clone(),
            cache.clone(),
            emitter.clone(),
            clock.clone(),
            TIMEOUT,
            1000,
        );

        let chat = Arc::new(ChatService::new(ChatServiceDependencies {
            messages: messages.clone(),
            reactions: reaction_store.clone(),
            directory: directory.clone(),
            cache: cache.clone(),
            emitter: emitter.clone(),
            moderation: moderation.clone(),
            mentions: MentionParser::new(directory.clone(), TIMEOUT),
            pipeline: pipeline.clone(),
            side_effects: side_effects.clone(),
            clock: clock.clone(),
            timeout: TIMEOUT,
            max_history: 1000,
        }));
        let sender: Arc<dyn ChatSender> = chat.clone();
        moderation.attach_chat_sender(Arc::downgrade(&sender));

        Self {
            clock,
            hub,
            bus,
            messages,
            statuses,
            moderations,
            reaction_store,
            directory,
            cache,
            emitter,
            moderation,
            reactions,
            side_effects,
            pipeline,
            chat,
            room: RoomId::generate(),
        }
    }

    /// 注册用户并加入默认房间
    pub async fn user(&self, username: &str) -> UserId {
        let id = UserId::generate();
        self.directory
            .add_user(UserRecord {
                id,
                username: username.to_owned(),
                first_name: username.to_owned(),
                last_name: "Tester".to_owned(),
                role_id: None,
            })
            .await;
        self.directory.add_member(self.room, id).await;
        id
    }

    pub async fn connect(&self, user_id: UserId) -> Receiver<OutboundFrame> {
        let (handle, receiver) = ConnectionHandle::channel();
        self.chat
            .connect(self.room, user_id, handle)
            .await
            .expect("connect should succeed");
        receiver
    }

    pub async fn wait_for_status<F>(&self, message_id: MessageId, predicate: F) -> MessageStatus
    where
        F: Fn(&MessageStatus) -> bool,
    {
        use application::MessageStatusRepository;
        for _ in 0..300 {
            if let Ok(Some(status)) = self.statuses.find(message_id).await {
                if predicate(&status) {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("status for {message_id} never reached the expected state");
    }
}

/// 取出当前已投递的全部事件
pub fn drain_events(receiver: &mut Receiver<OutboundFrame>) -> Vec<Value> {
    let mut events = Vec::new();
    while let Ok(frame) = receiver.try_recv() {
        if let OutboundFrame::Text(text) = frame {
            events.push(serde_json::from_str(&text).expect("frame should be json"));
        }
    }
    events
}

pub fn events_of_type<'a>(events: &'a [Value], event_type: &str) -> Vec<&'a Value> {
    events.iter().filter(|event| event["type"] == event_type).collect()
}

//! 主应用程序入口
//!
//! 加载配置、建立外部连接、组装应用层服务，启动 Axum 服务与后台任务。

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use application::pipeline::PhantomDetectorHandler;
use application::topics::{NOTIFICATIONS_TOPIC, ROOM_EVENTS_TOPIC};
use application::{
    AsyncPipeline, ChatSender, ChatService, ChatServiceDependencies, Clock, ConnectionHub, EventBus, EventEmitter,
    MentionParser, MessageSideEffects, ModerationEngine, NotificationService, PipelineSettings, ReactionService,
    SystemClock, UserInfoResolver,
};
use config::AppConfig;
use infrastructure::{BusMessageHandler, Infrastructure, RoomEventConsumer};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::load().context("加载配置失败")?;
    tracing::info!(database = %config.sanitized_database_url(), brokers = %config.kafka.brokers, "配置已加载");

    let infra = Infrastructure::connect(&config).await.context("初始化基础设施失败")?;
    // 共享主题提前创建，房间主题在首次发布时创建
    for topic in [NOTIFICATIONS_TOPIC, ROOM_EVENTS_TOPIC] {
        if let Err(err) = infra.bus.ensure_topic(topic).await {
            tracing::warn!(topic, error = %err, "预创建主题失败");
        }
    }
    let timeout = config.timeouts.external_call();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let storage = &infra.storage;

    // 应用层组装
    let hub = Arc::new(ConnectionHub::new());
    let users = UserInfoResolver::new(storage.directory.clone(), timeout);
    let emitter = Arc::new(EventEmitter::new(
        hub.clone(),
        infra.bus.clone(),
        users.clone(),
        clock.clone(),
        timeout,
    ));
    let notifications = Arc::new(NotificationService::new(
        infra.bus.clone(),
        storage.directory.clone(),
        users.clone(),
        Duration::from_secs(config.notification.dedup_ttl_secs),
        timeout,
    ));
    let side_effects = Arc::new(MessageSideEffects::new(
        storage.messages.clone(),
        storage.statuses.clone(),
        infra.cache.clone(),
        users,
        notifications.clone(),
        hub.clone(),
        clock.clone(),
        timeout,
        config.cache.max_messages,
    ));
    let phantom_handler: Arc<dyn PhantomDetectorHandler> = side_effects.clone();
    let pipeline = AsyncPipeline::start(
        PipelineSettings::from(&config.async_flow),
        Some(phantom_handler),
        clock.clone(),
    );

    let moderation = Arc::new(ModerationEngine::new(
        storage.moderations.clone(),
        emitter.clone(),
        clock.clone(),
        timeout,
    ));
    let reactions = Arc::new(ReactionService::new(
        storage.reactions.clone(),
        storage.messages.clone(),
        infra.cache.clone(),
        emitter.clone(),
        clock.clone(),
        timeout,
        config.cache.max_messages,
    ));
    let chat = Arc::new(ChatService::new(ChatServiceDependencies {
        messages: storage.messages.clone(),
        reactions: storage.reactions.clone(),
        directory: storage.directory.clone(),
        cache: infra.cache.clone(),
        emitter,
        moderation: moderation.clone(),
        mentions: MentionParser::new(storage.directory.clone(), timeout),
        pipeline,
        side_effects,
        clock: clock.clone(),
        timeout,
        max_history: config.cache.max_messages,
    }));
    let sender: Arc<dyn ChatSender> = chat.clone();
    moderation.attach_chat_sender(Arc::downgrade(&sender));

    // 后台任务
    let shutdown = CancellationToken::new();
    let mut background = vec![moderation.clone().spawn_cleanup(
        Duration::from_secs(config.moderation.cleanup_interval_secs.max(1)),
        shutdown.clone(),
    )];
    background.push(spawn_dedup_purge(
        notifications,
        Duration::from_secs(config.notification.dedup_ttl_secs.max(1)),
        shutdown.clone(),
    ));
    let consumer = RoomEventConsumer::new(&config.kafka, infra.bus.origin()).context("创建 Kafka 消费者失败")?;
    let handler: Arc<dyn BusMessageHandler> = chat.clone();
    background.push(consumer.spawn(handler, shutdown.clone()));

    let state = AppState::new(chat.clone(), moderation, reactions, clock);
    let app = router(state);
    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("绑定地址 {address} 失败"))?;

    tracing::info!("聊天服务启动在 http://{}", address);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("开始关闭后台任务");
    shutdown.cancel();
    for task in background {
        if let Err(err) = task.await {
            tracing::warn!(error = %err, "后台任务异常退出");
        }
    }
    chat.shutdown().await;
    if let Err(err) = infra.bus.flush() {
        tracing::warn!(error = %err, "刷新 Kafka 生产者失败");
    }
    tracing::info!("服务已停止");
    Ok(())
}

/// 定期清理通知去重窗口
fn spawn_dedup_purge(
    notifications: Arc<NotificationService>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let purged = notifications.purge_expired();
                    if purged > 0 {
                        tracing::debug!(purged, "已清理通知去重记录");
                    }
                }
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "监听退出信号失败");
    }
    tracing::info!("收到退出信号");
}

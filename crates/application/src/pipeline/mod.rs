//! 消息异步处理流水线
//!
//! 广播之后的持久化、缓存与通知都在这里以有界队列 + worker 池执行。
//! 队列满时提交直接失败，调用方不会被阻塞；失败任务按退避策略进入重试队列，
//! 达到上限后标记为 failed 终态；入队时被丢弃的任务由幽灵消息检测按台账快照补做。

pub mod handler;
pub mod jobs;
pub mod phantom;
pub mod retry;
pub mod status;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use config::AsyncFlowConfig;
use domain::{ChatMessage, PipelineStatus, RoomId, StageFlag, StatusUpdate, UserId};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{ApplicationError, ApplicationResult};

pub use handler::{DatabaseJobHandler, NotificationJobHandler, PhantomDetectorHandler, StatusRecorder};
pub use jobs::{DatabaseJob, DatabaseJobKind, NotificationJob};
pub use phantom::{PhantomDetector, PhantomReport, PhantomSettings};
pub use retry::RetryPolicy;
pub use status::check_completion;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineSettings {
    pub database_workers: usize,
    pub database_queue_size: usize,
    pub batch_size: usize,
    pub flush_timeout: Duration,
    pub notification_workers: usize,
    pub notification_queue_size: usize,
    pub retry: RetryPolicy,
    pub phantom: PhantomSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&AsyncFlowConfig::default())
    }
}

impl From<&AsyncFlowConfig> for PipelineSettings {
    fn from(config: &AsyncFlowConfig) -> Self {
        Self {
            database_workers: config.database_workers.count,
            database_queue_size: config.database_workers.queue_size,
            batch_size: config.database_workers.batch_size.max(1),
            flush_timeout: Duration::from_millis(config.database_workers.flush_timeout_ms),
            notification_workers: config.notification_workers.count,
            notification_queue_size: config.notification_workers.queue_size,
            retry: RetryPolicy::from(&config.retry),
            phantom: PhantomSettings::from(&config.phantom_detection),
        }
    }
}

/// 队列长度与容量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    pub length: usize,
    pub capacity: usize,
}

impl QueueMetrics {
    fn of<T>(sender: &mpsc::Sender<T>) -> Self {
        let capacity = sender.max_capacity();
        Self {
            length: capacity - sender.capacity(),
            capacity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub workers: usize,
    pub queue: QueueMetrics,
    pub retry_queue: QueueMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RetryStatus {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhantomStatus {
    pub enabled: bool,
    pub check_interval_secs: u64,
    pub max_age_secs: u64,
    pub fix_automatically: bool,
    pub last_report: Option<PhantomReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WorkerPoolStatus {
    pub database: PoolStatus,
    pub notification: PoolStatus,
    pub batch_size: usize,
    pub retry: RetryStatus,
    pub phantom_detection: PhantomStatus,
}

struct DatabaseStage {
    queue: AsyncMutex<mpsc::Receiver<DatabaseJob>>,
    retry_tx: mpsc::Sender<DatabaseJob>,
    batch_size: usize,
    flush_timeout: Duration,
    retry: RetryPolicy,
}

struct NotificationStage {
    queue: AsyncMutex<mpsc::Receiver<NotificationJob>>,
    retry_tx: mpsc::Sender<NotificationJob>,
    retry: RetryPolicy,
}

pub struct AsyncPipeline {
    settings: PipelineSettings,
    database_tx: mpsc::Sender<DatabaseJob>,
    database_retry_tx: mpsc::Sender<DatabaseJob>,
    notification_tx: mpsc::Sender<NotificationJob>,
    notification_retry_tx: mpsc::Sender<NotificationJob>,
    detector: Option<Arc<PhantomDetector>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncPipeline {
    /// 创建队列并启动全部 worker；必须在 tokio 运行时内调用
    pub fn start(
        settings: PipelineSettings,
        phantom_handler: Option<Arc<dyn PhantomDetectorHandler>>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let database_queue = settings.database_queue_size.max(1);
        let notification_queue = settings.notification_queue_size.max(1);
        let (database_tx, database_rx) = mpsc::channel(database_queue);
        let (database_retry_tx, database_retry_rx) = mpsc::channel((database_queue / 2).max(1));
        let (notification_tx, notification_rx) = mpsc::channel(notification_queue);
        let (notification_retry_tx, notification_retry_rx) = mpsc::channel((notification_queue / 2).max(1));

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let database = Arc::new(DatabaseStage {
            queue: AsyncMutex::new(database_rx),
            retry_tx: database_retry_tx.clone(),
            batch_size: settings.batch_size.max(1),
            flush_timeout: settings.flush_timeout,
            retry: settings.retry,
        });
        for worker_id in 0..settings.database_workers {
            tasks.push(tokio::spawn(run_database_worker(
                worker_id,
                database.clone(),
                shutdown.clone(),
            )));
        }
        tasks.push(tokio::spawn(run_database_retry_worker(
            database.clone(),
            database_retry_rx,
            shutdown.clone(),
        )));

        let notification = Arc::new(NotificationStage {
            queue: AsyncMutex::new(notification_rx),
            retry_tx: notification_retry_tx.clone(),
            retry: settings.retry,
        });
        for worker_id in 0..settings.notification_workers {
            tasks.push(tokio::spawn(run_notification_worker(
                worker_id,
                notification.clone(),
                shutdown.clone(),
            )));
        }
        tasks.push(tokio::spawn(run_notification_retry_worker(
            notification.clone(),
            notification_retry_rx,
            shutdown.clone(),
        )));

        let detector = phantom_handler
            .filter(|_| settings.phantom.enabled)
            .map(|handler| Arc::new(PhantomDetector::new(handler, settings.phantom, clock)));
        if let Some(detector) = &detector {
            tasks.push(detector.clone().spawn(shutdown.clone()));
        }

        info!(
            database_workers = settings.database_workers,
            notification_workers = settings.notification_workers,
            database_queue,
            notification_queue,
            phantom_detection = detector.is_some(),
            "异步处理流水线已启动"
        );

        Arc::new(Self {
            settings,
            database_tx,
            database_retry_tx,
            notification_tx,
            notification_retry_tx,
            detector,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// 非阻塞提交，队列已满或已关闭时返回 false
    pub fn submit_database_job(
        &self,
        kind: DatabaseJobKind,
        message: Arc<ChatMessage>,
        handler: Arc<dyn DatabaseJobHandler>,
    ) -> bool {
        let message_id = message.id;
        match self.database_tx.try_send(DatabaseJob::new(kind, message, handler)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(message_id = %message_id, job = kind.as_str(), "数据库任务队列已满");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(message_id = %message_id, job = kind.as_str(), "数据库任务队列已关闭");
                false
            }
        }
    }

    pub fn submit_notification_job(
        &self,
        message: Arc<ChatMessage>,
        online_users: Vec<UserId>,
        handler: Arc<dyn NotificationJobHandler>,
    ) -> bool {
        let message_id = message.id;
        match self
            .notification_tx
            .try_send(NotificationJob::new(message, online_users, handler))
        {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(message_id = %message_id, "通知任务队列已满");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(message_id = %message_id, "通知任务队列已关闭");
                false
            }
        }
    }

    pub fn database_queue_metrics(&self) -> QueueMetrics {
        QueueMetrics::of(&self.database_tx)
    }

    pub fn notification_queue_metrics(&self) -> QueueMetrics {
        QueueMetrics::of(&self.notification_tx)
    }

    pub fn worker_pool_status(&self) -> WorkerPoolStatus {
        let phantom = self.settings.phantom;
        WorkerPoolStatus {
            database: PoolStatus {
                workers: self.settings.database_workers,
                queue: self.database_queue_metrics(),
                retry_queue: QueueMetrics::of(&self.database_retry_tx),
            },
            notification: PoolStatus {
                workers: self.settings.notification_workers,
                queue: self.notification_queue_metrics(),
                retry_queue: QueueMetrics::of(&self.notification_retry_tx),
            },
            batch_size: self.settings.batch_size,
            retry: RetryStatus {
                max_retries: self.settings.retry.max_retries,
                initial_delay_ms: self.settings.retry.initial_delay.as_millis() as u64,
                max_delay_ms: self.settings.retry.max_delay.as_millis() as u64,
                backoff_factor: self.settings.retry.backoff_factor,
            },
            phantom_detection: PhantomStatus {
                enabled: self.detector.is_some(),
                check_interval_secs: phantom.check_interval.as_secs(),
                max_age_secs: phantom.max_age.as_secs(),
                fix_automatically: phantom.fix_automatically,
                last_report: self.detector.as_ref().and_then(|detector| detector.last_report()),
            },
        }
    }

    /// 立即执行一轮幽灵消息检测
    pub async fn trigger_phantom_detection(&self) -> ApplicationResult<PhantomReport> {
        match &self.detector {
            Some(detector) => detector.run_once().await,
            None => Err(ApplicationError::infrastructure("phantom detection is disabled")),
        }
    }

    /// 停止接收并等待 worker 退出，队列中尚未处理的任务留给下次启动的幽灵检测
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "流水线任务退出异常");
            }
        }
        let pending = self.database_queue_metrics().length + self.notification_queue_metrics().length;
        info!(pending, "异步处理流水线已停止");
    }
}

async fn run_database_worker(worker_id: usize, stage: Arc<DatabaseStage>, shutdown: CancellationToken) {
    debug!(worker_id, "数据库 worker 启动");
    loop {
        let (batch, strays) = {
            let mut queue = stage.queue.lock().await;
            let first = tokio::select! {
                _ = shutdown.cancelled() => break,
                job = queue.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            stage.collect_batch(&mut queue, first).await
        };

        for stray in strays {
            let stage = stage.clone();
            tokio::spawn(async move { stage.process(vec![stray]).await });
        }
        stage.process(batch).await;
    }
    debug!(worker_id, "数据库 worker 退出");
}

async fn run_database_retry_worker(
    stage: Arc<DatabaseStage>,
    mut retries: mpsc::Receiver<DatabaseJob>,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = retries.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let delay = stage.retry.delay_for(job.retry_count);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        debug!(message_id = %job.message.id, retry = job.retry_count, "重试数据库任务");
        stage.process(vec![job]).await;
    }
}

impl DatabaseStage {
    /// 在 flush 超时内继续取同类任务直到批量上限，其余任务单独处理
    async fn collect_batch(
        &self,
        queue: &mut mpsc::Receiver<DatabaseJob>,
        first: DatabaseJob,
    ) -> (Vec<DatabaseJob>, Vec<DatabaseJob>) {
        let mut batch = vec![first];
        let mut strays = Vec::new();
        if self.batch_size <= 1 {
            return (batch, strays);
        }
        let deadline = tokio::time::Instant::now() + self.flush_timeout;
        while batch.len() < self.batch_size {
            let next = match queue.try_recv() {
                Ok(job) => job,
                Err(mpsc::error::TryRecvError::Disconnected) => break,
                Err(mpsc::error::TryRecvError::Empty) => {
                    match tokio::time::timeout_at(deadline, queue.recv()).await {
                        Ok(Some(job)) => job,
                        _ => break,
                    }
                }
            };
            if batch[0].batches_with(&next) {
                batch.push(next);
            } else {
                strays.push(next);
            }
        }
        (batch, strays)
    }

    async fn process(&self, jobs: Vec<DatabaseJob>) {
        let mut runnable = Vec::with_capacity(jobs.len());
        for job in jobs {
            if job.message.is_noop() {
                skip_database_job(&job).await;
            } else {
                runnable.push(job);
            }
        }
        let Some(first) = runnable.first() else {
            return;
        };
        let kind = first.kind;
        let handler = first.handler.clone();

        match kind {
            DatabaseJobKind::SaveMessage => {
                let messages: Vec<ChatMessage> = runnable.iter().map(|job| (*job.message).clone()).collect();
                let result = if messages.len() == 1 {
                    handler.save_message_to_db(&messages[0]).await
                } else {
                    handler.save_message_batch(&messages).await
                };
                self.settle(runnable, result).await;
            }
            DatabaseJobKind::CacheMessage => {
                let mut by_room: HashMap<RoomId, Vec<DatabaseJob>> = HashMap::new();
                for job in runnable {
                    by_room.entry(job.message.room_id).or_default().push(job);
                }
                for (room_id, jobs) in by_room {
                    let messages: Vec<ChatMessage> = jobs.iter().map(|job| (*job.message).clone()).collect();
                    let result = if messages.len() == 1 {
                        handler.save_message_to_cache(&messages[0]).await
                    } else {
                        handler.save_message_batch_to_cache(room_id, &messages).await
                    };
                    self.settle(jobs, result).await;
                }
            }
        }
    }

    async fn settle(&self, jobs: Vec<DatabaseJob>, result: ApplicationResult<()>) {
        match result {
            Ok(()) => {
                for job in jobs {
                    let message_id = job.message.id;
                    job.handler
                        .update_message_status(message_id, StatusUpdate::Stage(job.kind.stage(), true))
                        .await;
                    check_completion(job.handler.as_ref(), message_id).await;
                }
            }
            Err(err) => {
                let reason = err.to_string();
                for job in jobs {
                    self.fail(job, &reason).await;
                }
            }
        }
    }

    async fn fail(&self, mut job: DatabaseJob, reason: &str) {
        let message_id = job.message.id;
        let failures = job.retry_count + 1;
        job.handler
            .update_message_status_with_error(message_id, reason, failures)
            .await;

        if self.retry.is_exhausted(failures) {
            error!(message_id = %message_id, job = job.kind.as_str(), failures, error = reason, "数据库任务重试耗尽");
            job.handler
                .update_message_status(message_id, StatusUpdate::Status(PipelineStatus::Failed))
                .await;
            return;
        }

        job.retry_count = failures;
        let kind = job.kind;
        if self.retry_tx.try_send(job).is_err() {
            warn!(message_id = %message_id, job = kind.as_str(), "重试队列不可用，等待幽灵检测补偿");
        }
    }
}

async fn skip_database_job(job: &DatabaseJob) {
    let message_id = job.message.id;
    debug!(message_id = %message_id, job = job.kind.as_str(), "空消息，跳过");
    job.handler
        .update_message_status(message_id, StatusUpdate::Status(PipelineStatus::Skipped))
        .await;
    check_completion(job.handler.as_ref(), message_id).await;
}

async fn run_notification_worker(worker_id: usize, stage: Arc<NotificationStage>, shutdown: CancellationToken) {
    debug!(worker_id, "通知 worker 启动");
    loop {
        let job = {
            let mut queue = stage.queue.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                job = queue.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            }
        };
        stage.process(job).await;
    }
    debug!(worker_id, "通知 worker 退出");
}

async fn run_notification_retry_worker(
    stage: Arc<NotificationStage>,
    mut retries: mpsc::Receiver<NotificationJob>,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = retries.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let delay = stage.retry.delay_for(job.retry_count);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        stage.process(job).await;
    }
}

impl NotificationStage {
    async fn process(&self, job: NotificationJob) {
        let message_id = job.message.id;
        if job.message.is_noop() {
            job.handler
                .update_message_status(message_id, StatusUpdate::Stage(StageFlag::NotificationSent, false))
                .await;
            job.handler
                .update_message_status(message_id, StatusUpdate::Status(PipelineStatus::Skipped))
                .await;
            check_completion(job.handler.as_ref(), message_id).await;
            return;
        }

        match job.handler.send_notifications(&job.message, &job.online_users).await {
            Ok(()) => {
                job.handler
                    .update_message_status(message_id, StatusUpdate::Stage(StageFlag::NotificationSent, true))
                    .await;
                check_completion(job.handler.as_ref(), message_id).await;
            }
            Err(err) => self.fail(job, &err.to_string()).await,
        }
    }

    async fn fail(&self, mut job: NotificationJob, reason: &str) {
        let message_id = job.message.id;
        let failures = job.retry_count + 1;
        job.handler
            .update_message_status_with_error(message_id, reason, failures)
            .await;

        if self.retry.is_exhausted(failures) {
            error!(message_id = %message_id, failures, error = reason, "通知任务重试耗尽");
            job.handler
                .update_message_status(message_id, StatusUpdate::Status(PipelineStatus::Failed))
                .await;
            return;
        }

        job.retry_count = failures;
        if self.retry_tx.try_send(job).is_err() {
            warn!(message_id = %message_id, "通知重试队列不可用，等待幽灵检测补偿");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use async_trait::async_trait;
    use chrono::Utc;
    use domain::{MessageId, MessageStatus};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// 记录每次调用的方法名与批量大小
    #[derive(Default)]
    struct CountingHandler {
        calls: Mutex<Vec<(&'static str, usize)>>,
        statuses: Mutex<HashMap<MessageId, MessageStatus>>,
        fail_batches: AtomicBool,
        status_reads: AtomicUsize,
    }

    impl CountingHandler {
        fn track(&self, message: &ChatMessage) {
            self.statuses
                .lock()
                .unwrap()
                .insert(message.id, MessageStatus::for_message(message, Utc::now()));
        }

        fn record(&self, call: &'static str, size: usize) {
            self.calls.lock().unwrap().push((call, size));
        }

        fn calls(&self) -> Vec<(&'static str, usize)> {
            self.calls.lock().unwrap().clone()
        }

        fn status(&self, message_id: MessageId) -> MessageStatus {
            self.statuses.lock().unwrap()[&message_id].clone()
        }

        async fn wait_until(&self, predicate: impl Fn(&Self) -> bool) {
            for _ in 0..200 {
                if predicate(self) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("handler never reached the expected state");
        }
    }

    #[async_trait]
    impl StatusRecorder for CountingHandler {
        async fn update_message_status(&self, message_id: MessageId, update: StatusUpdate) {
            if let Some(status) = self.statuses.lock().unwrap().get_mut(&message_id) {
                status.apply(&update, Utc::now());
            }
        }

        async fn update_message_status_with_error(&self, message_id: MessageId, error: &str, retry_count: u32) {
            if let Some(status) = self.statuses.lock().unwrap().get_mut(&message_id) {
                status.record_error(error, retry_count, Utc::now());
            }
        }

        async fn message_status(&self, message_id: MessageId) -> Option<MessageStatus> {
            self.status_reads.fetch_add(1, Ordering::SeqCst);
            self.statuses.lock().unwrap().get(&message_id).cloned()
        }
    }

    #[async_trait]
    impl DatabaseJobHandler for CountingHandler {
        async fn create_message_status(&self, message: &ChatMessage) -> ApplicationResult<()> {
            self.track(message);
            Ok(())
        }

        async fn save_message_to_db(&self, _message: &ChatMessage) -> ApplicationResult<()> {
            self.record("save_message_to_db", 1);
            Ok(())
        }

        async fn save_message_to_cache(&self, _message: &ChatMessage) -> ApplicationResult<()> {
            self.record("save_message_to_cache", 1);
            Ok(())
        }

        async fn save_message_batch(&self, messages: &[ChatMessage]) -> ApplicationResult<()> {
            self.record("save_message_batch", messages.len());
            if self.fail_batches.load(Ordering::SeqCst) {
                return Err(ApplicationError::infrastructure("batch insert rejected"));
            }
            Ok(())
        }

        async fn save_message_batch_to_cache(&self, _room_id: RoomId, messages: &[ChatMessage]) -> ApplicationResult<()> {
            self.record("save_message_batch_to_cache", messages.len());
            Ok(())
        }
    }

    #[async_trait]
    impl NotificationJobHandler for CountingHandler {
        async fn send_notifications(&self, _message: &ChatMessage, _online_users: &[UserId]) -> ApplicationResult<()> {
            self.record("send_notifications", 1);
            Ok(())
        }
    }

    fn settings(batch_size: usize, flush_timeout: Duration) -> PipelineSettings {
        PipelineSettings {
            database_workers: 1,
            database_queue_size: 32,
            batch_size,
            flush_timeout,
            notification_workers: 1,
            notification_queue_size: 32,
            retry: RetryPolicy {
                max_retries: 3,
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                backoff_factor: 2.0,
            },
            phantom: PhantomSettings {
                enabled: false,
                ..PhantomSettings::default()
            },
        }
    }

    fn messages(handler: &CountingHandler, room_id: RoomId, count: usize) -> Vec<Arc<ChatMessage>> {
        (0..count)
            .map(|index| {
                let message = ChatMessage::text(room_id, UserId::generate(), format!("message {index}"), Utc::now());
                handler.track(&message);
                Arc::new(message)
            })
            .collect()
    }

    #[tokio::test]
    async fn same_kind_jobs_share_one_batch_and_strays_run_alone() {
        let handler = Arc::new(CountingHandler::default());
        let pipeline = AsyncPipeline::start(settings(4, Duration::from_secs(5)), None, Arc::new(SystemClock));
        let database: Arc<dyn DatabaseJobHandler> = handler.clone();
        let room_id = RoomId::generate();
        let saves = messages(&handler, room_id, 4);
        let cached = messages(&handler, room_id, 1).remove(0);

        // 提交均为同步调用，worker 首次取任务时队列里已有全部任务
        for message in &saves[..3] {
            assert!(pipeline.submit_database_job(DatabaseJobKind::SaveMessage, message.clone(), database.clone()));
        }
        assert!(pipeline.submit_database_job(DatabaseJobKind::CacheMessage, cached.clone(), database.clone()));
        assert!(pipeline.submit_database_job(DatabaseJobKind::SaveMessage, saves[3].clone(), database));

        handler.wait_until(|handler| handler.calls().len() == 2).await;
        let calls = handler.calls();
        assert!(calls.contains(&("save_message_batch", 4)));
        assert!(calls.contains(&("save_message_to_cache", 1)));
        for message in &saves {
            assert!(handler.status(message.id).saved_to_db);
        }
        assert!(handler.status(cached.id).saved_to_cache);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn flush_timeout_closes_a_partial_batch() {
        let handler = Arc::new(CountingHandler::default());
        let pipeline = AsyncPipeline::start(settings(10, Duration::from_millis(30)), None, Arc::new(SystemClock));
        let database: Arc<dyn DatabaseJobHandler> = handler.clone();
        let room_id = RoomId::generate();
        let cached = messages(&handler, room_id, 3);

        for message in &cached {
            assert!(pipeline.submit_database_job(DatabaseJobKind::CacheMessage, message.clone(), database.clone()));
        }

        handler.wait_until(|handler| !handler.calls().is_empty()).await;
        assert_eq!(handler.calls(), vec![("save_message_batch_to_cache", 3)]);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn failed_batch_retries_each_job_alone() {
        let handler = Arc::new(CountingHandler::default());
        handler.fail_batches.store(true, Ordering::SeqCst);
        let pipeline = AsyncPipeline::start(settings(3, Duration::from_secs(5)), None, Arc::new(SystemClock));
        let database: Arc<dyn DatabaseJobHandler> = handler.clone();
        let saves = messages(&handler, RoomId::generate(), 3);

        for message in &saves {
            assert!(pipeline.submit_database_job(DatabaseJobKind::SaveMessage, message.clone(), database.clone()));
        }

        handler
            .wait_until(|handler| saves.iter().all(|message| handler.status(message.id).saved_to_db))
            .await;
        let calls = handler.calls();
        assert_eq!(calls[0], ("save_message_batch", 3));
        assert_eq!(calls.iter().filter(|call| call.0 == "save_message_to_db").count(), 3);
        for message in &saves {
            let status = handler.status(message.id);
            assert_eq!(status.retry_count, 1);
            assert_eq!(status.last_error.as_deref(), Some("infrastructure error: batch insert rejected"));
        }
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn skipped_notification_runs_completion_check() {
        let handler = Arc::new(CountingHandler::default());
        let pipeline = AsyncPipeline::start(settings(1, Duration::from_millis(10)), None, Arc::new(SystemClock));
        let notification: Arc<dyn NotificationJobHandler> = handler.clone();
        let noop = Arc::new(ChatMessage::text(RoomId::generate(), UserId::generate(), "  ", Utc::now()));
        handler.track(&noop);

        assert!(pipeline.submit_notification_job(noop.clone(), Vec::new(), notification));
        handler
            .wait_until(|handler| handler.status(noop.id).status == PipelineStatus::Skipped)
            .await;
        handler
            .wait_until(|handler| handler.status_reads.load(Ordering::SeqCst) > 0)
            .await;
        assert!(!handler.status(noop.id).notification_sent);
        assert!(handler.calls().is_empty());
        pipeline.shutdown().await;
    }
}

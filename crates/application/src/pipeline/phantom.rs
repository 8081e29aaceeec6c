//! 幽灵消息检测
//!
//! 已广播给在线用户、但在限定时间内仍有阶段未落地的消息称为幽灵消息。
//! 自动修复会补跑缺失阶段，成功后走同一套完成判定。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use config::PhantomDetectionConfig;
use domain::{ChatMessage, MessageStatus, PipelineStatus, StageFlag, StatusUpdate, Timestamp};
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::handler::PhantomDetectorHandler;
use super::status::check_completion;
use crate::clock::Clock;
use crate::error::ApplicationResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhantomSettings {
    pub enabled: bool,
    pub check_interval: Duration,
    pub max_age: Duration,
    pub fix_automatically: bool,
}

impl Default for PhantomSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(60),
            max_age: Duration::from_secs(300),
            fix_automatically: true,
        }
    }
}

impl From<&PhantomDetectionConfig> for PhantomSettings {
    fn from(config: &PhantomDetectionConfig) -> Self {
        Self {
            enabled: config.enabled,
            check_interval: Duration::from_secs(config.check_interval_secs),
            max_age: Duration::from_secs(config.max_age_secs),
            fix_automatically: config.fix_automatically,
        }
    }
}

/// 一轮检测的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhantomReport {
    pub checked_at: Timestamp,
    pub detected: usize,
    pub fixed: usize,
    pub unresolved: usize,
}

pub struct PhantomDetector {
    handler: Arc<dyn PhantomDetectorHandler>,
    settings: PhantomSettings,
    clock: Arc<dyn Clock>,
    last_report: Mutex<Option<PhantomReport>>,
}

impl PhantomDetector {
    pub fn new(handler: Arc<dyn PhantomDetectorHandler>, settings: PhantomSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            handler,
            settings,
            clock,
            last_report: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> PhantomSettings {
        self.settings
    }

    pub fn last_report(&self) -> Option<PhantomReport> {
        self.last_report.lock().ok().and_then(|report| *report)
    }

    pub async fn run_once(&self) -> ApplicationResult<PhantomReport> {
        let now = self.clock.now();
        let max_age = ChronoDuration::from_std(self.settings.max_age).unwrap_or(ChronoDuration::zero());
        let phantoms = self.handler.find_phantom_statuses(now - max_age).await?;

        let mut report = PhantomReport {
            checked_at: now,
            detected: phantoms.len(),
            fixed: 0,
            unresolved: phantoms.len(),
        };
        if !phantoms.is_empty() {
            warn!(count = phantoms.len(), "检测到幽灵消息");
        }

        if self.settings.fix_automatically && !phantoms.is_empty() {
            let outcomes = join_all(phantoms.iter().map(|status| self.fix(status))).await;
            report.fixed = outcomes.into_iter().filter(|fixed| *fixed).count();
            report.unresolved = report.detected - report.fixed;
            info!(fixed = report.fixed, unresolved = report.unresolved, "幽灵消息修复完成");
        }

        if let Ok(mut last) = self.last_report.lock() {
            *last = Some(report);
        }
        Ok(report)
    }

    /// 补跑缺失阶段，全部成功时返回 true
    async fn fix(&self, status: &MessageStatus) -> bool {
        let message_id = status.message_id;
        let message = match self.recover_payload(status).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                // 内容无处可寻，置为 failed 终态，后续检测不再命中
                warn!(message_id = %message_id, "幽灵消息的内容已不可用");
                self.handler
                    .update_message_status_with_error(message_id, "message payload unavailable", status.retry_count)
                    .await;
                self.handler
                    .update_message_status(message_id, StatusUpdate::Status(PipelineStatus::Failed))
                    .await;
                return false;
            }
            Err(err) => {
                error!(message_id = %message_id, error = %err, "读取幽灵消息失败");
                return false;
            }
        };

        let mut all_fixed = true;
        for stage in status.missing_stages() {
            let result = match stage {
                StageFlag::SavedToDb => self.handler.save_message_to_db(&message).await,
                StageFlag::SavedToCache => self.handler.save_message_to_cache(&message).await,
                StageFlag::NotificationSent => {
                    let online = self.handler.online_users(message.room_id);
                    self.handler.send_notifications(&message, &online).await
                }
            };
            match result {
                Ok(()) => {
                    self.handler
                        .update_message_status(message_id, StatusUpdate::Stage(stage, true))
                        .await;
                }
                Err(err) => {
                    all_fixed = false;
                    warn!(message_id = %message_id, stage = stage.column(), error = %err, "幽灵消息阶段补跑失败");
                    self.handler
                        .update_message_status_with_error(message_id, &err.to_string(), status.retry_count + 1)
                        .await;
                }
            }
        }

        check_completion(self.handler.as_ref(), message_id).await;
        all_fixed
    }

    /// 优先使用台账快照
    async fn recover_payload(&self, status: &MessageStatus) -> ApplicationResult<Option<ChatMessage>> {
        match &status.payload {
            Some(message) => Ok(Some(message.clone())),
            None => self.handler.retrieve_message(status.message_id, status.room_id).await,
        }
    }

    /// 周期检测，首轮在一个间隔之后
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.run_once().await {
                            error!(error = %err, "幽灵消息检测失败");
                        }
                    }
                }
            }
            info!("幽灵消息检测已停止");
        })
    }
}

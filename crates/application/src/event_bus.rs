use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("topic provisioning failed: {0}")]
    Topic(String),
}

impl BusError {
    pub fn publish(message: impl Into<String>) -> Self {
        BusError::Publish(message.into())
    }
}

/// 跨实例消息总线
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BusError>;

    /// 主题不存在时创建，已存在视为成功
    async fn ensure_topic(&self, topic: &str) -> Result<(), BusError>;
}

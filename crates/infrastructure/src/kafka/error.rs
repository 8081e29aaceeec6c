//! Kafka 错误类型定义

use application::BusError;
use thiserror::Error;

/// Kafka 操作错误
#[derive(Error, Debug)]
pub enum KafkaError {
    /// 连接错误
    #[error("Kafka 连接错误: {message}")]
    ConnectionError { message: String },

    /// 生产者错误
    #[error("Kafka 生产者错误: {message}")]
    ProducerError { message: String },

    /// 消费者错误
    #[error("Kafka 消费者错误: {message}")]
    ConsumerError { message: String },

    /// 主题管理错误
    #[error("Kafka 主题错误: {topic}: {message}")]
    TopicError { topic: String, message: String },

    /// 配置错误
    #[error("配置错误: {message}")]
    ConfigError { message: String },
}

/// Kafka 结果类型
pub type KafkaResult<T> = Result<T, KafkaError>;

impl From<rdkafka::error::KafkaError> for KafkaError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        match err {
            rdkafka::error::KafkaError::ClientConfig(..) => KafkaError::ConfigError {
                message: err.to_string(),
            },
            rdkafka::error::KafkaError::ConsumerCommit(_) => KafkaError::ConsumerError {
                message: err.to_string(),
            },
            rdkafka::error::KafkaError::Canceled => KafkaError::ProducerError {
                message: "操作被取消".to_string(),
            },
            _ => KafkaError::ConnectionError {
                message: err.to_string(),
            },
        }
    }
}

impl From<KafkaError> for BusError {
    fn from(err: KafkaError) -> Self {
        match err {
            KafkaError::TopicError { .. } => BusError::Topic(err.to_string()),
            other => BusError::publish(other.to_string()),
        }
    }
}

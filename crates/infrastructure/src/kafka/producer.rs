//! Kafka 事件总线生产者
//!
//! 房间事件以 room_id 为键发布，保证同一房间内有序。主题在首次发布前按需创建。

use std::time::Duration;

use application::{BusError, EventBus};
use async_trait::async_trait;
use config::KafkaConfig;
use dashmap::DashSet;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::error::{KafkaError, KafkaResult};
use super::ORIGIN_HEADER;
use crate::retry::{retry_async, RetryConfig};

pub struct KafkaEventBus {
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
    config: KafkaConfig,
    origin: String,
    known_topics: DashSet<String>,
}

impl KafkaEventBus {
    pub fn new(config: &KafkaConfig) -> KafkaResult<Self> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.client_id)
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .set("acks", "all")
            .set("compression.type", "snappy")
            .set("enable.idempotence", "true");

        let producer: FutureProducer = client_config.create().map_err(|e| KafkaError::ConfigError {
            message: format!("创建 Kafka 生产者失败: {}", e),
        })?;
        let admin: AdminClient<DefaultClientContext> =
            client_config.create().map_err(|e| KafkaError::ConfigError {
                message: format!("创建 Kafka 管理客户端失败: {}", e),
            })?;

        let origin = Uuid::new_v4().to_string();
        info!(brokers = %config.brokers, origin = %origin, "Kafka 生产者创建成功");

        Ok(Self {
            producer,
            admin,
            config: config.clone(),
            origin,
            known_topics: DashSet::new(),
        })
    }

    /// 本实例的来源标识，消费者据此跳过自己发布的事件
    pub fn origin(&self) -> &str {
        &self.origin
    }

    fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.config.message_timeout_ms)
    }

    async fn send_once(&self, topic: &str, key: &str, payload: &[u8]) -> KafkaResult<()> {
        let headers = OwnedHeaders::new().insert(Header {
            key: ORIGIN_HEADER,
            value: Some(self.origin.as_str()),
        });
        let record = FutureRecord::to(topic).key(key).payload(payload).headers(headers);

        match self.producer.send(record, Timeout::After(self.send_timeout())).await {
            Ok(_) => Ok(()),
            Err((err, _)) => Err(KafkaError::ProducerError {
                message: format!("发送到 {} 失败: {}", topic, err),
            }),
        }
    }

    async fn create_topic(&self, topic: &str) -> KafkaResult<()> {
        let new_topic = NewTopic::new(
            topic,
            self.config.topic_partitions.max(1),
            TopicReplication::Fixed(self.config.topic_replication.max(1)),
        );
        let options = AdminOptions::new().operation_timeout(Some(self.send_timeout()));
        let results = self.admin.create_topics(&[new_topic], &options).await?;
        for result in results {
            if let Err((name, code)) = result {
                if !topic_exists(code) {
                    return Err(KafkaError::TopicError {
                        topic: name,
                        message: code.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// 刷新生产者缓冲区
    pub fn flush(&self) -> KafkaResult<()> {
        self.producer
            .flush(Timeout::After(Duration::from_secs(10)))
            .map_err(|e| KafkaError::ProducerError {
                message: format!("刷新生产者缓冲区失败: {}", e),
            })
    }
}

fn topic_exists(code: RDKafkaErrorCode) -> bool {
    code == RDKafkaErrorCode::TopicAlreadyExists
}

#[async_trait]
impl EventBus for KafkaEventBus {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BusError> {
        retry_async(RetryConfig::publish(), "kafka.publish", || self.send_once(topic, key, payload))
            .await
            .map_err(|err| {
                error!(topic, key, error = %err, "事件发布失败");
                BusError::from(err)
            })?;
        debug!(topic, key, bytes = payload.len(), "事件已发布");
        Ok(())
    }

    async fn ensure_topic(&self, topic: &str) -> Result<(), BusError> {
        if self.known_topics.contains(topic) {
            return Ok(());
        }
        self.create_topic(topic).await?;
        self.known_topics.insert(topic.to_owned());
        debug!(topic, "主题已就绪");
        Ok(())
    }
}

impl Drop for KafkaEventBus {
    fn drop(&mut self) {
        info!("Kafka 生产者正在关闭");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> KafkaConfig {
        KafkaConfig {
            brokers: "localhost:9092".to_string(),
            group_id: "test-group".to_string(),
            client_id: "test-client".to_string(),
            message_timeout_ms: 1000,
            topic_partitions: 1,
            topic_replication: 1,
        }
    }

    #[test]
    fn existing_topic_counts_as_provisioned() {
        assert!(topic_exists(RDKafkaErrorCode::TopicAlreadyExists));
        assert!(!topic_exists(RDKafkaErrorCode::InvalidReplicationFactor));
    }

    #[test]
    fn topic_errors_map_to_bus_topic_errors() {
        let err = BusError::from(KafkaError::TopicError {
            topic: "chat-room-x".into(),
            message: "denied".into(),
        });
        assert!(matches!(err, BusError::Topic(_)));

        let err = BusError::from(KafkaError::ProducerError { message: "timeout".into() });
        assert!(matches!(err, BusError::Publish(_)));
    }

    #[tokio::test]
    async fn test_producer_creation() {
        // 需要本地 Kafka 实例
        if std::env::var("KAFKA_INTEGRATION_TEST").is_ok() {
            let bus = KafkaEventBus::new(&create_test_config()).unwrap();
            assert!(!bus.origin().is_empty());
            bus.ensure_topic("chat-room-integration").await.unwrap();
            bus.publish("chat-room-integration", "room", b"{}").await.unwrap();
        }
    }
}

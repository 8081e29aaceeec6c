//! Kafka 房间事件消费者
//!
//! 每个实例使用独立的消费者组，订阅全部 `chat-room-*` 主题，
//! 把其他实例发布的事件交给本地连接注册表重新广播。

use std::sync::Arc;
use std::time::Duration;

use application::topics::ROOM_TOPIC_PREFIX;
use application::ChatService;
use config::KafkaConfig;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{KafkaError, KafkaResult};
use super::ORIGIN_HEADER;

const MAX_BACKOFF_EXP: u32 = 5;

/// 总线消息的本地处理方
pub trait BusMessageHandler: Send + Sync {
    fn handle_bus_message(&self, topic: &str, payload: &[u8]) -> Result<usize, String>;
}

impl BusMessageHandler for ChatService {
    fn handle_bus_message(&self, topic: &str, payload: &[u8]) -> Result<usize, String> {
        ChatService::handle_bus_message(self, topic, payload)
            .map(|report| report.delivered)
            .map_err(|err| err.to_string())
    }
}

pub struct RoomEventConsumer {
    consumer: StreamConsumer,
    origin: String,
}

impl RoomEventConsumer {
    pub fn new(config: &KafkaConfig, origin: impl Into<String>) -> KafkaResult<Self> {
        let origin = origin.into();
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", format!("{}-{}", config.group_id, origin))
            .set("client.id", &config.client_id)
            .set("bootstrap.servers", &config.brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "10000")
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .set("topic.metadata.refresh.interval.ms", "5000")
            .set("fetch.wait.max.ms", "100")
            .create()
            .map_err(|e| KafkaError::ConfigError {
                message: format!("创建 Kafka 消费者失败: {}", e),
            })?;

        let pattern = subscription_pattern();
        consumer
            .subscribe(&[pattern.as_str()])
            .map_err(|e| KafkaError::ConsumerError {
                message: format!("订阅主题失败: {}", e),
            })?;
        info!(pattern = %pattern, origin = %origin, "Kafka 消费者已订阅房间主题");

        Ok(Self { consumer, origin })
    }

    pub fn spawn(self, handler: Arc<dyn BusMessageHandler>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(handler, shutdown).await })
    }

    async fn run(self, handler: Arc<dyn BusMessageHandler>, shutdown: CancellationToken) {
        let mut consecutive_errors = 0u32;
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.consumer.recv() => received,
            };
            match received {
                Ok(message) => {
                    consecutive_errors = 0;
                    self.dispatch(&message, handler.as_ref());
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let delay = Duration::from_millis(500 * (1u64 << consecutive_errors.min(MAX_BACKOFF_EXP)));
                    error!(error = %e, attempt = consecutive_errors, "接收消息失败");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
        info!("Kafka 消费循环已停止");
    }

    fn dispatch(&self, message: &BorrowedMessage<'_>, handler: &dyn BusMessageHandler) {
        let origin = message
            .headers()
            .and_then(|headers| headers.iter().find(|header| header.key == ORIGIN_HEADER))
            .and_then(|header| header.value);
        if is_own_origin(origin, &self.origin) {
            return;
        }

        let Some(payload) = message.payload() else {
            warn!(topic = message.topic(), "消息负载为空");
            return;
        };
        match handler.handle_bus_message(message.topic(), payload) {
            Ok(delivered) => debug!(
                topic = message.topic(),
                partition = message.partition(),
                offset = message.offset(),
                delivered,
                "转发总线事件"
            ),
            Err(err) => warn!(topic = message.topic(), error = %err, "总线事件处理失败"),
        }
    }
}

fn subscription_pattern() -> String {
    format!("^{}.*", ROOM_TOPIC_PREFIX)
}

fn is_own_origin(header: Option<&[u8]>, origin: &str) -> bool {
    header.is_some_and(|value| value == origin.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribes_to_every_room_topic() {
        assert_eq!(subscription_pattern(), "^chat-room-.*");
    }

    #[test]
    fn own_events_are_recognised_by_origin_header() {
        assert!(is_own_origin(Some(b"abc"), "abc"));
        assert!(!is_own_origin(Some(b"xyz"), "abc"));
        assert!(!is_own_origin(None, "abc"));
    }
}

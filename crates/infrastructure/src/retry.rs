//! 外部调用的有限次重试
//!
//! 启动期的连接建立与总线发布使用；消息流水线有自己的退避与重试队列。

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backoff {
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Backoff::Exponential { base, max }
    }

    /// 第 `attempt` 次失败后的等待时间，attempt 从 1 开始
    pub fn delay_at(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Exponential { base, max } => {
                let exp = attempt.saturating_sub(1).min(20);
                base.saturating_mul(1u32 << exp).min(*max)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryConfig {
    /// 启动期连接 Postgres / Redis
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::exponential(Duration::from_millis(500), Duration::from_secs(8)),
        }
    }

    /// 发布到消息总线
    pub fn publish() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_millis(100), Duration::from_secs(1)),
        }
    }
}

pub async fn retry_async<F, Fut, T, E>(config: RetryConfig, operation: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= max_attempts => return Err(err),
            Err(err) => {
                let delay = config.backoff.delay_at(attempt);
                warn!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %err, "调用失败，稍后重试");
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn exponential_delay_is_capped() {
        let backoff = Backoff::exponential(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.delay_at(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_at(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_at(3), Duration::from_millis(350));
        assert_eq!(backoff.delay_at(30), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_async(RetryConfig::publish(), "test", || async {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call < 3 {
                Err(format!("failure {call}"))
            } else {
                Ok(call)
            }
        })
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_async(RetryConfig::publish(), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("down".to_owned())
        })
        .await;
        assert_eq!(result, Err("down".to_owned()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

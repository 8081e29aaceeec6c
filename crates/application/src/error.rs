use std::future::Future;
use std::time::Duration;

use domain::DomainError;
use thiserror::Error;

use crate::cache::CacheError;
use crate::event_bus::BusError;
use crate::hub::HubError;
use crate::repository::RepositoryError;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("event bus error: {0}")]
    Bus(#[from] BusError),
    #[error("hub error: {0}")]
    Hub(#[from] HubError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl ApplicationError {
    /// 创建基础设施错误
    pub fn infrastructure(message: impl Into<String>) -> Self {
        ApplicationError::Infrastructure(message.into())
    }

    /// 同步拒绝的请求（校验、冲突、权限）不进入重试
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ApplicationError::Domain(_))
    }
}

pub type ApplicationResult<T> = Result<T, ApplicationError>;

/// 对外部调用施加超时，超时按失败处理
pub async fn bounded<T, E, F>(limit: Duration, operation: &str, fut: F) -> ApplicationResult<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ApplicationError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(ApplicationError::Timeout(format!(
            "{operation} exceeded {}ms",
            limit.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounded_reports_timeout() {
        let result: ApplicationResult<()> = bounded(Duration::from_millis(10), "slow call", async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, RepositoryError>(())
        })
        .await;
        assert!(matches!(result, Err(ApplicationError::Timeout(ref op)) if op.starts_with("slow call")));
    }

    #[tokio::test]
    async fn bounded_passes_errors_through() {
        let result: ApplicationResult<()> = bounded(Duration::from_secs(1), "store", async {
            Err(RepositoryError::storage("disk full"))
        })
        .await;
        assert!(matches!(result, Err(ApplicationError::Repository(_))));
    }

    #[test]
    fn domain_errors_are_not_retryable() {
        let err = ApplicationError::from(DomainError::conflict("dup"));
        assert!(!err.is_retryable());
        assert!(ApplicationError::Timeout("x".into()).is_retryable());
    }
}

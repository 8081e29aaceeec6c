use std::sync::Arc;
use std::time::Duration;

use domain::{UserId, UserInfo};
use tracing::warn;

use crate::error::bounded;
use crate::repository::UserDirectory;

/// 为事件负载补全用户资料，查不到或查询失败时使用占位资料
#[derive(Clone)]
pub struct UserInfoResolver {
    directory: Arc<dyn UserDirectory>,
    timeout: Duration,
}

impl UserInfoResolver {
    pub fn new(directory: Arc<dyn UserDirectory>, timeout: Duration) -> Self {
        Self { directory, timeout }
    }

    pub async fn resolve(&self, user_id: UserId) -> UserInfo {
        match bounded(self.timeout, "user lookup", self.directory.find_user(user_id)).await {
            Ok(Some(record)) => UserInfo::from_record(&record),
            Ok(None) => UserInfo::fallback(user_id),
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "查询用户资料失败，使用占位资料");
                UserInfo::fallback(user_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{MockUserDirectory, RepositoryError};
    use domain::UserRecord;

    #[tokio::test]
    async fn falls_back_when_lookup_fails() {
        let mut directory = MockUserDirectory::new();
        directory
            .expect_find_user()
            .returning(|_| Err(RepositoryError::storage("connection refused")));
        let resolver = UserInfoResolver::new(Arc::new(directory), Duration::from_secs(1));

        let user = UserId::generate();
        let info = resolver.resolve(user).await;
        assert_eq!(info, UserInfo::fallback(user));
    }

    #[tokio::test]
    async fn uses_directory_record() {
        let user = UserId::generate();
        let mut directory = MockUserDirectory::new();
        directory.expect_find_user().returning(move |id| {
            Ok(Some(UserRecord {
                id,
                username: "alice".into(),
                first_name: "Alice".into(),
                last_name: "Liddell".into(),
                role_id: Some("member".into()),
            }))
        });
        let resolver = UserInfoResolver::new(Arc::new(directory), Duration::from_secs(1));

        let info = resolver.resolve(user).await;
        assert_eq!(info.username, "alice");
        assert_eq!(info.id, user.to_string());
    }
}

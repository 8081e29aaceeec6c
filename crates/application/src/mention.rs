//! `@handle` 提及解析

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use domain::{MentionInfo, UserId};
use regex::Regex;
use tracing::warn;

use crate::error::bounded;
use crate::repository::UserDirectory;

static MENTION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([A-Za-z0-9_.]+)").expect("Invalid mention regex"));

/// 保留字，提及整个房间
pub const ALL_HANDLE: &str = "All";

/// 文本中出现的原始句柄及其字节位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionToken {
    pub handle: String,
    pub position: usize,
}

/// 按出现顺序提取句柄，大小写不敏感去重
pub fn extract_mentions(text: &str) -> Vec<MentionToken> {
    let mut seen = HashSet::new();
    MENTION_REGEX
        .captures_iter(text)
        .filter_map(|captures| {
            let whole = captures.get(0)?;
            let handle = captures.get(1)?.as_str().trim_end_matches('.');
            if handle.is_empty() || !seen.insert(handle.to_lowercase()) {
                return None;
            }
            Some(MentionToken {
                handle: handle.to_owned(),
                position: whole.start(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMentions {
    pub info: Vec<MentionInfo>,
    /// 解析到的个人用户；`@All` 时为空
    pub user_ids: Vec<UserId>,
}

impl ParsedMentions {
    pub fn is_all(&self) -> bool {
        self.info.iter().any(|mention| mention.is_all)
    }

    pub fn is_empty(&self) -> bool {
        self.info.is_empty()
    }
}

pub struct MentionParser {
    directory: Arc<dyn UserDirectory>,
    timeout: Duration,
}

impl MentionParser {
    pub fn new(directory: Arc<dyn UserDirectory>, timeout: Duration) -> Self {
        Self { directory, timeout }
    }

    /// 出现 `@All` 时只保留这一条；无法解析的句柄直接忽略
    pub async fn parse(&self, text: &str) -> ParsedMentions {
        let tokens = extract_mentions(text);
        if tokens.is_empty() {
            return ParsedMentions::default();
        }

        if let Some(all) = tokens
            .iter()
            .find(|token| token.handle.eq_ignore_ascii_case(ALL_HANDLE))
        {
            return ParsedMentions {
                info: vec![MentionInfo {
                    user_id: None,
                    username: ALL_HANDLE.to_owned(),
                    position: all.position,
                    is_all: true,
                }],
                user_ids: Vec::new(),
            };
        }

        let handles: Vec<String> = tokens.iter().map(|token| token.handle.clone()).collect();
        let records = match bounded(self.timeout, "resolve mentions", self.directory.find_by_usernames(&handles)).await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "解析提及用户失败");
                return ParsedMentions::default();
            }
        };

        let mut parsed = ParsedMentions::default();
        for token in tokens {
            let Some(record) = records
                .iter()
                .find(|record| record.username.eq_ignore_ascii_case(&token.handle))
            else {
                continue;
            };
            if parsed.user_ids.contains(&record.id) {
                continue;
            }
            parsed.user_ids.push(record.id);
            parsed.info.push(MentionInfo {
                user_id: Some(record.id),
                username: record.username.clone(),
                position: token.position,
                is_all: false,
            });
        }
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MockUserDirectory;
    use domain::UserRecord;

    fn record(username: &str) -> UserRecord {
        UserRecord {
            id: UserId::generate(),
            username: username.to_owned(),
            first_name: String::new(),
            last_name: String::new(),
            role_id: None,
        }
    }

    #[test]
    fn extracts_handles_with_positions() {
        let tokens = extract_mentions("hi @alice and @bob.smith, @Alice again");
        assert_eq!(
            tokens,
            vec![
                MentionToken {
                    handle: "alice".into(),
                    position: 3
                },
                MentionToken {
                    handle: "bob.smith".into(),
                    position: 14
                },
            ]
        );
    }

    #[tokio::test]
    async fn resolves_known_users_only() {
        let bob = record("Bob");
        let bob_id = bob.id;
        let mut directory = MockUserDirectory::new();
        directory
            .expect_find_by_usernames()
            .returning(move |_| Ok(vec![bob.clone()]));
        let parser = MentionParser::new(Arc::new(directory), Duration::from_secs(1));

        let parsed = parser.parse("hello @Bob and @ghost").await;
        assert_eq!(parsed.user_ids, vec![bob_id]);
        assert_eq!(parsed.info.len(), 1);
        assert_eq!(parsed.info[0].username, "Bob");
        assert!(!parsed.is_all());
    }

    #[tokio::test]
    async fn all_supersedes_individual_mentions() {
        let mut directory = MockUserDirectory::new();
        directory.expect_find_by_usernames().never();
        let parser = MentionParser::new(Arc::new(directory), Duration::from_secs(1));

        let parsed = parser.parse("@bob hello @All").await;
        assert_eq!(parsed.info.len(), 1);
        assert!(parsed.info[0].is_all);
        assert_eq!(parsed.info[0].position, 11);
        assert!(parsed.user_ids.is_empty());
    }
}

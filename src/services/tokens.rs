use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::config::{GradingParts, TokenLocation};
use crate::core::metrics;
use crate::core::redis::RedisHandle;
use crate::core::state::RuntimeFlags;

/// Shown in place of a token that could not be read.
pub(crate) const TOKEN_ERROR_MESSAGE: &str = "Unexpected error encountered. Contact an administrator.";

/// Shown for a part that was not solved.
pub(crate) const NO_TOKEN_MESSAGE: &str = "You did not earn a token for this part";

#[derive(Debug, Error)]
pub(crate) enum TokenLookupError {
    #[error("no grading part named {0}")]
    UnknownPart(String),
    #[error("token {0} is missing or empty")]
    Empty(String),
    #[error("redis lookup for token {name} failed: {source}")]
    Redis {
        name: String,
        #[source]
        source: redis::RedisError,
    },
    #[error("failed to read token file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A place secrets are read from, keyed by token name.
#[async_trait]
pub(crate) trait TokenBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn lookup(&self, token_name: &str) -> Result<Option<String>, TokenLookupError>;
}

pub(crate) struct EnvTokenBackend;

#[async_trait]
impl TokenBackend for EnvTokenBackend {
    fn name(&self) -> &'static str {
        "env"
    }

    async fn lookup(&self, token_name: &str) -> Result<Option<String>, TokenLookupError> {
        Ok(std::env::var(token_name)
            .ok()
            .map(|value| value.trim().trim_matches('"').trim_matches('\'').to_string()))
    }
}

pub(crate) struct RedisTokenBackend {
    redis: RedisHandle,
    key_prefix: String,
}

impl RedisTokenBackend {
    pub(crate) fn new(redis: RedisHandle, key_prefix: String) -> Self {
        Self { redis, key_prefix }
    }
}

#[async_trait]
impl TokenBackend for RedisTokenBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn lookup(&self, token_name: &str) -> Result<Option<String>, TokenLookupError> {
        let key = format!("{}{token_name}", self.key_prefix);
        self.redis
            .get(&key)
            .await
            .map_err(|source| TokenLookupError::Redis { name: key, source })
    }
}

pub(crate) struct FileTokenBackend {
    dir: PathBuf,
}

impl FileTokenBackend {
    pub(crate) fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl TokenBackend for FileTokenBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn lookup(&self, token_name: &str) -> Result<Option<String>, TokenLookupError> {
        let path = self.dir.join(token_name);
        let contents = tokio::fs::read_to_string(&path).await.map_err(|source| {
            TokenLookupError::File { path: path.display().to_string(), source }
        })?;
        Ok(contents.lines().next().map(str::to_string))
    }
}

pub(crate) fn backend_for(
    location: TokenLocation,
    redis: RedisHandle,
    key_prefix: &str,
    token_dir: PathBuf,
) -> Arc<dyn TokenBackend> {
    match location {
        TokenLocation::Env => Arc::new(EnvTokenBackend),
        TokenLocation::Redis => Arc::new(RedisTokenBackend::new(redis, key_prefix.to_string())),
        TokenLocation::File => Arc::new(FileTokenBackend::new(token_dir)),
    }
}

/// Resolves tokens for solved parts. Never fails; problems turn into a placeholder.
#[derive(Clone)]
pub(crate) struct TokenDispenser {
    parts: GradingParts,
    backend: Arc<dyn TokenBackend>,
    flags: Arc<RuntimeFlags>,
    escalate: bool,
}

impl TokenDispenser {
    /// `escalate` raises the fatal flag on lookup failures; set it when tokens are auto-submitted.
    pub(crate) fn new(
        parts: GradingParts,
        backend: Arc<dyn TokenBackend>,
        flags: Arc<RuntimeFlags>,
        escalate: bool,
    ) -> Self {
        Self { parts, backend, flags, escalate }
    }

    pub(crate) async fn read_token(&self, label: &str) -> String {
        match self.resolve(label).await {
            Ok(token) => {
                metrics::record_token("ok");
                token
            }
            Err(err) => {
                tracing::error!(
                    label,
                    backend = self.backend.name(),
                    error = %err,
                    "Token lookup failed"
                );
                metrics::record_token("error");
                if self.escalate {
                    self.flags.set_fatal(true);
                }
                TOKEN_ERROR_MESSAGE.to_string()
            }
        }
    }

    async fn resolve(&self, label: &str) -> Result<String, TokenLookupError> {
        let part =
            self.parts.get(label).ok_or_else(|| TokenLookupError::UnknownPart(label.to_string()))?;
        self.backend
            .lookup(&part.token_name)
            .await?
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| TokenLookupError::Empty(part.token_name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::GradingSettings;
    use crate::test_support;

    fn parts() -> GradingParts {
        GradingSettings::from_toml_str(test_support::MANUAL_CHALLENGE).parts
    }

    #[tokio::test]
    async fn file_backend_reads_first_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("token1"), "abc123\nsecond line\n").expect("token");
        let flags = Arc::new(RuntimeFlags::default());
        let dispenser = TokenDispenser::new(
            parts(),
            Arc::new(FileTokenBackend::new(dir.path().to_path_buf())),
            flags.clone(),
            true,
        );

        assert_eq!(dispenser.read_token("GradingCheck1").await, "abc123");
        assert!(!flags.fatal());
    }

    #[tokio::test]
    async fn missing_token_returns_placeholder_without_escalation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let flags = Arc::new(RuntimeFlags::default());
        let dispenser = TokenDispenser::new(
            parts(),
            Arc::new(FileTokenBackend::new(dir.path().to_path_buf())),
            flags.clone(),
            false,
        );

        assert_eq!(dispenser.read_token("GradingCheck1").await, TOKEN_ERROR_MESSAGE);
        assert!(!flags.fatal());
    }

    #[tokio::test]
    async fn missing_token_escalates_when_auto_submitting() {
        let _guard = test_support::env_lock().await;
        std::env::remove_var("token2");
        let flags = Arc::new(RuntimeFlags::default());
        let dispenser = TokenDispenser::new(parts(), Arc::new(EnvTokenBackend), flags.clone(), true);

        assert_eq!(dispenser.read_token("GradingCheck2").await, TOKEN_ERROR_MESSAGE);
        assert!(flags.fatal());
    }

    #[tokio::test]
    async fn env_backend_strips_quotes() {
        let _guard = test_support::env_lock().await;
        std::env::set_var("token3", "\"quoted-token\"");
        let flags = Arc::new(RuntimeFlags::default());
        let dispenser =
            TokenDispenser::new(parts(), Arc::new(EnvTokenBackend), flags.clone(), false);

        assert_eq!(dispenser.read_token("GradingCheck3").await, "quoted-token");
        std::env::remove_var("token3");
    }

    #[tokio::test]
    async fn unknown_label_is_a_lookup_failure() {
        let flags = Arc::new(RuntimeFlags::default());
        let dispenser = TokenDispenser::new(parts(), Arc::new(EnvTokenBackend), flags, false);

        assert_eq!(dispenser.read_token("NotAPart").await, TOKEN_ERROR_MESSAGE);
    }

    #[tokio::test]
    async fn disconnected_redis_backend_reports_empty() {
        let flags = Arc::new(RuntimeFlags::default());
        let backend = backend_for(
            TokenLocation::Redis,
            RedisHandle::new("redis://127.0.0.1:6379/0".to_string()),
            "guestinfo.",
            PathBuf::new(),
        );
        assert_eq!(backend.name(), "redis");
        let dispenser = TokenDispenser::new(parts(), backend, flags, false);

        assert_eq!(dispenser.read_token("GradingCheck1").await, TOKEN_ERROR_MESSAGE);
    }
}

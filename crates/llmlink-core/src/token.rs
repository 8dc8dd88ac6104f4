//! Bearer tokens for the relay connection.
//!
//! llmlink does not run the login flow; it consumes tokens that the desktop
//! app stores. A [`TokenSource`] hands out the current token and is asked to
//! [`refresh`](TokenSource::refresh) when the relay rejects it.
//!
//! Token values are zeroized on drop and never appear in `Debug` output.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use zeroize::Zeroize;

use llmlink_config::AuthConfig;

use crate::BoxFuture;

/// A bearer token with automatic zeroization.
#[derive(Clone)]
pub struct BearerToken {
    inner: String,
}

impl BearerToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            inner: value.into(),
        }
    }

    /// Raw token value. Only for building the auth header and message.
    pub fn expose(&self) -> &str {
        &self.inner
    }

    /// Value of the `Authorization` header.
    pub fn header_value(&self) -> String {
        format!("Bearer {}", self.inner)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.trim().is_empty()
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("inner", &"[REDACTED]")
            .field("len", &self.inner.len())
            .finish()
    }
}

impl PartialEq for BearerToken {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl Drop for BearerToken {
    fn drop(&mut self) {
        self.inner.zeroize();
    }
}

/// Errors from obtaining a token.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("no bearer token available: {0}")]
    Missing(String),

    #[error("bearer token expired at {0}")]
    Expired(DateTime<Utc>),

    #[error("token source cannot refresh")]
    NotRefreshable,

    #[error("failed to read token file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid token file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// Supplies bearer tokens to the tunnel client.
pub trait TokenSource: Send + Sync {
    /// Current token.
    fn token(&self) -> BoxFuture<'_, Result<BearerToken, TokenError>>;

    /// Called after the relay rejected the current token.
    fn refresh(&self) -> BoxFuture<'_, Result<BearerToken, TokenError>>;
}

/// Fixed token, mostly for tests and `--token` overrides.
pub struct StaticTokenSource {
    token: BearerToken,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: BearerToken::new(token),
        }
    }
}

impl TokenSource for StaticTokenSource {
    fn token(&self) -> BoxFuture<'_, Result<BearerToken, TokenError>> {
        Box::pin(async move { Ok(self.token.clone()) })
    }

    fn refresh(&self) -> BoxFuture<'_, Result<BearerToken, TokenError>> {
        Box::pin(async { Err(TokenError::NotRefreshable) })
    }
}

/// Token read from an environment variable on every call.
pub struct EnvTokenSource {
    var: String,
}

impl EnvTokenSource {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    fn read(&self) -> Result<BearerToken, TokenError> {
        match std::env::var(&self.var) {
            Ok(value) if !value.trim().is_empty() => Ok(BearerToken::new(value.trim())),
            _ => Err(TokenError::Missing(format!(
                "environment variable {} is not set",
                self.var
            ))),
        }
    }
}

impl TokenSource for EnvTokenSource {
    fn token(&self) -> BoxFuture<'_, Result<BearerToken, TokenError>> {
        Box::pin(async move { self.read() })
    }

    fn refresh(&self) -> BoxFuture<'_, Result<BearerToken, TokenError>> {
        Box::pin(async move { self.read() })
    }
}

/// Token file written by the desktop login flow.
#[derive(Deserialize)]
struct TokenFile {
    access_token: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

/// Token read from a JSON file (`{"access_token": "...", "expires_at": "..."}`).
///
/// The file is re-read on every call, so a refresh picks up whatever the login
/// flow wrote since.
pub struct FileTokenSource {
    path: PathBuf,
}

impl FileTokenSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<BearerToken, TokenError> {
        let mut content =
            tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|source| TokenError::Io {
                    path: self.path.clone(),
                    source,
                })?;
        let parsed = serde_json::from_str::<TokenFile>(&content);
        content.zeroize();
        let mut file = parsed.map_err(|e| TokenError::Parse {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        let token = BearerToken::new(std::mem::take(&mut file.access_token));
        if token.is_empty() {
            return Err(TokenError::Missing(format!(
                "access_token in {} is empty",
                self.path.display()
            )));
        }
        if let Some(expires_at) = file.expires_at
            && expires_at <= Utc::now()
        {
            return Err(TokenError::Expired(expires_at));
        }
        Ok(token)
    }
}

impl TokenSource for FileTokenSource {
    fn token(&self) -> BoxFuture<'_, Result<BearerToken, TokenError>> {
        Box::pin(self.read())
    }

    fn refresh(&self) -> BoxFuture<'_, Result<BearerToken, TokenError>> {
        Box::pin(self.read())
    }
}

/// Build the token source described by the `[auth]` config section.
pub fn from_config(config: &AuthConfig) -> Arc<dyn TokenSource> {
    match &config.token_file {
        Some(path) => Arc::new(FileTokenSource::new(path.clone())),
        None => Arc::new(EnvTokenSource::new(config.token_env.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_debug_is_redacted() {
        let token = BearerToken::new("super-secret");
        let debug = format!("{token:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_header_value() {
        assert_eq!(BearerToken::new("abc").header_value(), "Bearer abc");
    }

    #[tokio::test]
    async fn test_static_source_cannot_refresh() {
        let source = StaticTokenSource::new("abc");
        assert_eq!(source.token().await.unwrap().expose(), "abc");
        assert!(matches!(
            source.refresh().await,
            Err(TokenError::NotRefreshable)
        ));
    }

    #[tokio::test]
    async fn test_env_source_missing_variable() {
        let source = EnvTokenSource::new("LLMLINK_TEST_TOKEN_THAT_IS_NEVER_SET");
        assert!(matches!(source.token().await, Err(TokenError::Missing(_))));
    }

    #[tokio::test]
    async fn test_file_source_reads_and_rereads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.json");
        tokio::fs::write(&path, r#"{"access_token":"first"}"#)
            .await
            .unwrap();

        let source = FileTokenSource::new(&path);
        assert_eq!(source.token().await.unwrap().expose(), "first");

        tokio::fs::write(&path, r#"{"access_token":"second","refresh_token":"r"}"#)
            .await
            .unwrap();
        assert_eq!(source.refresh().await.unwrap().expose(), "second");
    }

    #[tokio::test]
    async fn test_file_source_rejects_expired_token() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.json");
        tokio::fs::write(
            &path,
            r#"{"access_token":"old","expires_at":"2001-01-01T00:00:00Z"}"#,
        )
        .await
        .unwrap();

        let err = FileTokenSource::new(&path).token().await.unwrap_err();
        assert!(matches!(err, TokenError::Expired(_)));
    }

    #[tokio::test]
    async fn test_file_source_errors() {
        let dir = TempDir::new().unwrap();
        let missing = FileTokenSource::new(dir.path().join("absent.json"));
        assert!(matches!(
            missing.token().await,
            Err(TokenError::Io { .. })
        ));

        let path = dir.path().join("tokens.json");
        tokio::fs::write(&path, "not json").await.unwrap();
        assert!(matches!(
            FileTokenSource::new(&path).token().await,
            Err(TokenError::Parse { .. })
        ));

        tokio::fs::write(&path, r#"{"access_token":"  "}"#)
            .await
            .unwrap();
        assert!(matches!(
            FileTokenSource::new(&path).token().await,
            Err(TokenError::Missing(_))
        ));
    }
}

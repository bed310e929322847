//! 令牌集合：启动时从按行分隔的文件加载，之后只读。

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

use crate::config::TOKEN_LOG_PREFIX_LEN;

/// 令牌校验失败的具体原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    MissingToken,
    InvalidTokenFormat,
    TokenMismatch,
    TooManyAttempts,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            AuthError::MissingToken => "missing token",
            AuthError::InvalidTokenFormat => "invalid token format",
            AuthError::TokenMismatch => "token mismatched",
            AuthError::TooManyAttempts => "too many connection attempts using an invalid token",
        };
        f.write_str(message)
    }
}

impl std::error::Error for AuthError {}

/// Immutable set of accepted upload tokens.
#[derive(Debug, Default)]
pub struct TokenStore {
    tokens: HashSet<String>,
}

impl TokenStore {
    /// 读取令牌文件；文件不可读时返回错误，由调用方决定是否退出。
    pub async fn load(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path).await.map_err(|err| {
            io::Error::new(
                err.kind(),
                format!("unable to open tokens file {}: {err}", path.display()),
            )
        })?;
        let store = Self::parse(&content);
        if store.is_empty() {
            warn!(path = %path.display(), "tokens file contains no token, every upload will be refused");
        } else {
            info!(path = %path.display(), count = store.len(), "tokens loaded");
        }
        Ok(store)
    }

    fn parse(content: &str) -> Self {
        let tokens = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .inspect(|line| {
                if !is_canonical_token(line) {
                    warn!(
                        token = token_prefix(line),
                        "token does not match the expected format and will never authenticate"
                    );
                }
            })
            .map(str::to_owned)
            .collect();
        Self { tokens }
    }

    #[cfg(test)]
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// 按顺序校验：缺失、格式、成员关系。
    pub fn check(&self, token: Option<&str>) -> Result<(), AuthError> {
        let token = match token {
            Some(value) if !value.is_empty() => value,
            _ => return Err(AuthError::MissingToken),
        };
        if !is_canonical_token(token) {
            warn!(
                token = token_prefix(token),
                "connection attempt using invalid token format"
            );
            return Err(AuthError::InvalidTokenFormat);
        }
        if !self.tokens.contains(token) {
            warn!(
                token = token_prefix(token),
                "connection attempt using unknown token"
            );
            return Err(AuthError::TokenMismatch);
        }
        Ok(())
    }
}

/// Checks the 8-4-4-4-12 lowercase hex shape.
pub fn is_canonical_token(token: &str) -> bool {
    const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];

    let mut parts = token.split('-');
    for expected in GROUPS {
        match parts.next() {
            Some(part)
                if part.len() == expected
                    && part
                        .bytes()
                        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) => {}
            _ => return false,
        }
    }
    parts.next().is_none()
}

/// 日志中只输出令牌前缀。
pub fn token_prefix(token: &str) -> &str {
    match token.char_indices().nth(TOKEN_LOG_PREFIX_LEN) {
        Some((index, _)) => &token[..index],
        None => token,
    }
}

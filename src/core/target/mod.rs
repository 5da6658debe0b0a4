//! The external system whose credential is rotated.

use async_trait::async_trait;
use thiserror::Error;

pub mod snowflake;

pub use snowflake::{AdminCredentials, SnowflakeTarget};

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("login as {user} rejected: {message}")]
    AuthenticationFailed { user: String, message: String },
    #[error("statement failed (code {}): {message}", code.map(|c| c.to_string()).unwrap_or_else(|| "?".into()))]
    Statement { code: Option<i64>, message: String },
    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),
    #[error("unexpected response: {0}")]
    Protocol(String),
    #[error("target not configured: {0}")]
    NotConfigured(String),
    #[error("request to target failed")]
    Http(#[from] reqwest::Error),
}

impl TargetError {
    /// Whether a failed request may still have taken effect on the target, as when
    /// the connection drops after the statement committed.
    pub fn outcome_unknown(&self) -> bool {
        matches!(self, TargetError::Protocol(_) | TargetError::Http(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetPasswordOutcome {
    Applied,
    /// The target refused the password as previously used, which on a rerun of the
    /// same rotation means it is already in place.
    AlreadyUsed,
}

#[async_trait]
pub trait TargetSystem: Send + Sync {
    /// Human-readable target name for logs.
    fn describe(&self) -> String;

    /// Set `username`'s password using the target's administrative principal.
    async fn set_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<SetPasswordOutcome, TargetError>;

    /// Open and close a session as `username`.
    async fn verify_login(&self, username: &str, password: &str) -> Result<(), TargetError>;
}

//! Secret store abstraction: versions, staging labels, and values.
//!
//! The contract follows AWS Secrets Manager, which is the production store:
//! - every label is attached to at most one version;
//! - `get_secret_value` with neither version nor stage means `AWSCURRENT`;
//! - with both, the version must currently carry the stage.

use crate::core::password::{PasswordError, PasswordPolicy};
use crate::models::secret::{SecretMetadata, SecretValue};
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use zeroize::Zeroizing;

pub mod aws;
pub mod local;

pub use aws::AwsSecretStore;
pub use local::LocalSecretStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("secret '{secret_id}': {what} not found")]
    NotFound { secret_id: String, what: String },
    #[error("secret '{secret_id}': {reason}")]
    InvalidRequest { secret_id: String, reason: String },
    #[error("secret store {operation} failed: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },
    #[error("secret store file {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("secret store file {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("cannot generate password")]
    Password(#[from] PasswordError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    async fn describe_secret(&self, secret_id: &str) -> Result<SecretMetadata, StoreError>;

    async fn get_secret_value(
        &self,
        secret_id: &str,
        version_id: Option<&str>,
        stage: Option<&str>,
    ) -> Result<SecretValue, StoreError>;

    /// Store `secret_string` as version `token` carrying `stages`.
    async fn put_secret_value(
        &self,
        secret_id: &str,
        token: &str,
        secret_string: &str,
        stages: &[&str],
    ) -> Result<(), StoreError>;

    /// Attach `stage` to `move_to` and/or detach it from `remove_from`.
    async fn update_version_stage(
        &self,
        secret_id: &str,
        stage: &str,
        move_to: Option<&str>,
        remove_from: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn random_password(
        &self,
        policy: &PasswordPolicy,
    ) -> Result<Zeroizing<String>, StoreError> {
        Ok(policy.generate()?)
    }
}

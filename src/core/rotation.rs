//! The rotation operation: create, set, test, and finish a pending credential.
//!
//! Every step is idempotent for a given (secret, token) so the scheduler may retry
//! any of them. The target only ever sees a new password after the pending version
//! is durably stored, and AWSCURRENT only moves after the target accepted a login
//! with it.

use crate::constants::{STAGE_CURRENT, STAGE_PENDING, STAGE_PREVIOUS};
use crate::core::password::PasswordPolicy;
use crate::core::secret_store::{SecretStore, StoreError};
use crate::core::target::{SetPasswordOutcome, TargetError, TargetSystem};
use crate::models::event::{RotationRequest, RotationStep};
use crate::models::secret::{DatabaseSecret, SecretMetadata};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Error)]
pub enum RotationError {
    #[error("invalid rotation event: {0}")]
    InvalidEvent(String),
    #[error("secret {secret_id} is not enabled for rotation")]
    RotationDisabled { secret_id: String },
    #[error("secret version {token} has no stage for rotation of secret {secret_id}")]
    UnknownVersion { secret_id: String, token: String },
    #[error("secret version {token} not set as AWSPENDING for rotation of secret {secret_id}")]
    NotPending { secret_id: String, token: String },
    #[error("secret {secret_id} has no AWSCURRENT version")]
    NoCurrentVersion { secret_id: String },
    #[error("secret {secret_id} has no AWSPREVIOUS version to roll back to")]
    NoPreviousVersion { secret_id: String },
    #[error("secret {secret_id} version {version_id} is not a username/password document")]
    MalformedSecret {
        secret_id: String,
        version_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(
        "rotation of {secret_id} failed at {step} after the target was changed; target {}",
        if *restored { "restored to the current password" } else { "NOT restored, manual action needed" }
    )]
    Aborted {
        secret_id: String,
        step: RotationStep,
        restored: bool,
        #[source]
        source: Box<RotationError>,
    },
    #[error("secret store error")]
    Store(#[from] StoreError),
    #[error("target system error")]
    Target(#[from] TargetError),
}

impl RotationError {
    /// Stable name reported to the hosting runtime as `errorType`.
    pub fn kind(&self) -> &'static str {
        match self {
            RotationError::InvalidEvent(_) => "InvalidEvent",
            RotationError::RotationDisabled { .. } => "RotationDisabled",
            RotationError::UnknownVersion { .. } => "UnknownVersion",
            RotationError::NotPending { .. } => "NotPending",
            RotationError::NoCurrentVersion { .. } => "NoCurrentVersion",
            RotationError::NoPreviousVersion { .. } => "NoPreviousVersion",
            RotationError::MalformedSecret { .. } => "MalformedSecret",
            RotationError::Aborted { .. } => "RotationAborted",
            RotationError::Store(StoreError::NotFound { .. }) => "ResourceNotFound",
            RotationError::Store(_) => "SecretStoreError",
            RotationError::Target(_) => "TargetError",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    /// The token already holds AWSCURRENT; nothing to do.
    AlreadyCurrent,
}

#[derive(Debug, Clone)]
pub struct RotationReport {
    pub secret_id: String,
    pub token: String,
    pub previous_version: String,
}

#[derive(Debug, Clone)]
pub struct RollbackReport {
    pub secret_id: String,
    pub restored_version: String,
    pub replaced_version: String,
}

#[derive(Debug, Clone)]
pub struct SecretStatus {
    pub metadata: SecretMetadata,
    pub username: Option<String>,
}

#[derive(Clone)]
pub struct Rotator {
    store: Arc<dyn SecretStore>,
    target: Arc<dyn TargetSystem>,
    policy: PasswordPolicy,
}

impl Rotator {
    pub fn new(
        store: Arc<dyn SecretStore>,
        target: Arc<dyn TargetSystem>,
        policy: PasswordPolicy,
    ) -> Self {
        Self {
            store,
            target,
            policy,
        }
    }

    async fn load_secret(
        &self,
        secret_id: &str,
        version_id: Option<&str>,
        stage: &str,
    ) -> Result<DatabaseSecret, RotationError> {
        let value = self
            .store
            .get_secret_value(secret_id, version_id, Some(stage))
            .await?;
        DatabaseSecret::parse(&value.secret_string).map_err(|source| {
            RotationError::MalformedSecret {
                secret_id: secret_id.to_string(),
                version_id: value.version_id.clone(),
                source,
            }
        })
    }

    /// Check the token's staging, then run the requested step.
    pub async fn execute(&self, request: &RotationRequest) -> Result<StepOutcome, RotationError> {
        let span = info_span!(
            "rotation_step",
            secret_id = %request.secret_id,
            token = %request.token,
            step = %request.step
        );
        self.guarded_step(request).instrument(span).await
    }

    async fn guarded_step(&self, request: &RotationRequest) -> Result<StepOutcome, RotationError> {
        let RotationRequest {
            secret_id,
            token,
            step,
        } = request;
        info!("begin rotation step");
        let metadata = self.store.describe_secret(secret_id).await?;
        if !metadata.rotation_enabled {
            return Err(RotationError::RotationDisabled {
                secret_id: secret_id.clone(),
            });
        }
        if !metadata.has_version(token) {
            return Err(RotationError::UnknownVersion {
                secret_id: secret_id.clone(),
                token: token.clone(),
            });
        }
        if metadata.has_stage(token, STAGE_CURRENT) {
            info!("version already set as AWSCURRENT");
            return Ok(StepOutcome::AlreadyCurrent);
        }
        if !metadata.has_stage(token, STAGE_PENDING) {
            return Err(RotationError::NotPending {
                secret_id: secret_id.clone(),
                token: token.clone(),
            });
        }

        match step {
            RotationStep::Create => self.create_secret(secret_id, token).await?,
            RotationStep::Set => self.set_secret(secret_id, token).await?,
            RotationStep::Test => self.test_secret(secret_id, token).await?,
            RotationStep::Finish => self.finish_secret(secret_id, token).await?,
        }
        Ok(StepOutcome::Completed)
    }

    /// Stage a freshly generated password under `token`, unless one already is.
    pub async fn create_secret(&self, secret_id: &str, token: &str) -> Result<(), RotationError> {
        let current = self.load_secret(secret_id, None, STAGE_CURRENT).await?;

        match self
            .store
            .get_secret_value(secret_id, Some(token), Some(STAGE_PENDING))
            .await
        {
            Ok(_) => {
                warn!(secret_id, token, "AWSPENDING version already exists, keeping it");
                return Ok(());
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let password = self.store.random_password(&self.policy).await?;
        let pending = current.with_password(&password);
        let secret_string = pending.to_secret_string().map_err(|source| {
            RotationError::MalformedSecret {
                secret_id: secret_id.to_string(),
                version_id: token.to_string(),
                source,
            }
        })?;
        self.store
            .put_secret_value(secret_id, token, &secret_string, &[STAGE_PENDING])
            .await?;
        info!(secret_id, token, username = %current.username, "created AWSPENDING version");
        Ok(())
    }

    /// Apply the pending password to the target.
    pub async fn set_secret(&self, secret_id: &str, token: &str) -> Result<(), RotationError> {
        let pending = self.load_secret(secret_id, Some(token), STAGE_PENDING).await?;
        match self
            .target
            .set_password(&pending.username, &pending.password)
            .await?
        {
            SetPasswordOutcome::Applied => {
                info!(secret_id, token, target = %self.target.describe(), "set pending password on target")
            }
            SetPasswordOutcome::AlreadyUsed => warn!(
                secret_id,
                token,
                "target reports prior use of the pending password, continuing without setting it"
            ),
        }
        Ok(())
    }

    /// Log in to the target with the pending credentials.
    pub async fn test_secret(&self, secret_id: &str, token: &str) -> Result<(), RotationError> {
        let pending = self.load_secret(secret_id, Some(token), STAGE_PENDING).await?;
        self.target
            .verify_login(&pending.username, &pending.password)
            .await?;
        info!(secret_id, token, "pending credentials accepted by target");
        Ok(())
    }

    /// Promote `token` to AWSCURRENT and clear AWSPENDING everywhere.
    pub async fn finish_secret(&self, secret_id: &str, token: &str) -> Result<(), RotationError> {
        let metadata = self.store.describe_secret(secret_id).await?;
        let current = metadata.current_version().map(str::to_string);

        if current.as_deref() == Some(token) {
            info!(secret_id, token, "version already marked as AWSCURRENT");
        } else {
            self.store
                .update_version_stage(secret_id, STAGE_CURRENT, Some(token), current.as_deref())
                .await?;
            info!(secret_id, token, "set AWSCURRENT stage to pending version");
        }

        for version in metadata.pending_versions() {
            self.store
                .update_version_stage(secret_id, STAGE_PENDING, None, Some(version))
                .await?;
            info!(secret_id, version, "removed AWSPENDING stage");
        }
        Ok(())
    }

    /// Run all four steps under a new token.
    ///
    /// A failure after the target accepted the new password puts the AWSCURRENT
    /// password back on the target before reporting. So does a set whose outcome
    /// is unknown, such as a dropped connection after the statement ran.
    pub async fn rotate(&self, secret_id: &str) -> Result<RotationReport, RotationError> {
        let token = uuid::Uuid::new_v4().to_string();
        let metadata = self.store.describe_secret(secret_id).await?;
        let previous_version = metadata
            .current_version()
            .ok_or_else(|| RotationError::NoCurrentVersion {
                secret_id: secret_id.to_string(),
            })?
            .to_string();
        if !metadata.rotation_enabled {
            return Err(RotationError::RotationDisabled {
                secret_id: secret_id.to_string(),
            });
        }
        info!(secret_id, token = %token, "starting rotation");

        self.create_secret(secret_id, &token).await?;
        let request = |step| RotationRequest {
            secret_id: secret_id.to_string(),
            token: token.clone(),
            step,
        };
        match self.execute(&request(RotationStep::Set)).await {
            Ok(_) => {}
            Err(RotationError::Target(e)) if e.outcome_unknown() => {
                warn!(secret_id, error = %e, "target may have applied the new password, restoring");
                let restored = self.restore_current(secret_id).await;
                return Err(RotationError::Aborted {
                    secret_id: secret_id.to_string(),
                    step: RotationStep::Set,
                    restored,
                    source: Box::new(RotationError::Target(e)),
                });
            }
            Err(e) => return Err(e),
        }

        for step in [RotationStep::Test, RotationStep::Finish] {
            if let Err(err) = self.execute(&request(step)).await {
                warn!(secret_id, %step, error = %err, "rotation failed after target change, restoring");
                let restored = self.restore_current(secret_id).await;
                return Err(RotationError::Aborted {
                    secret_id: secret_id.to_string(),
                    step,
                    restored,
                    source: Box::new(err),
                });
            }
        }

        info!(secret_id, token = %token, "rotation complete");
        Ok(RotationReport {
            secret_id: secret_id.to_string(),
            token,
            previous_version,
        })
    }

    /// Put the AWSCURRENT password back on the target. Returns whether it worked.
    async fn restore_current(&self, secret_id: &str) -> bool {
        let current = match self.load_secret(secret_id, None, STAGE_CURRENT).await {
            Ok(secret) => secret,
            Err(e) => {
                warn!(secret_id, error = %e, "cannot read AWSCURRENT to restore target");
                return false;
            }
        };
        match self
            .target
            .set_password(&current.username, &current.password)
            .await
        {
            Ok(SetPasswordOutcome::Applied) => true,
            Ok(SetPasswordOutcome::AlreadyUsed) => {
                warn!(secret_id, "target refused to reuse the current password");
                false
            }
            Err(e) => {
                warn!(secret_id, error = %e, "restoring target password failed");
                false
            }
        }
    }

    /// Make the AWSPREVIOUS credential current again, on the target first.
    pub async fn rollback(&self, secret_id: &str) -> Result<RollbackReport, RotationError> {
        let metadata = self.store.describe_secret(secret_id).await?;
        let current = metadata
            .current_version()
            .ok_or_else(|| RotationError::NoCurrentVersion {
                secret_id: secret_id.to_string(),
            })?
            .to_string();
        let previous = metadata
            .previous_version()
            .ok_or_else(|| RotationError::NoPreviousVersion {
                secret_id: secret_id.to_string(),
            })?
            .to_string();
        info!(secret_id, from = %current, to = %previous, "rolling back");

        let prior = self
            .load_secret(secret_id, Some(previous.as_str()), STAGE_PREVIOUS)
            .await?;
        let outcome = match self
            .target
            .set_password(&prior.username, &prior.password)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) if e.outcome_unknown() => {
                let restored = self.restore_current(secret_id).await;
                return Err(RotationError::Aborted {
                    secret_id: secret_id.to_string(),
                    step: RotationStep::Set,
                    restored,
                    source: Box::new(e.into()),
                });
            }
            Err(e) => return Err(e.into()),
        };
        if outcome == SetPasswordOutcome::AlreadyUsed {
            warn!(secret_id, "target refused to reuse the previous password");
        }
        if let Err(e) = self
            .target
            .verify_login(&prior.username, &prior.password)
            .await
        {
            if outcome == SetPasswordOutcome::AlreadyUsed {
                return Err(e.into());
            }
            warn!(secret_id, error = %e, "previous credentials rejected after set, restoring");
            let restored = self.restore_current(secret_id).await;
            return Err(RotationError::Aborted {
                secret_id: secret_id.to_string(),
                step: RotationStep::Test,
                restored,
                source: Box::new(e.into()),
            });
        }

        if let Err(err) = self
            .store
            .update_version_stage(
                secret_id,
                STAGE_CURRENT,
                Some(previous.as_str()),
                Some(current.as_str()),
            )
            .await
        {
            let restored = self.restore_current(secret_id).await;
            return Err(RotationError::Aborted {
                secret_id: secret_id.to_string(),
                step: RotationStep::Finish,
                restored,
                source: Box::new(err.into()),
            });
        }

        info!(secret_id, version = %previous, "rollback complete");
        Ok(RollbackReport {
            secret_id: secret_id.to_string(),
            restored_version: previous,
            replaced_version: current,
        })
    }

    pub async fn status(&self, secret_id: &str) -> Result<SecretStatus, RotationError> {
        status(self.store.as_ref(), secret_id).await
    }
}

/// Versions and current username, without needing a target.
pub async fn status(store: &dyn SecretStore, secret_id: &str) -> Result<SecretStatus, RotationError> {
    let metadata = store.describe_secret(secret_id).await?;
    let username = match store.get_secret_value(secret_id, None, Some(STAGE_CURRENT)).await {
        Ok(value) => DatabaseSecret::parse(&value.secret_string)
            .ok()
            .map(|s| s.username.clone()),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e.into()),
    };
    Ok(SecretStatus { metadata, username })
}

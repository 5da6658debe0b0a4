//! Secret payloads and version metadata.

use crate::constants::{STAGE_CURRENT, STAGE_PENDING, STAGE_PREVIOUS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

/// Database credential stored as the secret string.
///
/// Fields other than `username` and `password` (host, account, warehouse, ...) are
/// carried through rotation untouched.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseSecret {
    pub username: String,
    pub password: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DatabaseSecret {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn parse(secret_string: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(secret_string)
    }

    /// Same identity and extra fields, new password.
    pub fn with_password(&self, password: &str) -> Self {
        Self {
            username: self.username.clone(),
            password: password.to_string(),
            extra: self.extra.clone(),
        }
    }

    pub fn to_secret_string(&self) -> Result<Zeroizing<String>, serde_json::Error> {
        serde_json::to_string(self).map(Zeroizing::new)
    }
}

impl Drop for DatabaseSecret {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

impl fmt::Debug for DatabaseSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSecret")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("extra_keys", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// One stored version of a secret.
pub struct SecretValue {
    pub version_id: String,
    pub secret_string: Zeroizing<String>,
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretValue")
            .field("version_id", &self.version_id)
            .finish_non_exhaustive()
    }
}

/// Rotation-relevant description of a secret.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretMetadata {
    pub name: Option<String>,
    pub rotation_enabled: bool,
    /// Version id -> staging labels.
    #[serde(default)]
    pub versions: BTreeMap<String, Vec<String>>,
}

impl SecretMetadata {
    pub fn has_version(&self, version_id: &str) -> bool {
        self.versions.contains_key(version_id)
    }

    pub fn has_stage(&self, version_id: &str, stage: &str) -> bool {
        self.versions
            .get(version_id)
            .is_some_and(|stages| stages.iter().any(|s| s == stage))
    }

    /// Version holding `stage`; labels other than AWSPENDING are unique.
    pub fn version_with_stage(&self, stage: &str) -> Option<&str> {
        self.versions
            .iter()
            .find(|(_, stages)| stages.iter().any(|s| s == stage))
            .map(|(id, _)| id.as_str())
    }

    pub fn versions_with_stage(&self, stage: &str) -> Vec<&str> {
        self.versions
            .iter()
            .filter(|(_, stages)| stages.iter().any(|s| s == stage))
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn current_version(&self) -> Option<&str> {
        self.version_with_stage(STAGE_CURRENT)
    }

    pub fn previous_version(&self) -> Option<&str> {
        self.version_with_stage(STAGE_PREVIOUS)
    }

    pub fn pending_versions(&self) -> Vec<&str> {
        self.versions_with_stage(STAGE_PENDING)
    }
}

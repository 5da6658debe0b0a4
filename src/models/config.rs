//! Rotator configuration file model.

use crate::constants;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Deployment environment name, carried into logs and audit entries.
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub snowflake: SnowflakeSection,
    #[serde(default)]
    pub password: PasswordSection,
    #[serde(default)]
    pub audit: AuditSection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Aws,
    Local,
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKind::Aws => f.write_str("aws"),
            StoreKind::Local => f.write_str("local"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default)]
    pub kind: StoreKind,
    /// Local store file (required for `kind = "local"`).
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub region: Option<String>,
    /// Alternative Secrets Manager endpoint (LocalStack and similar).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SnowflakeSection {
    #[serde(default)]
    pub account: Option<String>,
    /// Overrides `https://<account>.snowflakecomputing.com`.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub admin_user: Option<String>,
    #[serde(default)]
    pub admin_password: Option<String>,
    /// Secret holding the admin credentials; takes precedence over user/password.
    #[serde(default)]
    pub admin_secret_id: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub warehouse: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SnowflakeSection {
    fn default() -> Self {
        Self {
            account: None,
            base_url: None,
            admin_user: None,
            admin_password: None,
            admin_secret_id: None,
            role: default_role(),
            warehouse: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl std::fmt::Debug for SnowflakeSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnowflakeSection")
            .field("account", &self.account)
            .field("base_url", &self.base_url)
            .field("admin_user", &self.admin_user)
            .field("admin_password", &self.admin_password.as_ref().map(|_| "<redacted>"))
            .field("admin_secret_id", &self.admin_secret_id)
            .field("role", &self.role)
            .field("warehouse", &self.warehouse)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordSection {
    #[serde(default = "default_length")]
    pub length: usize,
    #[serde(default = "default_exclude")]
    pub exclude_characters: String,
    #[serde(default)]
    pub exclude_punctuation: bool,
    #[serde(default = "default_true")]
    pub require_each_included_type: bool,
}

impl Default for PasswordSection {
    fn default() -> Self {
        Self {
            length: default_length(),
            exclude_characters: default_exclude(),
            exclude_punctuation: false,
            require_each_included_type: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditSection {
    /// Hash-chained audit log; disabled when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_role() -> String {
    constants::DEFAULT_SNOWFLAKE_ROLE.to_string()
}

fn default_timeout_secs() -> u64 {
    constants::DEFAULT_SNOWFLAKE_TIMEOUT_SECS
}

fn default_length() -> usize {
    constants::DEFAULT_PASSWORD_LENGTH
}

fn default_exclude() -> String {
    constants::DEFAULT_EXCLUDE_CHARACTERS.to_string()
}

fn default_true() -> bool {
    true
}

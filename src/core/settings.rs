//! Configuration loading: TOML file first, environment on top.

use crate::core::password::{PasswordError, PasswordPolicy};
use crate::models::config::{Config, StoreKind};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("invalid password policy")]
    Password(#[from] PasswordError),
}

/// Load configuration from `path` (when given) and the process environment.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(path) => read_file(path)?,
        None => Config::default(),
    };
    apply_env(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

pub fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Overlay environment variables; `lookup` abstracts the environment for tests.
pub fn apply_env<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = non_empty("ENVIRONMENT") {
        config.environment = Some(v);
    }
    if let Some(v) = non_empty("SNOWROT_STORE") {
        config.store.kind = match v.to_ascii_lowercase().as_str() {
            "aws" => StoreKind::Aws,
            "local" => StoreKind::Local,
            other => {
                return Err(ConfigError::Invalid {
                    field: "SNOWROT_STORE",
                    reason: format!("unknown store kind '{}' (use aws|local)", other),
                })
            }
        };
    }
    if let Some(v) = non_empty("SNOWROT_STORE_PATH") {
        config.store.path = Some(PathBuf::from(v));
    }
    if let Some(v) = non_empty("SNOWROT_AWS_ENDPOINT") {
        config.store.endpoint_url = Some(v);
    }
    if let Some(v) = non_empty("SNOWFLAKE_ACCOUNT") {
        config.snowflake.account = Some(v);
    }
    if let Some(v) = non_empty("SNOWFLAKE_BASE_URL") {
        config.snowflake.base_url = Some(v);
    }
    if let Some(v) = non_empty("SNOWFLAKE_ADMIN_USER") {
        config.snowflake.admin_user = Some(v);
    }
    if let Some(v) = non_empty("SNOWFLAKE_ADMIN_PASSWORD") {
        config.snowflake.admin_password = Some(v);
    }
    if let Some(v) = non_empty("SNOWFLAKE_ADMIN_SECRET_ID") {
        config.snowflake.admin_secret_id = Some(v);
    }
    if let Some(v) = non_empty("SNOWFLAKE_ROLE") {
        config.snowflake.role = v;
    }
    if let Some(v) = non_empty("SNOWFLAKE_WAREHOUSE") {
        config.snowflake.warehouse = Some(v);
    }
    if let Some(v) = non_empty("PASSWORD_LENGTH") {
        config.password.length = v.trim().parse().map_err(|_| ConfigError::Invalid {
            field: "PASSWORD_LENGTH",
            reason: format!("'{}' is not a number", v),
        })?;
    }
    // An empty value is meaningful here: exclude nothing.
    if let Some(v) = lookup("EXCLUDE_CHARACTERS") {
        config.password.exclude_characters = v;
    }
    if let Some(v) = non_empty("SNOWROT_AUDIT_LOG") {
        config.audit.path = Some(PathBuf::from(v));
    }
    Ok(())
}

/// Reject configurations no command can run with.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.store.kind == StoreKind::Local && config.store.path.is_none() {
        return Err(ConfigError::Invalid {
            field: "store.path",
            reason: "required when store.kind = \"local\"".into(),
        });
    }
    if config.snowflake.timeout_secs == 0 {
        return Err(ConfigError::Invalid {
            field: "snowflake.timeout_secs",
            reason: "must be greater than zero".into(),
        });
    }
    if config.snowflake.role.trim().is_empty() {
        return Err(ConfigError::Invalid {
            field: "snowflake.role",
            reason: "cannot be empty".into(),
        });
    }
    PasswordPolicy::from(&config.password).validate()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.store.kind, StoreKind::Aws);
        assert_eq!(config.snowflake.role, "SECURITYADMIN");
        assert_eq!(config.password.length, 32);
        assert_eq!(config.password.exclude_characters, "/@\"'\\`");
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_read_file_partial_sections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snowrot.toml");
        fs::write(
            &path,
            r#"
environment = "prod"

[store]
kind = "local"
path = "/tmp/secrets.toml"

[snowflake]
account = "xy12345"
warehouse = "ROTATION_WH"
"#,
        )
        .unwrap();
        let config = read_file(&path).unwrap();
        assert_eq!(config.environment.as_deref(), Some("prod"));
        assert_eq!(config.store.kind, StoreKind::Local);
        assert_eq!(config.snowflake.account.as_deref(), Some("xy12345"));
        assert_eq!(config.snowflake.role, "SECURITYADMIN");
        assert_eq!(config.password.length, 32);
    }

    #[test]
    fn test_read_file_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[store\nkind = ").unwrap();
        assert!(matches!(read_file(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::default();
        config.snowflake.account = Some("from-file".into());
        apply_env(
            &mut config,
            env(&[
                ("SNOWFLAKE_ACCOUNT", "from-env"),
                ("SNOWROT_STORE", "local"),
                ("SNOWROT_STORE_PATH", "/var/lib/snowrot/secrets.toml"),
                ("PASSWORD_LENGTH", "48"),
                ("SNOWFLAKE_ROLE", ""),
            ]),
        )
        .unwrap();
        assert_eq!(config.snowflake.account.as_deref(), Some("from-env"));
        assert_eq!(config.store.kind, StoreKind::Local);
        assert_eq!(config.password.length, 48);
        // blank values do not clobber
        assert_eq!(config.snowflake.role, "SECURITYADMIN");
    }

    #[test]
    fn test_empty_exclude_characters_is_kept() {
        let mut config = Config::default();
        apply_env(&mut config, env(&[("EXCLUDE_CHARACTERS", "")])).unwrap();
        assert_eq!(config.password.exclude_characters, "");
    }

    #[test]
    fn test_bad_env_values() {
        let mut config = Config::default();
        assert!(apply_env(&mut config, env(&[("SNOWROT_STORE", "vault")])).is_err());
        assert!(apply_env(&mut config, env(&[("PASSWORD_LENGTH", "long")])).is_err());
    }

    #[test]
    fn test_validate_local_requires_path() {
        let mut config = Config::default();
        config.store.kind = StoreKind::Local;
        assert!(matches!(
            validate(&config),
            Err(ConfigError::Invalid { field: "store.path", .. })
        ));
    }

    #[test]
    fn test_validate_password_policy() {
        let mut config = Config::default();
        config.password.length = 2;
        assert!(matches!(validate(&config), Err(ConfigError::Password(_))));
    }
}

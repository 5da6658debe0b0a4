//! Centralized constants for staging labels, defaults, and limits.

/// Label of the active secret version.
pub const STAGE_CURRENT: &str = "AWSCURRENT";

/// Label of the version under rotation.
pub const STAGE_PENDING: &str = "AWSPENDING";

/// Label of the version superseded by the last rotation.
pub const STAGE_PREVIOUS: &str = "AWSPREVIOUS";

/// Characters never used in generated passwords unless overridden.
pub const DEFAULT_EXCLUDE_CHARACTERS: &str = "/@\"'\\`";

/// Default generated password length.
pub const DEFAULT_PASSWORD_LENGTH: usize = 32;

/// Generated password length bounds (Secrets Manager accepts 1..=4096; Snowflake needs 8+).
pub const MIN_PASSWORD_LENGTH: usize = 8;
pub const MAX_PASSWORD_LENGTH: usize = 4096;

/// Punctuation set Secrets Manager draws from in `GetRandomPassword`.
pub const PUNCTUATION: &str = "!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";

/// Role used to alter user passwords when none is configured.
pub const DEFAULT_SNOWFLAKE_ROLE: &str = "SECURITYADMIN";

/// Snowflake error code for "password was used previously".
pub const SNOWFLAKE_PRIOR_USE_ERROR: i64 = 3002;

/// Default HTTP timeout towards Snowflake, in seconds.
pub const DEFAULT_SNOWFLAKE_TIMEOUT_SECS: u64 = 30;

/// Maximum secret string size accepted by the local store (Secrets Manager limit).
pub const MAX_SECRET_SIZE: usize = 65_536;

/// Unlabeled versions kept by the local store before pruning.
pub const MAX_DEPRECATED_VERSIONS: usize = 10;

/// Permission mode for the local store file.
pub const STORE_FILE_MODE: u32 = 0o600;

/// Permission mode for the audit log.
pub const AUDIT_LOG_MODE: u32 = 0o640;

/// Lambda custom runtime API version prefix.
pub const RUNTIME_API_VERSION: &str = "2018-06-01";

/// Header carrying the invocation id in runtime API responses.
pub const RUNTIME_REQUEST_ID_HEADER: &str = "lambda-runtime-aws-request-id";

/// Tag used in audit entries and log lines.
pub const APP_NAME: &str = "snowrot";

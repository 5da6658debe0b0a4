//! CLI routing and command dispatch.

use crate::constants::STAGE_CURRENT;
use crate::core::audit_log::AuditLog;
use crate::core::handler::RotationHandler;
use crate::core::password::PasswordPolicy;
use crate::core::rotation::Rotator;
use crate::core::secret_store::{AwsSecretStore, LocalSecretStore, SecretStore};
use crate::core::settings;
use crate::core::target::snowflake::SnowflakeSettings;
use crate::core::target::{AdminCredentials, SnowflakeTarget, TargetSystem};
use crate::models::config::{Config, StoreKind};
use crate::models::secret::DatabaseSecret;
use crate::util::logging::{self, LogFormat};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

pub mod audit;
pub mod doctor;
pub mod rotate;
pub mod seed;
pub mod serve;

/// Shared context passed to all command handlers.
pub struct CliContext {
    pub config: Config,
    pub config_path: Option<PathBuf>,
    pub non_interactive: bool,
}

impl CliContext {
    pub fn audit_log(&self) -> Option<AuditLog> {
        self.config
            .audit
            .path
            .as_ref()
            .map(|path| AuditLog::new(path, self.config.environment.clone()))
    }

    pub fn policy(&self) -> PasswordPolicy {
        PasswordPolicy::from(&self.config.password)
    }

    /// The local store, or an error naming the command that needs it.
    pub fn local_store(&self, command: &str) -> Result<LocalSecretStore> {
        if self.config.store.kind != StoreKind::Local {
            bail!(
                "'{}' only works with the local store (use --store local --store-path PATH)",
                command
            );
        }
        let path = self
            .config
            .store
            .path
            .as_ref()
            .context("local store requires a path (--store-path or SNOWROT_STORE_PATH)")?;
        Ok(LocalSecretStore::new(path))
    }

    pub async fn open_store(&self) -> Result<Arc<dyn SecretStore>> {
        let store: Arc<dyn SecretStore> = match self.config.store.kind {
            StoreKind::Aws => Arc::new(AwsSecretStore::connect(&self.config.store).await),
            StoreKind::Local => Arc::new(self.local_store("local store")?),
        };
        tracing::debug!(backend = store.backend(), "opened secret store");
        Ok(store)
    }

    /// Admin credentials from the admin secret when configured, else from config/env.
    async fn admin_credentials(&self, store: &dyn SecretStore) -> Result<AdminCredentials> {
        let sf = &self.config.snowflake;
        if let Some(secret_id) = &sf.admin_secret_id {
            let value = store
                .get_secret_value(secret_id, None, Some(STAGE_CURRENT))
                .await
                .with_context(|| format!("read admin secret '{}'", secret_id))?;
            let admin = DatabaseSecret::parse(&value.secret_string)
                .with_context(|| format!("admin secret '{}' is not username/password JSON", secret_id))?;
            return Ok(AdminCredentials::new(&admin.username, &admin.password));
        }
        match (&sf.admin_user, &sf.admin_password) {
            (Some(user), Some(password)) => Ok(AdminCredentials::new(user, password)),
            _ => bail!(
                "no Snowflake admin credentials: set SNOWFLAKE_ADMIN_SECRET_ID, or SNOWFLAKE_ADMIN_USER and SNOWFLAKE_ADMIN_PASSWORD"
            ),
        }
    }

    pub async fn build_target(&self, store: &dyn SecretStore) -> Result<Arc<dyn TargetSystem>> {
        let settings = SnowflakeSettings::from_section(&self.config.snowflake)?;
        let admin = self.admin_credentials(store).await?;
        let target = SnowflakeTarget::new(settings, admin)?;
        Ok(Arc::new(target))
    }

    pub async fn build_handler(&self) -> Result<RotationHandler> {
        let store = self.open_store().await?;
        let target = self.build_target(store.as_ref()).await?;
        let rotator = Rotator::new(store, target, self.policy());
        Ok(RotationHandler::new(rotator, self.audit_log()))
    }
}

#[derive(Parser, Debug)]
#[command(name = "snowrot", version, about = "Snowflake password rotation for AWS Secrets Manager")]
pub struct Cli {
    /// Configuration file (TOML); environment variables override it
    #[arg(long, global = true, value_name = "PATH", env = "SNOWROT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Secret store backend
    #[arg(long, global = true, value_enum)]
    pub store: Option<StoreKind>,

    /// Local store file
    #[arg(long, global = true, value_name = "PATH")]
    pub store_path: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text, env = "SNOWROT_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run in non-interactive mode (no prompts, suitable for automation)
    #[arg(long, global = true, env = "SNOWROT_NON_INTERACTIVE")]
    pub non_interactive: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        logging::init(self.log_format, self.verbose);

        let mut config = settings::load(self.config.as_deref())?;
        if let Some(kind) = self.store {
            config.store.kind = kind;
        }
        if let Some(path) = self.store_path {
            config.store.path = Some(path);
        }

        let ctx = CliContext {
            config,
            config_path: self.config,
            non_interactive: self.non_interactive,
        };

        match self.command {
            // doctor reports invalid configuration instead of refusing to start
            Commands::Doctor(args) => doctor::run(&ctx, args),
            Commands::Audit { command } => audit::run(&ctx, command),
            command => {
                settings::validate(&ctx.config)?;
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .build()
                    .context("start async runtime")?;
                runtime.block_on(command.dispatch(&ctx))
            }
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one rotation step from an event (JSON file or stdin)
    Handle(rotate::HandleArgs),
    /// Run one rotation step from arguments
    Step(rotate::StepArgs),
    /// Rotate a secret now (all four steps)
    Rotate(rotate::RotateArgs),
    /// Restore the previous credential
    Rollback(rotate::RollbackArgs),
    /// Show versions and staging labels of a secret
    Status(rotate::StatusArgs),
    /// Serve invocations from the function host's runtime API
    Serve(serve::ServeArgs),
    /// Create a secret in the local store
    Seed(seed::SeedArgs),
    /// View or verify the audit trail
    Audit {
        #[command(subcommand)]
        command: audit::AuditCommand,
    },
    /// Diagnose configuration (safe, read-only)
    Doctor(doctor::DoctorArgs),
}

impl Commands {
    async fn dispatch(self, ctx: &CliContext) -> Result<()> {
        match self {
            Commands::Handle(args) => rotate::run_handle(ctx, args).await,
            Commands::Step(args) => rotate::run_step(ctx, args).await,
            Commands::Rotate(args) => rotate::run_rotate(ctx, args).await,
            Commands::Rollback(args) => rotate::run_rollback(ctx, args).await,
            Commands::Status(args) => rotate::run_status(ctx, args).await,
            Commands::Serve(args) => serve::run(ctx, args).await,
            Commands::Seed(args) => seed::run(ctx, args).await,
            Commands::Audit { command } => audit::run(ctx, command),
            Commands::Doctor(args) => doctor::run(ctx, args),
        }
    }
}

//! Seed a secret in the local store for rehearsals and development.

use crate::cli::CliContext;
use crate::constants;
use crate::core::audit_log::AuditEvent;
use crate::models::secret::DatabaseSecret;
use anyhow::{bail, Context, Result};
use clap::Args;
use dialoguer::Password;
use std::io::Read;
use zeroize::Zeroizing;

#[derive(Args, Debug)]
pub struct SeedArgs {
    pub secret_id: String,

    /// Snowflake login name stored in the secret
    #[arg(long)]
    pub username: String,

    /// Read the initial password from stdin
    #[arg(long)]
    pub from_stdin: bool,

    /// Generate the initial password from the configured policy
    #[arg(long)]
    pub auto: bool,

    /// Extra string fields carried in the secret (KEY=VALUE)
    #[arg(long = "extra", value_name = "KEY=VALUE", value_parser = parse_extra)]
    pub extra: Vec<(String, String)>,

    /// Create the secret with rotation disabled
    #[arg(long)]
    pub disable_rotation: bool,
}

fn parse_extra(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    if key.is_empty() || key == "username" || key == "password" {
        return Err(format!("invalid extra key '{}'", key));
    }
    Ok((key.to_string(), value.to_string()))
}

fn read_password(from_stdin: bool, secret_id: &str) -> Result<Zeroizing<String>> {
    let password = if from_stdin {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read password from stdin")?;
        Zeroizing::new(buf.trim_end_matches(['\r', '\n']).to_string())
    } else {
        Zeroizing::new(
            Password::new()
                .with_prompt(format!("Initial password for {}", secret_id))
                .with_confirmation("Confirm password", "Passwords do not match")
                .interact()
                .context("read password from prompt")?,
        )
    };
    if password.is_empty() {
        bail!("password is empty");
    }
    Ok(password)
}

pub async fn run(ctx: &CliContext, args: SeedArgs) -> Result<()> {
    let store = ctx.local_store("seed")?;

    if args.auto && args.from_stdin {
        bail!("--auto and --from-stdin cannot be used together");
    }
    if ctx.non_interactive && !args.from_stdin && !args.auto {
        bail!("--non-interactive requires --from-stdin or --auto for seed");
    }

    let password = if args.auto {
        ctx.policy().generate()?
    } else {
        read_password(args.from_stdin, &args.secret_id)?
    };

    let mut secret = DatabaseSecret::new(&args.username, &password);
    for (key, value) in &args.extra {
        secret
            .extra
            .insert(key.clone(), serde_json::Value::String(value.clone()));
    }
    let secret_string = secret.to_secret_string()?;
    if secret_string.len() > constants::MAX_SECRET_SIZE {
        bail!(
            "secret exceeds maximum size ({} bytes, max {} bytes)",
            secret_string.len(),
            constants::MAX_SECRET_SIZE
        );
    }

    let version = store.create_secret(&args.secret_id, &secret_string, !args.disable_rotation)?;
    if let Some(log) = ctx.audit_log() {
        if let Err(e) = log.append(AuditEvent::new("seed", &args.secret_id).token(&version)) {
            tracing::warn!(error = %format!("{:#}", e), "failed to write audit entry");
        }
    }

    println!("Created {} in {}", args.secret_id, store.path().display());
    println!("  AWSCURRENT: {}", version);
    if args.disable_rotation {
        println!("  rotation disabled");
    }
    Ok(())
}
